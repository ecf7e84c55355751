//! Scripted transport and recording notifier for tests
//!
//! [`MockTransport`] answers descriptor reads from byte buffers built with
//! `common::test_utils`, builds pipe handles from the configuration
//! descriptor on `select_configuration`, and records every side effect so
//! tests can assert on it.

use crate::notify::UpperLayerNotifier;
use crate::state::{DeviceIdentity, DeviceState, lock};
use crate::usb::descriptors::{DescriptorRecord, records};
use crate::usb::enumerator::DeviceEnumerator;
use crate::usb::transport::{
    ControlRequest, DescriptorType, EndpointType, InterfaceSelection, PipeHandle, Transport,
};
use bytes::Bytes;
use common::test_utils::{
    create_mock_device_descriptor, create_mock_modem_config, create_mock_string_descriptor,
};
use common::{DevicePower, UsbError, UsbSpeed};
use protocol::FlowCommand;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Longest a mock transfer blocks before reporting a timeout
const MOCK_POLL: Duration = Duration::from_millis(5);

pub struct MockTransport {
    speed: UsbSpeed,
    device_descriptor: Mutex<Vec<u8>>,
    config_descriptor: Mutex<Vec<u8>>,
    strings: Mutex<HashMap<u8, Vec<u8>>>,
    /// Errors returned by successive `reset_pipe` calls before they succeed
    reset_failures: Mutex<VecDeque<UsbError>>,
    /// Error returned by every `select_configuration` call
    select_error: Mutex<Option<UsbError>>,
    /// Error returned by every `control_out` call
    control_error: Mutex<Option<UsbError>>,
    bulk_in: Mutex<VecDeque<Bytes>>,
    interrupt_in: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Bytes>>,
    control: Mutex<Vec<ControlRequest>>,
    resets: Mutex<Vec<u8>>,
    idle: Mutex<Vec<bool>>,
    releases: AtomicUsize,
}

impl MockTransport {
    pub fn new(device_descriptor: Vec<u8>, config_descriptor: Vec<u8>) -> Self {
        Self {
            speed: UsbSpeed::High,
            device_descriptor: Mutex::new(device_descriptor),
            config_descriptor: Mutex::new(config_descriptor),
            strings: Mutex::new(HashMap::new()),
            reset_failures: Mutex::new(VecDeque::new()),
            select_error: Mutex::new(None),
            control_error: Mutex::new(None),
            bulk_in: Mutex::new(VecDeque::new()),
            interrupt_in: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            control: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            idle: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
        }
    }

    /// High-speed modem with interrupt, bulk-in and bulk-out pipes on interface 0
    pub fn modem() -> Self {
        let transport = Self::new(
            create_mock_device_descriptor(0x05c6, 0x9025),
            create_mock_modem_config(),
        );
        transport.set_string(1, "Acme");
        transport.set_string(2, "LTE Modem");
        transport.set_string(3, "SN0001");
        transport
    }

    pub fn with_speed(mut self, speed: UsbSpeed) -> Self {
        self.speed = speed;
        self
    }

    pub fn set_string(&self, index: u8, text: &str) {
        lock(&self.strings).insert(index, create_mock_string_descriptor(text));
    }

    pub fn set_device_descriptor(&self, bytes: Vec<u8>) {
        *lock(&self.device_descriptor) = bytes;
    }

    pub fn set_config_descriptor(&self, bytes: Vec<u8>) {
        *lock(&self.config_descriptor) = bytes;
    }

    /// Fail the next `count` pipe resets with `error`
    pub fn fail_resets(&self, count: usize, error: UsbError) {
        let mut failures = lock(&self.reset_failures);
        failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_select(&self, error: UsbError) {
        *lock(&self.select_error) = Some(error);
    }

    pub fn fail_control(&self, error: UsbError) {
        *lock(&self.control_error) = Some(error);
    }

    pub fn push_bulk_in(&self, data: impl Into<Bytes>) {
        lock(&self.bulk_in).push_back(data.into());
    }

    pub fn push_interrupt(&self, data: &[u8]) {
        lock(&self.interrupt_in).push_back(data.to_vec());
    }

    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.sent).clone()
    }

    pub fn control_requests(&self) -> Vec<ControlRequest> {
        lock(&self.control).clone()
    }

    /// DTR values of every line-state request, in order
    pub fn dtr_history(&self) -> Vec<bool> {
        lock(&self.control).iter().filter_map(|r| r.dtr()).collect()
    }

    pub fn resets(&self) -> Vec<u8> {
        lock(&self.resets).clone()
    }

    pub fn idle_history(&self) -> Vec<bool> {
        lock(&self.idle).clone()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn copy_out(src: &[u8], buf: &mut [u8]) -> usize {
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }
}

impl Transport for MockTransport {
    fn get_descriptor(
        &self,
        kind: DescriptorType,
        index: u8,
        _language_id: u16,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        match kind {
            DescriptorType::Device => Ok(Self::copy_out(&lock(&self.device_descriptor), buf)),
            DescriptorType::Configuration if index == 0 => {
                Ok(Self::copy_out(&lock(&self.config_descriptor), buf))
            }
            DescriptorType::Configuration => Err(UsbError::NotFound),
            DescriptorType::String => lock(&self.strings)
                .get(&index)
                .map(|s| Self::copy_out(s, buf))
                .ok_or(UsbError::Pipe),
        }
    }

    fn select_configuration(
        &self,
        _config_value: u8,
        interfaces: &[InterfaceSelection],
    ) -> Result<Vec<PipeHandle>, UsbError> {
        if let Some(err) = lock(&self.select_error).clone() {
            return Err(err);
        }

        let config = lock(&self.config_descriptor).clone();
        let mut current: Option<(u8, u8)> = None;
        let mut pipes = Vec::new();
        for record in records(&config) {
            match record {
                DescriptorRecord::Interface(iface) => {
                    current = Some((iface.number, iface.alternate_setting));
                }
                DescriptorRecord::Endpoint(ep) => {
                    let Some((number, alt)) = current else {
                        continue;
                    };
                    let selected = interfaces
                        .iter()
                        .any(|s| s.interface_number == number && s.alternate_setting == alt);
                    if selected {
                        pipes.push(PipeHandle {
                            interface_number: number,
                            endpoint_address: ep.address,
                            endpoint_type: EndpointType::from_attributes(ep.attributes),
                            max_packet_size: ep.max_packet_size,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(pipes)
    }

    fn release_interfaces(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn bulk_in(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        let next = lock(&self.bulk_in).pop_front();
        match next {
            Some(data) => Ok(Self::copy_out(&data, buf)),
            None => {
                std::thread::sleep(timeout.min(MOCK_POLL));
                Err(UsbError::Timeout)
            }
        }
    }

    fn bulk_out(&self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, UsbError> {
        lock(&self.sent).push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    fn interrupt_in(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let next = lock(&self.interrupt_in).pop_front();
        match next {
            Some(data) => Ok(Self::copy_out(&data, buf)),
            None => {
                std::thread::sleep(timeout.min(MOCK_POLL));
                Err(UsbError::Timeout)
            }
        }
    }

    fn reset_pipe(&self, endpoint: u8) -> Result<(), UsbError> {
        lock(&self.resets).push(endpoint);
        match lock(&self.reset_failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn control_out(&self, request: &ControlRequest) -> Result<(), UsbError> {
        lock(&self.control).push(request.clone());
        match lock(&self.control_error).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn set_idle(&self, idle: bool) -> Result<(), UsbError> {
        lock(&self.idle).push(idle);
        Ok(())
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }
}

/// Enumerate configuration 0 through `transport` and store it in `state`
pub fn configure(state: &DeviceState, transport: &dyn Transport) {
    if let Ok(config) = DeviceEnumerator::new(transport).configure(0, state.mux()) {
        state.set_configuration(Some(config));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    LinkDown,
    Deregistration,
    FlowControl(FlowCommand),
    PowerStateChanged(DevicePower),
    Received(Bytes),
    DeviceStarted { vendor_id: u16, product_id: u16 },
    DeviceRemoved,
}

/// Records every notification in arrival order
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifierEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    fn push(&self, event: NotifierEvent) {
        lock(&self.events).push(event);
    }
}

impl UpperLayerNotifier for RecordingNotifier {
    fn notify_link_down(&self) {
        self.push(NotifierEvent::LinkDown);
    }

    fn notify_deregistration(&self) {
        self.push(NotifierEvent::Deregistration);
    }

    fn notify_flow_control(&self, command: FlowCommand) {
        self.push(NotifierEvent::FlowControl(command));
    }

    fn notify_power_state_changed(&self, level: DevicePower) {
        self.push(NotifierEvent::PowerStateChanged(level));
    }

    fn indicate_receive(&self, payload: Bytes) {
        self.push(NotifierEvent::Received(payload));
    }

    fn notify_device_started(&self, identity: &DeviceIdentity) {
        self.push(NotifierEvent::DeviceStarted {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
        });
    }

    fn notify_device_removed(&self) {
        self.push(NotifierEvent::DeviceRemoved);
    }
}
