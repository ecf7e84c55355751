//! Device session: start, open, close and power orchestration
//!
//! A [`DeviceSession`] owns one logical modem device. It enumerates the
//! device on start, runs the four service loops, attaches and detaches the
//! client, and carries out the actions the [`PowerController`] decides on.
//!
//! Every loop stop carries a [`StopTag`] naming the call site, so the
//! "closed" acknowledgement in the logs identifies who stopped the loop.

use crate::error::{DriverError, Result};
use crate::notify::UpperLayerNotifier;
use crate::power::{
    DEFAULT_POOL_SIZE, PowerController, PowerDisposition, PowerRequest, PowerSignal, StopTags,
};
use crate::registry::{self, AdapterKey, Registration};
use crate::service::{ServiceSet, StopTag};
use crate::state::{DeviceLifecycle, DeviceState, LifecycleEvent, MuxConfig};
use crate::store::{KeyValueStore, StoreKey, StoreValue};
use crate::usb::enumerator::{DeviceEnumerator, UsbConfiguration};
use crate::usb::pipes::{PipeManager, RESET_BACKOFF, is_usb_broken};
use crate::usb::transport::{ControlRequest, Transport};
use crate::workers::threaded_services;
use bytes::Bytes;
use common::{DevicePower, StatusReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Tags for tearing down a failed start: read, write, dispatch, interrupt
pub const START_ROLLBACK_TAGS: [StopTag; 4] = [StopTag(11), StopTag(12), StopTag(13), StopTag(14)];

pub const CLOSE_WRITE_TAG: StopTag = StopTag(21);
pub const CLOSE_READ_TAG: StopTag = StopTag(22);
pub const OPEN_FAILED_READ_TAG: StopTag = StopTag(23);

pub const POWER_STOP_TAGS: StopTags = StopTags {
    read: StopTag(31),
    write: StopTag(32),
    interrupt: StopTag(33),
};

/// Tags for stop, shutdown and surprise removal
pub const STOP_TAGS: [StopTag; 4] = [StopTag(41), StopTag(42), StopTag(43), StopTag(44)];

/// Tags for the full stop before a reinitializing wakeup
pub const RESET_TAGS: [StopTag; 4] = [StopTag(51), StopTag(52), StopTag(53), StopTag(54)];

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub port_name: String,
    pub mux: MuxConfig,
    /// Allow selective suspend while no client is attached
    pub selective_suspend: bool,
    /// Idle time before selective suspend; `None` disables the timer
    pub idle_timeout: Option<Duration>,
    pub power_request_pool: usize,
    /// Delay between pipe reset attempts
    pub reset_backoff: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            port_name: "modem0".to_string(),
            mux: MuxConfig::default(),
            selective_suspend: true,
            idle_timeout: Some(Duration::from_secs(5)),
            power_request_pool: DEFAULT_POOL_SIZE,
            reset_backoff: RESET_BACKOFF,
        }
    }
}

pub struct DeviceSession {
    key: AdapterKey,
    state: Arc<DeviceState>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn UpperLayerNotifier>,
    store: Box<dyn KeyValueStore>,
    services: ServiceSet,
    power: PowerController,
    options: SessionOptions,
    _registration: Registration,
}

impl DeviceSession {
    /// Create the session for a newly arrived device and register it
    pub fn new(
        key: AdapterKey,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn UpperLayerNotifier>,
        store: Box<dyn KeyValueStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        let (t, n) = (transport.clone(), notifier.clone());
        Self::with_services(key, transport, notifier, store, options, |state| {
            threaded_services(t, state, n)
        })
    }

    /// Like [`DeviceSession::new`] with caller-built service loops
    pub fn with_services(
        key: AdapterKey,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn UpperLayerNotifier>,
        store: Box<dyn KeyValueStore>,
        options: SessionOptions,
        build: impl FnOnce(Arc<DeviceState>) -> ServiceSet,
    ) -> Result<Self> {
        let state = Arc::new(DeviceState::new(
            options.mux,
            &options.port_name,
            options.power_request_pool,
        ));
        state.power().selective_suspend_allowed = options.selective_suspend;
        state.apply(LifecycleEvent::Arrive)?;

        let registration = registry::register(key, state.clone())?;
        let services = build(state.clone());

        Ok(Self {
            key,
            state,
            transport,
            notifier,
            store,
            services,
            power: PowerController::new(options.idle_timeout),
            options,
            _registration: registration,
        })
    }

    pub fn key(&self) -> AdapterKey {
        self.key
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn lifecycle(&self) -> DeviceLifecycle {
        self.state.lifecycle()
    }

    fn is_primary(&self) -> bool {
        self.state.mux().is_primary()
    }

    fn control_interface(&self) -> Option<u8> {
        self.state.configuration().map(|c| c.control_interface())
    }

    fn set_line_state(&self, dtr: bool, rts: bool) {
        let Some(interface) = self.control_interface() else {
            return;
        };
        let request = ControlRequest::line_state(interface, dtr, rts);
        if let Err(e) = self.pipes().control_out(&request) {
            warn!("Failed to set line state (dtr={}, rts={}): {}", dtr, rts, e);
        }
    }

    fn pipes(&self) -> PipeManager<'_> {
        PipeManager::new(self.transport.as_ref(), &self.state)
            .with_backoff(self.options.reset_backoff)
    }

    fn set_interface_idle(&self, idle: bool) {
        if !self.is_primary() {
            return;
        }
        if let Err(e) = self.transport.set_idle(idle) {
            warn!("Failed to mark interface idle={}: {}", idle, e);
        }
    }

    /// Enumerate the device and bring up the data path
    pub fn start_device(&mut self) -> Result<()> {
        match self.state.lifecycle() {
            DeviceLifecycle::Started { .. } => {
                debug!("Device already started");
                return Ok(());
            }
            DeviceLifecycle::SurpriseRemoved | DeviceLifecycle::Removed => {
                return Err(DriverError::DeletePending);
            }
            DeviceLifecycle::Absent | DeviceLifecycle::Present => {}
        }
        self.state.apply(LifecycleEvent::Start)?;

        if let Err(e) = self.start_sequence() {
            error!("Device start failed: {}", e);
            self.rollback_start();
            return Err(e);
        }

        self.state.power().device = DevicePower::D0;
        match self.store.increment(StoreKey::DeviceStamp) {
            Ok(stamp) => debug!("Device stamp {}", stamp),
            Err(e) => warn!("Failed to update device stamp: {}", e),
        }

        let identity = self.state.identity().clone();
        info!(
            "Started {:04x}:{:04x} on {} as {:?}",
            identity.vendor_id, identity.product_id, identity.port_name, identity.model
        );
        self.notifier.notify_device_started(&identity);
        Ok(())
    }

    fn start_sequence(&mut self) -> Result<()> {
        self.state.reset_descriptor_cache();

        let enumerator = DeviceEnumerator::new(self.transport.as_ref());
        let desc = enumerator.read_device_descriptor()?;
        let strings = enumerator.read_strings(&desc);

        if let Some(serial) = &strings.serial_number {
            if let Err(e) = self
                .store
                .set(StoreKey::SerialNumber, StoreValue::Text(serial.clone()))
            {
                warn!("Failed to store serial number: {}", e);
            }
        }
        {
            let mut identity = self.state.identity();
            identity.vendor_id = desc.vendor_id;
            identity.product_id = desc.product_id;
            identity.bcd_usb = desc.bcd_usb;
            identity.speed = self.transport.speed();
            identity.strings = strings;
        }

        let config = self.configure_any(&enumerator, desc.num_configurations)?;
        self.state.identity().model = config.model;
        self.state.set_configuration(Some(config));

        self.state.queues.purge();
        self.state.reset_stats();
        self.services.dispatch.start()?;

        if !self.is_primary() {
            return Ok(());
        }

        self.pipes().reset_with_retry()?;

        if is_usb_broken(&self.state) {
            error!("Device reports disconnected after pipe reset");
            return Err(DriverError::DeletePending);
        }

        if let Some(interface) = self.control_interface() {
            let request = ControlRequest::data_bundling(interface, true);
            if let Err(e) = self.pipes().control_out(&request) {
                warn!("Failed to enable data bundling: {}", e);
            }
        }

        self.services.interrupt.start()
    }

    /// Try each advertised configuration until one is usable
    fn configure_any(
        &self,
        enumerator: &DeviceEnumerator<'_>,
        count: u8,
    ) -> Result<UsbConfiguration> {
        let mut last = DriverError::UnrecognizedModel;
        for index in 0..count.max(1) {
            match enumerator.configure(index, self.state.mux()) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Configuration {} unusable: {}", index, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn rollback_start(&mut self) {
        self.services.stop_all(START_ROLLBACK_TAGS);
        if self.state.configuration().is_some() {
            self.transport.release_interfaces();
            self.state.set_configuration(None);
        }
        if let Err(e) = self.state.apply(LifecycleEvent::Stop) {
            warn!("Failed to roll back start: {}", e);
        }
    }

    /// Attach the client
    ///
    /// A failure to start the read or write loop leaves the device closed
    /// with selective suspend and the idle timer restored; the pipe resets
    /// already performed are not undone.
    pub fn open(&mut self) -> Result<()> {
        match self.state.lifecycle() {
            DeviceLifecycle::Started { in_service: true } => return Err(DriverError::DeviceBusy),
            DeviceLifecycle::Started { in_service: false } => {}
            other => {
                warn!("Open rejected in state {}", other.name());
                return Err(DriverError::DeletePending);
            }
        }
        self.ensure_awake()?;

        if self.is_primary() {
            let pipes = self.pipes();
            pipes.reset_input()?;
            pipes.reset_output()?;
        }

        self.state.apply(LifecycleEvent::Open)?;
        self.state.power().selective_suspend_allowed = false;
        self.power.cancel_idle_timer(&self.state);
        self.set_interface_idle(false);
        self.state.reset_stats();
        self.state.set_tx_paused(false);

        if let Err(e) = self.start_data_loops() {
            error!("Open failed: {}", e);
            self.abandon_open();
            return Err(e);
        }

        // Pulse DTR to reset the modem's line state
        self.set_line_state(false, false);
        self.set_line_state(true, true);
        self.power.cancel_idle_timer(&self.state);

        info!("Client attached to {}", self.options.port_name);
        Ok(())
    }

    fn abandon_open(&mut self) {
        if let Err(e) = self.services.read.request_stop(OPEN_FAILED_READ_TAG, true) {
            warn!("Failed to stop read loop: {}", e);
        }
        if let Err(e) = self.state.apply(LifecycleEvent::Close) {
            warn!("Failed to leave service after open failure: {}", e);
        }
        self.set_interface_idle(true);
        self.state.power().selective_suspend_allowed = self.options.selective_suspend;
        self.power.arm_idle_timer(&self.state, Instant::now());
    }

    fn start_data_loops(&mut self) -> Result<()> {
        self.services.read.start()?;
        self.services.write.start()
    }

    /// Detach the client; closing a closed device is not an error
    pub fn close(&mut self) -> Result<()> {
        if !self.state.lifecycle().in_service() {
            debug!("Close on a device with no client attached");
            return Ok(());
        }

        self.set_line_state(false, false);

        if let Err(e) = self.services.write.request_stop(CLOSE_WRITE_TAG, false) {
            warn!("Failed to stop write loop: {}", e);
        }
        if let Err(e) = self.services.read.request_stop(CLOSE_READ_TAG, true) {
            warn!("Failed to stop read loop: {}", e);
        }

        self.state.apply(LifecycleEvent::Close)?;
        if self.state.queues.take_notification().is_some() {
            debug!("Cancelled pending notification");
        }
        self.state.queues.purge();
        self.state.set_tx_paused(false);
        self.set_interface_idle(true);

        self.state.power().selective_suspend_allowed = self.options.selective_suspend;
        self.power.arm_idle_timer(&self.state, Instant::now());

        info!("Client detached from {}", self.options.port_name);
        Ok(())
    }

    /// Stop the device without removing it
    pub fn stop_device(&mut self) -> Result<()> {
        if let Err(e) = self.close() {
            warn!("Close during stop failed: {}", e);
        }
        self.services.stop_all(STOP_TAGS);
        if self.state.configuration().is_some() {
            self.transport.release_interfaces();
            self.state.set_configuration(None);
        }
        self.power.cancel_idle_timer(&self.state);
        self.state.apply(LifecycleEvent::Stop)?;
        Ok(())
    }

    /// The device left the bus without warning
    pub fn surprise_remove(&mut self) {
        if let Err(e) = self.state.apply(LifecycleEvent::SurpriseRemove) {
            warn!("Surprise removal in unexpected state: {}", e);
        }
        self.services.stop_all(STOP_TAGS);
        self.state.queues.purge();
        self.state.set_configuration(None);
        self.power.cancel_idle_timer(&self.state);
        self.notifier.notify_device_removed();
    }

    /// Tear the session down for good
    pub fn shutdown(&mut self) {
        if let Err(e) = self.close() {
            warn!("Close during shutdown failed: {}", e);
        }
        self.services.stop_all(STOP_TAGS);
        if self.state.configuration().is_some() {
            self.transport.release_interfaces();
            self.state.set_configuration(None);
        }
        if let Err(e) = self.state.apply(LifecycleEvent::Remove) {
            warn!("Failed to mark device removed: {}", e);
        }
        info!("Session for {} shut down", self.options.port_name);
    }

    /// Fail with delete-pending when the device is no longer reachable
    pub fn check_health(&self) -> Result<()> {
        if is_usb_broken(&self.state) {
            error!("USB link broken on {}", self.options.port_name);
            return Err(DriverError::DeletePending);
        }
        Ok(())
    }

    /// Handle a power request addressed to this device
    pub fn handle_power(&mut self, request: PowerRequest) -> Result<()> {
        match request {
            PowerRequest::QueryDevice(level) => self.power.check_veto(&self.state, level),
            PowerRequest::QuerySystem(_) => Ok(()),
            PowerRequest::SetSystem(level) => {
                self.power
                    .set_system_power(&self.state, level, self.notifier.as_ref());
                Ok(())
            }
            PowerRequest::SetDevice(level) => {
                let disposition = registry::filter_power_request(self.key, &request);
                let signal = self.power.set_device_power(&self.state, level)?;
                match signal {
                    Some(PowerSignal::Standby) => {
                        let cancel_wait_wake = !self.state.power().system.is_awake();
                        self.power.stop_data_threads(
                            &self.state,
                            self.transport.as_ref(),
                            &mut self.services,
                            cancel_wait_wake,
                            POWER_STOP_TAGS,
                        )?;
                    }
                    Some(PowerSignal::Wakeup) => self.resume_data_path()?,
                    Some(PowerSignal::WakeupReset) => self.reinitialize()?,
                    None if level.is_low_power() && !self.state.power().system.is_awake() => {
                        self.power.set_wait_wake(&self.state, self.transport.as_ref(), false);
                    }
                    None => {}
                }

                if disposition == PowerDisposition::Forward {
                    self.notifier.notify_power_state_changed(level);
                }
                Ok(())
            }
        }
    }

    fn resume_data_path(&mut self) -> Result<()> {
        info!("Resuming data path");
        self.set_interface_idle(false);
        if self.is_primary() {
            self.services.interrupt.start()?;
        }
        if self.state.lifecycle().in_service() {
            self.start_data_loops()?;
            self.services.write.kick();
        }
        self.power.set_wait_wake(&self.state, self.transport.as_ref(), false);
        self.power.clear_suspend(&self.state);
        Ok(())
    }

    /// The device lost power: enumerate again and restore the client
    fn reinitialize(&mut self) -> Result<()> {
        let was_open = self.state.lifecycle().in_service();
        info!("Reinitializing device (client attached: {})", was_open);

        self.services.stop_all(RESET_TAGS);
        if was_open {
            self.state.apply(LifecycleEvent::Close)?;
        }
        self.transport.release_interfaces();
        self.state.apply(LifecycleEvent::Stop)?;
        self.power.clear_suspend(&self.state);

        match self.store.increment(StoreKey::SsrCounter) {
            Ok(count) => info!("Subsystem restart #{}", count),
            Err(e) => warn!("Failed to update restart counter: {}", e),
        }

        self.start_device()?;
        if was_open {
            self.open()?;
        }
        Ok(())
    }

    /// Bring a suspended device back to D0 before using it
    pub fn ensure_awake(&mut self) -> Result<()> {
        if !self.state.power().device.is_low_power() {
            return Ok(());
        }
        let handle = self.power.request_self_power(&self.state, DevicePower::D0)?;
        let result = self.handle_power(PowerRequest::SetDevice(DevicePower::D0));
        if result.is_err() {
            self.state.power_requests().cancel(handle);
        }
        result
    }

    /// Selectively suspend the device once the idle timer expires
    ///
    /// Returns whether the device was suspended.
    pub fn poll_idle(&mut self, now: Instant) -> Result<bool> {
        if !self.power.idle_expired(&self.state, now) {
            return Ok(false);
        }
        self.power.cancel_idle_timer(&self.state);
        info!("Idle timeout on {}, suspending", self.options.port_name);

        self.state.power().idle_suspended = true;
        let handle = self.power.request_self_power(&self.state, DevicePower::D2)?;
        if let Err(e) = self.handle_power(PowerRequest::SetDevice(DevicePower::D2)) {
            self.state.power_requests().cancel(handle);
            self.state.power().idle_suspended = false;
            return Err(e);
        }
        Ok(true)
    }

    /// Queue a payload for transmission, MUX-framing it when enabled
    pub fn send(&mut self, payload: Bytes, is_data: bool) -> Result<()> {
        let lifecycle = self.state.lifecycle();
        if !lifecycle.in_service() {
            return Err(DriverError::InvalidState {
                from: lifecycle.name(),
                event: "send",
            });
        }
        self.ensure_awake()?;

        let mux = *self.state.mux();
        let frame = if mux.enabled {
            mux.channels().encode(&payload, is_data)?
        } else {
            payload
        };

        if is_data {
            self.state.queues.push_write(frame);
        } else {
            self.state.queues.push_control(frame);
        }
        self.services.write.kick();
        Ok(())
    }

    /// Take the pending interrupt notification, if any
    pub fn take_notification(&self) -> Option<Bytes> {
        self.state.queues.take_notification()
    }

    pub fn status(&self) -> StatusReport {
        let lifecycle = self.state.lifecycle();
        let identity = self.state.identity().clone();
        let stats = self.state.stats();
        let (device_power, system_power) = {
            let power = self.state.power();
            (power.device, power.system)
        };

        StatusReport {
            lifecycle: lifecycle.name().to_string(),
            in_service: lifecycle.in_service(),
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            model: identity.model,
            device_power,
            system_power,
            rx_bytes: stats.rx_bytes,
            tx_bytes: stats.tx_bytes,
        }
    }
}
