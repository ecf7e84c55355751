//! Device session integration tests
//!
//! Drives full sessions against the scripted `MockTransport`:
//! - Start, open and close sequencing
//! - Start failure rollback
//! - MUX data path and flow control
//! - Power veto, idle suspend, wait-wake and sleep/resume
//!
//! Run with: `cargo test -p driver --test session_tests`

use bytes::Bytes;
use common::test_utils::{ConfigDescriptorBuilder, EP_BULK, EP_INTERRUPT};
use common::{DevicePower, SystemPower, UsbError, UsbSpeed};
use driver::power::PowerRequest;
use driver::registry::{self, AdapterKey};
use driver::service::{ServiceLoop, StopTag};
use driver::state::{DeviceLifecycle, MuxConfig};
use driver::testing::{MockTransport, NotifierEvent, RecordingNotifier};
use driver::usb::transport::{CLEAR_FEATURE, SET_FEATURE};
use driver::workers::threaded_services;
use driver::{
    DeviceSession, DriverError, FileStore, KeyValueStore, MemoryStore, SessionOptions, StoreKey,
    StoreValue,
};
use protocol::qmap::CMD_TYPE_REQUEST;
use protocol::{FlowCommand, FlowControlMessage, MuxChannels};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

fn key(address: u8) -> AdapterKey {
    AdapterKey {
        bus: 220,
        address,
        interface: 0,
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        reset_backoff: Duration::from_millis(1),
        idle_timeout: None,
        ..Default::default()
    }
}

struct Harness {
    session: DeviceSession,
    transport: Arc<MockTransport>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with(
    address: u8,
    transport: MockTransport,
    store: Box<dyn KeyValueStore>,
    options: SessionOptions,
) -> Harness {
    let transport = Arc::new(transport);
    let notifier = Arc::new(RecordingNotifier::default());
    let session = DeviceSession::new(
        key(address),
        transport.clone(),
        notifier.clone(),
        store,
        options,
    )
    .unwrap();
    Harness {
        session,
        transport,
        notifier,
    }
}

fn harness(address: u8) -> Harness {
    harness_with(
        address,
        MockTransport::modem(),
        Box::new(MemoryStore::new()),
        options(),
    )
}

fn count_events(notifier: &RecordingNotifier, event: &NotifierEvent) -> usize {
    notifier.events().iter().filter(|e| *e == event).count()
}

/// SET_FEATURE / CLEAR_FEATURE requests sent so far
fn wake_requests(transport: &MockTransport) -> Vec<u8> {
    transport
        .control_requests()
        .into_iter()
        .map(|r| r.request)
        .filter(|&r| r == SET_FEATURE || r == CLEAR_FEATURE)
        .collect()
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// Start / Open / Close
// ============================================================================

#[test]
fn test_start_device_enumerates_and_resets() {
    let mut h = harness(1);
    h.session.start_device().unwrap();

    assert_eq!(
        h.session.lifecycle(),
        DeviceLifecycle::Started { in_service: false }
    );
    // Interrupt, then input, then output
    assert_eq!(h.transport.resets(), vec![0x81, 0x82, 0x02]);

    let identity = h.session.state().identity().clone();
    assert_eq!(identity.vendor_id, 0x05c6);
    assert_eq!(identity.product_id, 0x9025);
    assert_eq!(identity.strings.serial_number.as_deref(), Some("SN0001"));

    let bundling = h
        .transport
        .control_requests()
        .into_iter()
        .any(|r| r.request == driver::usb::transport::VENDOR_SET_DATA_BUNDLING);
    assert!(bundling);

    assert_eq!(
        h.notifier.events(),
        vec![NotifierEvent::DeviceStarted {
            vendor_id: 0x05c6,
            product_id: 0x9025
        }]
    );
}

#[test]
fn test_open_close_open() {
    let mut h = harness(2);
    h.session.start_device().unwrap();

    h.session.open().unwrap();
    assert!(h.session.lifecycle().in_service());
    assert!(matches!(h.session.open(), Err(DriverError::DeviceBusy)));

    h.session.close().unwrap();
    assert!(!h.session.lifecycle().in_service());
    h.session.close().unwrap();

    h.session.open().unwrap();
    assert_eq!(
        h.session.lifecycle(),
        DeviceLifecycle::Started { in_service: true }
    );

    // Pulse on open, drop on close, pulse again
    assert_eq!(
        h.transport.dtr_history(),
        vec![false, true, false, false, true]
    );
    // Start triple, then an input/output pair per open
    assert_eq!(
        h.transport.resets(),
        vec![0x81, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02]
    );
    assert!(!h.session.state().power().selective_suspend_allowed);
}

#[test]
fn test_open_rejected_before_start_and_after_removal() {
    let mut h = harness(3);
    assert!(matches!(h.session.open(), Err(DriverError::DeletePending)));

    h.session.start_device().unwrap();
    h.session.surprise_remove();
    assert_eq!(h.session.lifecycle(), DeviceLifecycle::SurpriseRemoved);
    assert!(matches!(h.session.open(), Err(DriverError::DeletePending)));
    assert!(matches!(
        h.session.start_device(),
        Err(DriverError::DeletePending)
    ));
    assert!(h.notifier.events().contains(&NotifierEvent::DeviceRemoved));
}

#[test]
fn test_stop_and_restart() {
    let mut h = harness(4);
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    h.session.stop_device().unwrap();
    assert_eq!(h.session.lifecycle(), DeviceLifecycle::Present);
    assert!(h.session.state().configuration().is_none());
    assert_eq!(h.transport.release_count(), 1);

    h.session.start_device().unwrap();
    h.session.open().unwrap();
    assert!(h.session.lifecycle().in_service());
}

#[test]
fn test_duplicate_adapter_is_busy() {
    let _first = harness(5);
    let second = DeviceSession::new(
        key(5),
        Arc::new(MockTransport::modem()),
        Arc::new(RecordingNotifier::default()),
        Box::new(MemoryStore::new()),
        options(),
    );
    assert!(matches!(second, Err(DriverError::DeviceBusy)));
}

#[test]
fn test_registration_released_on_drop() {
    {
        let _h = harness(6);
        assert!(registry::lookup(key(6)).is_some());
    }
    assert!(registry::lookup(key(6)).is_none());
}

/// Write loop whose thread can never be started
struct UnstartableLoop;

impl ServiceLoop for UnstartableLoop {
    fn name(&self) -> &'static str {
        "unstartable"
    }

    fn start(&mut self) -> driver::Result<()> {
        Err(DriverError::Service {
            name: "unstartable",
            reason: "no thread".to_string(),
        })
    }

    fn request_stop(&mut self, _tag: StopTag, _wait: bool) -> driver::Result<()> {
        Ok(())
    }

    fn kick(&self) {}

    fn is_running(&self) -> bool {
        false
    }

    fn closed_tag(&self) -> Option<StopTag> {
        None
    }
}

#[test]
fn test_open_failure_restores_idle_state() {
    let transport = Arc::new(MockTransport::modem());
    let notifier = Arc::new(RecordingNotifier::default());
    let (t, n) = (transport.clone(), notifier.clone());
    let options = SessionOptions {
        idle_timeout: Some(Duration::from_secs(60)),
        ..options()
    };
    let mut session = DeviceSession::with_services(
        key(7),
        transport.clone(),
        notifier,
        Box::new(MemoryStore::new()),
        options,
        |state| {
            let mut services = threaded_services(t, state, n);
            services.write = Box::new(UnstartableLoop);
            services
        },
    )
    .unwrap();
    session.start_device().unwrap();

    let err = session.open().unwrap_err();
    assert!(matches!(err, DriverError::Service { name: "unstartable", .. }));
    assert_eq!(
        session.lifecycle(),
        DeviceLifecycle::Started { in_service: false }
    );
    {
        let power = session.state().power();
        assert!(power.selective_suspend_allowed);
        assert!(power.idle_deadline.is_some());
    }
    assert_eq!(transport.idle_history(), vec![false, true]);
    // Line state is never raised for a failed open
    assert!(transport.dtr_history().is_empty());

    // Still closed, so a close is a no-op
    session.close().unwrap();
}

// ============================================================================
// Start failures
// ============================================================================

#[test]
fn test_reset_failure_rolls_back_start() {
    let mut h = harness(10);
    h.transport.fail_resets(10, UsbError::Pipe);

    let err = h.session.start_device().unwrap_err();
    assert!(matches!(err, DriverError::Transport(UsbError::Pipe)));

    // Every attempt fails on the interrupt pipe
    assert_eq!(h.transport.resets(), vec![0x81; 10]);
    assert_eq!(h.session.lifecycle(), DeviceLifecycle::Present);
    assert!(h.session.state().configuration().is_none());
    assert_eq!(h.transport.release_count(), 1);
    assert!(h.notifier.events().is_empty());
}

#[test]
fn test_reset_recovers_within_retry_budget() {
    let mut h = harness(11);
    h.transport.fail_resets(3, UsbError::Pipe);

    h.session.start_device().unwrap();
    assert_eq!(h.transport.resets().len(), 3 + 3);
}

#[test]
fn test_unrecognized_model_rolls_back() {
    let transport = MockTransport::modem();
    transport.set_config_descriptor(
        ConfigDescriptorBuilder::new()
            .interface(0, 0, 0xFF, 0xFF, 1)
            .endpoint(0x81, EP_INTERRUPT, 8)
            .build(),
    );
    let mut h = harness_with(12, transport, Box::new(MemoryStore::new()), options());

    let err = h.session.start_device().unwrap_err();
    assert!(matches!(err, DriverError::UnrecognizedModel));
    assert!(err.is_device_fatal());
    assert_eq!(h.session.lifecycle(), DeviceLifecycle::Present);
    assert_eq!(h.transport.release_count(), 1);
    assert!(h.transport.resets().is_empty());
}

#[test]
fn test_invalid_device_descriptor() {
    let transport = MockTransport::modem();
    let mut desc = common::test_utils::create_mock_device_descriptor(0x05c6, 0x9025);
    desc[7] = 7;
    transport.set_device_descriptor(desc);
    let mut h = harness_with(13, transport, Box::new(MemoryStore::new()), options());

    let err = h.session.start_device().unwrap_err();
    assert!(matches!(err, DriverError::InvalidDescriptor { kind: "device", .. }));
    assert_eq!(h.session.lifecycle(), DeviceLifecycle::Present);
}

#[test]
fn test_select_failure_releases_interfaces() {
    let mut h = harness(15);
    h.transport.fail_select(UsbError::Busy);

    let err = h.session.start_device().unwrap_err();
    assert!(matches!(err, DriverError::Transport(UsbError::Busy)));
    assert!(h.transport.release_count() >= 1);
    assert_eq!(h.session.lifecycle(), DeviceLifecycle::Present);
    assert!(h.session.state().configuration().is_none());
}

#[test]
fn test_super_speed_ep0_exponent() {
    let transport = MockTransport::modem().with_speed(UsbSpeed::Super);
    let mut h = harness_with(16, transport, Box::new(MemoryStore::new()), options());
    // A 64-byte ep0 size is not a valid exponent at super speed
    assert!(matches!(
        h.session.start_device(),
        Err(DriverError::InvalidDescriptor { kind: "device", .. })
    ));

    let mut desc = common::test_utils::create_mock_device_descriptor(0x05c6, 0x9025);
    desc[7] = 9;
    h.transport.set_device_descriptor(desc);
    h.session.start_device().unwrap();
    assert_eq!(h.session.state().identity().speed, UsbSpeed::Super);
}

#[test]
fn test_mux_derived_interface_skips_pipe_reset() {
    let transport = MockTransport::modem();
    let options = SessionOptions {
        mux: MuxConfig {
            enabled: true,
            physical_interface: 0,
            interface_number: 1,
            ..Default::default()
        },
        ..options()
    };
    let mut h = harness_with(14, transport, Box::new(MemoryStore::new()), options);

    h.session.start_device().unwrap();
    assert_eq!(
        h.session.state().identity().model,
        common::ModelType::NetLike
    );
    assert!(h.transport.resets().is_empty());

    h.session.open().unwrap();
    h.session.close().unwrap();
    assert!(h.transport.resets().is_empty());
    assert!(h.transport.idle_history().is_empty());
}

// ============================================================================
// Data path
// ============================================================================

fn mux_harness(address: u8) -> Harness {
    let options = SessionOptions {
        mux: MuxConfig {
            enabled: true,
            ..Default::default()
        },
        ..options()
    };
    harness_with(
        address,
        MockTransport::modem(),
        Box::new(MemoryStore::new()),
        options,
    )
}

#[test]
fn test_receive_and_send_over_mux() {
    let mut h = mux_harness(20);
    let channels = MuxChannels::default();
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    h.transport
        .push_bulk_in(channels.encode(b"downlink", true).unwrap());
    let notifier = h.notifier.clone();
    wait_until("downlink payload", || {
        notifier
            .events()
            .contains(&NotifierEvent::Received(Bytes::from_static(b"downlink")))
    });

    h.session
        .send(Bytes::from_static(b"uplink"), true)
        .unwrap();
    let transport = h.transport.clone();
    wait_until("uplink frame", || !transport.sent().is_empty());
    assert_eq!(
        h.transport.sent()[0],
        channels.encode(b"uplink", true).unwrap()
    );

    let stats = h.session.state().stats();
    assert_eq!(stats.rx_bytes, 8);
    wait_until("tx stats", || h.session.state().stats().tx_bytes > 0);
}

#[test]
fn test_bundled_transfer_delivers_every_frame() {
    let mut h = mux_harness(24);
    let channels = MuxChannels::default();
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    let mut bundle = channels.encode(b"one", true).unwrap().to_vec();
    bundle.extend_from_slice(&channels.encode(b"two", true).unwrap());
    h.transport.push_bulk_in(bundle);

    let notifier = h.notifier.clone();
    wait_until("both payloads", || {
        let events = notifier.events();
        events.contains(&NotifierEvent::Received(Bytes::from_static(b"one")))
            && events.contains(&NotifierEvent::Received(Bytes::from_static(b"two")))
    });
    assert_eq!(h.session.state().stats().rx_bytes, 6);
}

#[test]
fn test_flow_control_pause_is_acknowledged() {
    let mut h = mux_harness(21);
    let channels = MuxChannels::default();
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    let pause = FlowControlMessage {
        mux_id: 0,
        command: FlowCommand::Pause,
        transaction_id: 7,
        cmd_type: CMD_TYPE_REQUEST,
        flow_ctrl_seq_num_ip: 0,
        qos_id: 0,
    };
    h.transport
        .push_bulk_in(channels.encode(&pause.encode(), false).unwrap());

    let state = h.session.state().clone();
    wait_until("pause", || state.tx_paused());
    let transport = h.transport.clone();
    wait_until("ack", || !transport.sent().is_empty());

    let ack = channels.encode(&pause.ack().encode(), false).unwrap();
    assert_eq!(h.transport.sent()[0], ack);
    assert!(h
        .notifier
        .events()
        .contains(&NotifierEvent::FlowControl(FlowCommand::Pause)));

    // Data waits while paused
    h.session.send(Bytes::from_static(b"held"), true).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(h.transport.sent().len(), 1);
}

#[test]
fn test_link_down_notification() {
    let mut h = harness(22);
    h.transport
        .push_interrupt(&[0xA1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    h.session.start_device().unwrap();

    let notifier = h.notifier.clone();
    wait_until("link down", || {
        notifier.events().contains(&NotifierEvent::LinkDown)
    });
}

#[test]
fn test_send_without_mux_is_raw() {
    let mut h = harness(23);
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    h.session.send(Bytes::from_static(b"raw"), true).unwrap();
    let transport = h.transport.clone();
    wait_until("raw frame", || !transport.sent().is_empty());
    assert_eq!(h.transport.sent()[0], Bytes::from_static(b"raw"));
}

// ============================================================================
// Power
// ============================================================================

#[test]
fn test_power_veto_while_open() {
    let mut h = harness(30);
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    let err = h
        .session
        .handle_power(PowerRequest::SetDevice(DevicePower::D2))
        .unwrap_err();
    assert!(err.is_veto());
    assert_eq!(h.session.state().power().device, DevicePower::D0);

    let err = h
        .session
        .handle_power(PowerRequest::QueryDevice(DevicePower::D3))
        .unwrap_err();
    assert!(err.is_veto());
}

#[test]
fn test_idle_suspend_is_self_originated() {
    let options = SessionOptions {
        idle_timeout: Some(Duration::ZERO),
        ..options()
    };
    let mut h = harness_with(
        31,
        MockTransport::modem(),
        Box::new(MemoryStore::new()),
        options,
    );
    h.session.start_device().unwrap();

    // The idle timer only runs after a client detaches
    assert!(!h.session.poll_idle(Instant::now()).unwrap());
    h.session.open().unwrap();
    h.session.close().unwrap();
    h.notifier.clear();

    assert!(h.session.poll_idle(Instant::now()).unwrap());
    {
        let power = h.session.state().power();
        assert_eq!(power.device, DevicePower::D2);
        assert!(power.idle_suspended);
        assert!(power.low_power_mode);
        assert!(power.wait_wake_armed);
    }
    assert_eq!(wake_requests(&h.transport), vec![SET_FEATURE]);
    let pool = h.session.state().power_requests();
    assert_eq!(pool.free_count(), pool.capacity());
    drop(pool);

    // Opening wakes the device without a reset
    h.session.open().unwrap();
    assert_eq!(h.session.state().power().device, DevicePower::D0);
    assert!(!h.session.state().power().low_power_mode);
    assert!(!h.session.state().power().wait_wake_armed);
    assert_eq!(wake_requests(&h.transport), vec![SET_FEATURE, CLEAR_FEATURE]);
    assert!(h.notifier.events().is_empty());
}

#[test]
fn test_system_sleep_and_reset_wakeup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.toml");
    let store = FileStore::open(&path).unwrap();
    let mut h = harness_with(32, MockTransport::modem(), Box::new(store), options());

    h.session.start_device().unwrap();
    h.session.open().unwrap();

    h.session
        .handle_power(PowerRequest::SetSystem(SystemPower::Sleeping3))
        .unwrap();
    h.session
        .handle_power(PowerRequest::SetSystem(SystemPower::Hibernate))
        .unwrap();
    let deregs = h
        .notifier
        .events()
        .iter()
        .filter(|e| **e == NotifierEvent::Deregistration)
        .count();
    assert_eq!(deregs, 1);

    // Asleep: no veto even with a client attached, and DTR drops
    h.session
        .handle_power(PowerRequest::SetDevice(DevicePower::D3))
        .unwrap();
    assert_eq!(h.transport.dtr_history().last(), Some(&false));
    assert!(h.session.state().power().power_suspended);

    h.session
        .handle_power(PowerRequest::SetSystem(SystemPower::Working))
        .unwrap();
    assert!(!h.session.state().power().prepare_to_power_down);

    h.session
        .handle_power(PowerRequest::SetDevice(DevicePower::D0))
        .unwrap();
    assert!(h.session.lifecycle().in_service());
    assert_eq!(h.session.state().power().device, DevicePower::D0);
    assert!(h
        .notifier
        .events()
        .contains(&NotifierEvent::PowerStateChanged(DevicePower::D3)));

    let store = FileStore::open(&path).unwrap();
    assert_eq!(
        store.get(StoreKey::SsrCounter).unwrap(),
        Some(StoreValue::U32(1))
    );
    assert_eq!(
        store.get(StoreKey::DeviceStamp).unwrap(),
        Some(StoreValue::U32(2))
    );
    assert_eq!(
        store.get(StoreKey::SerialNumber).unwrap(),
        Some(StoreValue::Text("SN0001".into()))
    );
}

#[test]
fn test_idle_suspend_then_system_sleep_reinitializes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.toml");
    let options = SessionOptions {
        idle_timeout: Some(Duration::ZERO),
        ..options()
    };
    let store = FileStore::open(&path).unwrap();
    let mut h = harness_with(36, MockTransport::modem(), Box::new(store), options);

    h.session.start_device().unwrap();
    h.session.open().unwrap();
    h.session.close().unwrap();
    assert!(h.session.poll_idle(Instant::now()).unwrap());
    assert!(h.session.state().power().wait_wake_armed);

    h.session
        .handle_power(PowerRequest::SetSystem(SystemPower::Sleeping3))
        .unwrap();
    h.session
        .handle_power(PowerRequest::SetDevice(DevicePower::D3))
        .unwrap();
    {
        let power = h.session.state().power();
        assert!(!power.idle_suspended);
        assert!(!power.wait_wake_armed);
    }
    assert_eq!(wake_requests(&h.transport), vec![SET_FEATURE, CLEAR_FEATURE]);

    h.session
        .handle_power(PowerRequest::SetSystem(SystemPower::Working))
        .unwrap();
    h.session
        .handle_power(PowerRequest::SetDevice(DevicePower::D0))
        .unwrap();

    // Power was lost, so the device was enumerated again
    let started = NotifierEvent::DeviceStarted {
        vendor_id: 0x05c6,
        product_id: 0x9025,
    };
    assert_eq!(count_events(&h.notifier, &started), 2);
    let store = FileStore::open(&path).unwrap();
    assert_eq!(
        store.get(StoreKey::SsrCounter).unwrap(),
        Some(StoreValue::U32(1))
    );
}

#[test]
fn test_deregistration_once_per_sleep_cycle() {
    let mut h = harness(37);
    h.session.start_device().unwrap();

    for level in [
        SystemPower::Sleeping3,
        SystemPower::Hibernate,
        SystemPower::Working,
        SystemPower::Sleeping3,
    ] {
        h.session.handle_power(PowerRequest::SetSystem(level)).unwrap();
    }
    assert_eq!(count_events(&h.notifier, &NotifierEvent::Deregistration), 2);
}

#[test]
fn test_failed_control_transfer_marks_disconnect() {
    let mut h = harness(38);
    h.session.start_device().unwrap();
    h.session.open().unwrap();
    assert!(h.session.check_health().is_ok());

    h.transport.fail_control(UsbError::NoDevice);
    // Dropping DTR on close goes over the default pipe
    h.session.close().unwrap();
    assert!(matches!(
        h.session.check_health(),
        Err(DriverError::DeletePending)
    ));
}

#[test]
fn test_health_check_reports_disconnect() {
    let mut h = harness(33);
    h.session.start_device().unwrap();
    assert!(h.session.check_health().is_ok());

    h.session
        .state()
        .record_pipe_status(common::PipeKind::Input, Err(&UsbError::NoDevice));
    assert!(matches!(
        h.session.check_health(),
        Err(DriverError::DeletePending)
    ));

    h.session
        .handle_power(PowerRequest::SetSystem(SystemPower::Sleeping2))
        .unwrap();
    assert!(h.session.check_health().is_ok());
}

#[test]
fn test_status_report() {
    let mut h = harness(34);
    h.session.start_device().unwrap();
    h.session.open().unwrap();

    let status = h.session.status();
    assert_eq!(status.lifecycle, "in-service");
    assert!(status.in_service);
    assert_eq!(status.model, common::ModelType::Net);
    assert_eq!(status.product_id, 0x9025);
}

#[test]
fn test_bulk_only_device_is_netlike() {
    let transport = MockTransport::modem();
    transport.set_config_descriptor(
        ConfigDescriptorBuilder::new()
            .interface(0, 0, 0xFF, 0xFF, 2)
            .endpoint(0x82, EP_BULK, 512)
            .endpoint(0x02, EP_BULK, 512)
            .build(),
    );
    let mut h = harness_with(35, transport, Box::new(MemoryStore::new()), options());

    h.session.start_device().unwrap();
    assert_eq!(
        h.session.state().identity().model,
        common::ModelType::NetLike
    );
    // No interrupt pipe to reset
    assert_eq!(h.transport.resets(), vec![0x82, 0x02]);
}
