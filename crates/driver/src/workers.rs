//! Read, write, dispatch and interrupt loop bodies
//!
//! The read loop pulls raw buffers off the bulk-in pipe into the read
//! queue. The dispatch loop splits bundled transfers into frames and
//! MUX-decodes each one: data-channel payloads go to the upper layer,
//! flow-control messages on the control channel pause or resume transmit
//! and are acknowledged. The write loop drains the control
//! queue ahead of the data queue. The interrupt loop watches CDC
//! notifications.

use crate::notify::UpperLayerNotifier;
use crate::service::{Kicker, LoopWorker, ServiceSet, Step, ThreadedLoop};
use crate::state::{DeviceState, IO_READ, IO_WRITE, MuxConfig};
use crate::usb::enumerator::PipeType;
use crate::usb::transport::Transport;
use bytes::{Bytes, BytesMut};
use common::{PipeKind, UsbError};
use protocol::{Decoded, DropReason, FlowCommand, FlowControlMessage, MAX_PAYLOAD, frame_len};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const INTERRUPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a transfer error before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Largest frame plus flags, header and FCS
const READ_BUFFER_LEN: usize = MAX_PAYLOAD + 8;

// CDC notification codes
const NOTIFY_NETWORK_CONNECTION: u8 = 0x00;
const NOTIFY_RESPONSE_AVAILABLE: u8 = 0x01;
const NOTIFY_SERIAL_STATE: u8 = 0x20;
const NOTIFY_SPEED_CHANGE: u8 = 0x2A;

fn endpoint(state: &DeviceState, pipe: PipeType) -> Option<u8> {
    state
        .configuration()
        .and_then(|c| c.pipe(pipe).map(|p| p.endpoint_address))
}

pub struct ReadWorker {
    transport: Arc<dyn Transport>,
    state: Arc<DeviceState>,
    endpoint: Option<u8>,
    dispatch: Kicker,
}

impl ReadWorker {
    pub fn new(transport: Arc<dyn Transport>, state: Arc<DeviceState>, dispatch: Kicker) -> Self {
        let endpoint = endpoint(&state, PipeType::BulkIn);
        Self {
            transport,
            state,
            endpoint,
            dispatch,
        }
    }
}

impl LoopWorker for ReadWorker {
    fn step(&mut self) -> Step {
        let Some(endpoint) = self.endpoint else {
            return Step::Idle;
        };

        let mut buf = BytesMut::zeroed(READ_BUFFER_LEN);
        let result = {
            let _busy = self.state.begin_io(IO_READ);
            self.transport.bulk_in(endpoint, &mut buf, READ_TIMEOUT)
        };

        match result {
            Ok(0) | Err(UsbError::Timeout) => {}
            Ok(n) => {
                self.state.record_pipe_status(PipeKind::Input, Ok(()));
                buf.truncate(n);
                self.state.queues.push_read(buf.freeze());
                self.dispatch.kick();
            }
            Err(e) => {
                self.state.record_pipe_status(PipeKind::Input, Err(&e));
                warn!("Bulk-in on {:#04x} failed: {}", endpoint, e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
        Step::Busy
    }
}

pub struct DispatchWorker {
    state: Arc<DeviceState>,
    notifier: Arc<dyn UpperLayerNotifier>,
    write: Kicker,
}

impl DispatchWorker {
    pub fn new(
        state: Arc<DeviceState>,
        notifier: Arc<dyn UpperLayerNotifier>,
        write: Kicker,
    ) -> Self {
        Self {
            state,
            notifier,
            write,
        }
    }

    fn dispatch(&self, mut buf: Bytes) {
        let mux = *self.state.mux();
        if mux.enabled {
            // A bundled transfer carries several frames back to back
            while let Some(len) = frame_len(&buf).filter(|&len| len < buf.len()) {
                let frame = buf.split_to(len);
                self.dispatch_frame(frame, &mux);
            }
        }
        self.dispatch_frame(buf, &mux);
    }

    fn dispatch_frame(&self, buf: Bytes, mux: &MuxConfig) {
        let channels = mux.channels();

        match channels.decode(&buf, true, mux.enabled) {
            Decoded::Passthrough(data) | Decoded::Payload { data, .. } => {
                self.deliver(buf.slice_ref(data));
            }
            Decoded::NotAFrame { len } => {
                debug!("Passing through {} unframed bytes", len);
                self.deliver(buf.clone());
            }
            Decoded::Dropped(DropReason::DlciMismatch { found, .. })
                if found == channels.control_dlci =>
            {
                self.control(&buf);
            }
            Decoded::Dropped(reason) => {
                debug!("Dropped inbound frame: {:?}", reason);
                self.state.update_stats(|s| s.dropped_frames += 1);
            }
        }
    }

    fn deliver(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.state.update_stats(|s| s.record_rx(payload.len()));
        self.notifier.indicate_receive(payload);
    }

    fn control(&self, buf: &[u8]) {
        let channels = self.state.mux().channels();
        let Decoded::Payload { data, .. } = channels.decode(buf, false, true) else {
            self.state.update_stats(|s| s.dropped_frames += 1);
            return;
        };

        let msg = match FlowControlMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Control payload is not flow control: {}", e);
                return;
            }
        };

        info!(
            "Flow control {:?} (txn {}, type {})",
            msg.command, msg.transaction_id, msg.cmd_type
        );
        self.state.set_tx_paused(msg.command == FlowCommand::Pause);
        self.notifier.notify_flow_control(msg.command);

        if msg.is_request() {
            match channels.encode(&msg.ack().encode(), false) {
                Ok(frame) => self.state.queues.push_control(frame),
                Err(e) => warn!("Failed to frame flow-control ack: {}", e),
            }
        }
        self.write.kick();
    }
}

impl LoopWorker for DispatchWorker {
    fn step(&mut self) -> Step {
        match self.state.queues.pop_read() {
            Some(buf) => {
                self.dispatch(buf);
                Step::Busy
            }
            None => Step::Idle,
        }
    }
}

pub struct WriteWorker {
    transport: Arc<dyn Transport>,
    state: Arc<DeviceState>,
    endpoint: Option<u8>,
}

impl WriteWorker {
    pub fn new(transport: Arc<dyn Transport>, state: Arc<DeviceState>) -> Self {
        let endpoint = endpoint(&state, PipeType::BulkOut);
        Self {
            transport,
            state,
            endpoint,
        }
    }

    fn next_frame(&self) -> Option<Bytes> {
        self.state.queues.pop_control().or_else(|| {
            if self.state.tx_paused() {
                None
            } else {
                self.state.queues.pop_write()
            }
        })
    }
}

impl LoopWorker for WriteWorker {
    fn step(&mut self) -> Step {
        let Some(endpoint) = self.endpoint else {
            return Step::Idle;
        };
        let Some(frame) = self.next_frame() else {
            return Step::Idle;
        };

        let result = {
            let _busy = self.state.begin_io(IO_WRITE);
            self.transport.bulk_out(endpoint, &frame, WRITE_TIMEOUT)
        };
        self.state
            .record_pipe_status(PipeKind::Output, result.as_ref().map(|_| ()));

        match result {
            Ok(n) => self.state.update_stats(|s| s.record_tx(n)),
            Err(e) => {
                warn!("Dropping {}-byte frame: {}", frame.len(), e);
                if e.is_disconnect() {
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        Step::Busy
    }
}

pub struct InterruptWorker {
    transport: Arc<dyn Transport>,
    state: Arc<DeviceState>,
    notifier: Arc<dyn UpperLayerNotifier>,
    endpoint: Option<u8>,
}

impl InterruptWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        state: Arc<DeviceState>,
        notifier: Arc<dyn UpperLayerNotifier>,
    ) -> Self {
        let endpoint = endpoint(&state, PipeType::Interrupt);
        Self {
            transport,
            state,
            notifier,
            endpoint,
        }
    }

    fn notification(&self, data: &[u8]) {
        if data.len() < 8 {
            debug!("Short notification ({} bytes)", data.len());
            return;
        }
        let code = data[1];
        let value = u16::from_le_bytes([data[2], data[3]]);

        match code {
            NOTIFY_NETWORK_CONNECTION if value == 0 => {
                info!("Modem reports link down");
                self.notifier.notify_link_down();
            }
            NOTIFY_NETWORK_CONNECTION => debug!("Modem reports link up"),
            NOTIFY_RESPONSE_AVAILABLE => {
                self.state.add_inflight_response();
                if self
                    .state
                    .queues
                    .set_notification(Bytes::copy_from_slice(data))
                    .is_some()
                {
                    debug!("Replaced unconsumed notification");
                }
            }
            NOTIFY_SERIAL_STATE | NOTIFY_SPEED_CHANGE => {
                debug!("Notification {:#04x}: {:02x?}", code, &data[8..]);
            }
            other => debug!("Unhandled notification {:#04x}", other),
        }
    }
}

impl LoopWorker for InterruptWorker {
    fn step(&mut self) -> Step {
        let Some(endpoint) = self.endpoint else {
            return Step::Idle;
        };

        let mut buf = [0u8; 64];
        match self
            .transport
            .interrupt_in(endpoint, &mut buf, INTERRUPT_TIMEOUT)
        {
            Ok(n) => {
                self.state.record_pipe_status(PipeKind::Interrupt, Ok(()));
                self.notification(&buf[..n]);
            }
            Err(UsbError::Timeout) => {}
            Err(e) => {
                self.state.record_pipe_status(PipeKind::Interrupt, Err(&e));
                warn!("Interrupt pipe {:#04x} failed: {}", endpoint, e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
        Step::Busy
    }
}

/// Build the four thread-backed loops for a device
pub fn threaded_services(
    transport: Arc<dyn Transport>,
    state: Arc<DeviceState>,
    notifier: Arc<dyn UpperLayerNotifier>,
) -> ServiceSet {
    let write = {
        let (t, s) = (transport.clone(), state.clone());
        ThreadedLoop::new(
            "modem-write",
            Box::new(move || Box::new(WriteWorker::new(t.clone(), s.clone())) as Box<dyn LoopWorker>),
        )
    };

    let dispatch = {
        let (s, n, k) = (state.clone(), notifier.clone(), write.kicker());
        ThreadedLoop::new(
            "modem-dispatch",
            Box::new(move || {
                Box::new(DispatchWorker::new(s.clone(), n.clone(), k.clone())) as Box<dyn LoopWorker>
            }),
        )
    };

    let read = {
        let (t, s, k) = (transport.clone(), state.clone(), dispatch.kicker());
        ThreadedLoop::new(
            "modem-read",
            Box::new(move || {
                Box::new(ReadWorker::new(t.clone(), s.clone(), k.clone())) as Box<dyn LoopWorker>
            }),
        )
    };

    let interrupt = ThreadedLoop::new(
        "modem-interrupt",
        Box::new(move || {
            Box::new(InterruptWorker::new(
                transport.clone(),
                state.clone(),
                notifier.clone(),
            )) as Box<dyn LoopWorker>
        }),
    );

    ServiceSet {
        read: Box::new(read),
        write: Box::new(write),
        dispatch: Box::new(dispatch),
        interrupt: Box::new(interrupt),
    }
}
