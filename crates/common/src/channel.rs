//! Async channel bridge between Tokio runtime and the driver worker thread

use crate::usb_types::{DevicePower, ModelType, SystemPower};
use async_channel::{Receiver, Sender, bounded};
use bytes::Bytes;
use protocol::FlowCommand;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reply channel for commands that only report success or failure
pub type Reply = tokio::sync::oneshot::Sender<crate::Result<()>>;

/// Commands from Tokio runtime to the driver worker
#[derive(Debug)]
pub enum DriverCommand {
    /// Attach a client to the modem (start read/write service)
    Open {
        /// Channel to send response back
        response: Reply,
    },

    /// Detach the client
    Close {
        /// Channel to send response back
        response: Reply,
    },

    /// Queue a payload on the data or control channel
    Send {
        /// Payload, MUX-framed by the worker when the multiplexer is on
        payload: Bytes,
        /// Data channel (true) or control channel (false)
        is_data: bool,
        /// Channel to send response back
        response: Reply,
    },

    /// System power transition reported by the host
    SetSystemPower {
        /// Target system level
        level: SystemPower,
        /// Channel to send response back
        response: Reply,
    },

    /// Device power request from the power manager
    SetDevicePower {
        /// Target device level
        level: DevicePower,
        /// Channel to send response back
        response: Reply,
    },

    /// Snapshot of the session state
    QueryStatus {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<StatusReport>,
    },

    /// Shutdown the worker thread gracefully
    Shutdown,
}

/// Events from the driver worker
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Device enumerated and started
    DeviceStarted {
        vendor_id: u16,
        product_id: u16,
        model: ModelType,
    },

    /// Device left the bus
    DeviceRemoved,

    /// Modem reported the network link down
    LinkDown,

    /// Deregistration sent ahead of a deep sleep
    Deregistered,

    /// Peer asked to pause or resume the data channel
    FlowControl(FlowCommand),

    /// Device power level changed
    PowerStateChanged(DevicePower),

    /// Payload received on the data channel
    Received(Bytes),
}

/// Session snapshot returned by `QueryStatus`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    /// Lifecycle state name
    pub lifecycle: String,
    /// Client attached
    pub in_service: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: ModelType,
    pub device_power: DevicePower,
    pub system_power: SystemPower,
    /// Received bytes since the last open
    pub rx_bytes: u64,
    /// Transmitted bytes since the last open
    pub tx_bytes: u64,
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct DriverBridge {
    cmd_tx: Sender<DriverCommand>,
    event_rx: Receiver<DriverEvent>,
}

impl DriverBridge {
    /// Send a command to the driver worker
    pub async fn send_command(&self, cmd: DriverCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the driver worker
    pub async fn recv_event(&self) -> crate::Result<DriverEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the driver worker thread (blocking)
pub struct DriverWorker {
    pub(crate) cmd_rx: Receiver<DriverCommand>,
    /// Event sender (public so notifiers can be built from it)
    pub event_tx: Sender<DriverEvent>,
}

impl DriverWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<DriverCommand> {
        self.cmd_rx.recv_blocking().map_err(|e| {
            debug!("Command channel closed: {}", e);
            crate::Error::Channel(e.to_string())
        })
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<DriverCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: DriverEvent) -> crate::Result<()> {
        self.event_tx.send_blocking(event).map_err(|e| {
            warn!("Dropping event, no receiver: {:?}", e.into_inner());
            crate::Error::Channel("event receiver closed".to_string())
        })
    }
}

/// Create the channel bridge between Tokio and the driver worker
///
/// Returns (DriverBridge for Tokio, DriverWorker for the worker thread)
pub fn create_driver_bridge() -> (DriverBridge, DriverWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        DriverBridge { cmd_tx, event_rx },
        DriverWorker { cmd_rx, event_tx },
    )
}
