//! Notifications to the upper layer

use crate::state::DeviceIdentity;
use bytes::Bytes;
use common::{DevicePower, DriverEvent};
use protocol::FlowCommand;
use tracing::warn;

/// Calls the driver core makes into the network layer above it
pub trait UpperLayerNotifier: Send + Sync {
    fn notify_link_down(&self);

    fn notify_deregistration(&self);

    fn notify_flow_control(&self, command: FlowCommand);

    fn notify_power_state_changed(&self, level: DevicePower);

    /// Deliver a data-channel payload
    fn indicate_receive(&self, payload: Bytes);

    fn notify_device_started(&self, _identity: &DeviceIdentity) {}

    fn notify_device_removed(&self) {}
}

/// Forwards notifications as [`DriverEvent`]s over the worker bridge
///
/// Never blocks: when the front-end falls behind, events are dropped and
/// logged.
#[derive(Clone)]
pub struct ChannelNotifier {
    events: async_channel::Sender<DriverEvent>,
}

impl ChannelNotifier {
    pub fn new(events: async_channel::Sender<DriverEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: DriverEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping driver event: {}", e);
        }
    }
}

impl UpperLayerNotifier for ChannelNotifier {
    fn notify_link_down(&self) {
        self.emit(DriverEvent::LinkDown);
    }

    fn notify_deregistration(&self) {
        self.emit(DriverEvent::Deregistered);
    }

    fn notify_flow_control(&self, command: FlowCommand) {
        self.emit(DriverEvent::FlowControl(command));
    }

    fn notify_power_state_changed(&self, level: DevicePower) {
        self.emit(DriverEvent::PowerStateChanged(level));
    }

    fn indicate_receive(&self, payload: Bytes) {
        self.emit(DriverEvent::Received(payload));
    }

    fn notify_device_started(&self, identity: &DeviceIdentity) {
        self.emit(DriverEvent::DeviceStarted {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            model: identity.model,
        });
    }

    fn notify_device_removed(&self) {
        self.emit(DriverEvent::DeviceRemoved);
    }
}
