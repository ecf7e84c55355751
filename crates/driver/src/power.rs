//! Power arbitration
//!
//! Maps device (D0..D3) and system (S0..S5) power transitions onto driver
//! actions. The controller only decides; the session carries out the
//! returned [`PowerSignal`] (stop, resume or fully reinitialize the data
//! path).
//!
//! Power requests the driver issues itself (idle suspend, wake for
//! transmit) are recorded in a [`PowerRequestPool`] so the dispatch filter
//! can recognize them when they come back and not forward them again.

use crate::error::{DriverError, Result};
use crate::notify::UpperLayerNotifier;
use crate::service::{ServiceSet, StopTag};
use crate::state::DeviceState;
use crate::usb::pipes::PipeManager;
use crate::usb::transport::{ControlRequest, Transport};
use common::{DevicePower, SystemPower};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default number of self-originated request slots
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Index of a slot in the request pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PowerRequestHandle(usize);

#[derive(Debug, Clone, Copy, Default)]
struct PowerRequestRecord {
    target: DevicePower,
    live: bool,
}

/// Fixed arena of self-originated power request records
///
/// Slots move between the free list and the pending queue by index; the
/// arena never grows after construction.
#[derive(Debug)]
pub struct PowerRequestPool {
    slots: Vec<PowerRequestRecord>,
    free: Vec<usize>,
    pending: VecDeque<usize>,
}

impl PowerRequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![PowerRequestRecord::default(); capacity],
            free: (0..capacity).rev().collect(),
            pending: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record a request for `target` as pending
    pub fn push_pending(&mut self, target: DevicePower) -> Result<PowerRequestHandle> {
        let index = self.free.pop().ok_or(DriverError::PowerPoolExhausted)?;
        self.slots[index] = PowerRequestRecord { target, live: true };
        self.pending.push_back(index);
        Ok(PowerRequestHandle(index))
    }

    /// Release the oldest pending record targeting `target`
    pub fn match_and_release(&mut self, target: DevicePower) -> bool {
        let Some(pos) = self.pending.iter().position(|&i| {
            let slot = &self.slots[i];
            slot.live && slot.target == target
        }) else {
            return false;
        };

        if let Some(index) = self.pending.remove(pos) {
            self.slots[index].live = false;
            self.free.push(index);
        }
        true
    }

    /// Drop a pending record that will never be matched
    pub fn cancel(&mut self, handle: PowerRequestHandle) -> bool {
        let Some(pos) = self.pending.iter().position(|&i| i == handle.0) else {
            return false;
        };
        self.pending.remove(pos);
        self.slots[handle.0].live = false;
        self.free.push(handle.0);
        true
    }
}

/// Power request delivered to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    QueryDevice(DevicePower),
    SetDevice(DevicePower),
    QuerySystem(SystemPower),
    SetSystem(SystemPower),
}

/// How the dispatch filter treats a power request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDisposition {
    /// No registered adapter owns the device
    NotOurs,
    /// Matched a request the driver issued itself
    SelfOriginated,
    /// Externally driven; report it upward
    Forward,
}

/// Action the session must take after a device power change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSignal {
    /// Restart the stopped data path
    Wakeup,
    /// Device lost power: re-enumerate and restart
    WakeupReset,
    /// Quiesce the data path
    Standby,
}

/// Stop tags used when quiescing for a power transition
#[derive(Debug, Clone, Copy)]
pub struct StopTags {
    pub read: StopTag,
    pub write: StopTag,
    pub interrupt: StopTag,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PowerController {
    idle_timeout: Option<Duration>,
}

impl PowerController {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    /// Refuse D1+ while awake and the device is open, busy, or not allowed to suspend
    pub fn check_veto(&self, state: &DeviceState, target: DevicePower) -> Result<()> {
        if !target.is_low_power() {
            return Ok(());
        }

        let in_service = state.lifecycle().in_service();
        let busy = state.io_busy();
        let power = state.power();
        if !power.system.is_awake() {
            return Ok(());
        }

        let reason = if in_service {
            "client open"
        } else if busy != 0 {
            "I/O in flight"
        } else if !power.selective_suspend_allowed {
            "selective suspend disabled"
        } else {
            return Ok(());
        };

        warn!("Vetoing {:?}: {}", target, reason);
        Err(DriverError::PowerVeto(format!("{:?}: {}", target, reason)))
    }

    /// Record a device power transition and return the action it requires
    ///
    /// A vetoed request leaves the recorded level unchanged.
    pub fn set_device_power(
        &self,
        state: &DeviceState,
        target: DevicePower,
    ) -> Result<Option<PowerSignal>> {
        self.check_veto(state, target)?;

        let mut power = state.power();
        let current = power.device;
        if current == target {
            return Ok(None);
        }

        if target.is_low_power() && !power.system.is_awake() && power.idle_suspended {
            // An idle-suspended device that sleeps with the system loses power
            debug!("Idle suspend superseded by {:?} during system sleep", target);
            power.idle_suspended = false;
        }

        let signal = if target == DevicePower::D0 {
            power.stopped = false;
            current.is_low_power().then(|| {
                if power.power_suspended && !power.idle_suspended {
                    PowerSignal::WakeupReset
                } else {
                    PowerSignal::Wakeup
                }
            })
        } else if target.is_low_power() && !current.is_low_power() {
            power.stopped = true;
            Some(PowerSignal::Standby)
        } else {
            None
        };

        power.device = target;
        info!("Device power {:?} -> {:?} ({:?})", current, target, signal);
        Ok(signal)
    }

    /// Record a system power transition
    pub fn set_system_power(
        &self,
        state: &DeviceState,
        target: SystemPower,
        notifier: &dyn UpperLayerNotifier,
    ) {
        let send_dereg = {
            let mut power = state.power();
            debug!("System power {:?} -> {:?}", power.system, target);
            power.system = target;

            if target.is_awake() {
                power.dereg_sent = false;
                power.prepare_to_power_down = false;
                return;
            }
            if !target.is_deep_sleep() {
                return;
            }

            power.prepare_to_power_down = true;
            !std::mem::replace(&mut power.dereg_sent, true)
        };

        let dropped = state.queues.flush_tx();
        if dropped > 0 {
            info!("Flushed {} queued frames before {:?}", dropped, target);
        }
        if send_dereg {
            info!("Sending deregistration before {:?}", target);
            notifier.notify_deregistration();
        }
    }

    /// Queue a self-originated request for `target`
    pub fn request_self_power(
        &self,
        state: &DeviceState,
        target: DevicePower,
    ) -> Result<PowerRequestHandle> {
        state.power_requests().push_pending(target).inspect_err(|_| {
            error!("Self-originated power request pool exhausted ({:?})", target);
        })
    }

    /// Arm or disarm remote wakeup
    ///
    /// The feature request goes out only on a change. Arming is skipped when
    /// the active configuration does not advertise remote wakeup; a failed
    /// disarm still leaves the flag cleared.
    pub fn set_wait_wake(&self, state: &DeviceState, transport: &dyn Transport, armed: bool) {
        if state.power().wait_wake_armed == armed {
            return;
        }
        if armed && !state.configuration().is_some_and(|c| c.remote_wakeup) {
            debug!("Configuration has no remote wakeup, not arming");
            return;
        }

        let request = ControlRequest::remote_wakeup(armed);
        match PipeManager::new(transport, state).control_out(&request) {
            Ok(()) => {
                debug!("Wait-wake armed={}", armed);
                state.power().wait_wake_armed = armed;
            }
            Err(e) => {
                warn!("Failed to set wait-wake armed={}: {}", armed, e);
                if !armed {
                    state.power().wait_wake_armed = false;
                }
            }
        }
    }

    /// Quiesce the data path for a low-power transition
    ///
    /// Returns immediately if already in low-power mode. Transport errors
    /// while signalling idle or dropping DTR are logged only. An idle suspend
    /// arms wait-wake unless `cancel_wait_wake` is set.
    pub fn stop_data_threads(
        &self,
        state: &DeviceState,
        transport: &dyn Transport,
        services: &mut ServiceSet,
        cancel_wait_wake: bool,
        tags: StopTags,
    ) -> Result<()> {
        let (drop_dtr, idle) = {
            let mut power = state.power();
            if power.low_power_mode {
                debug!("Data threads already stopped");
                return Ok(());
            }
            power.power_suspended = true;
            power.low_power_mode = true;
            let drop_dtr = power.device >= DevicePower::D3
                && (!power.system.is_awake() || power.prepare_to_power_down);
            (drop_dtr, power.idle_suspended)
        };

        if cancel_wait_wake {
            self.set_wait_wake(state, transport, false);
        } else if idle {
            self.set_wait_wake(state, transport, true);
        }

        if state.mux().is_primary() {
            if let Err(e) = transport.set_idle(true) {
                warn!("Failed to signal interface idle: {}", e);
            }
        }

        if drop_dtr {
            if let Some(config) = state.configuration() {
                let request = ControlRequest::line_state(config.control_interface(), false, false);
                if let Err(e) = PipeManager::new(transport, state).control_out(&request) {
                    warn!("Failed to drop DTR: {}", e);
                }
            }
        }

        for (service, tag, wait) in [
            (&mut services.read, tags.read, true),
            (&mut services.write, tags.write, false),
            (&mut services.interrupt, tags.interrupt, true),
        ] {
            if let Err(e) = service.request_stop(tag, wait) {
                warn!("Failed to stop {} loop: {}", service.name(), e);
            }
        }

        state.reset_inflight_responses();
        Ok(())
    }

    /// Clear the suspend flags after the data path restarted
    pub fn clear_suspend(&self, state: &DeviceState) {
        let mut power = state.power();
        power.low_power_mode = false;
        power.power_suspended = false;
        power.idle_suspended = false;
        power.wait_wake_armed = false;
    }

    pub fn arm_idle_timer(&self, state: &DeviceState, now: Instant) {
        if let Some(timeout) = self.idle_timeout {
            state.power().idle_deadline = Some(now + timeout);
        }
    }

    pub fn cancel_idle_timer(&self, state: &DeviceState) {
        state.power().idle_deadline = None;
    }

    /// Idle timer fired and the device may be selectively suspended
    pub fn idle_expired(&self, state: &DeviceState, now: Instant) -> bool {
        let in_service = state.lifecycle().in_service();
        let busy = state.io_busy() != 0;
        let power = state.power();

        matches!(power.idle_deadline, Some(deadline) if now >= deadline)
            && power.selective_suspend_allowed
            && power.system.is_awake()
            && !power.device.is_low_power()
            && !in_service
            && !busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{IO_READ, LifecycleEvent, MuxConfig};
    use crate::testing::{MockTransport, RecordingNotifier, configure};
    use crate::usb::transport::{CLEAR_FEATURE, SET_FEATURE};
    use crate::workers::threaded_services;
    use common::UsbError;
    use common::test_utils::{ConfigDescriptorBuilder, EP_BULK, EP_INTERRUPT};
    use std::sync::Arc;

    const TAGS: StopTags = StopTags {
        read: StopTag(1),
        write: StopTag(2),
        interrupt: StopTag(3),
    };

    fn started_state() -> DeviceState {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 4);
        state.apply(LifecycleEvent::Arrive).unwrap();
        state.apply(LifecycleEvent::Start).unwrap();
        state.power().device = DevicePower::D0;
        state.power().system = SystemPower::Working;
        state
    }

    #[test]
    fn test_pool_allocate_release() {
        let mut pool = PowerRequestPool::new(2);
        let a = pool.push_pending(DevicePower::D2).unwrap();
        let _b = pool.push_pending(DevicePower::D0).unwrap();
        assert!(matches!(
            pool.push_pending(DevicePower::D3),
            Err(DriverError::PowerPoolExhausted)
        ));

        assert!(pool.match_and_release(DevicePower::D2));
        assert!(!pool.match_and_release(DevicePower::D2));
        assert!(!pool.cancel(a));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.pending_count(), 1);
    }

    #[test]
    fn test_pool_cancel() {
        let mut pool = PowerRequestPool::new(1);
        let handle = pool.push_pending(DevicePower::D2).unwrap();
        assert!(pool.cancel(handle));
        assert!(!pool.cancel(handle));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_veto_when_client_open() {
        let controller = PowerController::default();
        let state = started_state();
        state.apply(LifecycleEvent::Open).unwrap();

        let err = controller
            .set_device_power(&state, DevicePower::D2)
            .unwrap_err();
        assert!(err.is_veto());
        assert_eq!(state.power().device, DevicePower::D0);
    }

    #[test]
    fn test_veto_when_busy_or_suspend_disabled() {
        let controller = PowerController::default();
        let state = started_state();
        {
            let _io = state.begin_io(IO_READ);
            assert!(controller.check_veto(&state, DevicePower::D1).is_err());
        }
        assert!(controller.check_veto(&state, DevicePower::D1).is_ok());

        state.power().selective_suspend_allowed = false;
        assert!(controller.check_veto(&state, DevicePower::D1).is_err());
        assert!(controller.check_veto(&state, DevicePower::D0).is_ok());
    }

    #[test]
    fn test_no_veto_while_system_sleeps() {
        let controller = PowerController::default();
        let state = started_state();
        state.apply(LifecycleEvent::Open).unwrap();
        state.power().system = SystemPower::Sleeping3;

        assert_eq!(
            controller.set_device_power(&state, DevicePower::D3).unwrap(),
            Some(PowerSignal::Standby)
        );
        assert!(state.power().stopped);
    }

    #[test]
    fn test_wakeup_vs_wakeup_reset() {
        let controller = PowerController::default();
        let state = started_state();

        controller.set_device_power(&state, DevicePower::D2).unwrap();
        state.power().power_suspended = true;
        state.power().idle_suspended = true;
        assert_eq!(
            controller.set_device_power(&state, DevicePower::D0).unwrap(),
            Some(PowerSignal::Wakeup)
        );
        assert!(!state.power().stopped);

        controller.set_device_power(&state, DevicePower::D3).unwrap();
        state.power().power_suspended = true;
        state.power().idle_suspended = false;
        assert_eq!(
            controller.set_device_power(&state, DevicePower::D0).unwrap(),
            Some(PowerSignal::WakeupReset)
        );
    }

    #[test]
    fn test_same_level_is_noop() {
        let controller = PowerController::default();
        let state = started_state();
        assert_eq!(
            controller.set_device_power(&state, DevicePower::D0).unwrap(),
            None
        );
    }

    #[test]
    fn test_idle_timer() {
        let controller = PowerController::new(Some(Duration::from_secs(5)));
        let state = started_state();
        let now = Instant::now();

        assert!(!controller.idle_expired(&state, now));
        controller.arm_idle_timer(&state, now);
        assert!(!controller.idle_expired(&state, now));
        assert!(controller.idle_expired(&state, now + Duration::from_secs(5)));

        controller.cancel_idle_timer(&state);
        assert!(!controller.idle_expired(&state, now + Duration::from_secs(60)));
    }

    #[test]
    fn test_idle_suspend_lost_in_system_sleep() {
        let controller = PowerController::default();
        let state = started_state();

        state.power().idle_suspended = true;
        controller.set_device_power(&state, DevicePower::D2).unwrap();
        state.power().power_suspended = true;
        assert!(state.power().idle_suspended);

        state.power().system = SystemPower::Sleeping3;
        assert_eq!(
            controller.set_device_power(&state, DevicePower::D3).unwrap(),
            None
        );
        assert!(!state.power().idle_suspended);

        state.power().system = SystemPower::Working;
        assert_eq!(
            controller.set_device_power(&state, DevicePower::D0).unwrap(),
            Some(PowerSignal::WakeupReset)
        );
    }

    #[test]
    fn test_stop_data_threads_twice() {
        let controller = PowerController::default();
        let transport = Arc::new(MockTransport::modem());
        let state = Arc::new(started_state());
        configure(&state, transport.as_ref());
        let mut services = threaded_services(
            transport.clone(),
            state.clone(),
            Arc::new(RecordingNotifier::default()),
        );

        for _ in 0..2 {
            controller
                .stop_data_threads(&state, transport.as_ref(), &mut services, false, TAGS)
                .unwrap();
        }
        assert_eq!(transport.idle_history(), vec![true]);
        assert!(state.power().low_power_mode);
    }

    #[test]
    fn test_wait_wake_arming() {
        let controller = PowerController::default();
        let transport = MockTransport::modem();
        let state = started_state();
        let feature_requests = || {
            transport
                .control_requests()
                .iter()
                .map(|r| r.request)
                .filter(|&r| r == SET_FEATURE || r == CLEAR_FEATURE)
                .collect::<Vec<_>>()
        };

        // Nothing to arm without a configuration
        controller.set_wait_wake(&state, &transport, true);
        assert!(!state.power().wait_wake_armed);

        configure(&state, &transport);
        controller.set_wait_wake(&state, &transport, true);
        controller.set_wait_wake(&state, &transport, true);
        assert!(state.power().wait_wake_armed);
        assert_eq!(feature_requests(), vec![SET_FEATURE]);

        transport.fail_control(UsbError::NoDevice);
        controller.set_wait_wake(&state, &transport, false);
        assert!(!state.power().wait_wake_armed);
        assert_eq!(feature_requests(), vec![SET_FEATURE, CLEAR_FEATURE]);
    }

    #[test]
    fn test_no_wait_wake_without_remote_wakeup() {
        let controller = PowerController::default();
        let transport = MockTransport::modem();
        transport.set_config_descriptor(
            ConfigDescriptorBuilder::new()
                .attributes(0x80)
                .interface(0, 0, 0xFF, 0xFF, 3)
                .endpoint(0x81, EP_INTERRUPT, 8)
                .endpoint(0x82, EP_BULK, 512)
                .endpoint(0x02, EP_BULK, 512)
                .build(),
        );
        let state = started_state();
        configure(&state, &transport);
        assert!(state.configuration().is_some());

        controller.set_wait_wake(&state, &transport, true);
        assert!(!state.power().wait_wake_armed);
        assert!(transport.control_requests().is_empty());
    }
}
