//! Pipe reset sequencing, control transfers and USB health check

use crate::error::Result;
use crate::state::DeviceState;
use crate::usb::enumerator::PipeType;
use crate::usb::transport::{ControlRequest, Transport};
use common::{PipeKind, UsbError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts of the interrupt/input/output reset triple
pub const RESET_ATTEMPTS: u32 = 10;

/// Fixed delay between reset attempts
pub const RESET_BACKOFF: Duration = Duration::from_millis(400);

/// Resets the device's pipes and records their status
pub struct PipeManager<'a> {
    transport: &'a dyn Transport,
    state: &'a DeviceState,
    backoff: Duration,
}

impl<'a> PipeManager<'a> {
    pub fn new(transport: &'a dyn Transport, state: &'a DeviceState) -> Self {
        Self {
            transport,
            state,
            backoff: RESET_BACKOFF,
        }
    }

    /// Override the delay between attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn reset_input(&self) -> Result<()> {
        self.reset(PipeType::BulkIn, PipeKind::Input)
    }

    pub fn reset_output(&self) -> Result<()> {
        self.reset(PipeType::BulkOut, PipeKind::Output)
    }

    pub fn reset_interrupt(&self) -> Result<()> {
        self.reset(PipeType::Interrupt, PipeKind::Interrupt)
    }

    fn reset(&self, pipe: PipeType, kind: PipeKind) -> Result<()> {
        let Some(endpoint) = self
            .state
            .configuration()
            .and_then(|c| c.pipe(pipe).map(|p| p.endpoint_address))
        else {
            debug!("No {:?} pipe to reset", pipe);
            return Ok(());
        };

        let result = self.transport.reset_pipe(endpoint);
        self.state.record_pipe_status(kind, result.as_ref().copied());
        result.map_err(|e| {
            warn!("Reset of {:?} pipe {:#04x} failed: {}", pipe, endpoint, e);
            e.into()
        })
    }

    /// Issue a control request, recording the default pipe's status
    pub fn control_out(&self, request: &ControlRequest) -> std::result::Result<(), UsbError> {
        let result = self.transport.control_out(request);
        self.state.record_pipe_status(PipeKind::Control, result.as_ref().copied());
        result
    }

    /// Reset interrupt, input and output in order, retrying the whole triple
    pub fn reset_with_retry(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            let result = self
                .reset_interrupt()
                .and_then(|_| self.reset_input())
                .and_then(|_| self.reset_output());

            match result {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Pipes reset after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(e) if attempt >= RESET_ATTEMPTS => {
                    warn!("Giving up pipe reset after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    debug!("Pipe reset attempt {} failed: {}", attempt, e);
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
            }
        }
    }
}

/// True when a tracked pipe reports the device gone
///
/// Only meaningful while the system is awake; during sleep transitions the
/// check always reports healthy.
pub fn is_usb_broken(state: &DeviceState) -> bool {
    if !state.power().system.is_awake() {
        return false;
    }

    PipeKind::ALL.iter().any(|&kind| {
        matches!(
            state.pipe_status(kind),
            Some(UsbError::NoDevice | UsbError::NotFound)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MuxConfig;
    use common::SystemPower;

    #[test]
    fn test_broken_when_awake() {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 1);
        assert!(!is_usb_broken(&state));

        state.record_pipe_status(PipeKind::Output, Err(&UsbError::NotFound));
        assert!(is_usb_broken(&state));

        state.power().system = SystemPower::Working;
        assert!(is_usb_broken(&state));
    }

    #[test]
    fn test_not_broken_while_asleep() {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 1);
        for kind in PipeKind::ALL {
            state.record_pipe_status(kind, Err(&UsbError::NoDevice));
        }
        state.power().system = SystemPower::Sleeping2;
        assert!(!is_usb_broken(&state));
    }

    #[test]
    fn test_control_failure_marks_broken() {
        let transport = crate::testing::MockTransport::modem();
        let state = DeviceState::new(MuxConfig::default(), "modem0", 1);
        let pipes = PipeManager::new(&transport, &state);
        let request = ControlRequest::line_state(0, true, true);

        assert!(pipes.control_out(&request).is_ok());
        assert!(!is_usb_broken(&state));

        transport.fail_control(UsbError::NoDevice);
        assert_eq!(pipes.control_out(&request), Err(UsbError::NoDevice));
        assert!(is_usb_broken(&state));
    }

    #[test]
    fn test_other_errors_are_not_broken() {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 1);
        state.record_pipe_status(PipeKind::Input, Err(&UsbError::Pipe));
        state.record_pipe_status(PipeKind::Control, Err(&UsbError::Timeout));
        assert!(!is_usb_broken(&state));
    }
}
