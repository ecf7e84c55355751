//! Shared per-device state
//!
//! One [`DeviceState`] exists per logical device. The session owns it through
//! an `Arc`; service loops, the power controller and the adapter registry
//! hold clones. Each field group sits behind its own lock so the read and
//! write paths never contend on a single mutex.

use crate::error::{DriverError, Result};
use crate::power::PowerRequestPool;
use crate::usb::enumerator::{DeviceStrings, UsbConfiguration};
use bytes::Bytes;
use common::{DevicePower, ModelType, PipeKind, SystemPower, UsbError, UsbSpeed};
use protocol::MuxChannels;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// I/O busy mask bits
pub const IO_READ: u32 = 1 << 0;
pub const IO_WRITE: u32 = 1 << 1;
pub const IO_CONTROL: u32 = 1 << 2;

/// MUX settings of this logical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    pub enabled: bool,
    pub control_dlci: u8,
    pub data_dlci: u8,
    /// Interface number of the underlying USB function
    pub physical_interface: u8,
    /// Interface number of this logical device
    pub interface_number: u8,
}

impl Default for MuxConfig {
    fn default() -> Self {
        let channels = MuxChannels::default();
        Self {
            enabled: false,
            control_dlci: channels.control_dlci,
            data_dlci: channels.data_dlci,
            physical_interface: 0,
            interface_number: 0,
        }
    }
}

impl MuxConfig {
    /// This device is the physical USB function rather than a MUX-derived channel
    pub fn is_primary(&self) -> bool {
        self.physical_interface == self.interface_number
    }

    pub fn channels(&self) -> MuxChannels {
        MuxChannels {
            control_dlci: self.control_dlci,
            data_dlci: self.data_dlci,
        }
    }
}

/// Device lifecycle
///
/// `in_service` means a client is attached. Removal and presence are
/// separate variants, so a removed device can never also be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceLifecycle {
    #[default]
    Absent,
    Present,
    Started {
        in_service: bool,
    },
    SurpriseRemoved,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Arrive,
    Start,
    Stop,
    Open,
    Close,
    SurpriseRemove,
    Remove,
}

impl LifecycleEvent {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleEvent::Arrive => "arrive",
            LifecycleEvent::Start => "start",
            LifecycleEvent::Stop => "stop",
            LifecycleEvent::Open => "open",
            LifecycleEvent::Close => "close",
            LifecycleEvent::SurpriseRemove => "surprise-remove",
            LifecycleEvent::Remove => "remove",
        }
    }
}

impl DeviceLifecycle {
    /// Transition table
    pub fn next(self, event: LifecycleEvent) -> Result<Self> {
        use DeviceLifecycle::*;
        use LifecycleEvent as E;

        match (self, event) {
            (Absent, E::Arrive) => Ok(Present),
            (Present, E::Start) => Ok(Started { in_service: false }),
            (Started { in_service: false }, E::Open) => Ok(Started { in_service: true }),
            (Started { in_service: true }, E::Open) => Err(DriverError::DeviceBusy),
            (Started { .. }, E::Close) => Ok(Started { in_service: false }),
            (Present | Started { .. }, E::Stop) => Ok(Present),
            (Present | Started { .. } | SurpriseRemoved, E::SurpriseRemove) => {
                Ok(SurpriseRemoved)
            }
            (_, E::Remove) => Ok(Removed),
            (from, event) => Err(DriverError::InvalidState {
                from: from.name(),
                event: event.name(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceLifecycle::Absent => "absent",
            DeviceLifecycle::Present => "present",
            DeviceLifecycle::Started { in_service: false } => "started",
            DeviceLifecycle::Started { in_service: true } => "in-service",
            DeviceLifecycle::SurpriseRemoved => "surprise-removed",
            DeviceLifecycle::Removed => "removed",
        }
    }

    pub fn is_present(self) -> bool {
        matches!(
            self,
            DeviceLifecycle::Present | DeviceLifecycle::Started { .. }
        )
    }

    pub fn is_started(self) -> bool {
        matches!(self, DeviceLifecycle::Started { .. })
    }

    /// Client attached
    pub fn in_service(self) -> bool {
        matches!(self, DeviceLifecycle::Started { in_service: true })
    }

    pub fn is_removed(self) -> bool {
        matches!(
            self,
            DeviceLifecycle::SurpriseRemoved | DeviceLifecycle::Removed
        )
    }
}

/// Who the device is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub port_name: String,
    pub model: ModelType,
    pub speed: UsbSpeed,
    pub bcd_usb: u16,
    pub strings: DeviceStrings,
}

/// Power bookkeeping
#[derive(Debug, Clone, Default)]
pub struct PowerState {
    pub device: DevicePower,
    pub system: SystemPower,
    pub prepare_to_power_down: bool,
    pub selective_suspend_allowed: bool,
    /// Data threads were stopped for a power transition
    pub power_suspended: bool,
    /// The stop was an idle (selective) suspend
    pub idle_suspended: bool,
    pub low_power_mode: bool,
    pub stopped: bool,
    /// Deregistration already sent in this sleep cycle
    pub dereg_sent: bool,
    pub wait_wake_armed: bool,
    pub idle_deadline: Option<Instant>,
}

/// Transfer size buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHistogram {
    pub under_10k: u64,
    pub from_10k_to_20k: u64,
    pub from_20k_to_30k: u64,
    pub over_30k: u64,
}

impl SizeHistogram {
    pub fn record(&mut self, size: usize) {
        const K: usize = 1024;
        match size {
            s if s < 10 * K => self.under_10k += 1,
            s if s < 20 * K => self.from_10k_to_20k += 1,
            s if s < 30 * K => self.from_20k_to_30k += 1,
            _ => self.over_30k += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.under_10k + self.from_10k_to_20k + self.from_20k_to_30k + self.over_30k
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub rx: SizeHistogram,
    pub tx: SizeHistogram,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub dropped_frames: u64,
}

impl TransferStats {
    pub fn record_rx(&mut self, size: usize) {
        self.rx.record(size);
        self.rx_bytes += size as u64;
    }

    pub fn record_tx(&mut self, size: usize) {
        self.tx.record(size);
        self.tx_bytes += size as u64;
    }
}

/// Per-device queues, one lock each
#[derive(Debug, Default)]
pub struct IoQueues {
    /// Raw bulk-in buffers awaiting dispatch
    read: Mutex<VecDeque<Bytes>>,
    /// Framed data awaiting bulk-out
    write: Mutex<VecDeque<Bytes>>,
    /// Framed control-channel messages, sent ahead of data
    control: Mutex<VecDeque<Bytes>>,
    /// Single pending interrupt notification
    completion: Mutex<Option<Bytes>>,
}

impl IoQueues {
    pub fn push_read(&self, buf: Bytes) {
        lock(&self.read).push_back(buf);
    }

    pub fn pop_read(&self) -> Option<Bytes> {
        lock(&self.read).pop_front()
    }

    pub fn push_write(&self, frame: Bytes) {
        lock(&self.write).push_back(frame);
    }

    pub fn pop_write(&self) -> Option<Bytes> {
        lock(&self.write).pop_front()
    }

    pub fn push_control(&self, frame: Bytes) {
        lock(&self.control).push_back(frame);
    }

    pub fn pop_control(&self) -> Option<Bytes> {
        lock(&self.control).pop_front()
    }

    /// Replace the pending notification, returning the one it displaced
    pub fn set_notification(&self, buf: Bytes) -> Option<Bytes> {
        lock(&self.completion).replace(buf)
    }

    pub fn take_notification(&self) -> Option<Bytes> {
        lock(&self.completion).take()
    }

    pub fn read_len(&self) -> usize {
        lock(&self.read).len()
    }

    pub fn write_len(&self) -> usize {
        lock(&self.write).len() + lock(&self.control).len()
    }

    /// Drop queued transmit frames, returning how many were discarded
    pub fn flush_tx(&self) -> usize {
        let mut dropped = 0;
        {
            let mut write = lock(&self.write);
            dropped += write.len();
            write.clear();
        }
        let mut control = lock(&self.control);
        dropped += control.len();
        control.clear();
        dropped
    }

    /// Empty the read and write queues
    pub fn purge(&self) {
        lock(&self.read).clear();
        self.flush_tx();
    }
}

/// Clears its busy bit on drop
pub struct IoBusyGuard<'a> {
    mask: &'a AtomicU32,
    bit: u32,
}

impl Drop for IoBusyGuard<'_> {
    fn drop(&mut self) {
        self.mask.fetch_and(!self.bit, Ordering::AcqRel);
    }
}

/// Shared mutable record for one logical device
#[derive(Debug)]
pub struct DeviceState {
    mux: MuxConfig,
    identity: Mutex<DeviceIdentity>,
    lifecycle: Mutex<DeviceLifecycle>,
    power: Mutex<PowerState>,
    power_requests: Mutex<PowerRequestPool>,
    configuration: Mutex<Option<Arc<UsbConfiguration>>>,
    pipe_status: Mutex<HashMap<PipeKind, Option<UsbError>>>,
    stats: Mutex<TransferStats>,
    io_busy: AtomicU32,
    inflight_responses: AtomicU32,
    tx_paused: AtomicBool,
    pub queues: IoQueues,
}

impl DeviceState {
    pub fn new(mux: MuxConfig, port_name: &str, power_request_pool: usize) -> Self {
        Self {
            mux,
            identity: Mutex::new(DeviceIdentity {
                port_name: port_name.to_string(),
                ..Default::default()
            }),
            lifecycle: Mutex::new(DeviceLifecycle::Absent),
            power: Mutex::new(PowerState {
                selective_suspend_allowed: true,
                ..Default::default()
            }),
            power_requests: Mutex::new(PowerRequestPool::new(power_request_pool)),
            configuration: Mutex::new(None),
            pipe_status: Mutex::new(HashMap::new()),
            stats: Mutex::new(TransferStats::default()),
            io_busy: AtomicU32::new(0),
            inflight_responses: AtomicU32::new(0),
            tx_paused: AtomicBool::new(false),
            queues: IoQueues::default(),
        }
    }

    pub fn mux(&self) -> &MuxConfig {
        &self.mux
    }

    pub fn lifecycle(&self) -> DeviceLifecycle {
        *lock(&self.lifecycle)
    }

    /// Apply a lifecycle event; the state is unchanged on error
    pub fn apply(&self, event: LifecycleEvent) -> Result<DeviceLifecycle> {
        let mut lifecycle = lock(&self.lifecycle);
        let next = lifecycle.next(event)?;
        if next != *lifecycle {
            info!(
                "Device {} -> {} ({})",
                lifecycle.name(),
                next.name(),
                event.name()
            );
        }
        *lifecycle = next;
        Ok(next)
    }

    pub fn identity(&self) -> MutexGuard<'_, DeviceIdentity> {
        lock(&self.identity)
    }

    pub fn power(&self) -> MutexGuard<'_, PowerState> {
        lock(&self.power)
    }

    pub fn power_requests(&self) -> MutexGuard<'_, PowerRequestPool> {
        lock(&self.power_requests)
    }

    pub fn configuration(&self) -> Option<Arc<UsbConfiguration>> {
        lock(&self.configuration).clone()
    }

    pub fn set_configuration(&self, config: Option<UsbConfiguration>) {
        *lock(&self.configuration) = config.map(Arc::new);
    }

    /// Forget everything learned from descriptors
    pub fn reset_descriptor_cache(&self) {
        {
            let mut identity = self.identity();
            let port_name = std::mem::take(&mut identity.port_name);
            *identity = DeviceIdentity {
                port_name,
                ..Default::default()
            };
        }
        self.set_configuration(None);
        lock(&self.pipe_status).clear();
    }

    /// Record the completion status of a pipe operation
    pub fn record_pipe_status(&self, kind: PipeKind, status: std::result::Result<(), &UsbError>) {
        let status = status.err().cloned();
        if let Some(err) = &status {
            debug!("Pipe {:?} status: {}", kind, err);
        }
        lock(&self.pipe_status).insert(kind, status);
    }

    pub fn pipe_status(&self, kind: PipeKind) -> Option<UsbError> {
        lock(&self.pipe_status).get(&kind).cloned().flatten()
    }

    pub fn stats(&self) -> TransferStats {
        *lock(&self.stats)
    }

    pub fn update_stats(&self, f: impl FnOnce(&mut TransferStats)) {
        f(&mut lock(&self.stats));
    }

    pub fn reset_stats(&self) {
        *lock(&self.stats) = TransferStats::default();
    }

    pub fn io_busy(&self) -> u32 {
        self.io_busy.load(Ordering::Acquire)
    }

    /// Mark `bit` busy until the guard drops
    pub fn begin_io(&self, bit: u32) -> IoBusyGuard<'_> {
        self.io_busy.fetch_or(bit, Ordering::AcqRel);
        IoBusyGuard {
            mask: &self.io_busy,
            bit,
        }
    }

    pub fn inflight_responses(&self) -> u32 {
        self.inflight_responses.load(Ordering::Acquire)
    }

    pub fn add_inflight_response(&self) {
        self.inflight_responses.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reset_inflight_responses(&self) {
        self.inflight_responses.store(0, Ordering::Release);
    }

    pub fn tx_paused(&self) -> bool {
        self.tx_paused.load(Ordering::Acquire)
    }

    pub fn set_tx_paused(&self, paused: bool) {
        self.tx_paused.store(paused, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let mut lc = DeviceLifecycle::default();
        for event in [
            LifecycleEvent::Arrive,
            LifecycleEvent::Start,
            LifecycleEvent::Open,
            LifecycleEvent::Close,
            LifecycleEvent::Open,
        ] {
            lc = lc.next(event).unwrap();
        }
        assert!(lc.in_service());
        assert!(lc.is_present());
    }

    #[test]
    fn test_lifecycle_rejections() {
        assert!(matches!(
            DeviceLifecycle::Started { in_service: true }.next(LifecycleEvent::Open),
            Err(DriverError::DeviceBusy)
        ));
        assert!(matches!(
            DeviceLifecycle::Present.next(LifecycleEvent::Open),
            Err(DriverError::InvalidState { .. })
        ));
        assert!(
            DeviceLifecycle::SurpriseRemoved
                .next(LifecycleEvent::Start)
                .is_err()
        );
    }

    #[test]
    fn test_removed_is_never_present() {
        let lc = DeviceLifecycle::Started { in_service: true }
            .next(LifecycleEvent::SurpriseRemove)
            .unwrap();
        assert!(lc.is_removed());
        assert!(!lc.is_present());
        assert!(!lc.in_service());

        let lc = lc.next(LifecycleEvent::Remove).unwrap();
        assert_eq!(lc, DeviceLifecycle::Removed);
        assert!(!lc.is_present());
    }

    #[test]
    fn test_close_is_idempotent() {
        let lc = DeviceLifecycle::Started { in_service: false };
        assert_eq!(lc.next(LifecycleEvent::Close).unwrap(), lc);
    }

    #[test]
    fn test_apply_leaves_state_on_error() {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 4);
        assert!(state.apply(LifecycleEvent::Start).is_err());
        assert_eq!(state.lifecycle(), DeviceLifecycle::Absent);
    }

    #[test]
    fn test_histogram_buckets() {
        let mut h = SizeHistogram::default();
        h.record(100);
        h.record(10 * 1024);
        h.record(25 * 1024);
        h.record(64 * 1024);
        assert_eq!(
            h,
            SizeHistogram {
                under_10k: 1,
                from_10k_to_20k: 1,
                from_20k_to_30k: 1,
                over_30k: 1
            }
        );
        assert_eq!(h.total(), 4);
    }

    #[test]
    fn test_io_busy_guard() {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 4);
        {
            let _read = state.begin_io(IO_READ);
            let _write = state.begin_io(IO_WRITE);
            assert_eq!(state.io_busy(), IO_READ | IO_WRITE);
        }
        assert_eq!(state.io_busy(), 0);
    }

    #[test]
    fn test_queue_purge() {
        let queues = IoQueues::default();
        queues.push_read(Bytes::from_static(b"rx"));
        queues.push_write(Bytes::from_static(b"tx"));
        queues.push_control(Bytes::from_static(b"ctl"));
        assert_eq!(queues.write_len(), 2);

        queues.purge();
        assert_eq!(queues.read_len(), 0);
        assert_eq!(queues.write_len(), 0);
    }

    #[test]
    fn test_pipe_status_recording() {
        let state = DeviceState::new(MuxConfig::default(), "modem0", 4);
        state.record_pipe_status(PipeKind::Input, Err(&UsbError::NoDevice));
        assert_eq!(state.pipe_status(PipeKind::Input), Some(UsbError::NoDevice));
        state.record_pipe_status(PipeKind::Input, Ok(()));
        assert_eq!(state.pipe_status(PipeKind::Input), None);
    }

    #[test]
    fn test_primary_detection() {
        let mux = MuxConfig {
            enabled: true,
            physical_interface: 4,
            interface_number: 4,
            ..Default::default()
        };
        assert!(mux.is_primary());
        assert_eq!(mux.channels(), MuxChannels::default());
    }
}
