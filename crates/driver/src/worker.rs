//! Driver worker thread
//!
//! Dedicated thread that owns the device session. It executes commands
//! from the Tokio runtime, pumps libusb hot-plug events, and polls the idle
//! timer and link health between commands.

use crate::error::{DriverError, Result};
use crate::notify::ChannelNotifier;
use crate::power::PowerRequest;
use crate::registry::AdapterKey;
use crate::session::{DeviceSession, SessionOptions};
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::usb::device::{RusbTransport, map_rusb_error};
use common::{DriverCommand, DriverWorker, StatusReport, UsbError};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long one libusb event pump may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// What the worker drives
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub session: SessionOptions,
    /// Persistent store; in-memory when unset
    pub store_path: Option<PathBuf>,
}

#[derive(Debug)]
enum HotplugEvent {
    Arrived,
    Left { bus: u8, address: u8 },
}

/// Forwards hot-plug callbacks for the configured VID/PID to the worker
struct HotplugWatcher {
    events: async_channel::Sender<HotplugEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugWatcher {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.try_send(HotplugEvent::Arrived);
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.try_send(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

pub struct DriverWorkerThread {
    context: Context,
    settings: WorkerSettings,
    worker: DriverWorker,
    notifier: Arc<ChannelNotifier>,
    session: Option<DeviceSession>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
    _hotplug_registration: Option<Registration<Context>>,
}

impl DriverWorkerThread {
    pub fn new(worker: DriverWorker, settings: WorkerSettings) -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        let notifier = Arc::new(ChannelNotifier::new(worker.event_tx.clone()));
        let (hotplug_tx, hotplug_rx) = async_channel::unbounded();

        let registration = if rusb::has_hotplug() {
            let registration = HotplugBuilder::new()
                .vendor_id(settings.vendor_id)
                .product_id(settings.product_id)
                .enumerate(false)
                .register(&context, Box::new(HotplugWatcher { events: hotplug_tx }))
                .map_err(map_rusb_error)?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("libusb has no hot-plug support; device must be present at startup");
            None
        };

        let mut thread = Self {
            context,
            settings,
            worker,
            notifier,
            session: None,
            hotplug_rx,
            _hotplug_registration: registration,
        };
        thread.attach();
        Ok(thread)
    }

    fn open_store(&self) -> Result<Box<dyn KeyValueStore>> {
        Ok(match &self.settings.store_path {
            Some(path) => Box::new(FileStore::open(path)?),
            None => Box::new(MemoryStore::new()),
        })
    }

    /// Open and start the configured device if it is on the bus
    fn attach(&mut self) {
        if self.session.is_some() {
            return;
        }

        let WorkerSettings {
            vendor_id,
            product_id,
            ..
        } = self.settings;
        let transport = match RusbTransport::open(&self.context, vendor_id, product_id) {
            Ok(transport) => transport,
            Err(UsbError::NotFound) => {
                info!(
                    "Waiting for device {:04x}:{:04x}",
                    vendor_id, product_id
                );
                return;
            }
            Err(e) => {
                error!("Failed to open {:04x}:{:04x}: {}", vendor_id, product_id, e);
                return;
            }
        };

        let key = AdapterKey {
            bus: transport.bus_number(),
            address: transport.address(),
            interface: self.settings.session.mux.interface_number,
        };

        let result = self.open_store().and_then(|store| {
            let mut session = DeviceSession::new(
                key,
                Arc::new(transport),
                self.notifier.clone(),
                store,
                self.settings.session.clone(),
            )?;
            session.start_device()?;
            Ok(session)
        });

        match result {
            Ok(session) => self.session = Some(session),
            Err(e) => error!("Failed to start device at {:?}: {}", key, e),
        }
    }

    fn detach(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            info!("Detaching device: {}", reason);
            session.surprise_remove();
        }
    }

    /// Run the worker event loop until a Shutdown command arrives
    pub fn run(mut self) -> Result<()> {
        info!("Driver worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(DriverCommand::Shutdown) => {
                    info!("Driver worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            self.process_hotplug();
            self.poll_session(Instant::now());
        }

        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
        info!("Driver worker thread stopped");
        Ok(())
    }

    fn process_hotplug(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived => self.attach(),
                HotplugEvent::Left { bus, address } => {
                    let ours = self
                        .session
                        .as_ref()
                        .is_some_and(|s| s.key().bus == bus && s.key().address == address);
                    if ours {
                        self.detach("device left the bus");
                    }
                }
            }
        }
    }

    fn poll_session(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Err(e) = session.poll_idle(now) {
            if e.is_veto() {
                debug!("Idle suspend vetoed: {}", e);
            } else {
                warn!("Idle suspend failed: {}", e);
            }
        }
        if let Err(e) = session.check_health() {
            self.detach(&e.to_string());
        }
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        // A panic in the session must not take the worker down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execute_command(&mut self.session, cmd)
        }));

        match result {
            Ok(true) => self.detach("device-fatal command failure"),
            Ok(false) => {}
            Err(e) => error!("Panic in driver command handler: {:?}", e),
        }
    }
}

fn with_session<T>(
    session: &mut Option<DeviceSession>,
    event: &'static str,
    f: impl FnOnce(&mut DeviceSession) -> Result<T>,
) -> Result<T> {
    match session.as_mut() {
        Some(session) => f(session),
        None => Err(DriverError::InvalidState {
            from: "absent",
            event,
        }),
    }
}

/// Execute one command and reply to it
///
/// Returns true when the command failed with a device-fatal error.
pub fn execute_command(session: &mut Option<DeviceSession>, cmd: DriverCommand) -> bool {
    let (result, response) = match cmd {
        DriverCommand::Open { response } => (with_session(session, "open", |s| s.open()), response),
        DriverCommand::Close { response } => {
            (with_session(session, "close", |s| s.close()), response)
        }
        DriverCommand::Send {
            payload,
            is_data,
            response,
        } => (
            with_session(session, "send", |s| s.send(payload, is_data)),
            response,
        ),
        DriverCommand::SetSystemPower { level, response } => (
            with_session(session, "set-system-power", |s| {
                s.handle_power(PowerRequest::SetSystem(level))
            }),
            response,
        ),
        DriverCommand::SetDevicePower { level, response } => (
            with_session(session, "set-device-power", |s| {
                s.handle_power(PowerRequest::SetDevice(level))
            }),
            response,
        ),
        DriverCommand::QueryStatus { response } => {
            let report = session
                .as_ref()
                .map(DeviceSession::status)
                .unwrap_or_else(|| StatusReport {
                    lifecycle: "absent".to_string(),
                    ..Default::default()
                });
            let _ = response.send(report);
            return false;
        }
        DriverCommand::Shutdown => {
            debug!("Shutdown is handled by the event loop");
            return false;
        }
    };

    let fatal = match &result {
        Ok(()) => false,
        Err(e) => {
            debug!("Command failed: {}", e);
            e.is_device_fatal()
        }
    };
    let _ = response.send(result.map_err(Into::into));
    fatal
}

/// Spawn the driver worker thread
pub fn spawn_driver_worker(
    worker: DriverWorker,
    settings: WorkerSettings,
) -> std::io::Result<std::thread::JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("driver-worker".to_string())
        .spawn(move || DriverWorkerThread::new(worker, settings)?.run())
}
