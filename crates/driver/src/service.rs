//! Service loops
//!
//! Each device runs four loops (read, write, dispatch, interrupt), each on
//! its own named thread. A loop is driven by signals on an `async-channel`:
//! a kick wakes an idle loop, a stop makes it exit at the next step
//! boundary. On exit the loop sends the stop tag back on a separate
//! "closed" channel, so a caller can wait for the acknowledgement instead
//! of aborting the thread mid-transfer.

use crate::error::{DriverError, Result};
use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::fmt;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Ordinal passed with a stop request, logged by the loop on exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StopTag(pub u16);

impl StopTag {
    /// Loop dropped without an explicit stop
    pub const DROP: StopTag = StopTag(0);
}

impl fmt::Display for StopTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of one worker step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Did work, or polled with a timeout; step again
    Busy,
    /// Nothing to do until kicked
    Idle,
}

/// Body of a service loop
pub trait LoopWorker: Send {
    fn step(&mut self) -> Step;
}

/// Start/stop contract of a service loop
pub trait ServiceLoop: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self) -> Result<()>;

    /// Signal the loop to stop; with `wait`, block until it acknowledges
    fn request_stop(&mut self, tag: StopTag, wait: bool) -> Result<()>;

    /// Wake the loop if idle
    fn kick(&self);

    fn is_running(&self) -> bool;

    /// Tag acknowledged by the most recent loop exit
    fn closed_tag(&self) -> Option<StopTag>;
}

enum Signal {
    Kick,
    Stop(StopTag),
}

/// Wakes a loop from another thread
#[derive(Clone)]
pub struct Kicker(Sender<Signal>);

impl Kicker {
    pub fn kick(&self) {
        let _ = self.0.try_send(Signal::Kick);
    }
}

pub type WorkerFactory = Box<dyn Fn() -> Box<dyn LoopWorker> + Send>;

/// Service loop backed by a dedicated OS thread
///
/// The worker is rebuilt from the factory on every start, so a restarted
/// loop picks up the current pipe configuration.
pub struct ThreadedLoop {
    name: &'static str,
    factory: WorkerFactory,
    signal_tx: Sender<Signal>,
    signal_rx: Receiver<Signal>,
    closed_tx: Sender<StopTag>,
    closed_rx: Receiver<StopTag>,
    handle: Option<JoinHandle<()>>,
    stopping: bool,
    last_closed: Option<StopTag>,
}

impl ThreadedLoop {
    pub fn new(name: &'static str, factory: WorkerFactory) -> Self {
        let (signal_tx, signal_rx) = unbounded();
        let (closed_tx, closed_rx) = unbounded();
        Self {
            name,
            factory,
            signal_tx,
            signal_rx,
            closed_tx,
            closed_rx,
            handle: None,
            stopping: false,
            last_closed: None,
        }
    }

    pub fn kicker(&self) -> Kicker {
        Kicker(self.signal_tx.clone())
    }

    /// Join an exited thread and collect its acknowledgement
    fn reap(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| DriverError::Service {
                name: self.name,
                reason: "thread panicked".to_string(),
            })?;
        }
        while let Ok(tag) = self.closed_rx.try_recv() {
            self.last_closed = Some(tag);
        }
        self.stopping = false;
        Ok(())
    }
}

impl ServiceLoop for ThreadedLoop {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            if !self.stopping {
                debug!("{} loop already running", self.name);
                return Ok(());
            }
            // A fire-and-forget stop is still draining
            self.reap()?;
        }

        while self.signal_rx.try_recv().is_ok() {}

        let worker = (self.factory)();
        let signals = self.signal_rx.clone();
        let closed = self.closed_tx.clone();
        let name = self.name;

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(name, worker, signals, closed))
            .map_err(|e| DriverError::Service {
                name,
                reason: e.to_string(),
            })?;

        self.handle = Some(handle);
        info!("{} loop started", name);
        Ok(())
    }

    fn request_stop(&mut self, tag: StopTag, wait: bool) -> Result<()> {
        if self.handle.is_none() {
            return Ok(());
        }

        if !self.stopping {
            debug!("Stopping {} loop ({})", self.name, tag);
            self.signal_tx
                .try_send(Signal::Stop(tag))
                .map_err(|e| DriverError::Service {
                    name: self.name,
                    reason: e.to_string(),
                })?;
            self.stopping = true;
        }

        if wait {
            let ack = self
                .closed_rx
                .recv_blocking()
                .map_err(|e| DriverError::Service {
                    name: self.name,
                    reason: e.to_string(),
                })?;
            self.last_closed = Some(ack);
            self.reap()?;
        }
        Ok(())
    }

    fn kick(&self) {
        let _ = self.signal_tx.try_send(Signal::Kick);
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn closed_tag(&self) -> Option<StopTag> {
        self.last_closed
    }
}

impl Drop for ThreadedLoop {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.request_stop(StopTag::DROP, true) {
                warn!("{} loop did not stop cleanly: {}", self.name, e);
            }
        }
    }
}

fn run_loop(
    name: &'static str,
    mut worker: Box<dyn LoopWorker>,
    signals: Receiver<Signal>,
    closed: Sender<StopTag>,
) {
    let tag = loop {
        match signals.try_recv() {
            Ok(Signal::Stop(tag)) => break tag,
            Ok(Signal::Kick) | Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Closed) => break StopTag::DROP,
        }

        if worker.step() == Step::Idle {
            match signals.recv_blocking() {
                Ok(Signal::Stop(tag)) => break tag,
                Ok(Signal::Kick) => {}
                Err(_) => break StopTag::DROP,
            }
        }
    };

    debug!("{} loop closed ({})", name, tag);
    let _ = closed.try_send(tag);
}

/// The four loops of one device
pub struct ServiceSet {
    pub read: Box<dyn ServiceLoop>,
    pub write: Box<dyn ServiceLoop>,
    pub dispatch: Box<dyn ServiceLoop>,
    pub interrupt: Box<dyn ServiceLoop>,
}

impl ServiceSet {
    /// Stop every loop, waiting for each; failures are logged
    pub fn stop_all(&mut self, tags: [StopTag; 4]) {
        let [read, write, dispatch, interrupt] = tags;
        for (service, tag) in [
            (&mut self.read, read),
            (&mut self.write, write),
            (&mut self.dispatch, dispatch),
            (&mut self.interrupt, interrupt),
        ] {
            if let Err(e) = service.request_stop(tag, true) {
                warn!("Failed to stop {} loop: {}", service.name(), e);
            }
        }
    }
}
