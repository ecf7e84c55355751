//! Host-side driver core for a USB-attached modem
//!
//! The crate is organised bottom-up:
//!
//! - [`usb`]: the [`Transport`](usb::Transport) seam, its rusb implementation,
//!   descriptor parsing, enumeration and pipe resets
//! - [`state`]: per-device shared state and the lifecycle transition table
//! - [`power`]: device and system power arbitration
//! - [`service`] and [`workers`]: the read, write, dispatch and interrupt loops
//! - [`session`]: start, open, close and power orchestration for one device
//! - [`registry`]: process-wide map from bus location to device state
//! - [`worker`]: the blocking thread that owns the session and serves
//!   commands from the async front-end

pub mod config;
pub mod error;
pub mod notify;
pub mod power;
pub mod registry;
pub mod service;
pub mod session;
pub mod state;
pub mod store;
pub mod testing;
pub mod usb;
pub mod worker;
pub mod workers;

pub use error::{DriverError, Result};
pub use notify::{ChannelNotifier, UpperLayerNotifier};
pub use session::{DeviceSession, SessionOptions};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreKey, StoreValue};
