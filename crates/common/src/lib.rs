//! Common utilities for the USB modem driver
//!
//! This crate provides functionality shared between the driver library and
//! its front-end binary: USB and power types, error handling, logging setup,
//! and the async channel bridge between the Tokio runtime and the blocking
//! driver worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    DriverBridge, DriverCommand, DriverEvent, DriverWorker, StatusReport, create_driver_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    Direction, DevicePower, ModelType, PipeKind, SystemPower, UsbError, UsbSpeed,
    VENDOR_FEATURE_GUID,
};
