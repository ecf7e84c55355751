//! USB subsystem
//!
//! Everything that talks to the device through a [`Transport`]: descriptor
//! parsing and validation, interface selection and pipe classification,
//! pipe resets, and the rusb-backed transport used outside tests.

pub mod descriptors;
pub mod device;
pub mod enumerator;
pub mod pipes;
pub mod transport;

pub use device::{DeviceSummary, RusbTransport, list_devices};
pub use enumerator::{DeviceEnumerator, PipeType, UsbConfiguration};
pub use pipes::{PipeManager, is_usb_broken};
pub use transport::{ControlRequest, DescriptorType, PipeHandle, Transport};
