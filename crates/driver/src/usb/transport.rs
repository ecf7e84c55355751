//! Transport capability consumed by the driver core
//!
//! Everything the core needs from the USB stack goes through [`Transport`]:
//! descriptor reads, configuration selection, pipe resets, bulk and interrupt
//! transfers, and class/vendor control requests. Calls block until the
//! underlying request completes.

use common::{UsbError, UsbSpeed};
use std::time::Duration;

/// Standard descriptor type codes
pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;
pub const DESC_CS_INTERFACE: u8 = 0x24;

/// CDC SET_CONTROL_LINE_STATE
pub const CDC_SET_CONTROL_LINE_STATE: u8 = 0x22;

/// Vendor request toggling receive aggregation
pub const VENDOR_SET_DATA_BUNDLING: u8 = 0x5A;

/// Standard CLEAR_FEATURE / SET_FEATURE
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_FEATURE: u8 = 0x03;

/// Feature selector DEVICE_REMOTE_WAKEUP
pub const FEATURE_REMOTE_WAKEUP: u16 = 0x0001;

const STANDARD_DEVICE_OUT: u8 = 0x00;
const CLASS_INTERFACE_OUT: u8 = 0x21;
const VENDOR_INTERFACE_OUT: u8 = 0x41;

/// Descriptor kinds the core reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Device,
    Configuration,
    String,
}

impl DescriptorType {
    pub fn code(self) -> u8 {
        match self {
            DescriptorType::Device => DESC_DEVICE,
            DescriptorType::Configuration => DESC_CONFIGURATION,
            DescriptorType::String => DESC_STRING,
        }
    }
}

/// One interface/alternate-setting pair passed to `select_configuration`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSelection {
    pub interface_number: u8,
    pub alternate_setting: u8,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decode bits 0..1 of `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Pipe returned by a successful configuration selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHandle {
    pub interface_number: u8,
    pub endpoint_address: u8,
    pub endpoint_type: EndpointType,
    pub max_packet_size: u16,
}

impl PipeHandle {
    pub fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }
}

/// Host-to-device control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

impl ControlRequest {
    /// CDC line state (bit 0 DTR, bit 1 RTS) for `interface`
    pub fn line_state(interface: u8, dtr: bool, rts: bool) -> Self {
        Self {
            request_type: CLASS_INTERFACE_OUT,
            request: CDC_SET_CONTROL_LINE_STATE,
            value: u16::from(dtr) | (u16::from(rts) << 1),
            index: u16::from(interface),
            data: Vec::new(),
        }
    }

    /// Enable or disable receive bundling on `interface`
    pub fn data_bundling(interface: u8, enable: bool) -> Self {
        Self {
            request_type: VENDOR_INTERFACE_OUT,
            request: VENDOR_SET_DATA_BUNDLING,
            value: u16::from(enable),
            index: u16::from(interface),
            data: Vec::new(),
        }
    }

    /// Allow or forbid the device to signal remote wakeup
    pub fn remote_wakeup(enable: bool) -> Self {
        Self {
            request_type: STANDARD_DEVICE_OUT,
            request: if enable { SET_FEATURE } else { CLEAR_FEATURE },
            value: FEATURE_REMOTE_WAKEUP,
            index: 0,
            data: Vec::new(),
        }
    }

    /// DTR bit of a line-state request
    pub fn dtr(&self) -> Option<bool> {
        (self.request == CDC_SET_CONTROL_LINE_STATE).then_some(self.value & 0x01 != 0)
    }
}

/// Blocking USB transport for one device
pub trait Transport: Send + Sync {
    /// GET_DESCRIPTOR into `buf`, returning the number of bytes read
    fn get_descriptor(
        &self,
        kind: DescriptorType,
        index: u8,
        language_id: u16,
        buf: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Activate `configuration_value` with the given interfaces and return their pipes
    fn select_configuration(
        &self,
        configuration_value: u8,
        interfaces: &[InterfaceSelection],
    ) -> Result<Vec<PipeHandle>, UsbError>;

    /// Undo a previous `select_configuration`
    fn release_interfaces(&self);

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbError>;

    fn interrupt_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Reset the pipe and clear the endpoint halt
    fn reset_pipe(&self, endpoint: u8) -> Result<(), UsbError>;

    fn control_out(&self, request: &ControlRequest) -> Result<(), UsbError>;

    /// Signal the data interface idle (selective suspend allowed) or busy
    fn set_idle(&self, idle: bool) -> Result<(), UsbError>;

    /// Negotiated bus speed
    fn speed(&self) -> UsbSpeed;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_state_bits() {
        let req = ControlRequest::line_state(2, true, true);
        assert_eq!(req.request_type, 0x21);
        assert_eq!(req.value, 0x03);
        assert_eq!(req.index, 2);
        assert_eq!(req.dtr(), Some(true));

        let req = ControlRequest::line_state(2, false, false);
        assert_eq!(req.value, 0);
        assert_eq!(req.dtr(), Some(false));
    }

    #[test]
    fn test_bundling_is_not_line_state() {
        let req = ControlRequest::data_bundling(0, true);
        assert_eq!(req.dtr(), None);
        assert_eq!(req.value, 1);
    }

    #[test]
    fn test_remote_wakeup_feature() {
        let arm = ControlRequest::remote_wakeup(true);
        assert_eq!((arm.request_type, arm.request), (0x00, SET_FEATURE));
        assert_eq!(arm.value, FEATURE_REMOTE_WAKEUP);
        assert_eq!(arm.dtr(), None);

        let disarm = ControlRequest::remote_wakeup(false);
        assert_eq!(disarm.request, CLEAR_FEATURE);
    }

    #[test]
    fn test_endpoint_type_from_attributes() {
        assert_eq!(EndpointType::from_attributes(0x02), EndpointType::Bulk);
        assert_eq!(EndpointType::from_attributes(0x03), EndpointType::Interrupt);
        assert_eq!(EndpointType::from_attributes(0x00), EndpointType::Control);
        assert_eq!(EndpointType::from_attributes(0x0D), EndpointType::Isochronous);
    }

    #[test]
    fn test_pipe_direction() {
        let pipe = PipeHandle {
            interface_number: 0,
            endpoint_address: 0x81,
            endpoint_type: EndpointType::Bulk,
            max_packet_size: 512,
        };
        assert!(pipe.is_in());
    }
}
