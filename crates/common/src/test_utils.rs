//! Test utilities for the USB modem driver
//!
//! Provides descriptor byte builders and helpers for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{ConfigDescriptorBuilder, create_mock_device_descriptor};
//!
//! let device = create_mock_device_descriptor(0x05c6, 0x9025);
//! assert_eq!(device.len(), 18);
//!
//! let config = ConfigDescriptorBuilder::new()
//!     .interface(0, 0, 0xFF, 0x00, 2)
//!     .endpoint(0x81, 0x02, 512)
//!     .endpoint(0x01, 0x02, 512)
//!     .build();
//! assert_eq!(config[4], 1); // bNumInterfaces
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint attribute values
pub const EP_BULK: u8 = 0x02;
pub const EP_INTERRUPT: u8 = 0x03;

pub use crate::usb_types::VENDOR_FEATURE_GUID;

/// Create a standard 18-byte device descriptor (GET_DESCRIPTOR Device)
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> Vec<u8> {
    let vid = vendor_id.to_le_bytes();
    let pid = product_id.to_le_bytes();
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        vid[0], vid[1], // idVendor
        pid[0], pid[1], // idProduct
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create a UTF-16LE string descriptor
pub fn create_mock_string_descriptor(text: &str) -> Vec<u8> {
    let mut out = vec![0, 0x03];
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

/// Builder for configuration descriptors
///
/// Records are appended in call order; `build` fills in `wTotalLength`
/// and `bNumInterfaces` (distinct interface numbers).
#[derive(Debug, Clone, Default)]
pub struct ConfigDescriptorBuilder {
    records: Vec<u8>,
    interfaces: BTreeSet<u8>,
    configuration_value: u8,
    attributes: u8,
}

impl ConfigDescriptorBuilder {
    pub fn new() -> Self {
        Self {
            configuration_value: 1,
            attributes: 0xA0,
            ..Default::default()
        }
    }

    /// Override `bmAttributes` (bus-powered with remote wakeup by default)
    pub fn attributes(mut self, attributes: u8) -> Self {
        self.attributes = attributes;
        self
    }

    /// Append an interface descriptor
    pub fn interface(
        mut self,
        number: u8,
        alternate: u8,
        class: u8,
        subclass: u8,
        num_endpoints: u8,
    ) -> Self {
        self.interfaces.insert(number);
        self.records.extend_from_slice(&[
            0x09,
            0x04,
            number,
            alternate,
            num_endpoints,
            class,
            subclass,
            0x00,
            0x00,
        ]);
        self
    }

    /// Append an endpoint descriptor
    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet: u16) -> Self {
        let mps = max_packet.to_le_bytes();
        self.records
            .extend_from_slice(&[0x07, 0x05, address, attributes, mps[0], mps[1], 0x00]);
        self
    }

    /// Append the vendor functional descriptor carrying `guid` and capabilities
    pub fn vendor_feature(mut self, guid: [u8; 16], control_caps: u8, data_caps: u8) -> Self {
        self.records.extend_from_slice(&[21, 0x24, 0xFE]);
        self.records.extend_from_slice(&guid);
        self.records.extend_from_slice(&[control_caps, data_caps]);
        self
    }

    /// Append an arbitrary raw record
    pub fn raw(mut self, record: &[u8]) -> Self {
        self.records.extend_from_slice(record);
        self
    }

    /// Produce the full descriptor bytes
    pub fn build(self) -> Vec<u8> {
        let total = (9 + self.records.len()) as u16;
        let total = total.to_le_bytes();
        let mut out = vec![
            0x09, // bLength
            0x02, // bDescriptorType (Configuration)
            total[0],
            total[1], // wTotalLength
            self.interfaces.len() as u8,
            self.configuration_value,
            0x00, // iConfiguration
            self.attributes, // bmAttributes
            0xFA, // bMaxPower (500mA)
        ];
        out.extend_from_slice(&self.records);
        out
    }
}

/// Configuration of a full modem: one vendor interface with interrupt,
/// bulk-in and bulk-out endpoints
pub fn create_mock_modem_config() -> Vec<u8> {
    ConfigDescriptorBuilder::new()
        .interface(0, 0, 0xFF, 0xFF, 3)
        .endpoint(0x81, EP_INTERRUPT, 8)
        .endpoint(0x82, EP_BULK, 512)
        .endpoint(0x02, EP_BULK, 512)
        .build()
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_descriptor_ids() {
        let desc = create_mock_device_descriptor(0x1234, 0x5678);
        assert_eq!(desc.len(), 18);
        assert_eq!(&desc[8..12], &[0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_config_builder_totals() {
        let desc = ConfigDescriptorBuilder::new()
            .interface(0, 0, 0x02, 0x06, 1)
            .endpoint(0x83, EP_INTERRUPT, 16)
            .interface(1, 0, 0x0A, 0x00, 0)
            .interface(1, 1, 0x0A, 0x00, 2)
            .endpoint(0x82, EP_BULK, 512)
            .endpoint(0x02, EP_BULK, 512)
            .build();

        assert_eq!(u16::from_le_bytes([desc[2], desc[3]]) as usize, desc.len());
        assert_eq!(desc[4], 2);
    }

    #[test]
    fn test_modem_config() {
        let desc = create_mock_modem_config();
        assert_eq!(desc.len(), 9 + 9 + 3 * 7);
        assert_eq!(desc[4], 1);
        assert_eq!(desc[7], 0xA0);
    }

    #[test]
    fn test_string_descriptor() {
        let desc = create_mock_string_descriptor("AB");
        assert_eq!(desc, vec![6, 0x03, b'A', 0, b'B', 0]);
    }

    #[test]
    fn test_create_mock_bulk_data() {
        let data = create_mock_bulk_data(1024);
        assert_eq!(data.len(), 1024);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
