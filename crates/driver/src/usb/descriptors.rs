//! Descriptor parsing and validation
//!
//! Raw descriptor bytes come straight from the device and are not trusted:
//! the parsers check every length before reading and the record walker stops
//! at the first record that would run past the buffer.

use crate::error::{DriverError, Result};
use crate::usb::transport::{
    DESC_CONFIGURATION, DESC_CS_INTERFACE, DESC_DEVICE, DESC_ENDPOINT, DESC_INTERFACE,
};
use byteorder::{ByteOrder, LittleEndian};

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_DESCRIPTOR_LEN: usize = 9;

/// Interface table capacity; `bNumInterfaces` must stay below it
pub const MAX_INTERFACE: usize = 8;

/// Pipe table capacity
pub const MAX_PIPES: usize = 16;

/// Functional descriptor subtype carrying the vendor feature GUID
pub const VENDOR_FEATURE_SUBTYPE: u8 = 0xFE;
const VENDOR_FEATURE_LEN: usize = 21;

/// Allowed control endpoint sizes below SuperSpeed
const EP0_SIZES: [u8; 4] = [8, 16, 32, 64];

/// SuperSpeed encodes bMaxPacketSize0 as an exponent (2^9 = 512)
const EP0_SUPER_SPEED_EXPONENT: u8 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(DriverError::InvalidDescriptor {
                kind: "device",
                reason: format!("{} bytes, need {}", bytes.len(), DEVICE_DESCRIPTOR_LEN),
            });
        }

        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            bcd_usb: LittleEndian::read_u16(&bytes[2..4]),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            bcd_device: LittleEndian::read_u16(&bytes[12..14]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// Sanity-check a device descriptor for the negotiated speed
pub fn validate_device_descriptor(desc: &DeviceDescriptor, super_speed: bool) -> bool {
    if desc.length == 0 || desc.descriptor_type != DESC_DEVICE {
        return false;
    }

    if super_speed {
        desc.max_packet_size0 == EP0_SUPER_SPEED_EXPONENT
    } else {
        EP0_SIZES.contains(&desc.max_packet_size0)
    }
}

/// The fixed 9-byte header of a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptorHeader {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptorHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONFIG_DESCRIPTOR_LEN {
            return Err(DriverError::InvalidDescriptor {
                kind: "configuration",
                reason: format!("{} bytes, need {}", bytes.len(), CONFIG_DESCRIPTOR_LEN),
            });
        }

        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            total_length: LittleEndian::read_u16(&bytes[2..4]),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }

    /// bmAttributes bit 5
    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }
}

/// Sanity-check a configuration descriptor header
pub fn validate_config_descriptor(header: &ConfigDescriptorHeader) -> bool {
    header.length != 0
        && u16::from(header.length) <= header.total_length
        && header.total_length >= CONFIG_DESCRIPTOR_LEN as u16
        && usize::from(header.num_interfaces) < MAX_INTERFACE
        && header.descriptor_type == DESC_CONFIGURATION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// One record inside a configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorRecord<'a> {
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// Class-specific functional descriptor carrying the vendor GUID
    VendorFeature {
        guid: [u8; 16],
        control_caps: u8,
        data_caps: u8,
    },
    Other {
        descriptor_type: u8,
        data: &'a [u8],
    },
}

/// Iterator over the records following the configuration header
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
}

/// Walk the records of a full configuration descriptor
pub fn records(config: &[u8]) -> Records<'_> {
    Records {
        buf: config,
        offset: CONFIG_DESCRIPTOR_LEN.min(config.len()),
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = DescriptorRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.offset..];
        if rest.len() < 2 {
            return None;
        }
        let len = usize::from(rest[0]);
        if len < 2 || len > rest.len() {
            return None;
        }
        let record = &rest[..len];
        self.offset += len;

        Some(match record[1] {
            DESC_INTERFACE if len >= 9 => DescriptorRecord::Interface(InterfaceDescriptor {
                number: record[2],
                alternate_setting: record[3],
                num_endpoints: record[4],
                class: record[5],
                subclass: record[6],
                protocol: record[7],
            }),
            DESC_ENDPOINT if len >= 7 => DescriptorRecord::Endpoint(EndpointDescriptor {
                address: record[2],
                attributes: record[3],
                max_packet_size: LittleEndian::read_u16(&record[4..6]),
                interval: record[6],
            }),
            DESC_CS_INTERFACE if len >= VENDOR_FEATURE_LEN && record[2] == VENDOR_FEATURE_SUBTYPE => {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(&record[3..19]);
                DescriptorRecord::VendorFeature {
                    guid,
                    control_caps: record[19],
                    data_caps: record[20],
                }
            }
            descriptor_type => DescriptorRecord::Other {
                descriptor_type,
                data: record,
            },
        })
    }
}

/// Decode a UTF-16LE string descriptor
pub fn parse_string_descriptor(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes[1] != crate::usb::transport::DESC_STRING {
        return None;
    }
    let len = usize::from(bytes[0]).min(bytes.len());
    if len < 2 {
        return None;
    }
    let units: Vec<u16> = bytes[2..len]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    let text = String::from_utf16_lossy(&units);
    let text = text.trim_end_matches('\0').trim().to_string();
    (!text.is_empty()).then_some(text)
}
