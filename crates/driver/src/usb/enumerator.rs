//! Device enumeration and configuration
//!
//! Reads the device and configuration descriptors, picks the interfaces and
//! alternate settings to activate, then classifies the pipes returned by the
//! transport into a [`UsbConfiguration`]. Nothing is committed to the device
//! state here: a failed enumeration leaves the caller's previous
//! configuration untouched and releases any interface the transport claimed.

use crate::error::{DriverError, Result};
use crate::state::MuxConfig;
use crate::usb::descriptors::{
    CONFIG_DESCRIPTOR_LEN, ConfigDescriptorHeader, DEVICE_DESCRIPTOR_LEN, DescriptorRecord,
    DeviceDescriptor, MAX_INTERFACE, MAX_PIPES, parse_string_descriptor, records,
    validate_config_descriptor, validate_device_descriptor,
};
use crate::usb::transport::{DescriptorType, EndpointType, InterfaceSelection, PipeHandle, Transport};
use common::ModelType;
use common::VENDOR_FEATURE_GUID;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Language used for string descriptors
pub const LANG_EN_US: u16 = 0x0409;

const CDC_CLASS: u8 = 0x02;
const CDC_ECM_SUBCLASS: u8 = 0x06;
const CDC_DATA_CLASS: u8 = 0x0A;

/// Selected interface with the endpoints listed under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub endpoints: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeType {
    BulkIn,
    BulkOut,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeInfo {
    pub kind: PipeType,
    /// Position in the transport's pipe list
    pub index: usize,
    pub endpoint_address: u8,
    pub max_packet_size: u16,
    pub interface_number: u8,
}

/// Vendor functional descriptor contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VendorFeatures {
    pub enabled: bool,
    pub control_caps: u8,
    pub data_caps: u8,
}

/// Outcome of interface selection, before the transport is involved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfacePlan {
    pub interfaces: Vec<InterfaceEntry>,
    pub vendor: VendorFeatures,
    /// First interface looked like a CDC ECM control interface
    pub ecm: bool,
}

impl InterfacePlan {
    pub fn selections(&self) -> Vec<InterfaceSelection> {
        self.interfaces
            .iter()
            .map(|entry| InterfaceSelection {
                interface_number: entry.number,
                alternate_setting: entry.alternate_setting,
            })
            .collect()
    }
}

/// Active configuration of a started device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConfiguration {
    pub configuration_value: u8,
    pub remote_wakeup: bool,
    pub interfaces: BTreeMap<u8, InterfaceEntry>,
    pub pipes: Vec<PipeInfo>,
    pub model: ModelType,
    pub vendor: VendorFeatures,
    pub ecm: bool,
}

impl UsbConfiguration {
    pub fn pipe(&self, kind: PipeType) -> Option<&PipeInfo> {
        self.pipes.iter().find(|p| p.kind == kind)
    }

    /// Interface addressed by class requests (line state, bundling)
    pub fn control_interface(&self) -> u8 {
        self.pipe(PipeType::Interrupt)
            .or_else(|| self.pipe(PipeType::BulkIn))
            .map(|p| p.interface_number)
            .or_else(|| self.interfaces.keys().next().copied())
            .unwrap_or(0)
    }
}

/// Best-effort string descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

fn is_ecm_control(iface: &crate::usb::descriptors::InterfaceDescriptor) -> bool {
    iface.class == CDC_CLASS
        && iface.subclass == CDC_ECM_SUBCLASS
        && iface.alternate_setting == 0
        && iface.num_endpoints == 1
}

/// Choose interfaces and alternate settings from a full configuration descriptor
///
/// Alternate setting 0 interfaces take a new slot; a non-zero alternate
/// setting replaces the most recent slot. When the first interface is a CDC
/// ECM control interface, the data interface is only accepted in a non-zero
/// alternate setting.
pub fn select_interfaces(config: &[u8]) -> Result<InterfacePlan> {
    let mut plan = InterfacePlan::default();
    let mut first = true;
    // Slot collecting endpoints; None while inside a skipped interface
    let mut current: Option<usize> = None;

    for record in records(config) {
        match record {
            DescriptorRecord::VendorFeature {
                guid,
                control_caps,
                data_caps,
            } => {
                if guid == VENDOR_FEATURE_GUID {
                    debug!(
                        "Vendor feature enabled (caps {:#04x}/{:#04x})",
                        control_caps, data_caps
                    );
                    plan.vendor = VendorFeatures {
                        enabled: true,
                        control_caps,
                        data_caps,
                    };
                }
            }
            DescriptorRecord::Interface(iface) => {
                if first {
                    plan.ecm = is_ecm_control(&iface);
                    first = false;
                }

                let entry = InterfaceEntry {
                    number: iface.number,
                    alternate_setting: iface.alternate_setting,
                    class: iface.class,
                    subclass: iface.subclass,
                    endpoints: Vec::new(),
                };

                let accept_new = if plan.ecm {
                    if iface.class == CDC_DATA_CLASS {
                        iface.alternate_setting != 0
                    } else {
                        iface.alternate_setting == 0
                    }
                } else {
                    iface.alternate_setting == 0 || plan.interfaces.is_empty()
                };

                current = if accept_new {
                    if plan.interfaces.len() >= MAX_INTERFACE {
                        return Err(DriverError::InsufficientResources(format!(
                            "more than {} interfaces",
                            MAX_INTERFACE
                        )));
                    }
                    plan.interfaces.push(entry);
                    Some(plan.interfaces.len() - 1)
                } else if !plan.ecm {
                    let last = plan.interfaces.len() - 1;
                    plan.interfaces[last] = entry;
                    Some(last)
                } else {
                    debug!("Skipping interface {} alt {}", iface.number, iface.alternate_setting);
                    None
                };
            }
            DescriptorRecord::Endpoint(ep) => {
                if let Some(slot) = current {
                    plan.interfaces[slot].endpoints.push(ep.address);
                }
            }
            DescriptorRecord::Other { .. } => {}
        }
    }

    if plan.interfaces.is_empty() {
        return Err(DriverError::UnrecognizedModel);
    }
    Ok(plan)
}

/// Classify transport pipes, enforcing the pipe table ceiling
pub fn classify_pipes(handles: &[PipeHandle]) -> Result<Vec<PipeInfo>> {
    if handles.len() > MAX_PIPES {
        return Err(DriverError::InsufficientResources(format!(
            "{} pipes, at most {}",
            handles.len(),
            MAX_PIPES
        )));
    }

    let mut pipes = Vec::with_capacity(handles.len());
    for (index, handle) in handles.iter().enumerate() {
        let kind = match (handle.endpoint_type, handle.is_in()) {
            (EndpointType::Bulk, true) => PipeType::BulkIn,
            (EndpointType::Bulk, false) => PipeType::BulkOut,
            (EndpointType::Interrupt, true) => PipeType::Interrupt,
            (other, _) => {
                debug!("Ignoring {:?} pipe {:#04x}", other, handle.endpoint_address);
                continue;
            }
        };
        pipes.push(PipeInfo {
            kind,
            index,
            endpoint_address: handle.endpoint_address,
            max_packet_size: handle.max_packet_size,
            interface_number: handle.interface_number,
        });
    }
    Ok(pipes)
}

/// Model type from the discovered pipes, with the MUX-derived override
pub fn classify_model(pipes: &[PipeInfo], mux: &MuxConfig) -> ModelType {
    let has = |kind| pipes.iter().any(|p: &PipeInfo| p.kind == kind);
    let bulk = has(PipeType::BulkIn) && has(PipeType::BulkOut);

    if mux.enabled && !mux.is_primary() {
        return ModelType::NetLike;
    }
    match (bulk, has(PipeType::Interrupt)) {
        (true, true) => ModelType::Net,
        (true, false) => ModelType::NetLike,
        (false, _) => ModelType::None,
    }
}

/// Reads descriptors and configures the device through a transport
pub struct DeviceEnumerator<'a> {
    transport: &'a dyn Transport,
}

impl<'a> DeviceEnumerator<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }

    /// Read and validate the device descriptor
    pub fn read_device_descriptor(&self) -> Result<DeviceDescriptor> {
        let mut buf = [0u8; DEVICE_DESCRIPTOR_LEN];
        let n = self
            .transport
            .get_descriptor(DescriptorType::Device, 0, 0, &mut buf)?;
        let desc = DeviceDescriptor::parse(&buf[..n])?;

        if !validate_device_descriptor(&desc, self.transport.speed().is_super_speed()) {
            warn!("Device descriptor failed validation: {:?}", desc);
            return Err(DriverError::InvalidDescriptor {
                kind: "device",
                reason: format!(
                    "length {} type {:#04x} ep0 {}",
                    desc.length, desc.descriptor_type, desc.max_packet_size0
                ),
            });
        }
        Ok(desc)
    }

    /// Read one string descriptor; failures are logged and ignored
    pub fn read_string(&self, index: u8) -> Option<String> {
        if index == 0 {
            return None;
        }
        let mut buf = [0u8; 255];
        match self
            .transport
            .get_descriptor(DescriptorType::String, index, LANG_EN_US, &mut buf)
        {
            Ok(n) => parse_string_descriptor(&buf[..n]),
            Err(e) => {
                debug!("String descriptor {} unavailable: {}", index, e);
                None
            }
        }
    }

    pub fn read_strings(&self, desc: &DeviceDescriptor) -> DeviceStrings {
        DeviceStrings {
            manufacturer: self.read_string(desc.manufacturer_index),
            product: self.read_string(desc.product_index),
            serial_number: self.read_string(desc.serial_index),
        }
    }

    /// Two-pass read: the header first, then `wTotalLength` bytes
    pub fn read_config_descriptor(&self, index: u8) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; CONFIG_DESCRIPTOR_LEN];
        let n = self
            .transport
            .get_descriptor(DescriptorType::Configuration, index, 0, &mut buf)?;
        let header = ConfigDescriptorHeader::parse(&buf[..n])?;

        if !validate_config_descriptor(&header) {
            warn!("Configuration descriptor {} failed validation: {:?}", index, header);
            return Err(DriverError::InvalidDescriptor {
                kind: "configuration",
                reason: format!(
                    "length {} total {} interfaces {} type {:#04x}",
                    header.length,
                    header.total_length,
                    header.num_interfaces,
                    header.descriptor_type
                ),
            });
        }

        let total = usize::from(header.total_length);
        buf.resize(total, 0);
        let n = self
            .transport
            .get_descriptor(DescriptorType::Configuration, index, 0, &mut buf)?;
        if n < total {
            return Err(DriverError::InvalidDescriptor {
                kind: "configuration",
                reason: format!("short read: {} of {} bytes", n, total),
            });
        }
        Ok(buf)
    }

    /// Configure the device using configuration descriptor `index`
    pub fn configure(&self, index: u8, mux: &MuxConfig) -> Result<UsbConfiguration> {
        let raw = self.read_config_descriptor(index)?;
        let header = ConfigDescriptorHeader::parse(&raw)?;
        let plan = select_interfaces(&raw)?;

        let selected = self
            .transport
            .select_configuration(header.configuration_value, &plan.selections())
            .map_err(DriverError::from)
            .and_then(|handles| build_configuration(&header, plan, &handles, mux));

        match selected {
            Ok(config) => {
                info!(
                    "Configuration {} selected: {:?} with {} pipes",
                    config.configuration_value,
                    config.model,
                    config.pipes.len()
                );
                Ok(config)
            }
            Err(e) => {
                self.transport.release_interfaces();
                Err(e)
            }
        }
    }
}

fn build_configuration(
    header: &ConfigDescriptorHeader,
    plan: InterfacePlan,
    handles: &[PipeHandle],
    mux: &MuxConfig,
) -> Result<UsbConfiguration> {
    let pipes = classify_pipes(handles)?;
    let model = classify_model(&pipes, mux);
    if model == ModelType::None {
        return Err(DriverError::UnrecognizedModel);
    }

    let interfaces = plan
        .interfaces
        .into_iter()
        .map(|entry| (entry.number, entry))
        .collect();

    Ok(UsbConfiguration {
        configuration_value: header.configuration_value,
        remote_wakeup: header.remote_wakeup(),
        interfaces,
        pipes,
        model,
        vendor: plan.vendor,
        ecm: plan.ecm,
    })
}
