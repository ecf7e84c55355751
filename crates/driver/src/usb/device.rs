//! rusb-backed transport
//!
//! Wraps a `rusb::DeviceHandle` behind the [`Transport`] trait. Transfers
//! take a shared lock on the handle so the read and write loops can run
//! concurrently; configuration changes and halt clearing take it exclusively.

use crate::usb::transport::{
    ControlRequest, DescriptorType, EndpointType, InterfaceSelection, PipeHandle, Transport,
};
use common::{UsbError, UsbSpeed};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for descriptor reads and control requests
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

const GET_DESCRIPTOR: u8 = 0x06;
const STANDARD_DEVICE_IN: u8 = 0x80;

/// Summary row for `--list-devices`
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: UsbSpeed,
}

/// Enumerate every device visible to `context`
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>, UsbError> {
    let devices = context.devices().map_err(map_rusb_error)?;
    let mut out = Vec::new();

    for device in devices.iter() {
        match device.device_descriptor() {
            Ok(desc) => out.push(DeviceSummary {
                bus_number: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                speed: map_device_speed(device.speed()),
            }),
            Err(e) => debug!("Skipping device without descriptor: {}", e),
        }
    }

    Ok(out)
}

/// Transport over an opened rusb device
pub struct RusbTransport {
    device: Device<Context>,
    handle: RwLock<DeviceHandle<Context>>,
    speed: UsbSpeed,
    /// Interfaces claimed by the last configuration selection
    claimed: Mutex<Vec<u8>>,
}

impl RusbTransport {
    /// Open the first device matching `vendor_id:product_id`
    pub fn open(context: &Context, vendor_id: u16, product_id: u16) -> Result<Self, UsbError> {
        let devices = context.devices().map_err(map_rusb_error)?;
        let device = devices
            .iter()
            .find(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
                    .unwrap_or(false)
            })
            .ok_or(UsbError::NotFound)?;

        Self::from_device(device)
    }

    pub fn from_device(device: Device<Context>) -> Result<Self, UsbError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;
        let speed = map_device_speed(device.speed());

        info!(
            "Opened device on bus {} address {} ({:?})",
            device.bus_number(),
            device.address(),
            speed
        );

        Ok(Self {
            device,
            handle: RwLock::new(handle),
            speed,
            claimed: Mutex::new(Vec::new()),
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    fn read_handle(&self) -> std::sync::RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handle(&self) -> std::sync::RwLockWriteGuard<'_, DeviceHandle<Context>> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pipes of `interface_number`/`alternate_setting` in configuration `configuration_value`
    fn pipes_for(
        &self,
        configuration_value: u8,
        selection: &InterfaceSelection,
    ) -> Result<Vec<PipeHandle>, UsbError> {
        let num_configs = self
            .device
            .device_descriptor()
            .map_err(map_rusb_error)?
            .num_configurations();

        for index in 0..num_configs {
            let config = self.device.config_descriptor(index).map_err(map_rusb_error)?;
            if config.number() != configuration_value {
                continue;
            }

            let pipes = config
                .interfaces()
                .filter(|iface| iface.number() == selection.interface_number)
                .flat_map(|iface| iface.descriptors())
                .filter(|desc| desc.setting_number() == selection.alternate_setting)
                .flat_map(|desc| {
                    desc.endpoint_descriptors()
                        .map(|ep| PipeHandle {
                            interface_number: selection.interface_number,
                            endpoint_address: ep.address(),
                            endpoint_type: map_transfer_type(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
            return Ok(pipes);
        }

        Err(UsbError::NotFound)
    }

    #[cfg(target_os = "linux")]
    fn power_control_path(&self) -> Option<std::path::PathBuf> {
        let ports = self.device.port_numbers().ok()?;
        if ports.is_empty() {
            return None;
        }
        let ports: Vec<String> = ports.iter().map(u8::to_string).collect();
        let path = std::path::PathBuf::from(format!(
            "/sys/bus/usb/devices/{}-{}/power/control",
            self.device.bus_number(),
            ports.join(".")
        ));
        path.exists().then_some(path)
    }
}

impl Transport for RusbTransport {
    fn get_descriptor(
        &self,
        kind: DescriptorType,
        index: u8,
        language_id: u16,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        let value = (u16::from(kind.code()) << 8) | u16::from(index);
        self.read_handle()
            .read_control(
                STANDARD_DEVICE_IN,
                GET_DESCRIPTOR,
                value,
                language_id,
                buf,
                CONTROL_TIMEOUT,
            )
            .map_err(map_rusb_error)
    }

    fn select_configuration(
        &self,
        configuration_value: u8,
        interfaces: &[InterfaceSelection],
    ) -> Result<Vec<PipeHandle>, UsbError> {
        let mut pipes = Vec::new();
        {
            let mut handle = self.write_handle();
            let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);

            if handle.active_configuration().ok() != Some(configuration_value) {
                handle
                    .set_active_configuration(configuration_value)
                    .map_err(map_rusb_error)?;
            }

            for selection in interfaces {
                let number = selection.interface_number;

                match handle.kernel_driver_active(number) {
                    Ok(true) => {
                        debug!("Detaching kernel driver from interface {}", number);
                        if let Err(e) = handle.detach_kernel_driver(number) {
                            warn!(
                                "Failed to detach kernel driver from interface {}: {}",
                                number, e
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(e) => debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        number, e
                    ),
                }

                if !claimed.contains(&number) {
                    handle.claim_interface(number).map_err(|e| {
                        warn!("Failed to claim interface {}: {}", number, e);
                        map_rusb_error(e)
                    })?;
                    claimed.push(number);
                }

                if selection.alternate_setting != 0 {
                    handle
                        .set_alternate_setting(number, selection.alternate_setting)
                        .map_err(map_rusb_error)?;
                }
                debug!(
                    "Selected interface {} alt {}",
                    number, selection.alternate_setting
                );
            }
        }

        for selection in interfaces {
            pipes.extend(self.pipes_for(configuration_value, selection)?);
        }
        Ok(pipes)
    }

    fn release_interfaces(&self) {
        let mut handle = self.write_handle();
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);

        for interface in claimed.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        self.read_handle()
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbError> {
        self.read_handle()
            .write_bulk(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }

    fn interrupt_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.read_handle()
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn reset_pipe(&self, endpoint: u8) -> Result<(), UsbError> {
        self.write_handle()
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn control_out(&self, request: &ControlRequest) -> Result<(), UsbError> {
        self.read_handle()
            .write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                &request.data,
                CONTROL_TIMEOUT,
            )
            .map(|_| ())
            .map_err(map_rusb_error)
    }

    #[cfg(target_os = "linux")]
    fn set_idle(&self, idle: bool) -> Result<(), UsbError> {
        let Some(path) = self.power_control_path() else {
            debug!("No runtime power control for this device");
            return Ok(());
        };
        let value = if idle { "auto" } else { "on" };
        std::fs::write(&path, value).map_err(|e| UsbError::Other {
            message: format!("{}: {}", path.display(), e),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn set_idle(&self, _idle: bool) -> Result<(), UsbError> {
        Ok(())
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.release_interfaces();
    }
}

/// Map rusb::Error to UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}

fn map_device_speed(speed: rusb::Speed) -> UsbSpeed {
    match speed {
        rusb::Speed::Low => UsbSpeed::Low,
        rusb::Speed::Full => UsbSpeed::Full,
        rusb::Speed::High => UsbSpeed::High,
        rusb::Speed::Super => UsbSpeed::Super,
        rusb::Speed::SuperPlus => UsbSpeed::SuperPlus,
        _ => UsbSpeed::Full,
    }
}

fn map_transfer_type(kind: rusb::TransferType) -> EndpointType {
    match kind {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), UsbError::NotFound);
        assert!(map_rusb_error(rusb::Error::NoDevice).is_disconnect());
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), UsbSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), UsbSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), UsbSpeed::Super);
        assert_eq!(map_device_speed(rusb::Speed::Unknown), UsbSpeed::Full);
    }

    #[test]
    fn test_map_transfer_type() {
        assert_eq!(
            map_transfer_type(rusb::TransferType::Bulk),
            EndpointType::Bulk
        );
        assert_eq!(
            map_transfer_type(rusb::TransferType::Interrupt),
            EndpointType::Interrupt
        );
    }
}
