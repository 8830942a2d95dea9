//! nusb-based USB transport implementation.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, In, Out};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::descriptor::{
    AltSettingDesc, ConfigurationDesc, DeviceDescriptor, DeviceFilter, EndpointDesc,
    EndpointDirection, EndpointKind, InterfaceDesc, android_filters, matches_any,
};
use super::traits::{HostCapabilities, TransportError, UsbHost, UsbTransport};

/// Buffer size for endpoint readers and writers.
const ENDPOINT_BUFFER: usize = 16 * 1024;

/// nusb-based USB device handle.
pub struct NusbTransport {
    info: DeviceInfo,
    descriptor: DeviceDescriptor,
    device: Option<Device>,
    interfaces: HashMap<u8, Interface>,
    readers: HashMap<u8, EndpointRead<Bulk>>,
    writers: HashMap<u8, EndpointWrite<Bulk>>,
}

impl NusbTransport {
    pub fn new(info: DeviceInfo) -> Self {
        let descriptor = descriptor_from_info(&info);
        Self {
            info,
            descriptor,
            device: None,
            interfaces: HashMap::new(),
            readers: HashMap::new(),
            writers: HashMap::new(),
        }
    }

    fn device(&self) -> Result<&Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::NotOpen)
    }

    /// Interface that owns `endpoint`, which must already be claimed.
    fn interface_for(&self, endpoint: u8) -> Result<&Interface, TransportError> {
        let number = self
            .descriptor
            .alt_settings()
            .find(|(_, alt)| alt.endpoints.iter().any(|ep| ep.address == endpoint))
            .map(|(n, _)| n)
            .ok_or_else(|| TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: format!("0x{:02X}", endpoint),
            })?;
        self.interfaces
            .get(&number)
            .ok_or_else(|| TransportError::ClaimInterfaceFailed {
                interface: number,
                message: "interface not claimed".into(),
            })
    }

    fn drop_endpoints(&mut self) {
        self.readers.clear();
        self.writers.clear();
    }
}

impl UsbTransport for NusbTransport {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    #[instrument(level = "info", skip(self), fields(vid = format!("{:04X}", self.descriptor.vendor_id), pid = format!("{:04X}", self.descriptor.product_id)))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| map_open_error(&e))?;
        self.descriptor = descriptor_from_device(&self.info, &device);
        self.device = Some(device);
        info!("Device opened");
        Ok(())
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        let device = self.device()?;
        if let Ok(active) = device.active_configuration()
            && active.configuration_value() == value
        {
            debug!(value, "Configuration already active");
            return Ok(());
        }
        device
            .set_configuration(value)
            .wait()
            .map_err(|e| TransportError::OpenFailed(format!("set configuration {value}: {e}")))
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        if self.interfaces.contains_key(&number) {
            return Ok(());
        }
        let interface = self
            .device()?
            .claim_interface(number)
            .wait()
            .map_err(|e| map_claim_error(number, &e))?;
        self.interfaces.insert(number, interface);
        info!(interface = number, "Interface claimed");
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError> {
        if self.interfaces.remove(&number).is_some() {
            // Endpoint handles keep the interface alive; drop them too.
            self.drop_endpoints();
            debug!(interface = number, "Interface released");
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.drop_endpoints();
        self.interfaces.clear();
        let device = self.device()?;
        device
            .reset()
            .wait()
            .map_err(|e| TransportError::OpenFailed(format!("reset: {e}")))?;
        info!("Device reset");
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.drop_endpoints();
        self.interfaces.clear();
        self.device = None;
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        if !self.writers.contains_key(&endpoint) {
            let writer = self
                .interface_for(endpoint)?
                .endpoint::<Bulk, Out>(endpoint)
                .map_err(|e| TransportError::TransferFailed {
                    endpoint,
                    message: e.to_string(),
                })?
                .writer(ENDPOINT_BUFFER);
            self.writers.insert(endpoint, writer);
        }
        let writer = self
            .writers
            .get_mut(&endpoint)
            .ok_or(TransportError::NotOpen)?;

        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| map_io_error(endpoint, e))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn transfer_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.readers.contains_key(&endpoint) {
            let reader = self
                .interface_for(endpoint)?
                .endpoint::<Bulk, In>(endpoint)
                .map_err(|e| TransportError::TransferFailed {
                    endpoint,
                    message: e.to_string(),
                })?
                .reader(ENDPOINT_BUFFER);
            self.readers.insert(endpoint, reader);
        }
        let reader = self
            .readers
            .get_mut(&endpoint)
            .ok_or(TransportError::NotOpen)?;

        reader.set_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];
        let n = reader.read(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::TimedOut => TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            _ => map_io_error(endpoint, e),
        })?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // nusb has no liveness probe; a vanished device surfaces as a
        // transfer error instead.
        true
    }
}

fn map_open_error(e: &nusb::Error) -> TransportError {
    match e.kind() {
        nusb::ErrorKind::PermissionDenied | nusb::ErrorKind::Busy => {
            TransportError::PermissionDenied {
                interface: 0,
                message: e.to_string(),
            }
        }
        nusb::ErrorKind::Disconnected => TransportError::Disconnected,
        _ => TransportError::OpenFailed(e.to_string()),
    }
}

fn map_claim_error(interface: u8, e: &nusb::Error) -> TransportError {
    match e.kind() {
        nusb::ErrorKind::PermissionDenied | nusb::ErrorKind::Busy => {
            TransportError::PermissionDenied {
                interface,
                message: e.to_string(),
            }
        }
        nusb::ErrorKind::Disconnected => TransportError::Disconnected,
        _ => TransportError::ClaimInterfaceFailed {
            interface,
            message: e.to_string(),
        },
    }
}

fn map_io_error(endpoint: u8, e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
            TransportError::Disconnected
        }
        _ => TransportError::TransferFailed {
            endpoint,
            message: e.to_string(),
        },
    }
}

/// Descriptor from enumeration data only (no endpoints until opened).
fn descriptor_from_info(info: &DeviceInfo) -> DeviceDescriptor {
    let interfaces = info
        .interfaces()
        .map(|iface| InterfaceDesc {
            interface_number: iface.interface_number(),
            alt_settings: vec![AltSettingDesc {
                alternate_setting: 0,
                class: iface.class(),
                subclass: iface.subclass(),
                protocol: iface.protocol(),
                endpoints: Vec::new(),
            }],
        })
        .collect();

    DeviceDescriptor {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        manufacturer: info.manufacturer_string().map(String::from),
        product_name: info.product_string().map(String::from),
        serial_number: info.serial_number().map(String::from),
        configurations: vec![ConfigurationDesc {
            value: 1,
            interfaces,
        }],
    }
}

/// Full descriptor tree from an opened device.
fn descriptor_from_device(info: &DeviceInfo, device: &Device) -> DeviceDescriptor {
    let configurations = device
        .configurations()
        .map(|config| ConfigurationDesc {
            value: config.configuration_value(),
            interfaces: config
                .interfaces()
                .map(|iface| InterfaceDesc {
                    interface_number: iface.interface_number(),
                    alt_settings: iface
                        .alt_settings()
                        .map(|alt| AltSettingDesc {
                            alternate_setting: alt.alternate_setting(),
                            class: alt.class(),
                            subclass: alt.subclass(),
                            protocol: alt.protocol(),
                            endpoints: alt
                                .endpoints()
                                .map(|ep| EndpointDesc {
                                    address: ep.address(),
                                    direction: match ep.direction() {
                                        nusb::transfer::Direction::In => EndpointDirection::In,
                                        nusb::transfer::Direction::Out => EndpointDirection::Out,
                                    },
                                    kind: match ep.transfer_type() {
                                        nusb::descriptors::TransferType::Control => {
                                            EndpointKind::Control
                                        }
                                        nusb::descriptors::TransferType::Isochronous => {
                                            EndpointKind::Isochronous
                                        }
                                        nusb::descriptors::TransferType::Bulk => EndpointKind::Bulk,
                                        nusb::descriptors::TransferType::Interrupt => {
                                            EndpointKind::Interrupt
                                        }
                                    },
                                    max_packet_size: ep.max_packet_size(),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    DeviceDescriptor {
        configurations,
        ..descriptor_from_info(info)
    }
}

/// How the host picks a device when asked to "prompt".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    /// First matching device.
    #[default]
    First,
    /// Device with this serial number.
    Serial(String),
    /// Device with this VID/PID.
    Ids { vid: u16, pid: u16 },
}

impl Selection {
    fn accepts(&self, descriptor: &DeviceDescriptor) -> bool {
        match self {
            Selection::First => true,
            Selection::Serial(serial) => descriptor.serial_number.as_deref() == Some(serial),
            Selection::Ids { vid, pid } => {
                descriptor.vendor_id == *vid && descriptor.product_id == *pid
            }
        }
    }
}

/// nusb host. Device "selection" is a non-interactive policy.
#[derive(Debug, Clone, Default)]
pub struct NusbHost {
    selection: Selection,
}

impl NusbHost {
    pub fn new(selection: Selection) -> Self {
        Self { selection }
    }

    fn matching(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<impl Iterator<Item = DeviceInfo>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let filters = filters.to_vec();
        Ok(devices.filter(move |d| matches_any(&filters, &descriptor_from_info(d))))
    }
}

impl UsbHost for NusbHost {
    type Device = NusbTransport;

    fn capabilities(&self) -> HostCapabilities {
        let transport_supported = list_devices().wait().is_ok();
        if !transport_supported {
            warn!("USB enumeration unavailable on this host");
        }
        HostCapabilities {
            transport_supported,
            ..HostCapabilities::default()
        }
    }

    fn authorized_devices(&self) -> Result<Vec<NusbTransport>, TransportError> {
        Ok(self
            .matching(&android_filters())?
            .filter(|d| self.selection.accepts(&descriptor_from_info(d)))
            .map(NusbTransport::new)
            .collect())
    }

    #[instrument(level = "info", skip(self, filters))]
    fn request_device(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<NusbTransport>, TransportError> {
        let found = self
            .matching(filters)?
            .find(|d| self.selection.accepts(&descriptor_from_info(d)));

        if let Some(info) = &found {
            info!(
                vendor_id = %format!("{:04X}", info.vendor_id()),
                product_id = %format!("{:04X}", info.product_id()),
                "Found device"
            );
        }
        Ok(found.map(NusbTransport::new))
    }
}
