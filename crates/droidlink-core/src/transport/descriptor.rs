//! Owned snapshot of a USB device's descriptor tree.
//!
//! Backends fill this in from whatever the host API exposes so that
//! mode detection and interface lookup stay pure functions.

use crate::protocol::constants::{
    ADB_TRIPLET, ANDROID_VENDOR_IDS, FASTBOOT_TRIPLET, SIDELOAD_TRIPLET,
};

/// Endpoint transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDesc {
    /// Full endpoint address (direction bit included).
    pub address: u8,
    pub direction: EndpointDirection,
    pub kind: EndpointKind,
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSettingDesc {
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDesc>,
}

impl AltSettingDesc {
    pub fn triplet(&self) -> (u8, u8, u8) {
        (self.class, self.subclass, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDesc {
    pub interface_number: u8,
    pub alt_settings: Vec<AltSettingDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDesc {
    pub value: u8,
    pub interfaces: Vec<InterfaceDesc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub configurations: Vec<ConfigurationDesc>,
}

impl DeviceDescriptor {
    /// Every alternate setting in the tree, with its interface number.
    pub fn alt_settings(&self) -> impl Iterator<Item = (u8, &AltSettingDesc)> {
        self.configurations.iter().flat_map(|config| {
            config.interfaces.iter().flat_map(|iface| {
                iface
                    .alt_settings
                    .iter()
                    .map(move |alt| (iface.interface_number, alt))
            })
        })
    }

    /// Whether the device matches `(vid, pid, serial)` of another descriptor.
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.serial_number == other.serial_number
    }

    pub fn is_android_vendor(&self) -> bool {
        ANDROID_VENDOR_IDS.contains(&self.vendor_id)
    }
}

/// Device selection filter: an interface triplet or a vendor ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFilter {
    Interface { class: u8, subclass: u8, protocol: u8 },
    Vendor(u16),
}

impl DeviceFilter {
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        match *self {
            DeviceFilter::Interface {
                class,
                subclass,
                protocol,
            } => device
                .alt_settings()
                .any(|(_, alt)| alt.triplet() == (class, subclass, protocol)),
            DeviceFilter::Vendor(vid) => device.vendor_id == vid,
        }
    }

    fn interface((class, subclass, protocol): (u8, u8, u8)) -> Self {
        DeviceFilter::Interface {
            class,
            subclass,
            protocol,
        }
    }
}

/// ADB, Fastboot and Sideload triplets plus the OEM vendor allow-list.
pub fn android_filters() -> Vec<DeviceFilter> {
    let mut filters = vec![
        DeviceFilter::interface(ADB_TRIPLET),
        DeviceFilter::interface(FASTBOOT_TRIPLET),
        DeviceFilter::interface(SIDELOAD_TRIPLET),
    ];
    filters.extend(ANDROID_VENDOR_IDS.iter().map(|&vid| DeviceFilter::Vendor(vid)));
    filters
}

/// True if any filter accepts the device.
pub fn matches_any(filters: &[DeviceFilter], device: &DeviceDescriptor) -> bool {
    filters.iter().any(|f| f.matches(device))
}
