//! Device mode detection from USB descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::constants::{ADB_TRIPLET, ANDROID_CLASS, FASTBOOT_TRIPLET, SIDELOAD_TRIPLET};
use crate::transport::descriptor::{AltSettingDesc, DeviceDescriptor, EndpointDirection, EndpointKind};

/// Which protocol the device is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Adb,
    Fastboot,
    Recovery,
    Sideload,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Adb => write!(f, "adb"),
            DeviceMode::Fastboot => write!(f, "fastboot"),
            DeviceMode::Recovery => write!(f, "recovery"),
            DeviceMode::Sideload => write!(f, "sideload"),
            DeviceMode::Unknown => write!(f, "unknown"),
        }
    }
}

impl DeviceMode {
    /// Interface triplets to look for, in preference order.
    ///
    /// Recovery exposes adbd on the regular ADB interface; some builds
    /// only offer the sideload one.
    fn triplets(self) -> &'static [(u8, u8, u8)] {
        match self {
            DeviceMode::Adb => &[ADB_TRIPLET],
            DeviceMode::Fastboot => &[FASTBOOT_TRIPLET],
            DeviceMode::Sideload => &[SIDELOAD_TRIPLET],
            DeviceMode::Recovery => &[ADB_TRIPLET, SIDELOAD_TRIPLET],
            DeviceMode::Unknown => &[],
        }
    }
}

/// Claimable interface and its bulk endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceEndpoints {
    pub interface_number: u8,
    pub alternate_setting: u8,
    /// Bulk IN endpoint address.
    pub endpoint_in: u8,
    /// Bulk OUT endpoint address.
    pub endpoint_out: u8,
    pub max_packet_size: usize,
}

/// Classify a device from its descriptor tree.
///
/// The first Android triplet found wins. Without one, the product string
/// is searched for "fastboot", "recovery" and "sideload" (in that order).
pub fn detect_mode(device: &DeviceDescriptor) -> DeviceMode {
    for (_, alt) in device.alt_settings() {
        match alt.triplet() {
            t if t == ADB_TRIPLET => return DeviceMode::Adb,
            t if t == FASTBOOT_TRIPLET => return DeviceMode::Fastboot,
            t if t == SIDELOAD_TRIPLET => return DeviceMode::Sideload,
            _ => {}
        }
    }

    let name = device
        .product_name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if name.contains("fastboot") {
        DeviceMode::Fastboot
    } else if name.contains("recovery") {
        DeviceMode::Recovery
    } else if name.contains("sideload") {
        DeviceMode::Sideload
    } else {
        DeviceMode::Unknown
    }
}

/// Resolve the interface and bulk endpoints for `mode`.
///
/// Looks for an alternate setting with the mode's triplet first. A device
/// exposing no Android triplet at all (its mode came from the product
/// name) falls back to the first vendor-class setting with a bulk pair.
/// Returns `None` when neither yields both a bulk IN and a bulk OUT
/// endpoint.
pub fn find_interface_and_endpoints(
    device: &DeviceDescriptor,
    mode: DeviceMode,
) -> Option<InterfaceEndpoints> {
    let by_triplet = mode.triplets().iter().find_map(|&triplet| {
        device
            .alt_settings()
            .filter(|(_, alt)| alt.triplet() == triplet)
            .find_map(|(number, alt)| bulk_pair(number, alt))
    });
    if by_triplet.is_some() || mode == DeviceMode::Unknown || has_android_triplet(device) {
        return by_triplet;
    }

    device
        .alt_settings()
        .filter(|(_, alt)| alt.class == ANDROID_CLASS)
        .find_map(|(number, alt)| bulk_pair(number, alt))
}

fn has_android_triplet(device: &DeviceDescriptor) -> bool {
    device.alt_settings().any(|(_, alt)| {
        let t = alt.triplet();
        t == ADB_TRIPLET || t == FASTBOOT_TRIPLET || t == SIDELOAD_TRIPLET
    })
}

fn bulk_pair(interface_number: u8, alt: &AltSettingDesc) -> Option<InterfaceEndpoints> {
    let bulk = |direction| {
        alt.endpoints
            .iter()
            .find(|ep| ep.kind == EndpointKind::Bulk && ep.direction == direction)
    };
    let ep_in = bulk(EndpointDirection::In)?;
    let ep_out = bulk(EndpointDirection::Out)?;

    Some(InterfaceEndpoints {
        interface_number,
        alternate_setting: alt.alternate_setting,
        endpoint_in: ep_in.address,
        endpoint_out: ep_out.address,
        max_packet_size: ep_in.max_packet_size.min(ep_out.max_packet_size),
    })
}
