//! Device metadata and the text formats it is parsed from.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::mode::DeviceMode;
use crate::transport::DeviceDescriptor;

/// Placeholder for fields the device did not report.
const UNKNOWN: &str = "Unknown";

/// What we know about the connected device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub mode: DeviceMode,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub cpu_arch: Option<String>,
    pub kernel_version: Option<String>,
    pub build_fingerprint: Option<String>,
    pub battery_level: Option<u8>,
    // Fastboot
    pub variant: Option<String>,
    pub bootloader: Option<String>,
    pub secure: Option<bool>,
    pub unlocked: Option<bool>,
    /// ADB features from the CNXN banner.
    pub features: Vec<String>,
}

impl DeviceInfo {
    pub fn new(descriptor: &DeviceDescriptor, mode: DeviceMode) -> Self {
        Self {
            serial: descriptor
                .serial_number
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN.into()),
            mode,
            ..Default::default()
        }
    }

    fn has_serial(&self) -> bool {
        self.serial != UNKNOWN
    }

    /// Fill in fields from a parsed `CNXN` banner.
    pub fn apply_banner(&mut self, banner: &Banner) {
        if !self.has_serial()
            && let Some(serial) = &banner.serial
        {
            self.serial = serial.clone();
        }
        let prop = |key: &str| banner.properties.get(key).cloned();
        self.product = self.product.take().or_else(|| prop("ro.product.name"));
        self.model = self.model.take().or_else(|| prop("ro.product.model"));
        self.device = self.device.take().or_else(|| prop("ro.product.device"));
        self.features = banner.features.clone();
    }

    /// Fill in fields from `getprop` output.
    pub fn apply_properties(&mut self, props: &BTreeMap<String, String>) {
        let prop = |key: &str| props.get(key).filter(|v| !v.is_empty()).cloned();
        if !self.has_serial()
            && let Some(serial) = prop("ro.serialno")
        {
            self.serial = serial;
        }
        self.model = prop("ro.product.model").or(self.model.take());
        self.android_version = prop("ro.build.version.release");
        self.product = prop("ro.product.name").or(self.product.take());
        self.device = prop("ro.product.device").or(self.device.take());
        self.cpu_arch = prop("ro.product.cpu.abi");
        self.kernel_version = prop("ro.kernel.version");
        self.build_fingerprint = prop("ro.build.fingerprint");
    }

    /// Fill in fields from `getvar:all` output.
    pub fn apply_fastboot_vars(&mut self, vars: &BTreeMap<String, String>) {
        let var = |key: &str| vars.get(key).cloned();
        if !self.has_serial()
            && let Some(serial) = var("serialno")
        {
            self.serial = serial;
        }
        self.product = var("product");
        self.variant = var("variant");
        self.bootloader = var("version-bootloader").or_else(|| var("bootloader"));
        self.secure = var("secure").map(|v| v == "yes");
        self.unlocked = var("unlocked").map(|v| v == "yes");
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN.into());
        let yes_no = |v: Option<bool>| match v {
            Some(true) => "yes",
            Some(false) => "no",
            None => UNKNOWN,
        };
        writeln!(f, "Serial:       {}", self.serial)?;
        writeln!(f, "Mode:         {}", self.mode)?;
        match self.mode {
            DeviceMode::Fastboot => {
                writeln!(f, "Product:      {}", show(&self.product))?;
                writeln!(f, "Variant:      {}", show(&self.variant))?;
                writeln!(f, "Bootloader:   {}", show(&self.bootloader))?;
                writeln!(f, "Secure:       {}", yes_no(self.secure))?;
                write!(f, "Unlocked:     {}", yes_no(self.unlocked))
            }
            _ => {
                writeln!(f, "Model:        {}", show(&self.model))?;
                writeln!(f, "Android:      {}", show(&self.android_version))?;
                writeln!(f, "Product:      {}", show(&self.product))?;
                writeln!(f, "CPU ABI:      {}", show(&self.cpu_arch))?;
                writeln!(f, "Kernel:       {}", show(&self.kernel_version))?;
                writeln!(f, "Fingerprint:  {}", show(&self.build_fingerprint))?;
                match self.battery_level {
                    Some(level) => write!(f, "Battery:      {}%", level),
                    None => write!(f, "Battery:      {}", UNKNOWN),
                }
            }
        }
    }
}

/// Parsed `CNXN` banner: `<type>:<serial>:<k>=<v>;...;features=a,b`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Banner {
    /// `device`, `recovery`, `sideload`, `bootloader`...
    pub system_type: String,
    pub serial: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub features: Vec<String>,
}

pub fn parse_cnxn_banner(banner: &str) -> Banner {
    let banner = banner.trim_end_matches('\0');
    let mut parts = banner.splitn(3, ':');
    let system_type = parts.next().unwrap_or_default().to_string();
    let serial = parts
        .next()
        .filter(|s| !s.is_empty())
        .map(String::from);

    let mut properties = BTreeMap::new();
    let mut features = Vec::new();
    for entry in parts.next().unwrap_or_default().split(';') {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if key == "features" {
            features = value
                .split(',')
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        } else {
            properties.insert(key.to_string(), value.to_string());
        }
    }

    Banner {
        system_type,
        serial,
        properties,
        features,
    }
}

/// Parse `getprop` output (`[key]: [value]` per line).
pub fn parse_getprop(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once("]: [")?;
            let key = key.strip_prefix('[')?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Battery percentage from `dumpsys battery`.
pub fn parse_battery_level(output: &str) -> Option<u8> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("level: ")
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Parse `getvar:all` text (`key: value` per line).
///
/// Keys may themselves contain ':' (`partition-size:boot_a: 0x4000000`),
/// so the split is on the first ": ".
pub fn parse_fastboot_vars(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches("(bootloader) ");
            let (key, value) = line.split_once(": ")?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
