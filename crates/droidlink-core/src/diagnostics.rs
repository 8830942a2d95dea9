//! Point-in-time connection diagnostics.

use std::fmt;

use serde::Serialize;

use crate::state::classify::*;
use crate::state::{ConnectionContext, ConnectionState};
use crate::transport::{HostCapabilities, UsbHost, UsbTransport, android_filters};
use crate::transport::descriptor::matches_any;

/// Read-only report on why a device can or cannot be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub transport_supported: bool,
    pub secure_context: bool,
    pub permissions_policy_blocked: bool,
    /// Enumerating USB devices works.
    pub usb_devices_accessible: bool,
    pub previously_authorized_devices: usize,
    /// At least one accessible device looks like an Android device.
    pub android_device_found: bool,
    pub permission_granted: bool,
    pub connection_established: bool,
    /// `os/arch` of the host.
    pub host_platform: String,
    pub suggested_fixes: Vec<String>,
}

impl DiagnosticsSnapshot {
    /// Query `host` and combine the result with the session's published state.
    pub fn collect<H: UsbHost>(host: &H, context: &ConnectionContext) -> Self {
        let caps = host.capabilities();
        let devices = if caps.transport_supported {
            host.authorized_devices().ok()
        } else {
            None
        };

        let filters = android_filters();
        let android_device_found = devices
            .iter()
            .flatten()
            .any(|d| matches_any(&filters, &d.descriptor()));
        let connection_established = context.state == ConnectionState::Connected;

        let mut snapshot = Self {
            transport_supported: caps.transport_supported,
            secure_context: caps.secure_context,
            permissions_policy_blocked: caps.permissions_policy_blocked,
            usb_devices_accessible: devices.is_some(),
            previously_authorized_devices: devices.as_ref().map_or(0, Vec::len),
            android_device_found,
            permission_granted: connection_established
                || (android_device_found && context.state != ConnectionState::PermissionDenied),
            connection_established,
            host_platform: host_platform(),
            suggested_fixes: Vec::new(),
        };
        snapshot.suggested_fixes = suggested_fixes(&snapshot, caps, context);
        snapshot
    }
}

fn host_platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn suggested_fixes(
    snapshot: &DiagnosticsSnapshot,
    caps: HostCapabilities,
    context: &ConnectionContext,
) -> Vec<String> {
    let mut fixes: Vec<&str> = Vec::new();
    if !caps.transport_supported {
        fixes.push(FIX_USE_SUPPORTED_HOST);
    }
    if !caps.secure_context {
        fixes.push(FIX_SECURE_CONTEXT);
    }
    if caps.permissions_policy_blocked {
        fixes.push(FIX_POLICY);
    }
    if caps.transport_supported && !snapshot.usb_devices_accessible {
        fixes.push(FIX_UDEV);
    }
    if snapshot.usb_devices_accessible && !snapshot.android_device_found {
        fixes.extend([FIX_ENABLE_DEBUGGING, FIX_CABLE]);
    }
    if snapshot.android_device_found && !snapshot.permission_granted {
        fixes.extend([FIX_ACCEPT_PROMPT, FIX_OTHER_CLIENT]);
    }

    // Remediation of the last failed attempt.
    if context.state.is_failure()
        && let Some(details) = &context.details
    {
        fixes.extend(details.lines());
    }

    let mut out: Vec<String> = Vec::new();
    for fix in fixes {
        if !out.iter().any(|f| f == fix) {
            out.push(fix.to_string());
        }
    }
    out
}

impl fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |ok: bool| if ok { "ok" } else { "--" };
        writeln!(f, "[{}] USB transport supported", mark(self.transport_supported))?;
        writeln!(f, "[{}] Secure context", mark(self.secure_context))?;
        writeln!(f, "[{}] No blocking USB policy", mark(!self.permissions_policy_blocked))?;
        writeln!(
            f,
            "[{}] USB devices accessible ({} authorized)",
            mark(self.usb_devices_accessible),
            self.previously_authorized_devices
        )?;
        writeln!(f, "[{}] Android device found", mark(self.android_device_found))?;
        writeln!(f, "[{}] Permission granted", mark(self.permission_granted))?;
        writeln!(f, "[{}] Connection established", mark(self.connection_established))?;
        write!(f, "Host: {}", self.host_platform)?;
        if !self.suggested_fixes.is_empty() {
            write!(f, "\n\nSuggested fixes:")?;
            for fix in &self.suggested_fixes {
                write!(f, "\n  - {fix}")?;
            }
        }
        Ok(())
    }
}
