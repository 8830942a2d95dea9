//! Error classification into connection states and user remediation.
//!
//! The diagnostics snapshot draws its suggested fixes from the same
//! strings, so a failure and its diagnosis never disagree.

use crate::error::Error;
use crate::state::machine::ConnectionState;
use crate::transport::TransportError;

pub const FIX_USE_SUPPORTED_HOST: &str =
    "Use a host with USB support (Linux, macOS or Windows with a USB stack available).";
pub const FIX_SECURE_CONTEXT: &str = "Run from a trusted context that is allowed to access USB devices.";
pub const FIX_POLICY: &str = "Lift the USB permissions policy that blocks device access.";
pub const FIX_ACCEPT_PROMPT: &str =
    "Check the device screen for an 'Allow USB debugging?' prompt and accept it.";
pub const FIX_ENABLE_DEBUGGING: &str = "Enable USB debugging in Developer options on the device.";
pub const FIX_OTHER_CLIENT: &str =
    "Stop other ADB clients (e.g. `adb kill-server`) that may hold the interface.";
pub const FIX_UDEV: &str = "On Linux, install udev rules that grant your user access to Android devices.";
pub const FIX_CABLE: &str = "Try a different USB cable (some are power-only) or another USB port.";
pub const FIX_RECONNECT: &str = "Unplug the device and connect it again.";
pub const FIX_SELECT_DEVICE: &str = "Select a device when prompted.";
pub const FIX_CHECK_MODE: &str =
    "Make sure the device is booted into Android, the bootloader or recovery.";
pub const FIX_RESET: &str = "Reset the connection, then retry.";

/// Outcome of mapping an error onto the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: ConnectionState,
    pub message: String,
    pub details: String,
    /// Eligible for automatic retry.
    pub retryable: bool,
    /// Needs the user to grant access or trust this host.
    pub permission_class: bool,
}

impl Classification {
    fn new(state: ConnectionState, message: String, fixes: &[&str], retryable: bool) -> Self {
        Self {
            state,
            message,
            details: fixes.join("\n"),
            retryable,
            permission_class: state == ConnectionState::PermissionDenied,
        }
    }
}

/// Map an error to the state a failed connect attempt lands in.
pub fn classify(error: &Error) -> Classification {
    use ConnectionState as S;
    let message = error.to_string();

    match error {
        Error::UnsupportedPlatform => {
            Classification::new(S::Error, message, &[FIX_USE_SUPPORTED_HOST], false)
        }
        Error::InsecureContext => {
            Classification::new(S::Error, message, &[FIX_SECURE_CONTEXT], false)
        }
        Error::PermissionsPolicyBlocked => {
            Classification::new(S::Error, message, &[FIX_POLICY], false)
        }
        Error::NoDeviceSelected => Classification::new(
            S::Disconnected,
            message,
            &[FIX_SELECT_DEVICE, FIX_ENABLE_DEBUGGING],
            false,
        ),
        Error::NoInterfaceFound { .. } => Classification::new(
            S::Error,
            message,
            &[FIX_CHECK_MODE, FIX_ENABLE_DEBUGGING],
            false,
        ),
        Error::PermissionRequired(_) | Error::AuthenticationFailed(_) => Classification::new(
            S::PermissionDenied,
            message,
            &[FIX_ACCEPT_PROMPT, FIX_RECONNECT],
            false,
        ),
        Error::Transport(e) => classify_transport(e, message),
        Error::CommandTimeout { .. } | Error::HandshakeTimeout(_) => Classification::new(
            S::Timeout,
            message,
            &[FIX_ACCEPT_PROMPT, FIX_RESET, FIX_CABLE],
            true,
        ),
        Error::FlashTimeout { .. } => {
            Classification::new(S::Timeout, message, &[FIX_RESET, FIX_CABLE], false)
        }
        Error::Auth(_) => Classification::new(S::Error, message, &[FIX_USE_SUPPORTED_HOST], false),
        Error::MalformedFrame(_)
        | Error::UnexpectedResponse { .. }
        | Error::FastbootError(_)
        | Error::UnsupportedCommand { .. }
        | Error::NotConnected
        | Error::CommandRejected(_) => {
            Classification::new(S::Error, message, &[FIX_RESET, FIX_RECONNECT], false)
        }
    }
}

fn classify_transport(error: &TransportError, message: String) -> Classification {
    use ConnectionState as S;
    match error {
        TransportError::PermissionDenied { .. } => Classification::new(
            S::PermissionDenied,
            message,
            &[FIX_OTHER_CLIENT, FIX_UDEV, FIX_RECONNECT],
            false,
        ),
        TransportError::Timeout { .. } => Classification::new(
            S::Timeout,
            message,
            &[FIX_ACCEPT_PROMPT, FIX_RESET, FIX_CABLE],
            true,
        ),
        TransportError::Disconnected | TransportError::TransferFailed { .. } => {
            Classification::new(S::ConnectionLost, message, &[FIX_CABLE, FIX_RECONNECT], true)
        }
        TransportError::DeviceNotFound { .. } | TransportError::OpenFailed(_) => {
            Classification::new(
                S::Error,
                message,
                &[FIX_RECONNECT, FIX_UDEV, FIX_OTHER_CLIENT],
                true,
            )
        }
        TransportError::ClaimInterfaceFailed { .. }
        | TransportError::EndpointNotFound { .. }
        | TransportError::NotOpen
        | TransportError::Io(_) => {
            Classification::new(S::Error, message, &[FIX_RESET, FIX_RECONNECT], false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_permission_class() {
        let c = classify(&Error::AuthenticationFailed("no CNXN".into()));
        assert_eq!(c.state, ConnectionState::PermissionDenied);
        assert!(!c.retryable);
        assert!(c.permission_class);
        assert!(c.details.contains(FIX_ACCEPT_PROMPT));
    }

    #[test]
    fn test_transient_classes() {
        let c = classify(&Error::Transport(TransportError::TransferFailed {
            endpoint: 0x81,
            message: "pipe".into(),
        }));
        assert_eq!(c.state, ConnectionState::ConnectionLost);
        assert!(c.retryable);
        assert!(!c.permission_class);

        let c = classify(&Error::HandshakeTimeout(Duration::from_secs(10)));
        assert_eq!(c.state, ConnectionState::Timeout);
        assert!(c.retryable);
    }

    #[test]
    fn test_platform_is_final() {
        let c = classify(&Error::UnsupportedPlatform);
        assert_eq!(c.state, ConnectionState::Error);
        assert!(!c.retryable);
        assert_eq!(c.details, FIX_USE_SUPPORTED_HOST);
    }

    #[test]
    fn test_retryable_matches_transient() {
        let errors = [
            Error::Transport(TransportError::Disconnected),
            Error::Transport(TransportError::Timeout { timeout_ms: 10 }),
            Error::FastbootError("x".into()),
            Error::NoDeviceSelected,
        ];
        for e in &errors {
            assert_eq!(classify(e).retryable, e.is_transient(), "{e}");
        }
    }
}
