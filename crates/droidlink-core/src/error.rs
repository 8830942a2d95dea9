//! Crate-wide error type.

use std::time::Duration;

use thiserror::Error;

use crate::auth::AuthError;
use crate::mode::DeviceMode;
use crate::protocol::FrameError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("USB is not supported on this host")]
    UnsupportedPlatform,

    #[error("USB access requires a secure context")]
    InsecureContext,

    #[error("USB access is blocked by a permissions policy")]
    PermissionsPolicyBlocked,

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Could not find {mode} interface")]
    NoInterfaceFound { mode: DeviceMode },

    #[error("Permission required: {0}")]
    PermissionRequired(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    MalformedFrame(#[from] FrameError),

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("Fastboot error: {0}")]
    FastbootError(String),

    #[error("Command '{command}' timed out after {}s", .timeout.as_secs())]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Flashing '{partition}' timed out after {}s", .timeout.as_secs())]
    FlashTimeout { partition: String, timeout: Duration },

    #[error("Command '{command}' is not supported in {mode} mode")]
    UnsupportedCommand { command: String, mode: DeviceMode },

    #[error("Not connected")]
    NotConnected,

    #[error("Device rejected command '{0}'")]
    CommandRejected(String),

    #[error("Handshake timed out after {}s", .0.as_secs())]
    HandshakeTimeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Worth an automatic retry against the same device.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_transient(),
            Error::CommandTimeout { .. } | Error::HandshakeTimeout(_) => true,
            _ => false,
        }
    }

    /// Requires a user action on the device or host.
    pub fn is_permission(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_permission(),
            Error::PermissionRequired(_) | Error::AuthenticationFailed(_) => true,
            _ => false,
        }
    }

    /// Replace a bare transfer timeout with an operation-specific error.
    pub(crate) fn or_timeout(self, to: impl FnOnce() -> Error) -> Error {
        match self {
            Error::Transport(TransportError::Timeout { .. }) => to(),
            other => other,
        }
    }

    /// A transfer-level timeout, as opposed to a device-reported failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Timeout { .. })
                | Error::CommandTimeout { .. }
                | Error::FlashTimeout { .. }
                | Error::HandshakeTimeout(_)
        )
    }
}
