//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for a single claimed device and the
//! `UsbHost` trait for enumeration and device selection, allowing
//! different implementations (nusb, mock, etc.).

use std::time::Duration;
use thiserror::Error;

use super::descriptor::{DeviceDescriptor, DeviceFilter};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Access to interface {interface} denied: {message}")]
    PermissionDenied { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Transfer on endpoint 0x{endpoint:02X} failed: {message}")]
    TransferFailed { endpoint: u8, message: String },

    #[error("Device is not open")]
    NotOpen,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Security/permission-class failure (another process or the OS holds
    /// the interface, or the user has not granted access).
    pub fn is_permission(&self) -> bool {
        matches!(self, TransportError::PermissionDenied { .. })
    }

    /// Failures worth retrying against the same device.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::TransferFailed { .. }
                | TransportError::Timeout { .. }
                | TransportError::Disconnected
                | TransportError::DeviceNotFound { .. }
                | TransportError::OpenFailed(_)
        )
    }
}

/// Platform capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// The host can talk to USB devices at all.
    pub transport_supported: bool,
    /// The execution context is allowed to use the transport.
    pub secure_context: bool,
    /// A policy layer blocks USB access.
    pub permissions_policy_blocked: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            transport_supported: true,
            secure_context: true,
            permissions_policy_blocked: false,
        }
    }
}

/// Abstract USB device handle.
///
/// One implementor value is one physical device. The handle is owned by
/// exactly one transport session at a time.
pub trait UsbTransport: Send {
    /// Snapshot of the descriptor tree.
    fn descriptor(&self) -> DeviceDescriptor;

    fn open(&mut self) -> Result<(), TransportError>;

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError>;

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError>;

    /// Port-level reset of the device.
    fn reset(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Write raw bytes to a bulk OUT endpoint.
    fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from a bulk IN endpoint.
    ///
    /// Returns `TransportError::Timeout` if nothing arrives in time.
    fn transfer_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    fn vendor_id(&self) -> u16 {
        self.descriptor().vendor_id
    }

    fn product_id(&self) -> u16 {
        self.descriptor().product_id
    }
}

/// Host-side USB API: capabilities, known devices and the device chooser.
pub trait UsbHost {
    type Device: UsbTransport + 'static;

    fn capabilities(&self) -> HostCapabilities;

    /// Devices the host already grants access to, without prompting.
    fn authorized_devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    /// Let the user pick a device. `Ok(None)` means the chooser was dismissed.
    fn request_device(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<Self::Device>, TransportError>;
}
