//! Claimed interface plus its bulk endpoint pair.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::traits::{TransportError, UsbTransport};
use crate::clock::Clock;
use crate::error::Error;
use crate::mode::{DeviceMode, InterfaceEndpoints, detect_mode, find_interface_and_endpoints};
use crate::protocol::constants::DEFAULT_CONFIGURATION;

/// Absolute time limit shared by all transfers of one operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, or `Timeout` once the deadline has passed.
    pub fn remaining(&self) -> Result<Duration, TransportError> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.expired());
        }
        Ok(left)
    }

    pub fn expired(&self) -> TransportError {
        TransportError::Timeout {
            timeout_ms: self.budget.as_millis() as u64,
        }
    }
}

/// Failed `TransportSession::open`; hands the device back for a retry.
pub struct OpenFailure<T> {
    pub error: Error,
    pub device: T,
}

impl<T> fmt::Debug for OpenFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFailure")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Exclusive owner of an opened device and its claimed interface.
pub struct TransportSession<T: UsbTransport> {
    device: T,
    mode: DeviceMode,
    endpoints: InterfaceEndpoints,
    claimed: bool,
    /// ADB stream still open on the device, as `(local_id, remote_id)`.
    open_stream: Option<(u32, u32)>,
}

impl<T: UsbTransport> fmt::Debug for TransportSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("mode", &self.mode)
            .field("endpoints", &self.endpoints)
            .field("claimed", &self.claimed)
            .field("open_stream", &self.open_stream)
            .finish_non_exhaustive()
    }
}

impl<T: UsbTransport> TransportSession<T> {
    /// Open the device, select configuration 1, detect its mode and claim
    /// the matching interface.
    ///
    /// A permission-class claim failure gets one device reset, a settle
    /// delay and a second claim before it surfaces as `PermissionRequired`.
    #[instrument(level = "info", skip_all)]
    pub fn open(mut device: T, clock: &dyn Clock, settle: Duration) -> Result<Self, OpenFailure<T>> {
        match Self::prepare(&mut device, clock, settle) {
            Ok((mode, endpoints)) => Ok(Self {
                device,
                mode,
                endpoints,
                claimed: true,
                open_stream: None,
            }),
            Err(error) => {
                if let Err(e) = device.close() {
                    debug!(error = %e, "Close after failed open");
                }
                Err(OpenFailure { error, device })
            }
        }
    }

    fn prepare(
        device: &mut T,
        clock: &dyn Clock,
        settle: Duration,
    ) -> Result<(DeviceMode, InterfaceEndpoints), Error> {
        device.open()?;

        // Most platforms already have it selected; failing here is not fatal.
        if let Err(e) = device.select_configuration(DEFAULT_CONFIGURATION) {
            warn!(error = %e, "Could not select configuration");
        }

        let descriptor = device.descriptor();
        let mode = detect_mode(&descriptor);
        let endpoints =
            find_interface_and_endpoints(&descriptor, mode).ok_or(Error::NoInterfaceFound { mode })?;
        info!(
            mode = %mode,
            interface = endpoints.interface_number,
            ep_in = format!("0x{:02X}", endpoints.endpoint_in),
            ep_out = format!("0x{:02X}", endpoints.endpoint_out),
            "Resolved interface"
        );

        let number = endpoints.interface_number;
        match device.claim_interface(number) {
            Ok(()) => {}
            Err(e) if e.is_permission() => {
                warn!(error = %e, "Interface busy, resetting device");
                if let Err(reset) = device.reset() {
                    warn!(error = %reset, "Reset failed");
                }
                clock.sleep(settle);
                device.claim_interface(number).map_err(|e| {
                    if e.is_permission() {
                        Error::PermissionRequired(e.to_string())
                    } else {
                        Error::Transport(e)
                    }
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok((mode, endpoints))
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn endpoints(&self) -> InterfaceEndpoints {
        self.endpoints
    }

    pub fn device(&self) -> &T {
        &self.device
    }

    /// Write one frame to the OUT endpoint.
    pub fn send_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let endpoint = self.endpoints.endpoint_out;
        let written = self.device.transfer_out(endpoint, bytes)?;
        if written != bytes.len() {
            return Err(TransportError::TransferFailed {
                endpoint,
                message: format!("short write: {} of {} bytes", written, bytes.len()),
            });
        }
        Ok(())
    }

    /// Read one transfer of at most `max_len` bytes before `deadline`.
    ///
    /// Zero-length packets are skipped.
    pub fn receive_frame(
        &mut self,
        max_len: usize,
        deadline: &Deadline,
    ) -> Result<Vec<u8>, TransportError> {
        let endpoint = self.endpoints.endpoint_in;
        loop {
            let remaining = deadline.remaining()?;
            match self.device.transfer_in(endpoint, max_len, remaining) {
                Ok(data) if data.is_empty() => continue,
                Ok(data) => return Ok(data),
                Err(TransportError::Timeout { .. }) => return Err(deadline.expired()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read exactly `len` bytes, across as many transfers as needed.
    pub fn read_exact(&mut self, len: usize, deadline: &Deadline) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::with_capacity(len);
        while buf.len() < len {
            let chunk = self.receive_frame(len - buf.len(), deadline)?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// Re-claim the interface after `release_interface`. No-op if claimed.
    pub fn claim_interface(&mut self) -> Result<(), TransportError> {
        if !self.claimed {
            self.device.claim_interface(self.endpoints.interface_number)?;
            self.claimed = true;
        }
        Ok(())
    }

    /// Best-effort release; errors are logged. No-op if already released.
    pub fn release_interface(&mut self) {
        if !self.claimed {
            return;
        }
        self.claimed = false;
        if let Err(e) = self
            .device
            .release_interface(self.endpoints.interface_number)
        {
            warn!(error = %e, "Release interface failed");
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    pub fn set_open_stream(&mut self, stream: Option<(u32, u32)>) {
        self.open_stream = stream;
    }

    pub fn open_stream(&self) -> Option<(u32, u32)> {
        self.open_stream
    }

    /// Release, close and give the device back. Never fails.
    pub fn close(mut self) -> T {
        self.release_interface();
        if let Err(e) = self.device.close() {
            warn!(error = %e, "Close device failed");
        }
        self.device
    }
}
