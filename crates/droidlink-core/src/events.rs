//! Event system for UI decoupling.
//!
//! Frontends subscribe to session events instead of polling the
//! orchestrator. `ChannelObserver` turns the stream into an mpsc channel.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::mode::DeviceMode;
use crate::protocol::{AdbHeader, FastbootTag};
use crate::state::ConnectionState;
use crate::transport::{DeviceDescriptor, TransportError, UsbTransport};

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        message: Option<String>,
    },
    DeviceConnected {
        vid: u16,
        pid: u16,
        mode: DeviceMode,
    },
    DeviceDisconnected,
    /// USB packet sent/received. `data` holds at most the first 32 bytes.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    RetryScheduled {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
    PermissionPoll {
        attempt: u32,
        max: u32,
    },
}

/// Observer trait for receiving session events.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged { from, to, message } => match message {
                Some(message) => tracing::info!(from = %from, to = %to, "State changed: {}", message),
                None => tracing::info!(from = %from, to = %to, "State changed"),
            },
            SessionEvent::DeviceConnected { vid, pid, mode } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), mode = %mode, "Device connected");
            }
            SessionEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            SessionEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "USB Packet"
                );
            }
            SessionEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            SessionEvent::RetryScheduled {
                attempt,
                max,
                delay,
            } => {
                tracing::warn!(attempt, max, delay_ms = delay.as_millis() as u64, "Retry scheduled");
            }
            SessionEvent::PermissionPoll { attempt, max } => {
                tracing::info!(attempt, max, "Waiting for permission");
            }
        }
    }
}

/// Forwards events into an mpsc channel.
pub struct ChannelObserver {
    tx: Sender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl SessionObserver for ChannelObserver {
    fn on_event(&self, event: &SessionEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Short label for a raw USB transfer.
fn packet_label(data: &[u8]) -> String {
    if data.len() == AdbHeader::SIZE
        && let Ok(header) = AdbHeader::from_bytes(data)
    {
        return header.command.to_string();
    }
    if data.len() <= 64
        && let Some(tag) = data.get(..4).and_then(FastbootTag::from_bytes)
    {
        return tag.to_string();
    }
    let label = if data.len() < 32 { "Cmd/Hdr" } else { "Data" };
    label.to_string()
}

/// Device wrapper that emits packet events.
pub struct ObservedDevice<T: UsbTransport> {
    inner: T,
    observer: Arc<dyn SessionObserver>,
}

impl<T: UsbTransport> ObservedDevice<T> {
    pub fn new(inner: T, observer: Arc<dyn SessionObserver>) -> Self {
        Self { inner, observer }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn emit(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&SessionEvent::Packet {
            direction,
            packet_type: packet_label(data),
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }
}

impl<T: UsbTransport> UsbTransport for ObservedDevice<T> {
    fn descriptor(&self) -> DeviceDescriptor {
        self.inner.descriptor()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open()
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.inner.select_configuration(value)
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        self.inner.claim_interface(number)
    }

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError> {
        self.inner.release_interface(number)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.inner.reset()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close()
    }

    fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.transfer_out(endpoint, data);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, data);
        }
        res
    }

    fn transfer_in(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.transfer_in(endpoint, max_len, timeout);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.emit(PacketDirection::Rx, data);
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
