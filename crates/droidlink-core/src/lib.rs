//! DroidLink-Core: ADB and Fastboot host protocol over USB bulk endpoints.
//!
//! This crate talks to an Android device directly over USB, without an
//! ADB server. It detects whether the device is running Android, the
//! bootloader, recovery or sideload, claims the matching interface and
//! speaks ADB (with RSA key authentication) or Fastboot over it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, ADB message header, Fastboot frames
//! - **Transport**: USB abstraction (nusb, mock), mode detection, framed I/O
//! - **ADB / Fastboot**: Command drivers on top of a claimed interface
//! - **Auth**: RSA key pair, token signing, Android public key format
//! - **State**: Connection state machine and error classification
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator with retry and permission policies
//! - **Diagnostics**: Why a device can or cannot be reached
//!
//! # Example
//!
//! ```no_run
//! use droidlink_core::session::{DeviceSession, SessionConfig};
//! use droidlink_core::transport::{NusbHost, Selection};
//!
//! let mut session = DeviceSession::new(NusbHost::new(Selection::First), SessionConfig::default());
//! session.connect().expect("connect failed");
//! let output = session.execute_command("shell getprop ro.product.model").expect("shell failed");
//! println!("{output}");
//! ```

pub mod adb;
pub mod auth;
pub mod clock;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod fastboot;
pub mod mode;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use auth::KeyPair;
pub use device::DeviceInfo;
pub use diagnostics::DiagnosticsSnapshot;
pub use error::{Error, Result};
pub use events::{ChannelObserver, SessionEvent, SessionObserver, TracingObserver};
pub use fastboot::FlashSequence;
pub use mode::DeviceMode;
pub use session::{DeviceSession, RebootTarget, SessionConfig};
pub use state::{ConnectionContext, ConnectionState};
pub use transport::{MockHost, MockTransport, NusbHost, NusbTransport, TransportError, UsbHost, UsbTransport};
