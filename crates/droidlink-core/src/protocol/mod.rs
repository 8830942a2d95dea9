//! Protocol module - ADB and Fastboot wire formats.

pub mod constants;
pub mod fastboot;
pub mod message;

pub use constants::*;
pub use fastboot::{FastbootFrame, FastbootTag, decode_fastboot_frame, encode_fastboot_command};
pub use message::{
    AdbCommand, AdbHeader, AdbMessage, FrameError, checksum, decode_adb_header,
    encode_adb_message,
};
