//! Protocol constants for ADB and Fastboot over USB.
//!
//! Derived from AOSP `adb.h`, `usb.h` and the Fastboot protocol description.

use std::time::Duration;

// ============================================================================
// USB Interface Triplets (class, subclass, protocol)
// ============================================================================

/// Vendor-specific interface class shared by ADB, Fastboot and Sideload.
pub const ANDROID_CLASS: u8 = 0xFF;

/// Android subclass.
pub const ANDROID_SUBCLASS: u8 = 0x42;

/// ADB interface protocol.
pub const ADB_PROTOCOL: u8 = 0x01;

/// Sideload / recovery interface protocol.
pub const SIDELOAD_PROTOCOL: u8 = 0x02;

/// Fastboot interface protocol.
pub const FASTBOOT_PROTOCOL: u8 = 0x03;

pub const ADB_TRIPLET: (u8, u8, u8) = (ANDROID_CLASS, ANDROID_SUBCLASS, ADB_PROTOCOL);
pub const SIDELOAD_TRIPLET: (u8, u8, u8) = (ANDROID_CLASS, ANDROID_SUBCLASS, SIDELOAD_PROTOCOL);
pub const FASTBOOT_TRIPLET: (u8, u8, u8) = (ANDROID_CLASS, ANDROID_SUBCLASS, FASTBOOT_PROTOCOL);

// ============================================================================
// Vendor IDs (fallback allow-list for non-standard descriptors)
// ============================================================================

pub const VID_GOOGLE: u16 = 0x18D1;
pub const VID_SAMSUNG: u16 = 0x04E8;
pub const VID_MOTOROLA: u16 = 0x22B8;
pub const VID_HTC: u16 = 0x0BB4;
pub const VID_HUAWEI: u16 = 0x12D1;
pub const VID_XIAOMI: u16 = 0x2717;
pub const VID_MEDIATEK: u16 = 0x0E8D;
pub const VID_ONEPLUS: u16 = 0x2A70;
pub const VID_QUALCOMM: u16 = 0x05C6;
pub const VID_REALME: u16 = 0x1EBF;
pub const VID_VIVO: u16 = 0x2B4C;
pub const VID_NOKIA: u16 = 0x0421;

/// Major Android OEM vendor IDs.
pub const ANDROID_VENDOR_IDS: &[u16] = &[
    VID_GOOGLE,
    VID_SAMSUNG,
    VID_MOTOROLA,
    VID_HTC,
    VID_HUAWEI,
    VID_XIAOMI,
    VID_MEDIATEK,
    VID_ONEPLUS,
    VID_QUALCOMM,
    VID_REALME,
    VID_VIVO,
    VID_NOKIA,
];

// ============================================================================
// ADB Message Commands (little-endian ASCII)
// ============================================================================

pub const A_SYNC: u32 = 0x434E5953; // 'SYNC'
pub const A_CNXN: u32 = 0x4E584E43; // 'CNXN'
pub const A_OPEN: u32 = 0x4E45504F; // 'OPEN'
pub const A_OKAY: u32 = 0x59414B4F; // 'OKAY'
pub const A_CLSE: u32 = 0x45534C43; // 'CLSE'
pub const A_WRTE: u32 = 0x45545257; // 'WRTE'
pub const A_AUTH: u32 = 0x48545541; // 'AUTH'

/// Protocol version with payload checksums.
pub const ADB_VERSION: u32 = 0x01000000;

/// Protocol version where checksums may be zero.
pub const ADB_VERSION_NO_CHECKSUM: u32 = 0x01000001;

/// Maximum payload advertised in CNXN.
pub const ADB_MAX_PAYLOAD: u32 = 256 * 1024;

/// ADB header size (6 DWORDs = 24 bytes).
pub const ADB_HEADER_SIZE: usize = 24;

/// AUTH arg0 values.
pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Size of the token the device asks us to sign (a SHA-1 digest).
pub const AUTH_TOKEN_SIZE: usize = 20;

// ============================================================================
// Fastboot
// ============================================================================

pub const FB_OKAY: &[u8; 4] = b"OKAY";
pub const FB_FAIL: &[u8; 4] = b"FAIL";
pub const FB_DATA: &[u8; 4] = b"DATA";
pub const FB_INFO: &[u8; 4] = b"INFO";

/// Maximum Fastboot response frame.
pub const FB_RESPONSE_SIZE: usize = 64;

/// Chunk size when draining a device-offered DATA payload.
pub const FB_UPLOAD_CHUNK: usize = 16 * 1024;

/// Largest DATA payload accepted from the device.
pub const FB_MAX_PAYLOAD: usize = 512 * 1024 * 1024;

/// Chunk size when streaming an image to the device.
pub const FB_DOWNLOAD_CHUNK: usize = 1024 * 1024;

// ============================================================================
// Timing
// ============================================================================

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const FLASH_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between permission checks.
pub const PERMISSION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Permission checks before giving up (~30 s).
pub const MAX_PERMISSION_CHECKS: u32 = 15;

/// Automatic retries for transient failures.
pub const MAX_AUTO_RETRIES: u32 = 3;

/// First backoff delay; doubles on every retry.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Wait after a device reset before re-claiming.
pub const CLAIM_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// USB configuration selected on open.
pub const DEFAULT_CONFIGURATION: u8 = 1;

/// Host identity sent in CNXN.
pub const DEFAULT_HOST_BANNER: &str = "host::droidlink";
