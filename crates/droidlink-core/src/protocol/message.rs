//! ADB message framing.
//!
//! Every ADB message is a 24-byte little-endian header followed by
//! `length` payload bytes:
//!
//! ```text
//! command | arg0 | arg1 | length | length ^ 0xFFFFFFFF | checksum
//! ```

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Checksum mismatch: header 0x{expected:08X}, payload 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Unknown Fastboot tag '{0}'")]
    UnknownTag(String),
    #[error("Invalid DATA size '{0}'")]
    InvalidDataSize(String),
    #[error("Payload of {length} bytes exceeds maximum of {max}")]
    PayloadTooLarge { length: usize, max: usize },
    #[error("Header length 0x{length:08X} does not match its complement 0x{complement:08X}")]
    BadComplement { length: u32, complement: u32 },
}

/// ADB command word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdbCommand {
    Sync,
    Cnxn,
    Open,
    Okay,
    Clse,
    Wrte,
    Auth,
    Other(u32),
}

impl AdbCommand {
    pub const fn from_u32(value: u32) -> Self {
        match value {
            A_SYNC => Self::Sync,
            A_CNXN => Self::Cnxn,
            A_OPEN => Self::Open,
            A_OKAY => Self::Okay,
            A_CLSE => Self::Clse,
            A_WRTE => Self::Wrte,
            A_AUTH => Self::Auth,
            other => Self::Other(other),
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Sync => A_SYNC,
            Self::Cnxn => A_CNXN,
            Self::Open => A_OPEN,
            Self::Okay => A_OKAY,
            Self::Clse => A_CLSE,
            Self::Wrte => A_WRTE,
            Self::Auth => A_AUTH,
            Self::Other(v) => v,
        }
    }

    /// Four-character name, with non-printable bytes shown as '.'.
    pub fn as_ascii(self) -> String {
        self.as_u32()
            .to_le_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect()
    }
}

impl fmt::Debug for AdbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdbCommand({:08X} '{}')", self.as_u32(), self.as_ascii())
    }
}

impl fmt::Display for AdbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ascii())
    }
}

/// Sum of payload bytes modulo 2^32.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Decoded ADB header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdbHeader {
    pub command: AdbCommand,
    pub arg0: u32,
    pub arg1: u32,
    pub length: u32,
    pub length_complement: u32,
    pub checksum: u32,
}

impl AdbHeader {
    pub const SIZE: usize = ADB_HEADER_SIZE;

    pub fn new(command: AdbCommand, arg0: u32, arg1: u32, payload: &[u8]) -> Self {
        let length = payload.len() as u32;
        Self {
            command,
            arg0,
            arg1,
            length,
            length_complement: length ^ 0xFFFF_FFFF,
            checksum: checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; ADB_HEADER_SIZE] {
        let mut buf = [0u8; ADB_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.command.as_u32());
        LittleEndian::write_u32(&mut buf[4..8], self.arg0);
        LittleEndian::write_u32(&mut buf[8..12], self.arg1);
        LittleEndian::write_u32(&mut buf[12..16], self.length);
        LittleEndian::write_u32(&mut buf[16..20], self.length_complement);
        LittleEndian::write_u32(&mut buf[20..24], self.checksum);
        buf
    }

    /// Parse a header, rejecting one whose length complement is wrong.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < Self::SIZE {
            return Err(FrameError::TooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let length = LittleEndian::read_u32(&data[12..16]);
        let length_complement = LittleEndian::read_u32(&data[16..20]);
        if length ^ 0xFFFF_FFFF != length_complement {
            return Err(FrameError::BadComplement {
                length,
                complement: length_complement,
            });
        }
        Ok(Self {
            command: AdbCommand::from_u32(LittleEndian::read_u32(&data[0..4])),
            arg0: LittleEndian::read_u32(&data[4..8]),
            arg1: LittleEndian::read_u32(&data[8..12]),
            length,
            length_complement,
            checksum: LittleEndian::read_u32(&data[20..24]),
        })
    }

    /// Check a received payload against this header.
    ///
    /// A zero checksum is accepted: devices speaking
    /// `ADB_VERSION_NO_CHECKSUM` leave it unset.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), FrameError> {
        if self.checksum == 0 {
            return Ok(());
        }
        let actual = checksum(payload);
        if actual != self.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// A complete ADB message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbMessage {
    pub command: AdbCommand,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl AdbMessage {
    pub fn new(command: AdbCommand, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    pub fn header(&self) -> AdbHeader {
        AdbHeader::new(self.command, self.arg0, self.arg1, &self.payload)
    }

    /// Header followed by payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ADB_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header().to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Payload as text, dropping one trailing NUL.
    pub fn payload_text(&self) -> String {
        let bytes = self.payload.strip_suffix(&[0u8]).unwrap_or(&self.payload);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Build header + payload for a single ADB message.
pub fn encode_adb_message(command: u32, arg0: u32, arg1: u32, payload: &[u8]) -> Vec<u8> {
    AdbMessage::new(AdbCommand::from_u32(command), arg0, arg1, payload).encode()
}

/// Decode the first 24 bytes of `bytes` as an ADB header.
pub fn decode_adb_header(bytes: &[u8]) -> Result<AdbHeader, FrameError> {
    AdbHeader::from_bytes(bytes)
}
