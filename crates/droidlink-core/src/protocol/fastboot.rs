//! Fastboot framing.
//!
//! Requests are raw ASCII with no framing. Responses start with a 4-byte
//! tag (`OKAY`, `FAIL`, `INFO`, `DATA`) followed by an optional message.

use std::fmt;

use super::constants::{FB_DATA, FB_FAIL, FB_INFO, FB_OKAY};
use super::message::FrameError;

/// Response tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastbootTag {
    Okay,
    Fail,
    Info,
    Data,
}

impl FastbootTag {
    pub fn from_bytes(tag: &[u8]) -> Option<Self> {
        match tag {
            t if t == FB_OKAY => Some(Self::Okay),
            t if t == FB_FAIL => Some(Self::Fail),
            t if t == FB_INFO => Some(Self::Info),
            t if t == FB_DATA => Some(Self::Data),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Self::Okay => FB_OKAY,
            Self::Fail => FB_FAIL,
            Self::Info => FB_INFO,
            Self::Data => FB_DATA,
        }
    }
}

impl fmt::Display for FastbootTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// One decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastbootFrame {
    pub tag: FastbootTag,
    pub body: String,
}

impl FastbootFrame {
    /// Size announced by a `DATA` frame (hex digits).
    pub fn data_size(&self) -> Result<usize, FrameError> {
        usize::from_str_radix(self.body.trim(), 16)
            .map_err(|_| FrameError::InvalidDataSize(self.body.clone()))
    }
}

/// Fastboot commands go out as plain UTF-8.
pub fn encode_fastboot_command(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// Split a response into tag and body.
///
/// Bootloaders differ on whether a ':' separates tag and body
/// (`FAILdenied` vs `FAIL:denied`); one leading ':' is dropped.
pub fn decode_fastboot_frame(bytes: &[u8]) -> Result<FastbootFrame, FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::TooShort {
            expected: 4,
            actual: bytes.len(),
        });
    }
    let tag = FastbootTag::from_bytes(&bytes[..4])
        .ok_or_else(|| FrameError::UnknownTag(String::from_utf8_lossy(&bytes[..4]).into_owned()))?;

    let rest = &bytes[4..];
    let rest = rest.strip_prefix(b":").unwrap_or(rest);
    let body = String::from_utf8_lossy(rest)
        .trim_end_matches('\0')
        .to_string();

    Ok(FastbootFrame { tag, body })
}
