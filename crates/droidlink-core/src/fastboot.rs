//! Fastboot command driver.
//!
//! One command is outstanding at a time. The device answers with any
//! number of `INFO` frames, optional `DATA` stages, and a final `OKAY` or
//! `FAIL`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::protocol::{FastbootTag, FrameError, decode_fastboot_frame, encode_fastboot_command};
use crate::transport::{Deadline, TransportSession, UsbTransport};

/// Order of the `flash:` and `download:` commands when flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashSequence {
    /// `flash:<partition>` first, then `download:<size>` and the image.
    #[default]
    FlashThenDownload,
    /// `download:<size>` and the image first, then `flash:<partition>`.
    DownloadThenFlash,
}

/// Everything a single exchange produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastbootReply {
    /// INFO lines (newline-terminated) followed by the OKAY body.
    pub text: String,
    /// Bytes the device sent in `DATA` stages.
    pub upload: Vec<u8>,
}

/// How a run of frames ended.
enum Terminal {
    Okay,
    Data(usize),
}

/// Read frames until `OKAY`, `FAIL` or `DATA`, collecting `INFO` text.
fn next_terminal<T: UsbTransport>(
    session: &mut TransportSession<T>,
    deadline: &Deadline,
    text: &mut String,
) -> Result<Terminal> {
    loop {
        let raw = session.receive_frame(FB_RESPONSE_SIZE, deadline)?;
        let frame = decode_fastboot_frame(&raw)?;
        debug!(tag = %frame.tag, body = %frame.body, "Fastboot recv");
        match frame.tag {
            FastbootTag::Info => {
                text.push_str(&frame.body);
                text.push('\n');
            }
            FastbootTag::Okay => {
                text.push_str(&frame.body);
                return Ok(Terminal::Okay);
            }
            FastbootTag::Fail => return Err(Error::FastbootError(frame.body)),
            FastbootTag::Data => return Ok(Terminal::Data(frame.data_size()?)),
        }
    }
}

/// Drain a device-offered payload of `size` bytes.
fn receive_upload<T: UsbTransport>(
    session: &mut TransportSession<T>,
    size: usize,
    deadline: &Deadline,
    upload: &mut Vec<u8>,
) -> Result<()> {
    if size > FB_MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            length: size,
            max: FB_MAX_PAYLOAD,
        }
        .into());
    }
    session.send_frame(FB_DATA)?;
    let mut left = size;
    while left > 0 {
        let chunk = session.receive_frame(left.min(FB_UPLOAD_CHUNK), deadline)?;
        left = left.saturating_sub(chunk.len());
        upload.extend_from_slice(&chunk);
    }
    session.send_frame(FB_OKAY)?;
    debug!(size, "DATA stage complete");
    Ok(())
}

/// Send `command` and run the exchange to completion.
pub fn exchange<T: UsbTransport>(
    session: &mut TransportSession<T>,
    command: &str,
    deadline: &Deadline,
) -> Result<FastbootReply> {
    session.send_frame(&encode_fastboot_command(command))?;
    let mut reply = FastbootReply::default();
    loop {
        match next_terminal(session, deadline, &mut reply.text)? {
            Terminal::Okay => return Ok(reply),
            Terminal::Data(size) => receive_upload(session, size, deadline, &mut reply.upload)?,
        }
    }
}

/// Run one Fastboot command and return its text.
#[instrument(level = "info", skip(session, deadline))]
pub fn execute_fastboot<T: UsbTransport>(
    session: &mut TransportSession<T>,
    command: &str,
    deadline: &Deadline,
) -> Result<String> {
    exchange(session, command, deadline)
        .map(|reply| reply.text)
        .map_err(|e| {
            e.or_timeout(|| Error::CommandTimeout {
                command: command.to_string(),
                timeout: deadline.budget(),
            })
        })
}

/// Write `image` to `partition`.
///
/// `progress` is called after every chunk with `(sent, total)`.
#[instrument(level = "info", skip(session, image, deadline, progress), fields(size = image.len()))]
pub fn flash_partition<T: UsbTransport>(
    session: &mut TransportSession<T>,
    partition: &str,
    image: &[u8],
    sequence: FlashSequence,
    deadline: &Deadline,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<String> {
    let mut text = String::new();
    run_flash(session, partition, image, sequence, deadline, &mut text, progress).map_err(|e| {
        e.or_timeout(|| Error::FlashTimeout {
            partition: partition.to_string(),
            timeout: deadline.budget(),
        })
    })?;

    info!(partition, "Flash complete");
    Ok(text)
}

fn run_flash<T: UsbTransport>(
    session: &mut TransportSession<T>,
    partition: &str,
    image: &[u8],
    sequence: FlashSequence,
    deadline: &Deadline,
    text: &mut String,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    match sequence {
        FlashSequence::FlashThenDownload => {
            flash_command(session, partition, deadline, text)?;
            download(session, image, deadline, text, progress)
        }
        FlashSequence::DownloadThenFlash => {
            download(session, image, deadline, text, progress)?;
            flash_command(session, partition, deadline, text)
        }
    }
}

fn flash_command<T: UsbTransport>(
    session: &mut TransportSession<T>,
    partition: &str,
    deadline: &Deadline,
    text: &mut String,
) -> Result<()> {
    let reply = exchange(session, &format!("flash:{partition}"), deadline)?;
    text.push_str(&reply.text);
    Ok(())
}

fn download<T: UsbTransport>(
    session: &mut TransportSession<T>,
    image: &[u8],
    deadline: &Deadline,
    text: &mut String,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    session.send_frame(&encode_fastboot_command(&format!(
        "download:{:08x}",
        image.len()
    )))?;

    match next_terminal(session, deadline, text)? {
        Terminal::Data(size) if size == image.len() => {}
        Terminal::Data(size) => {
            return Err(Error::UnexpectedResponse {
                expected: format!("DATA{:08x}", image.len()),
                actual: format!("DATA{size:08x}"),
            });
        }
        Terminal::Okay => {
            return Err(Error::UnexpectedResponse {
                expected: "DATA".into(),
                actual: "OKAY".into(),
            });
        }
    }

    let total = image.len() as u64;
    let mut sent = 0u64;
    for chunk in image.chunks(FB_DOWNLOAD_CHUNK) {
        session.send_frame(chunk)?;
        sent += chunk.len() as u64;
        progress(sent, total);
    }
    debug!(bytes = sent, "Image streamed");

    match next_terminal(session, deadline, text)? {
        Terminal::Okay => Ok(()),
        Terminal::Data(size) => Err(Error::UnexpectedResponse {
            expected: "OKAY".into(),
            actual: format!("DATA{size:08x}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingClock;
    use crate::transport::MockTransport;
    use crate::transport::descriptor::fixtures::fastboot_device;
    use std::time::Duration;

    fn open_fastboot(mock: &MockTransport) -> TransportSession<MockTransport> {
        TransportSession::open(mock.clone(), &RecordingClock::new(), CLAIM_SETTLE_DELAY).unwrap()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn test_info_accumulation() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("INFO:step1");
        mock.queue_fastboot("INFO:step2");
        mock.queue_fastboot("OKAY");

        let out = execute_fastboot(&mut session, "oem unlock", &deadline()).unwrap();
        assert_eq!(out, "step1\nstep2\n");
        assert_eq!(mock.get_writes(), vec![b"oem unlock".to_vec()]);
    }

    #[test]
    fn test_fail_propagates_message() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("FAIL:denied");

        let err = execute_fastboot(&mut session, "flashing lock", &deadline()).unwrap_err();
        assert!(matches!(err, Error::FastbootError(ref m) if m == "denied"));
    }

    #[test]
    fn test_okay_body_is_returned() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("OKAYsargo");

        let out = execute_fastboot(&mut session, "getvar:product", &deadline()).unwrap();
        assert_eq!(out, "sargo");
    }

    #[test]
    fn test_data_stage() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        let payload = vec![0xABu8; 20_000];
        mock.queue_fastboot("DATA00004e20");
        mock.queue_in(&payload);
        mock.queue_fastboot("OKAY");

        let reply = exchange(&mut session, "upload", &deadline()).unwrap();
        assert_eq!(reply.upload, payload);
        assert_eq!(
            mock.get_writes(),
            vec![b"upload".to_vec(), b"DATA".to_vec(), b"OKAY".to_vec()]
        );
    }

    #[test]
    fn test_oversize_data_stage_rejected() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("DATAffffffff");

        let err = exchange(&mut session, "upload", &deadline()).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedFrame(FrameError::PayloadTooLarge { length: 0xFFFF_FFFF, max: FB_MAX_PAYLOAD })
        ));
        // Never acknowledged, so the device sends nothing.
        assert_eq!(mock.get_writes(), vec![b"upload".to_vec()]);
    }

    #[test]
    fn test_malformed_frames() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("OK");
        assert!(matches!(
            execute_fastboot(&mut session, "getvar:all", &deadline()),
            Err(Error::MalformedFrame(_))
        ));

        mock.queue_fastboot("WHAT");
        assert!(matches!(
            execute_fastboot(&mut session, "getvar:all", &deadline()),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_command_timeout() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        let err = execute_fastboot(&mut session, "reboot", &deadline()).unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { ref command, .. } if command == "reboot"));
    }

    #[test]
    fn test_flash_sequence() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        let image = vec![0x11u8; FB_DOWNLOAD_CHUNK + 10];
        mock.queue_fastboot("OKAY");
        mock.queue_fastboot(&format!("DATA{:08x}", image.len()));
        mock.queue_fastboot("INFOwriting 'boot'...");
        mock.queue_fastboot("OKAY");

        let mut calls = Vec::new();
        let out = flash_partition(
            &mut session,
            "boot",
            &image,
            FlashSequence::FlashThenDownload,
            &deadline(),
            &mut |sent, total| calls.push((sent, total)),
        )
        .unwrap();
        assert_eq!(out, "writing 'boot'...\n");

        let writes = mock.get_writes();
        assert_eq!(writes[0], b"flash:boot");
        assert_eq!(writes[1], b"download:0010000a");
        assert_eq!(writes[2].len(), FB_DOWNLOAD_CHUNK);
        assert_eq!(writes[3].len(), 10);
        let total = image.len() as u64;
        assert_eq!(calls, vec![(FB_DOWNLOAD_CHUNK as u64, total), (total, total)]);
    }

    #[test]
    fn test_download_first_sequence() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("DATA00000004");
        mock.queue_fastboot("OKAY");
        mock.queue_fastboot("OKAY");

        flash_partition(
            &mut session,
            "misc",
            b"\x01\x02\x03\x04",
            FlashSequence::DownloadThenFlash,
            &deadline(),
            &mut |_, _| {},
        )
        .unwrap();
        let writes = mock.get_writes();
        assert_eq!(writes[0], b"download:00000004");
        assert_eq!(writes[2], b"flash:misc");
    }

    #[test]
    fn test_flash_failure_and_timeout() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("FAIL:partition does not exist");
        let err = flash_partition(
            &mut session,
            "nope",
            b"x",
            FlashSequence::FlashThenDownload,
            &deadline(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::FastbootError(ref m) if m == "partition does not exist"));

        mock.queue_fastboot("OKAY");
        mock.queue_fastboot("DATA00000001");
        let err = flash_partition(
            &mut session,
            "boot",
            b"x",
            FlashSequence::FlashThenDownload,
            &deadline(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::FlashTimeout { ref partition, .. } if partition == "boot"));
    }

    #[test]
    fn test_download_size_mismatch() {
        let mock = MockTransport::new(fastboot_device());
        let mut session = open_fastboot(&mock);
        mock.queue_fastboot("DATA00000010");
        let err = flash_partition(
            &mut session,
            "boot",
            b"abc",
            FlashSequence::DownloadThenFlash,
            &deadline(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse { .. }));
    }
}
