//! ADB transport: connect handshake, authentication and shell streams.
//!
//! One logical stream is open at a time. A shell command runs as
//!
//! ```text
//! host                      device
//! OPEN(local, 0, "shell:..")  ->
//!                           <- OKAY(remote, local)
//!                           <- WRTE(remote, local, data)
//! OKAY(local, remote)         ->
//!                           <- CLSE(remote, local)
//! CLSE(local, remote)         ->
//! ```

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::auth::KeyPair;
use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::protocol::{AdbCommand, AdbHeader, AdbMessage, FrameError};
use crate::transport::{Deadline, TransportSession, UsbTransport};

/// Parameters the device announced in its `CNXN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbConnection {
    pub version: u32,
    pub max_payload: usize,
    /// `device::ro.product.name=...;features=...`
    pub banner: String,
}

impl AdbConnection {
    fn from_message(msg: &AdbMessage) -> Self {
        Self {
            version: msg.arg0,
            max_payload: msg.arg1 as usize,
            banner: msg.payload_text(),
        }
    }
}

/// First answer to our `CNXN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    Connected(AdbConnection),
    /// Device wants the token signed.
    Challenge(Vec<u8>),
}

/// Write one message: header transfer, then payload transfer.
pub fn send_message<T: UsbTransport>(
    session: &mut TransportSession<T>,
    message: &AdbMessage,
) -> Result<()> {
    let header = message.header();
    debug!(
        command = %message.command,
        arg0 = message.arg0,
        arg1 = message.arg1,
        len = message.payload.len(),
        "ADB send"
    );
    session.send_frame(&header.to_bytes())?;
    if !message.payload.is_empty() {
        session.send_frame(&message.payload)?;
    }
    Ok(())
}

/// Read one message: 24-byte header, then exactly `length` payload bytes.
pub fn receive_message<T: UsbTransport>(
    session: &mut TransportSession<T>,
    deadline: &Deadline,
) -> Result<AdbMessage> {
    let raw = session.read_exact(AdbHeader::SIZE, deadline)?;
    let header = AdbHeader::from_bytes(&raw)?;

    let length = header.length as usize;
    if length > ADB_MAX_PAYLOAD as usize {
        return Err(FrameError::PayloadTooLarge {
            length,
            max: ADB_MAX_PAYLOAD as usize,
        }
        .into());
    }
    let payload = if length > 0 {
        session.read_exact(length, deadline)?
    } else {
        Vec::new()
    };
    header.verify_payload(&payload)?;

    debug!(
        command = %header.command,
        arg0 = header.arg0,
        arg1 = header.arg1,
        len = length,
        "ADB recv"
    );
    Ok(AdbMessage::new(header.command, header.arg0, header.arg1, payload))
}

/// Send our `CNXN` with the host banner.
pub fn send_connect<T: UsbTransport>(
    session: &mut TransportSession<T>,
    banner: &str,
    max_payload: u32,
) -> Result<()> {
    let mut payload = banner.as_bytes().to_vec();
    payload.push(0);
    send_message(
        session,
        &AdbMessage::new(AdbCommand::Cnxn, ADB_VERSION_NO_CHECKSUM, max_payload, payload),
    )
}

/// Wait for the device's `CNXN` or `AUTH(TOKEN)`.
pub fn await_connect<T: UsbTransport>(
    session: &mut TransportSession<T>,
    deadline: &Deadline,
) -> Result<ConnectReply> {
    let msg = receive_message(session, deadline)
        .map_err(|e| e.or_timeout(|| Error::HandshakeTimeout(deadline.budget())))?;
    match msg.command {
        AdbCommand::Cnxn => {
            let conn = AdbConnection::from_message(&msg);
            info!(version = format!("0x{:08X}", conn.version), max_payload = conn.max_payload, "ADB connected");
            Ok(ConnectReply::Connected(conn))
        }
        AdbCommand::Auth if msg.arg0 == AUTH_TOKEN => {
            info!(token_len = msg.payload.len(), "ADB authentication required");
            Ok(ConnectReply::Challenge(msg.payload))
        }
        other => Err(Error::UnexpectedResponse {
            expected: "CNXN or AUTH".into(),
            actual: other.to_string(),
        }),
    }
}

/// Answer an `AUTH(TOKEN)` challenge.
///
/// The signed token goes first. If the device doesn't know our key it
/// issues a new token; we then offer the public key, which raises the
/// on-device prompt. No `CNXN` within the deadline means the user has not
/// (yet) allowed this host.
#[instrument(level = "info", skip_all)]
pub fn authenticate<T: UsbTransport>(
    session: &mut TransportSession<T>,
    key: &KeyPair,
    token: &[u8],
    comment: &str,
    deadline: &Deadline,
) -> Result<AdbConnection> {
    let not_trusted =
        || Error::AuthenticationFailed("device did not accept this host's key".into());

    let signature = key.sign_token(token)?;
    send_message(
        session,
        &AdbMessage::new(AdbCommand::Auth, AUTH_SIGNATURE, 0, signature),
    )?;

    let reply = receive_message(session, deadline).map_err(|e| e.or_timeout(not_trusted))?;
    match reply.command {
        AdbCommand::Cnxn => return Ok(AdbConnection::from_message(&reply)),
        AdbCommand::Auth if reply.arg0 == AUTH_TOKEN => {
            info!("Signature rejected, offering public key");
        }
        other => {
            return Err(Error::UnexpectedResponse {
                expected: "CNXN or AUTH".into(),
                actual: other.to_string(),
            });
        }
    }

    let public_key = key.android_public_key(comment)?;
    send_message(
        session,
        &AdbMessage::new(AdbCommand::Auth, AUTH_RSAPUBLICKEY, 0, public_key),
    )?;

    loop {
        let reply = receive_message(session, deadline).map_err(|e| e.or_timeout(not_trusted))?;
        match reply.command {
            AdbCommand::Cnxn => return Ok(AdbConnection::from_message(&reply)),
            // Devices repeat the challenge while the prompt is showing.
            AdbCommand::Auth => debug!("Challenge repeated, still waiting"),
            other => {
                return Err(Error::UnexpectedResponse {
                    expected: "CNXN".into(),
                    actual: other.to_string(),
                });
            }
        }
    }
}

/// Random 24-bit stream id; zero is reserved.
fn new_local_id() -> u32 {
    rand::thread_rng().gen_range(1..=0x00FF_FFFF)
}

/// Run `command` through `shell:` and collect its output.
#[instrument(level = "info", skip(session, deadline))]
pub fn execute_shell<T: UsbTransport>(
    session: &mut TransportSession<T>,
    command: &str,
    deadline: &Deadline,
) -> Result<String> {
    run_service(session, &format!("shell:{command}"), command, deadline).map_err(|e| {
        e.or_timeout(|| Error::CommandTimeout {
            command: command.to_string(),
            timeout: deadline.budget(),
        })
    })
}

/// Ask adbd to reboot into `target` (`""` for a normal reboot).
///
/// adbd may drop off the bus before closing the stream, so a transport
/// failure after the OPEN went out counts as success.
#[instrument(level = "info", skip(session, deadline))]
pub fn reboot<T: UsbTransport>(
    session: &mut TransportSession<T>,
    target: &str,
    deadline: &Deadline,
) -> Result<()> {
    let service = format!("reboot:{target}");
    let local_id = send_open(session, &service)?;
    match finish_service(session, local_id, &service, deadline) {
        Ok(_) => Ok(()),
        Err(Error::Transport(e)) => {
            debug!(error = %e, "Device went away while rebooting");
            session.set_open_stream(None);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn run_service<T: UsbTransport>(
    session: &mut TransportSession<T>,
    service: &str,
    command: &str,
    deadline: &Deadline,
) -> Result<String> {
    let local_id = send_open(session, service)?;
    finish_service(session, local_id, command, deadline)
}

/// Send `OPEN(local_id, 0, "<service>\0")` and return the new local id.
fn send_open<T: UsbTransport>(session: &mut TransportSession<T>, service: &str) -> Result<u32> {
    let local_id = new_local_id();
    let mut payload = service.as_bytes().to_vec();
    payload.push(0);
    send_message(
        session,
        &AdbMessage::new(AdbCommand::Open, local_id, 0, payload),
    )?;
    Ok(local_id)
}

/// Wait for the stream to be accepted, drain it and close our side.
fn finish_service<T: UsbTransport>(
    session: &mut TransportSession<T>,
    local_id: u32,
    command: &str,
    deadline: &Deadline,
) -> Result<String> {
    let reply = receive_message(session, deadline)?;
    let remote_id = match reply.command {
        AdbCommand::Okay => reply.arg0,
        AdbCommand::Clse => return Err(Error::CommandRejected(command.to_string())),
        other => {
            return Err(Error::UnexpectedResponse {
                expected: "OKAY".into(),
                actual: other.to_string(),
            });
        }
    };
    session.set_open_stream(Some((local_id, remote_id)));
    debug!(local_id, remote_id, "Stream opened");

    let mut output = Vec::new();
    loop {
        let msg = receive_message(session, deadline)?;
        if msg.arg1 != local_id {
            warn!(command = %msg.command, arg1 = msg.arg1, "Message for another stream, ignoring");
            continue;
        }
        match msg.command {
            AdbCommand::Wrte => {
                output.extend_from_slice(&msg.payload);
                send_message(
                    session,
                    &AdbMessage::new(AdbCommand::Okay, local_id, remote_id, Vec::new()),
                )?;
            }
            AdbCommand::Clse => break,
            AdbCommand::Okay => {}
            other => {
                return Err(Error::UnexpectedResponse {
                    expected: "WRTE or CLSE".into(),
                    actual: other.to_string(),
                });
            }
        }
    }

    send_message(
        session,
        &AdbMessage::new(AdbCommand::Clse, local_id, remote_id, Vec::new()),
    )?;
    session.set_open_stream(None);
    debug!(local_id, bytes = output.len(), "Stream closed");

    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// Best-effort `CLSE` for a stream left open by a failed command.
pub fn close_stream<T: UsbTransport>(session: &mut TransportSession<T>) {
    if let Some((local_id, remote_id)) = session.open_stream() {
        let clse = AdbMessage::new(AdbCommand::Clse, local_id, remote_id, Vec::new());
        if let Err(e) = send_message(session, &clse) {
            debug!(error = %e, "Closing stale stream failed");
        }
        session.set_open_stream(None);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::test_key;
    use crate::clock::RecordingClock;
    use crate::transport::MockTransport;
    use crate::transport::descriptor::fixtures::adb_device;
    use std::time::Duration;

    pub(crate) fn open_adb(mock: &MockTransport) -> TransportSession<MockTransport> {
        TransportSession::open(mock.clone(), &RecordingClock::new(), CLAIM_SETTLE_DELAY).unwrap()
    }

    /// Script the device side of one shell command. Pair with
    /// `set_echo_local_id` so replies reach the host's stream.
    pub(crate) fn script_shell(mock: &MockTransport, remote_id: u32, chunks: &[&[u8]]) {
        mock.queue_adb(A_OKAY, remote_id, 0, &[]);
        for chunk in chunks {
            mock.queue_adb(A_WRTE, remote_id, 0, chunk);
        }
        mock.queue_adb(A_CLSE, remote_id, 0, &[]);
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn test_receive_message_split_payload() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.queue_adb(A_WRTE, 5, 7, b"hello");

        let msg = receive_message(&mut session, &deadline()).unwrap();
        assert_eq!(msg.command, AdbCommand::Wrte);
        assert_eq!((msg.arg0, msg.arg1), (5, 7));
        assert_eq!(msg.payload, b"hello");
    }

    #[test]
    fn test_receive_bad_checksum() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        let mut header = AdbHeader::new(AdbCommand::Wrte, 1, 2, b"abc");
        header.checksum += 1;
        mock.queue_in(&header.to_bytes());
        mock.queue_in(b"abc");

        let err = receive_message(&mut session, &deadline()).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_receive_bad_complement() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        let mut header = AdbHeader::new(AdbCommand::Okay, 1, 2, &[]);
        header.length_complement = 0x1234_5678;
        mock.queue_in(&header.to_bytes());

        let err = receive_message(&mut session, &deadline()).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedFrame(FrameError::BadComplement { length: 0, complement: 0x1234_5678 })
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_connect_without_auth() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.queue_adb(A_CNXN, ADB_VERSION, 4096, b"device::ro.product.model=Pixel 3a;\0");

        send_connect(&mut session, DEFAULT_HOST_BANNER, ADB_MAX_PAYLOAD).unwrap();
        let reply = await_connect(&mut session, &deadline()).unwrap();

        let ConnectReply::Connected(conn) = reply else {
            panic!("expected CNXN");
        };
        assert_eq!(conn.max_payload, 4096);
        assert_eq!(conn.banner, "device::ro.product.model=Pixel 3a;");

        let sent = mock.sent_adb_messages();
        assert_eq!(sent[0].command, AdbCommand::Cnxn);
        assert_eq!(sent[0].arg0, ADB_VERSION_NO_CHECKSUM);
        assert_eq!(sent[0].payload, b"host::droidlink\0");
    }

    #[test]
    fn test_handshake_timeout() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        let err = await_connect(&mut session, &deadline()).unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(_)));
    }

    #[test]
    fn test_auth_signature_accepted() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        let token = [7u8; AUTH_TOKEN_SIZE];
        mock.queue_adb(A_AUTH, AUTH_TOKEN, 0, &token);
        mock.queue_adb(A_CNXN, ADB_VERSION, 4096, b"device::\0");

        let ConnectReply::Challenge(challenge) = await_connect(&mut session, &deadline()).unwrap()
        else {
            panic!("expected challenge");
        };
        let key = test_key();
        let conn = authenticate(&mut session, &key, &challenge, "t@h", &deadline()).unwrap();
        assert_eq!(conn.banner, "device::");

        let sent = mock.sent_adb_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, AdbCommand::Auth);
        assert_eq!(sent[0].arg0, AUTH_SIGNATURE);
        assert_eq!(sent[0].payload, key.sign_token(&token).unwrap());
    }

    #[test]
    fn test_auth_falls_back_to_public_key() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.queue_adb(A_AUTH, AUTH_TOKEN, 0, &[1u8; AUTH_TOKEN_SIZE]);
        mock.queue_adb(A_CNXN, ADB_VERSION, 4096, b"device::\0");

        let key = test_key();
        authenticate(&mut session, &key, &[9u8; AUTH_TOKEN_SIZE], "t@h", &deadline()).unwrap();

        let sent = mock.sent_adb_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].arg0, AUTH_RSAPUBLICKEY);
        assert!(sent[1].payload.ends_with(b" t@h\0"));
    }

    #[test]
    fn test_auth_without_cnxn_is_permission_failure() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.queue_adb(A_AUTH, AUTH_TOKEN, 0, &[1u8; AUTH_TOKEN_SIZE]);

        let err = authenticate(&mut session, &test_key(), &[9u8; AUTH_TOKEN_SIZE], "t@h", &deadline())
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert!(err.is_permission());
    }

    #[test]
    fn test_shell_roundtrip() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.set_echo_local_id(true);
        script_shell(&mock, 0x42, &[b"hello\n"]);

        let out = execute_shell(&mut session, "echo hello", &deadline()).unwrap();
        assert_eq!(out, "hello\n");

        let sent = mock.sent_adb_messages();
        let commands: Vec<_> = sent.iter().map(|m| m.command).collect();
        assert_eq!(
            commands,
            vec![AdbCommand::Open, AdbCommand::Okay, AdbCommand::Clse]
        );
        let local_id = sent[0].arg0;
        assert!(local_id > 0 && local_id <= 0x00FF_FFFF);
        assert_eq!(sent[0].payload, b"shell:echo hello\0");
        assert_eq!((sent[1].arg0, sent[1].arg1), (local_id, 0x42));
        assert_eq!((sent[2].arg0, sent[2].arg1), (local_id, 0x42));
        assert!(session.open_stream().is_none());
    }

    #[test]
    fn test_shell_acks_every_write() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.set_echo_local_id(true);
        script_shell(&mock, 3, &[b"a", b"b", b"c"]);

        let out = execute_shell(&mut session, "ls", &deadline()).unwrap();
        assert_eq!(out, "abc");
        let okays = mock
            .sent_adb_messages()
            .iter()
            .filter(|m| m.command == AdbCommand::Okay)
            .count();
        assert_eq!(okays, 3);
    }

    #[test]
    fn test_shell_rejected() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.queue_adb(A_CLSE, 0, 0, &[]);

        let err = execute_shell(&mut session, "nope", &deadline()).unwrap_err();
        assert!(matches!(err, Error::CommandRejected(ref c) if c == "nope"));
    }

    #[test]
    fn test_shell_timeout_keeps_stream_for_cleanup() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.set_echo_local_id(true);
        mock.queue_adb(A_OKAY, 9, 0, &[]);

        let err = execute_shell(&mut session, "sleep 100", &deadline()).unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(session.open_stream().is_some());

        close_stream(&mut session);
        assert!(session.open_stream().is_none());
        assert_eq!(
            mock.sent_adb_messages().last().map(|m| m.command),
            Some(AdbCommand::Clse)
        );
    }

    #[test]
    fn test_shell_transfer_failure_discards_output() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.set_echo_local_id(true);
        script_shell(&mock, 3, &[b"partial"]);
        // OPEN succeeds, the OKAY ack for the WRTE fails.
        mock.fail_writes_after(2, 1);

        let err = execute_shell(&mut session, "cat", &deadline()).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_reboot_tolerates_device_dropping_off() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.set_echo_local_id(true);
        mock.queue_adb(A_OKAY, 5, 0, &[]);

        reboot(&mut session, "bootloader", &deadline()).unwrap();
        let sent = mock.sent_adb_messages();
        assert_eq!(sent[0].command, AdbCommand::Open);
        assert_eq!(sent[0].payload, b"reboot:bootloader\0");
        assert!(session.open_stream().is_none());
    }

    #[test]
    fn test_reboot_open_failure_propagates() {
        let mock = MockTransport::new(adb_device());
        let mut session = open_adb(&mock);
        mock.fail_writes(1);
        assert!(reboot(&mut session, "", &deadline()).is_err());
    }
}
