//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::descriptor::{DeviceDescriptor, DeviceFilter, matches_any};
use super::traits::{HostCapabilities, TransportError, UsbHost, UsbTransport};
use crate::protocol::{AdbCommand, AdbHeader, AdbMessage, encode_adb_message};

/// Device-level call recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open,
    SelectConfiguration(u8),
    Claim(u8),
    Release(u8),
    Reset,
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    descriptor: DeviceDescriptor,
    /// Queued IN data, consumed front to back.
    in_queue: VecDeque<Vec<u8>>,
    /// Captured OUT writes.
    write_log: Vec<Vec<u8>>,
    calls: Vec<MockCall>,
    open: bool,
    connected: bool,
    /// Claims left to reject with a permission error.
    deny_claims: u32,
    /// Opens left to fail.
    fail_opens: u32,
    /// OUT transfers to let through before `fail_writes` kicks in.
    pass_writes: u32,
    /// OUT transfers left to fail.
    fail_writes: u32,
    /// Patch `arg1 == 0` in queued ADB headers with the last OPEN's local id.
    echo_local_id: bool,
    last_local_id: Option<u32>,
}

/// Mock transport for unit testing protocol and orchestrator logic.
///
/// Clones share state, so a test can keep one handle while the session
/// owns another.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                descriptor,
                connected: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue raw bytes to be returned on the next reads.
    pub fn queue_in(&self, bytes: &[u8]) {
        self.lock().in_queue.push_back(bytes.to_vec());
    }

    /// Queue an ADB message, header and payload as separate transfers.
    pub fn queue_adb(&self, command: u32, arg0: u32, arg1: u32, payload: &[u8]) {
        let bytes = encode_adb_message(command, arg0, arg1, payload);
        let (header, body) = bytes.split_at(AdbHeader::SIZE);
        self.queue_in(header);
        if !body.is_empty() {
            self.queue_in(body);
        }
    }

    /// Queue a Fastboot response frame.
    pub fn queue_fastboot(&self, frame: &str) {
        self.queue_in(frame.as_bytes());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.lock().write_log.clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.lock().write_log.clear();
    }

    /// Reassemble captured writes into ADB messages.
    pub fn sent_adb_messages(&self) -> Vec<AdbMessage> {
        let writes = self.get_writes();
        let mut out = Vec::new();
        let mut iter = writes.into_iter();
        while let Some(write) = iter.next() {
            let Ok(header) = AdbHeader::from_bytes(&write) else {
                continue;
            };
            let mut payload = write[AdbHeader::SIZE..].to_vec();
            if payload.len() < header.length as usize {
                if let Some(next) = iter.next() {
                    payload.extend_from_slice(&next);
                }
            }
            out.push(AdbMessage::new(header.command, header.arg0, header.arg1, payload));
        }
        out
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn pending_reads(&self) -> usize {
        self.lock().in_queue.len()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Reject the next `count` claims with a permission error.
    pub fn deny_claims(&self, count: u32) {
        self.lock().deny_claims = count;
    }

    /// Fail the next `count` opens.
    pub fn fail_opens(&self, count: u32) {
        self.lock().fail_opens = count;
    }

    /// Fail the next `count` OUT transfers.
    pub fn fail_writes(&self, count: u32) {
        self.fail_writes_after(0, count);
    }

    /// Let `pass` OUT transfers succeed, then fail the next `count`.
    pub fn fail_writes_after(&self, pass: u32, count: u32) {
        let mut state = self.lock();
        state.pass_writes = pass;
        state.fail_writes = count;
    }

    /// Answer as the device would: queued ADB headers with `arg1 == 0`
    /// are addressed to the stream id of the host's last OPEN.
    pub fn set_echo_local_id(&self, enabled: bool) {
        self.lock().echo_local_id = enabled;
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.lock().connected = true;
    }
}

impl UsbTransport for MockTransport {
    fn descriptor(&self) -> DeviceDescriptor {
        self.lock().descriptor.clone()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Open);
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(TransportError::OpenFailed("mock open failure".into()));
        }
        state.open = true;
        Ok(())
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.lock().calls.push(MockCall::SelectConfiguration(value));
        Ok(())
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Claim(number));
        if state.deny_claims > 0 {
            state.deny_claims = state.deny_claims.saturating_sub(1);
            return Err(TransportError::PermissionDenied {
                interface: number,
                message: "interface is held by another process".into(),
            });
        }
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<(), TransportError> {
        self.lock().calls.push(MockCall::Release(number));
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.lock().calls.push(MockCall::Reset);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Close);
        state.open = false;
        Ok(())
    }

    fn transfer_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.fail_writes > 0 {
            if state.pass_writes > 0 {
                state.pass_writes -= 1;
            } else {
                state.fail_writes -= 1;
                return Err(TransportError::TransferFailed {
                    endpoint,
                    message: "mock stall".into(),
                });
            }
        }
        if let Some(header) = adb_header(data)
            && header.command == AdbCommand::Open
        {
            state.last_local_id = Some(header.arg0);
        }
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn transfer_in(
        &mut self,
        _endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let Some(mut chunk) = state.in_queue.pop_front() else {
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        };
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            state.in_queue.push_front(rest);
        }
        if state.echo_local_id
            && let Some(local_id) = state.last_local_id
            && let Some(header) = adb_header(&chunk)
            && header.arg1 == 0
        {
            chunk[8..12].copy_from_slice(&local_id.to_le_bytes());
        }
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// A 24-byte chunk that is a well-formed ADB header.
fn adb_header(data: &[u8]) -> Option<AdbHeader> {
    if data.len() != AdbHeader::SIZE {
        return None;
    }
    AdbHeader::from_bytes(data).ok()
}

#[derive(Default)]
struct MockHostState {
    capabilities: HostCapabilities,
    authorized: Vec<MockTransport>,
    authorized_error: bool,
    chooser: VecDeque<Option<MockTransport>>,
    authorized_calls: u32,
    request_calls: u32,
}

/// Mock host: scripted capabilities, authorized list and chooser.
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockHostState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockHostState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_capabilities(&self, capabilities: HostCapabilities) {
        self.lock().capabilities = capabilities;
    }

    pub fn add_authorized(&self, device: MockTransport) {
        self.lock().authorized.push(device);
    }

    /// Make `authorized_devices` fail, as when USB access is blocked.
    pub fn fail_authorized(&self) {
        self.lock().authorized_error = true;
    }

    /// Next chooser result. `None` simulates the user cancelling.
    pub fn queue_choice(&self, device: Option<MockTransport>) {
        self.lock().chooser.push_back(device);
    }

    pub fn authorized_calls(&self) -> u32 {
        self.lock().authorized_calls
    }

    pub fn request_calls(&self) -> u32 {
        self.lock().request_calls
    }
}

impl UsbHost for MockHost {
    type Device = MockTransport;

    fn capabilities(&self) -> HostCapabilities {
        self.lock().capabilities
    }

    fn authorized_devices(&self) -> Result<Vec<MockTransport>, TransportError> {
        let mut state = self.lock();
        state.authorized_calls += 1;
        if state.authorized_error {
            return Err(TransportError::OpenFailed("USB access blocked".into()));
        }
        Ok(state.authorized.clone())
    }

    fn request_device(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<MockTransport>, TransportError> {
        let mut state = self.lock();
        state.request_calls += 1;
        Ok(state
            .chooser
            .pop_front()
            .flatten()
            .filter(|device| matches_any(filters, &device.descriptor())))
    }
}
