//! Device session - high-level connection orchestrator.
//!
//! `DeviceSession` owns the host, the claimed device and the connection
//! state. It selects a device, waits for USB permission, runs the mode
//! handshake with bounded automatic retries, and dispatches commands to
//! the ADB or Fastboot driver according to the device mode.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::adb::{self, AdbConnection, ConnectReply};
use crate::auth::{KeyPair, key_comment};
use crate::clock::{Clock, SystemClock};
use crate::device::{
    DeviceInfo, parse_battery_level, parse_cnxn_banner, parse_fastboot_vars, parse_getprop,
};
use crate::diagnostics::DiagnosticsSnapshot;
use crate::error::{Error, Result};
use crate::events::{ObservedDevice, SessionEvent, SessionObserver, TracingObserver};
use crate::fastboot::{self, FlashSequence};
use crate::mode::DeviceMode;
use crate::protocol::constants::*;
use crate::state::{ConnectionContext, ConnectionState, classify};
use crate::transport::descriptor::matches_any;
use crate::transport::{
    Deadline, OpenFailure, TransportError, TransportSession, UsbHost, UsbTransport,
    android_filters,
};

/// Configuration for a device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Budget for CNXN/AUTH, in seconds.
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub flash_timeout_secs: u64,
    pub permission_poll_interval_secs: u64,
    pub max_permission_checks: u32,
    /// Automatic retries for transient failures.
    pub max_auto_retries: u32,
    /// First retry delay; doubles on every retry.
    pub retry_base_delay_secs: u64,
    /// Wait after a device reset before re-claiming, in milliseconds.
    pub claim_settle_delay_ms: u64,
    /// Identity sent in our CNXN.
    pub host_banner: String,
    pub max_payload: u32,
    pub flash_sequence: FlashSequence,
    /// PKCS#8 PEM private key. Generated and stored on first use if the
    /// file is missing. Without it every session uses a fresh key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECTION_TIMEOUT.as_secs(),
            command_timeout_secs: COMMAND_TIMEOUT.as_secs(),
            flash_timeout_secs: FLASH_TIMEOUT.as_secs(),
            permission_poll_interval_secs: PERMISSION_POLL_INTERVAL.as_secs(),
            max_permission_checks: MAX_PERMISSION_CHECKS,
            max_auto_retries: MAX_AUTO_RETRIES,
            retry_base_delay_secs: RETRY_BASE_DELAY.as_secs(),
            claim_settle_delay_ms: CLAIM_SETTLE_DELAY.as_millis() as u64,
            host_banner: DEFAULT_HOST_BANNER.to_string(),
            max_payload: ADB_MAX_PAYLOAD,
            flash_sequence: FlashSequence::default(),
            key_path: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AnyResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }

    pub fn permission_poll_interval(&self) -> Duration {
        Duration::from_secs(self.permission_poll_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn claim_settle_delay(&self) -> Duration {
        Duration::from_millis(self.claim_settle_delay_ms)
    }

    /// Backoff before automatic retry number `retry` (0-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.retry_base_delay()
            .saturating_mul(1u32 << retry.min(16))
    }
}

/// Where `reboot_to` sends the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootTarget {
    System,
    Bootloader,
    Recovery,
    Fastboot,
    Sideload,
    SideloadAutoReboot,
}

impl RebootTarget {
    /// Argument of adbd's `reboot:` service.
    fn adb_target(self) -> &'static str {
        match self {
            RebootTarget::System => "",
            RebootTarget::Bootloader | RebootTarget::Fastboot => "bootloader",
            RebootTarget::Recovery => "recovery",
            RebootTarget::Sideload => "sideload",
            RebootTarget::SideloadAutoReboot => "sideload-auto-reboot",
        }
    }

    /// Bootloader command, if the bootloader can reach this target.
    fn fastboot_command(self) -> Option<&'static str> {
        match self {
            RebootTarget::System => Some("reboot"),
            RebootTarget::Bootloader | RebootTarget::Fastboot => Some("reboot-bootloader"),
            RebootTarget::Recovery => Some("reboot-recovery"),
            RebootTarget::Sideload | RebootTarget::SideloadAutoReboot => None,
        }
    }

    fn progress_message(self) -> &'static str {
        match self {
            RebootTarget::System => "Rebooting device...",
            RebootTarget::Bootloader | RebootTarget::Fastboot => "Rebooting to bootloader...",
            RebootTarget::Recovery => "Rebooting to recovery...",
            RebootTarget::Sideload => "Rebooting to sideload mode...",
            RebootTarget::SideloadAutoReboot => "Rebooting to sideload mode with auto-reboot...",
        }
    }
}

impl fmt::Display for RebootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootTarget::System => write!(f, "system"),
            RebootTarget::Bootloader => write!(f, "bootloader"),
            RebootTarget::Recovery => write!(f, "recovery"),
            RebootTarget::Fastboot => write!(f, "fastboot"),
            RebootTarget::Sideload => write!(f, "sideload"),
            RebootTarget::SideloadAutoReboot => write!(f, "sideload-auto-reboot"),
        }
    }
}

impl FromStr for RebootTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" | "system" => Ok(RebootTarget::System),
            "bootloader" => Ok(RebootTarget::Bootloader),
            "recovery" => Ok(RebootTarget::Recovery),
            "fastboot" => Ok(RebootTarget::Fastboot),
            "sideload" => Ok(RebootTarget::Sideload),
            "sideload-auto-reboot" => Ok(RebootTarget::SideloadAutoReboot),
            other => Err(format!("Unknown reboot target: {other}")),
        }
    }
}

type Transport<D> = TransportSession<ObservedDevice<D>>;

/// A failed connect attempt and the device to retry with.
type AttemptFailure<D> = (Error, D);

/// Security/permission-class failure while claiming the interface.
fn is_claim_permission(error: &Error) -> bool {
    matches!(
        error,
        Error::PermissionRequired(_) | Error::Transport(TransportError::PermissionDenied { .. })
    )
}

/// Device session - owns one device connection at a time.
///
/// Operations take `&mut self`, so commands on one session never overlap.
pub struct DeviceSession<H: UsbHost, O: SessionObserver + 'static = TracingObserver> {
    config: SessionConfig,
    host: H,
    observer: Arc<O>,
    clock: Arc<dyn Clock>,
    context: ConnectionContext,
    /// Generated at the first AUTH challenge, then kept for the session.
    key: Option<KeyPair>,
    transport: Option<Transport<H::Device>>,
    /// Device of the last failed or reset attempt; target of retries.
    last_device: Option<H::Device>,
    device_info: Option<DeviceInfo>,
    adb: Option<AdbConnection>,
}

impl<H: UsbHost> DeviceSession<H, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(host: H, config: SessionConfig) -> Self {
        Self::with_observer(host, config, Arc::new(TracingObserver))
    }
}

impl<H: UsbHost, O: SessionObserver + 'static> DeviceSession<H, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(host: H, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            host,
            observer,
            clock: Arc::new(SystemClock),
            context: ConnectionContext::new(),
            key: None,
            transport: None,
            last_device: None,
            device_info: None,
            adb: None,
        }
    }

    /// Replace the clock used for backoff and polling delays.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `key` instead of generating one.
    pub fn with_key_pair(mut self, key: KeyPair) -> Self {
        self.key = Some(key);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn state(&self) -> ConnectionState {
        self.context.state
    }

    /// State plus the message/details of the last failure.
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.context.state == ConnectionState::Connected && self.transport.is_some()
    }

    /// Mode of the connected device, `Unknown` when not connected.
    pub fn mode(&self) -> DeviceMode {
        self.transport
            .as_ref()
            .map_or(DeviceMode::Unknown, |t| t.mode())
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn adb_connection(&self) -> Option<&AdbConnection> {
        self.adb.as_ref()
    }

    pub fn has_pending_retry_target(&self) -> bool {
        self.last_device.is_some()
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// Find, claim and handshake with a device.
    ///
    /// Previously authorized devices are tried silently before the chooser
    /// is shown.
    #[instrument(level = "info", skip(self))]
    pub fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() || self.last_device.is_some() {
            self.disconnect();
        }

        self.transition(ConnectionState::Connecting);
        if let Err(e) = self.check_platform() {
            return Err(self.fail(e));
        }

        if self.probe_authorized() {
            return Ok(());
        }

        self.transition(ConnectionState::WaitingPermission);
        let device = match self.host.request_device(&android_filters()) {
            Ok(Some(device)) => device,
            Ok(None) => return Err(self.fail(Error::NoDeviceSelected)),
            Err(e) => return Err(self.fail(e.into())),
        };
        let descriptor = device.descriptor();
        info!(
            vid = format!("{:04X}", descriptor.vendor_id),
            pid = format!("{:04X}", descriptor.product_id),
            "Device selected"
        );

        self.transition(ConnectionState::Connecting);
        self.connect_with_recovery(device)
    }

    /// Reconnect to the last device without a new selection, or run a
    /// full `connect` if there is none.
    #[instrument(level = "info", skip(self))]
    pub fn retry_connection(&mut self) -> Result<()> {
        let Some(device) = self.take_device() else {
            return self.connect();
        };
        self.transition(ConnectionState::Connecting);
        if let Err(e) = self.check_platform() {
            self.last_device = Some(device);
            return Err(self.fail(e));
        }
        self.connect_with_recovery(device)
    }

    /// Port-level reset of the current (or last) device.
    ///
    /// Leaves the session disconnected with the device kept as the target
    /// of the next `retry_connection`.
    #[instrument(level = "info", skip(self))]
    pub fn reset_connection(&mut self) -> Result<()> {
        let Some(mut device) = self.take_device() else {
            return Err(Error::NotConnected);
        };

        let result = device.open().and_then(|()| device.reset());
        if let Err(e) = device.close() {
            debug!(error = %e, "Close after reset failed");
        }
        self.last_device = Some(device);

        match result {
            Ok(()) => {
                info!("Device reset");
                self.transition(ConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Close everything and return to the initial state. Never fails.
    #[instrument(level = "info", skip(self))]
    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            drop(self.close_transport(transport));
        }
        self.last_device = None;
        self.device_info = None;
        self.adb = None;
        self.transition(ConnectionState::Disconnected);
        self.context.reset();
    }

    pub fn get_connection_diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot::collect(&self.host, &self.context)
    }

    fn check_platform(&self) -> Result<()> {
        let caps = self.host.capabilities();
        if !caps.transport_supported {
            return Err(Error::UnsupportedPlatform);
        }
        if !caps.secure_context {
            return Err(Error::InsecureContext);
        }
        if caps.permissions_policy_blocked {
            return Err(Error::PermissionsPolicyBlocked);
        }
        Ok(())
    }

    /// Try devices the host already grants access to. True once one connects.
    fn probe_authorized(&mut self) -> bool {
        let devices = match self.host.authorized_devices() {
            Ok(devices) => devices,
            Err(e) => {
                debug!(error = %e, "Cannot list authorized devices");
                return false;
            }
        };

        let filters = android_filters();
        for device in devices
            .into_iter()
            .filter(|d| matches_any(&filters, &d.descriptor()))
        {
            match self.attempt(device) {
                Ok(()) => {
                    info!("Reconnected to a previously authorized device");
                    return true;
                }
                Err((error, _)) => {
                    debug!(error = %error, "Silent reconnect failed");
                    self.transition(ConnectionState::Connecting);
                }
            }
        }
        false
    }

    /// Connect to `device`, waiting out permission prompts and retrying
    /// transient failures with exponential backoff.
    fn connect_with_recovery(&mut self, mut device: H::Device) -> Result<()> {
        let mut retries = 0u32;
        let mut polls = 0u32;

        loop {
            let (error, returned) = match self.attempt(device) {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            if is_claim_permission(&error) {
                if polls < self.config.max_permission_checks {
                    polls += 1;
                    device = self.wait_for_permission(returned, polls);
                    continue;
                }
                self.last_device = Some(returned);
                let details = classify(&error).details;
                self.fail_with(
                    ConnectionState::PermissionDenied,
                    format!("USB permission not granted after {polls} checks; reconnect the device"),
                    details,
                );
                return Err(error);
            }

            let classification = classify(&error);
            if classification.retryable && retries < self.config.max_auto_retries {
                let delay = self.config.retry_delay(retries);
                retries += 1;
                warn!(
                    error = %error,
                    attempt = retries,
                    max = self.config.max_auto_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Connect failed, retrying"
                );
                self.observer.on_event(&SessionEvent::RetryScheduled {
                    attempt: retries,
                    max: self.config.max_auto_retries,
                    delay,
                });
                self.clock.sleep(delay);
                self.transition(ConnectionState::Connecting);
                device = returned;
                continue;
            }

            self.last_device = Some(returned);
            if classification.retryable && retries > 0 {
                // Timeouts stay timeouts; other transient classes give up as errors.
                let state = match classification.state {
                    ConnectionState::Timeout => ConnectionState::Timeout,
                    _ => ConnectionState::Error,
                };
                self.fail_with(
                    state,
                    format!(
                        "Connection failed after {retries} retries: {}",
                        classification.message
                    ),
                    classification.details,
                );
                return Err(error);
            }
            return Err(self.fail(error));
        }
    }

    fn wait_for_permission(&mut self, device: H::Device, attempt: u32) -> H::Device {
        let max = self.config.max_permission_checks;
        self.transition(ConnectionState::WaitingPermission);
        self.observer
            .on_event(&SessionEvent::PermissionPoll { attempt, max });
        info!(attempt, max, "Waiting for USB permission");
        self.clock.sleep(self.config.permission_poll_interval());

        // Prefer a fresh handle if the host now lists the device.
        let wanted = device.descriptor();
        match self.host.authorized_devices() {
            Ok(devices) => devices
                .into_iter()
                .find(|d| d.descriptor().same_device(&wanted))
                .unwrap_or(device),
            Err(e) => {
                debug!(error = %e, "Authorization check failed");
                device
            }
        }
    }

    /// One open + claim + handshake. Hands the device back on failure.
    fn attempt(&mut self, device: H::Device) -> std::result::Result<(), AttemptFailure<H::Device>> {
        self.transition(ConnectionState::Connecting);
        let observer: Arc<dyn SessionObserver> = self.observer.clone();
        let observed = ObservedDevice::new(device, observer);

        let mut transport = match TransportSession::open(
            observed,
            self.clock.as_ref(),
            self.config.claim_settle_delay(),
        ) {
            Ok(transport) => transport,
            Err(OpenFailure { error, device }) => return Err((error, device.into_inner())),
        };

        match self.handshake(&mut transport) {
            Ok((info, adb)) => {
                self.install(transport, info, adb);
                Ok(())
            }
            Err(error) => {
                adb::close_stream(&mut transport);
                Err((error, transport.close().into_inner()))
            }
        }
    }

    fn handshake(
        &mut self,
        transport: &mut Transport<H::Device>,
    ) -> Result<(DeviceInfo, Option<AdbConnection>)> {
        let mode = transport.mode();
        let mut info = DeviceInfo::new(&transport.device().descriptor(), mode);

        match mode {
            DeviceMode::Adb | DeviceMode::Recovery | DeviceMode::Sideload => {
                let conn = self.adb_handshake(transport)?;
                info.apply_banner(&parse_cnxn_banner(&conn.banner));
                if mode != DeviceMode::Sideload {
                    self.fetch_adb_metadata(transport, &mut info);
                }
                Ok((info, Some(conn)))
            }
            DeviceMode::Fastboot => {
                self.fastboot_probe(transport, &mut info)?;
                Ok((info, None))
            }
            DeviceMode::Unknown => Err(Error::NoInterfaceFound { mode }),
        }
    }

    #[instrument(level = "info", skip_all)]
    fn adb_handshake(&mut self, transport: &mut Transport<H::Device>) -> Result<AdbConnection> {
        let deadline = Deadline::after(self.config.connect_timeout());
        adb::send_connect(transport, &self.config.host_banner, self.config.max_payload)?;

        match adb::await_connect(transport, &deadline)? {
            ConnectReply::Connected(conn) => Ok(conn),
            ConnectReply::Challenge(token) => {
                self.transition(ConnectionState::Authenticating);
                let key = self.key_pair()?;
                adb::authenticate(transport, &key, &token, &key_comment(), &deadline)
            }
        }
    }

    /// Session key, loaded or generated on first use.
    fn key_pair(&mut self) -> Result<KeyPair> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        let key = match &self.config.key_path {
            Some(path) => KeyPair::load_or_generate(path)?,
            None => KeyPair::generate()?,
        };
        self.key = Some(key.clone());
        Ok(key)
    }

    /// Best-effort `getprop` and battery level. Failures are logged only.
    fn fetch_adb_metadata(&self, transport: &mut Transport<H::Device>, info: &mut DeviceInfo) {
        let deadline = Deadline::after(self.config.command_timeout());

        match adb::execute_shell(transport, "getprop", &deadline) {
            Ok(output) => info.apply_properties(&parse_getprop(&output)),
            Err(e) => {
                warn!(error = %e, "Could not read device properties");
                adb::close_stream(transport);
            }
        }

        match adb::execute_shell(transport, "dumpsys battery", &deadline) {
            Ok(output) => info.battery_level = parse_battery_level(&output),
            Err(e) => {
                debug!(error = %e, "Could not read battery level");
                adb::close_stream(transport);
            }
        }
    }

    fn fastboot_probe(
        &self,
        transport: &mut Transport<H::Device>,
        info: &mut DeviceInfo,
    ) -> Result<()> {
        let deadline = Deadline::after(self.config.command_timeout());
        match fastboot::execute_fastboot(transport, "getvar:all", &deadline) {
            Ok(text) => {
                info.apply_fastboot_vars(&parse_fastboot_vars(&text));
                Ok(())
            }
            // Some bootloaders refuse "all"; the link itself works.
            Err(Error::FastbootError(message)) => {
                debug!(message = %message, "getvar:all refused");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn install(
        &mut self,
        transport: Transport<H::Device>,
        info: DeviceInfo,
        adb: Option<AdbConnection>,
    ) {
        let descriptor = transport.device().descriptor();
        let mode = transport.mode();
        info!(serial = %info.serial, mode = %mode, "Device connected");

        self.transport = Some(transport);
        self.device_info = Some(info);
        self.adb = adb;
        self.last_device = None;
        self.transition(ConnectionState::Connected);
        self.observer.on_event(&SessionEvent::DeviceConnected {
            vid: descriptor.vendor_id,
            pid: descriptor.product_id,
            mode,
        });
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Run `command` on the device.
    ///
    /// ADB mode accepts `devices`, `shell <cmd>` and `reboot [target]`.
    /// Fastboot mode sends the command verbatim.
    #[instrument(level = "info", skip(self))]
    pub fn execute_command(&mut self, command: &str) -> Result<String> {
        let mode = self.connected_mode()?;
        let command = command.trim();

        match mode {
            DeviceMode::Adb | DeviceMode::Recovery => self.adb_command(command, mode),
            DeviceMode::Fastboot => {
                let deadline = Deadline::after(self.config.command_timeout());
                let transport = self.transport_mut()?;
                let result = fastboot::execute_fastboot(transport, command, &deadline);
                self.check(result)
            }
            DeviceMode::Sideload | DeviceMode::Unknown => Err(Error::UnsupportedCommand {
                command: command.to_string(),
                mode,
            }),
        }
    }

    fn adb_command(&mut self, command: &str, mode: DeviceMode) -> Result<String> {
        let unsupported = || Error::UnsupportedCommand {
            command: command.to_string(),
            mode,
        };
        let mut words = command.split_whitespace();

        match words.next() {
            Some("devices") if words.next().is_none() => {
                let serial = self
                    .device_info
                    .as_ref()
                    .map_or("unknown", |info| info.serial.as_str());
                let state = if mode == DeviceMode::Recovery {
                    "recovery"
                } else {
                    "device"
                };
                Ok(format!("List of devices attached\n{serial}\t{state}"))
            }
            Some("shell") => {
                let shell_command = command["shell".len()..].trim_start();
                // Interactive shells need a PTY stream.
                if shell_command.is_empty() {
                    return Err(unsupported());
                }
                let deadline = Deadline::after(self.config.command_timeout());
                let transport = self.transport_mut()?;
                let result = adb::execute_shell(transport, shell_command, &deadline);
                self.check(result)
            }
            Some("reboot") => {
                let target = match words.next() {
                    Some(word) => word.parse::<RebootTarget>().map_err(|_| unsupported())?,
                    None => RebootTarget::System,
                };
                if words.next().is_some() {
                    return Err(unsupported());
                }
                self.reboot_to(target)?;
                Ok(target.progress_message().to_string())
            }
            _ => Err(unsupported()),
        }
    }

    /// Reboot the device into `target`, then disconnect.
    #[instrument(level = "info", skip(self))]
    pub fn reboot_to(&mut self, target: RebootTarget) -> Result<()> {
        let mode = self.connected_mode()?;
        let unsupported = || Error::UnsupportedCommand {
            command: format!("reboot {target}"),
            mode,
        };
        let deadline = Deadline::after(self.config.command_timeout());

        let result = match mode {
            DeviceMode::Adb | DeviceMode::Recovery => {
                let transport = self.transport_mut()?;
                adb::reboot(transport, target.adb_target(), &deadline)
            }
            DeviceMode::Fastboot => {
                let command = target.fastboot_command().ok_or_else(unsupported)?;
                let transport = self.transport_mut()?;
                fastboot::execute_fastboot(transport, command, &deadline).map(|_| ())
            }
            DeviceMode::Sideload | DeviceMode::Unknown => return Err(unsupported()),
        };
        self.check(result)?;

        info!(target = %target, "Reboot requested");
        self.disconnect();
        Ok(())
    }

    /// Write `image` to `partition` over Fastboot.
    #[instrument(level = "info", skip(self, image), fields(size = image.len()))]
    pub fn flash_partition(&mut self, partition: &str, image: &[u8]) -> Result<String> {
        let mode = self.connected_mode()?;
        if mode != DeviceMode::Fastboot {
            return Err(Error::UnsupportedCommand {
                command: format!("flash:{partition}"),
                mode,
            });
        }

        let deadline = Deadline::after(self.config.flash_timeout());
        let sequence = self.config.flash_sequence;
        let observer = Arc::clone(&self.observer);
        let operation = format!("flash:{partition}");
        let mut progress = |current: u64, total: u64| {
            observer.on_event(&SessionEvent::Progress {
                operation: operation.clone(),
                current,
                total,
            });
        };

        let transport = self.transport_mut()?;
        let result =
            fastboot::flash_partition(transport, partition, image, sequence, &deadline, &mut progress);
        self.check(result)
    }

    /// Copy a local file to the device.
    ///
    /// Needs the ADB `sync:` service, which is not implemented.
    pub fn push_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mode = self.connected_mode()?;
        Err(Error::UnsupportedCommand {
            command: format!("push {} {remote}", local.display()),
            mode,
        })
    }

    /// Read a file from the device. Same limitation as `push_file`.
    pub fn pull_file(&mut self, remote: &str) -> Result<Vec<u8>> {
        let mode = self.connected_mode()?;
        Err(Error::UnsupportedCommand {
            command: format!("pull {remote}"),
            mode,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn connected_mode(&self) -> Result<DeviceMode> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(self.mode())
    }

    fn transport_mut(&mut self) -> Result<&mut Transport<H::Device>> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    /// Tear the link down if a command failure left it unusable.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.command_failed(e))
    }

    fn command_failed(&mut self, error: Error) -> Error {
        let link_broken = error.is_timeout()
            || matches!(
                error,
                Error::Transport(_) | Error::MalformedFrame(_) | Error::UnexpectedResponse { .. }
            );
        if !link_broken {
            return error;
        }

        if let Some(transport) = self.transport.take() {
            let device = self.close_transport(transport);
            self.last_device = Some(device);
        }
        self.device_info = None;
        self.adb = None;
        self.fail(error)
    }

    /// Close a leftover stream, release and close. Returns the device.
    fn close_transport(&self, mut transport: Transport<H::Device>) -> H::Device {
        adb::close_stream(&mut transport);
        let device = transport.close().into_inner();
        self.observer.on_event(&SessionEvent::DeviceDisconnected);
        device
    }

    fn take_device(&mut self) -> Option<H::Device> {
        self.device_info = None;
        self.adb = None;
        match self.transport.take() {
            Some(transport) => Some(self.close_transport(transport)),
            None => self.last_device.take(),
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.context.state == to {
            return;
        }
        let from = self.context.goto_state(to);
        self.observer.on_event(&SessionEvent::StateChanged {
            from,
            to,
            message: None,
        });
    }

    fn fail(&mut self, error: Error) -> Error {
        let classification = classify(&error);
        self.fail_with(
            classification.state,
            classification.message,
            classification.details,
        );
        error
    }

    fn fail_with(&mut self, state: ConnectionState, message: String, details: String) {
        warn!(state = %state, "{}", message);
        let from = self.context.fail(state, message.clone(), details);
        self.observer.on_event(&SessionEvent::StateChanged {
            from,
            to: state,
            message: Some(message),
        });
    }
}

impl<H: UsbHost, O: SessionObserver + 'static> Drop for DeviceSession<H, O> {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            adb::close_stream(&mut transport);
            let _ = transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::tests::script_shell;
    use crate::auth::tests::test_key;
    use crate::clock::RecordingClock;
    use crate::events::ChannelObserver;
    use crate::protocol::AdbCommand;
    use crate::transport::descriptor::DeviceDescriptor;
    use crate::transport::descriptor::fixtures::{adb_device, bulk_alt, device_with, fastboot_device};
    use crate::transport::mock::MockCall;
    use crate::transport::{HostCapabilities, MockHost, MockTransport};
    use std::sync::mpsc::Receiver;

    type TestSession = DeviceSession<MockHost, ChannelObserver>;

    const GETPROP: &[u8] = b"[ro.product.model]: [Pixel 3a]\n[ro.build.version.release]: [12]\n";

    fn session(host: &MockHost) -> (TestSession, RecordingClock, Receiver<SessionEvent>) {
        let (observer, rx) = ChannelObserver::new();
        let clock = RecordingClock::new();
        let session = DeviceSession::with_observer(host.clone(), SessionConfig::default(), Arc::new(observer))
            .with_clock(Arc::new(clock.clone()))
            .with_key_pair(test_key());
        (session, clock, rx)
    }

    /// ADB device that accepts CNXN without auth and answers the metadata queries.
    fn adb_mock() -> MockTransport {
        adb_mock_for(adb_device())
    }

    fn adb_mock_for(device: DeviceDescriptor) -> MockTransport {
        let mock = MockTransport::new(device);
        mock.set_echo_local_id(true);
        mock.queue_adb(
            A_CNXN,
            ADB_VERSION,
            4096,
            b"device::ro.product.name=sargo;ro.product.model=Pixel;features=shell_v2,cmd\0",
        );
        script_shell(&mock, 10, &[GETPROP]);
        script_shell(&mock, 11, &[b"  AC powered: false\n  level: 64\n"]);
        mock
    }

    fn fastboot_mock() -> MockTransport {
        let mock = MockTransport::new(fastboot_device());
        mock.queue_fastboot("INFOproduct: sargo");
        mock.queue_fastboot("INFOunlocked: yes");
        mock.queue_fastboot("OKAY");
        mock
    }

    fn connected(mock: &MockTransport) -> (TestSession, MockHost, RecordingClock, Receiver<SessionEvent>) {
        let host = MockHost::new();
        host.queue_choice(Some(mock.clone()));
        let (mut session, clock, rx) = session(&host);
        session.connect().unwrap();
        (session, host, clock, rx)
    }

    fn states(rx: &Receiver<SessionEvent>) -> Vec<ConnectionState> {
        rx.try_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_adb() {
        let mock = adb_mock();
        let (session, host, clock, rx) = connected(&mock);

        assert!(session.is_connected());
        assert_eq!(session.mode(), DeviceMode::Adb);
        let info = session.device_info().unwrap();
        assert_eq!(info.model.as_deref(), Some("Pixel 3a"));
        assert_eq!(info.product.as_deref(), Some("sargo"));
        assert_eq!(info.android_version.as_deref(), Some("12"));
        assert_eq!(info.battery_level, Some(64));
        assert_eq!(info.features, vec!["shell_v2", "cmd"]);
        assert_eq!(session.adb_connection().unwrap().max_payload, 4096);

        assert_eq!(host.request_calls(), 1);
        assert!(clock.sleeps().is_empty());
        assert_eq!(
            states(&rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::WaitingPermission,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn test_connect_emits_device_connected() {
        let mock = adb_mock();
        let (_session, _host, _clock, rx) = connected(&mock);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::DeviceConnected { vid: 0x18D1, mode: DeviceMode::Adb, .. }
        )));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Packet { .. })));
    }

    #[test]
    fn test_connect_with_auth() {
        let mock = MockTransport::new(adb_device());
        mock.queue_adb(A_AUTH, AUTH_TOKEN, 0, &[3u8; AUTH_TOKEN_SIZE]);
        mock.queue_adb(A_CNXN, ADB_VERSION, 4096, b"device::\0");
        let (session, _host, _clock, rx) = connected(&mock);

        assert!(session.is_connected());
        assert!(states(&rx).contains(&ConnectionState::Authenticating));
        let sent = mock.sent_adb_messages();
        assert_eq!(sent[0].command, AdbCommand::Cnxn);
        assert_eq!(sent[1].command, AdbCommand::Auth);
        assert_eq!(sent[1].arg0, AUTH_SIGNATURE);
    }

    #[test]
    fn test_untrusted_key_is_permission_denied() {
        let mock = MockTransport::new(adb_device());
        mock.queue_adb(A_AUTH, AUTH_TOKEN, 0, &[3u8; AUTH_TOKEN_SIZE]);
        mock.queue_adb(A_AUTH, AUTH_TOKEN, 0, &[4u8; AUTH_TOKEN_SIZE]);
        let host = MockHost::new();
        host.queue_choice(Some(mock.clone()));
        let (mut session, clock, _rx) = session(&host);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(session.state(), ConnectionState::PermissionDenied);
        assert!(session.context().details.is_some());
        // Not retried automatically
        assert!(clock.sleeps().is_empty());
        assert!(!mock.is_open());
    }

    #[test]
    fn test_connect_fastboot() {
        let mock = fastboot_mock();
        let (session, _host, _clock, _rx) = connected(&mock);

        assert_eq!(session.mode(), DeviceMode::Fastboot);
        let info = session.device_info().unwrap();
        assert_eq!(info.product.as_deref(), Some("sargo"));
        assert_eq!(info.unlocked, Some(true));
        assert_eq!(mock.get_writes(), vec![b"getvar:all".to_vec()]);
    }

    #[test]
    fn test_platform_checks() {
        let host = MockHost::new();
        host.set_capabilities(HostCapabilities {
            secure_context: false,
            ..Default::default()
        });
        let (mut session, _clock, _rx) = session(&host);

        assert!(matches!(session.connect(), Err(Error::InsecureContext)));
        assert_eq!(session.state(), ConnectionState::Error);
        assert_eq!(host.request_calls(), 0);
    }

    #[test]
    fn test_chooser_cancelled() {
        let host = MockHost::new();
        host.queue_choice(None);
        let (mut session, _clock, _rx) = session(&host);

        assert!(matches!(session.connect(), Err(Error::NoDeviceSelected)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.context().message.is_some());
    }

    #[test]
    fn test_silent_reconnect_skips_chooser() {
        let host = MockHost::new();
        host.add_authorized(adb_mock());
        let (mut session, _clock, _rx) = session(&host);

        session.connect().unwrap();
        assert!(session.is_connected());
        assert_eq!(host.request_calls(), 0);
    }

    #[test]
    fn test_permission_wait_bound() {
        let mock = adb_mock();
        mock.deny_claims(u32::MAX);
        let host = MockHost::new();
        host.queue_choice(Some(mock.clone()));
        let (mut session, clock, rx) = session(&host);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, Error::PermissionRequired(_)));
        assert_eq!(session.state(), ConnectionState::PermissionDenied);

        let polls = rx
            .try_iter()
            .filter(|e| matches!(e, SessionEvent::PermissionPoll { .. }))
            .count();
        assert_eq!(polls, MAX_PERMISSION_CHECKS as usize);
        let poll_sleeps = clock
            .sleeps()
            .into_iter()
            .filter(|d| *d == PERMISSION_POLL_INTERVAL)
            .count();
        assert_eq!(poll_sleeps, MAX_PERMISSION_CHECKS as usize);
        // One listing for the silent probe, one per poll.
        assert_eq!(host.authorized_calls(), 1 + MAX_PERMISSION_CHECKS);
    }

    #[test]
    fn test_permission_granted_while_waiting() {
        let mock = adb_mock();
        // Two attempts, each denied on claim and on the re-claim after reset.
        mock.deny_claims(4);
        let (session, _host, clock, _rx) = connected(&mock);

        assert!(session.is_connected());
        let poll_sleeps = clock
            .sleeps()
            .into_iter()
            .filter(|d| *d == PERMISSION_POLL_INTERVAL)
            .count();
        assert_eq!(poll_sleeps, 2);
    }

    #[test]
    fn test_retry_backoff() {
        let mock = adb_mock();
        mock.fail_writes(u32::MAX);
        let host = MockHost::new();
        host.queue_choice(Some(mock.clone()));
        let (mut session, clock, rx) = session(&host);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::TransferFailed { .. })));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(session.state(), ConnectionState::Error);
        assert!(session.has_pending_retry_target());

        let retries: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::RetryScheduled { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2, 3]);
        let opens = mock.calls().iter().filter(|c| **c == MockCall::Open).count();
        assert_eq!(opens, 4);
    }

    #[test]
    fn test_handshake_timeout_exhausts_retries_into_timeout() {
        let mock = MockTransport::new(adb_device());
        let host = MockHost::new();
        host.queue_choice(Some(mock.clone()));
        let (mut session, clock, _rx) = session(&host);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(_)));
        assert_eq!(clock.sleeps().len(), 3);
        assert_eq!(session.state(), ConnectionState::Timeout);
        let message = session.context().message.clone().unwrap();
        assert!(message.starts_with("Connection failed after 3 retries"), "{message}");
        let connects = mock
            .sent_adb_messages()
            .iter()
            .filter(|m| m.command == AdbCommand::Cnxn)
            .count();
        assert_eq!(connects, 4);
    }

    #[test]
    fn test_connect_vendor_fastboot_by_name() {
        let mock = MockTransport::new(device_with(
            VID_XIAOMI,
            Some("Xiaomi FASTBOOT Interface"),
            vec![(0, bulk_alt((0xFF, 0xFF, 0x00), 0x81, 0x01))],
        ));
        mock.queue_fastboot("OKAY");
        let (session, _host, _clock, _rx) = connected(&mock);

        assert!(session.is_connected());
        assert_eq!(session.mode(), DeviceMode::Fastboot);
        assert_eq!(mock.get_writes()[0], b"getvar:all".to_vec());
    }

    #[test]
    fn test_connect_recovery_by_name() {
        let mock = adb_mock_for(device_with(
            0x18D1,
            Some("Recovery"),
            vec![(0, bulk_alt((0xFF, 0x00, 0x00), 0x81, 0x01))],
        ));
        let (mut session, _host, _clock, _rx) = connected(&mock);

        assert!(session.is_connected());
        assert_eq!(session.mode(), DeviceMode::Recovery);
        assert_eq!(session.device_info().unwrap().mode, DeviceMode::Recovery);
        assert!(session.adb_connection().is_some());
        session.disconnect();
        assert!(!mock.is_open());
    }

    #[test]
    fn test_retry_recovers() {
        let mock = adb_mock();
        mock.fail_writes(1);
        let (session, _host, clock, _rx) = connected(&mock);

        assert!(session.is_connected());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mock = adb_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);

        for _ in 0..2 {
            session.disconnect();
            assert_eq!(session.state(), ConnectionState::Disconnected);
            assert_eq!(session.context(), &ConnectionContext::default());
            assert_eq!(session.mode(), DeviceMode::Unknown);
            assert!(session.device_info().is_none());
            assert!(session.adb_connection().is_none());
            assert!(!session.has_pending_retry_target());
            assert!(!session.is_connected());
        }
        assert!(!mock.is_open());
        let releases = mock
            .calls()
            .iter()
            .filter(|c| **c == MockCall::Release(1))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn test_adb_commands() {
        let mock = adb_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);

        script_shell(&mock, 20, &[b"hello\n"]);
        assert_eq!(session.execute_command("shell echo hello").unwrap(), "hello\n");
        assert_eq!(
            session.execute_command("devices").unwrap(),
            "List of devices attached\n0123456789ABCDEF\tdevice"
        );
        assert!(matches!(
            session.execute_command("install app.apk"),
            Err(Error::UnsupportedCommand { .. })
        ));
        assert!(matches!(
            session.execute_command("shell"),
            Err(Error::UnsupportedCommand { .. })
        ));
        assert!(matches!(
            session.push_file(Path::new("a.txt"), "/sdcard/a.txt"),
            Err(Error::UnsupportedCommand { mode: DeviceMode::Adb, .. })
        ));
        assert!(session.is_connected());
    }

    #[test]
    fn test_fastboot_passthrough() {
        let mock = fastboot_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);

        mock.queue_fastboot("OKAYsargo");
        assert_eq!(session.execute_command("getvar:product").unwrap(), "sargo");

        mock.queue_fastboot("FAIL:denied");
        let err = session.execute_command("flashing lock").unwrap_err();
        assert!(matches!(err, Error::FastbootError(ref m) if m == "denied"));
        // Device-reported failures keep the link.
        assert!(session.is_connected());
    }

    #[test]
    fn test_command_timeout_then_reset_and_retry() {
        let mock = adb_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);

        let err = session.execute_command("shell sleep 100").unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert_eq!(session.state(), ConnectionState::Timeout);
        assert!(!session.is_connected());
        assert!(!mock.is_open());

        session.reset_connection().unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(mock.calls().contains(&MockCall::Reset));

        mock.queue_adb(A_CNXN, ADB_VERSION, 4096, b"device::\0");
        session.retry_connection().unwrap();
        assert!(session.is_connected());
    }

    #[test]
    fn test_reboot_adb_disconnects() {
        let mock = adb_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);

        mock.queue_adb(A_OKAY, 30, 0, &[]);
        assert_eq!(
            session.execute_command("reboot bootloader").unwrap(),
            "Rebooting to bootloader..."
        );
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!mock.is_open());

        let open = mock
            .sent_adb_messages()
            .into_iter()
            .filter(|m| m.command == AdbCommand::Open)
            .last()
            .unwrap();
        assert_eq!(open.payload, b"reboot:bootloader\0");
    }

    #[test]
    fn test_reboot_fastboot() {
        let mock = fastboot_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);

        assert!(matches!(
            session.reboot_to(RebootTarget::Sideload),
            Err(Error::UnsupportedCommand { mode: DeviceMode::Fastboot, .. })
        ));

        mock.queue_fastboot("OKAY");
        session.reboot_to(RebootTarget::Recovery).unwrap();
        assert_eq!(mock.get_writes().last().unwrap(), b"reboot-recovery");
        assert!(!session.is_connected());
    }

    #[test]
    fn test_flash_reports_progress() {
        let mock = fastboot_mock();
        let (mut session, _host, _clock, rx) = connected(&mock);
        rx.try_iter().for_each(drop);

        let image = vec![0x5Au8; 10];
        mock.queue_fastboot("OKAY");
        mock.queue_fastboot("DATA0000000a");
        mock.queue_fastboot("OKAY");
        session.flash_partition("boot", &image).unwrap();

        let progress: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::Progress { operation, current, total } => {
                    Some((operation, current, total))
                }
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![("flash:boot".to_string(), 10, 10)]);
    }

    #[test]
    fn test_flash_requires_fastboot() {
        let mock = adb_mock();
        let (mut session, _host, _clock, _rx) = connected(&mock);
        assert!(matches!(
            session.flash_partition("boot", &[0u8; 4]),
            Err(Error::UnsupportedCommand { mode: DeviceMode::Adb, .. })
        ));
    }

    #[test]
    fn test_not_connected() {
        let (mut session, _clock, _rx) = session(&MockHost::new());
        assert!(matches!(session.execute_command("devices"), Err(Error::NotConnected)));
        assert!(matches!(session.reset_connection(), Err(Error::NotConnected)));
        assert!(matches!(session.pull_file("/sdcard/a"), Err(Error::NotConnected)));
    }

    #[test]
    fn test_diagnostics_reflect_session() {
        let mock = adb_mock();
        let (session, host, _clock, _rx) = connected(&mock);
        host.add_authorized(mock.clone());

        let snap = session.get_connection_diagnostics();
        assert!(snap.connection_established);
        assert!(snap.android_device_found);
        assert_eq!(snap.previously_authorized_devices, 1);
    }

    #[test]
    fn test_config_defaults_and_partial_toml() {
        let config = SessionConfig::default();
        assert_eq!(config.command_timeout(), COMMAND_TIMEOUT);
        assert_eq!(config.retry_delay(2), Duration::from_secs(4));

        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("key_path"));
        assert_eq!(toml::from_str::<SessionConfig>(&text).unwrap(), config);

        let partial: SessionConfig =
            toml::from_str("max_auto_retries = 5\nflash_sequence = \"download-then-flash\"\n").unwrap();
        assert_eq!(partial.max_auto_retries, 5);
        assert_eq!(partial.flash_sequence, FlashSequence::DownloadThenFlash);
        assert_eq!(partial.host_banner, DEFAULT_HOST_BANNER);
    }

    #[test]
    fn test_reboot_target_parsing() {
        assert_eq!("".parse::<RebootTarget>(), Ok(RebootTarget::System));
        assert_eq!(
            "sideload-auto-reboot".parse::<RebootTarget>(),
            Ok(RebootTarget::SideloadAutoReboot)
        );
        assert!("moon".parse::<RebootTarget>().is_err());
        assert_eq!(RebootTarget::Fastboot.to_string(), "fastboot");
    }
}
