use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use droidlink_core::mode::detect_mode;
use droidlink_core::transport::{NusbHost, Selection};
use droidlink_core::{
    DeviceSession, RebootTarget, SessionConfig, SessionEvent, SessionObserver, TracingObserver,
    UsbHost, UsbTransport,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "ADB and Fastboot over USB, no server required", long_about = None)]
struct Args {
    /// Session configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Select the device with this serial number
    #[arg(short, long, conflicts_with = "device")]
    serial: Option<String>,

    /// Select the device by VID:PID (hex, e.g. 18d1:4ee7)
    #[arg(long)]
    device: Option<String>,

    /// ADB private key (PKCS#8 PEM); created if missing
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected Android devices
    Devices,
    /// Connect and show device information
    Info,
    /// Run a shell command (ADB)
    Shell {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Send a raw session command (e.g. `getvar:product` in fastboot)
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Reboot the device
    Reboot {
        /// system, bootloader, recovery, fastboot, sideload, sideload-auto-reboot
        #[arg(default_value = "system")]
        target: RebootTarget,
    },
    /// Flash an image to a partition (fastboot)
    Flash { partition: String, image: PathBuf },
    /// Explain why a device can or cannot be reached
    Diagnose,
}

/// Logs through tracing and draws flash progress on stderr.
struct CliObserver;

impl SessionObserver for CliObserver {
    fn on_event(&self, event: &SessionEvent) {
        if let SessionEvent::Progress {
            operation,
            current,
            total,
        } = event
        {
            let pct = if *total > 0 { current * 100 / total } else { 100 };
            eprint!("\r{operation}: {pct:3}% ({current}/{total} bytes)");
            if current >= total {
                eprintln!();
            }
            let _ = std::io::stderr().flush();
            return;
        }
        TracingObserver.on_event(event);
    }
}

fn parse_ids(value: &str) -> Result<(u16, u16)> {
    let (vid, pid) = value
        .split_once(':')
        .context("expected VID:PID, e.g. 18d1:4ee7")?;
    let vid = u16::from_str_radix(vid, 16).with_context(|| format!("bad vendor id {vid}"))?;
    let pid = u16::from_str_radix(pid, 16).with_context(|| format!("bad product id {pid}"))?;
    Ok((vid, pid))
}

fn default_key_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".android").join("droidlink_adbkey"))
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(key) = &args.key {
        config.key_path = Some(key.clone());
    } else if config.key_path.is_none() {
        config.key_path = default_key_path();
    }
    Ok(config)
}

fn selection(args: &Args) -> Result<Selection> {
    if let Some(serial) = &args.serial {
        return Ok(Selection::Serial(serial.clone()));
    }
    if let Some(ids) = &args.device {
        let (vid, pid) = parse_ids(ids)?;
        return Ok(Selection::Ids { vid, pid });
    }
    Ok(Selection::First)
}

fn list_devices(host: &NusbHost) -> Result<()> {
    let devices = host.authorized_devices()?;
    println!("List of devices attached");
    for device in devices {
        let descriptor = device.descriptor();
        println!(
            "{}\t{}\t{:04x}:{:04x}",
            descriptor.serial_number.as_deref().unwrap_or("????????"),
            detect_mode(&descriptor),
            descriptor.vendor_id,
            descriptor.product_id
        );
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let host = NusbHost::new(selection(&args)?);

    if let Command::Devices = args.command {
        return list_devices(&host);
    }

    let mut session = DeviceSession::with_observer(host, config, Arc::new(CliObserver));

    if let Command::Diagnose = args.command {
        if let Err(e) = session.connect() {
            info!("Connect failed: {}", e);
        }
        println!("{}", session.get_connection_diagnostics());
        return Ok(());
    }

    if let Err(e) = session.connect() {
        if let Some(details) = &session.context().details {
            eprintln!("{details}");
        }
        return Err(e.into());
    }

    match args.command {
        Command::Info => {
            if let Some(info) = session.device_info() {
                println!("{info}");
            }
            if let Some(adb) = session.adb_connection() {
                println!("ADB:          version 0x{:08X}, max payload {}", adb.version, adb.max_payload);
            }
        }
        Command::Shell { command } => {
            let output = session.execute_command(&format!("shell {}", command.join(" ")))?;
            print!("{output}");
        }
        Command::Exec { command } => {
            let output = session.execute_command(&command.join(" "))?;
            if !output.is_empty() {
                println!("{}", output.trim_end());
            }
        }
        Command::Reboot { target } => {
            session.reboot_to(target)?;
            println!("Reboot to {target} requested");
        }
        Command::Flash { partition, image } => {
            let data = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let output = session.flash_partition(&partition, &data)?;
            if !output.is_empty() {
                println!("{}", output.trim_end());
            }
            println!("Flashed {} bytes to {partition}", data.len());
        }
        Command::Devices | Command::Diagnose => bail!("handled above"),
    }

    session.disconnect();
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids("18d1:4ee7").unwrap(), (0x18D1, 0x4EE7));
        assert!(parse_ids("18d1").is_err());
        assert!(parse_ids("zz:4ee7").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["droidlink", "-s", "ABC", "shell", "ls", "-l"]).unwrap();
        assert_eq!(args.serial.as_deref(), Some("ABC"));
        match args.command {
            Command::Shell { command } => assert_eq!(command, vec!["ls", "-l"]),
            other => panic!("unexpected {other:?}"),
        }

        let args = Args::try_parse_from(["droidlink", "reboot", "bootloader"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Reboot { target: RebootTarget::Bootloader }
        ));
    }

    #[test]
    fn test_key_flag_overrides_config() {
        let args = Args::try_parse_from(["droidlink", "--key", "/tmp/k.pem", "info"]).unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.key_path, Some(PathBuf::from("/tmp/k.pem")));
    }
}
