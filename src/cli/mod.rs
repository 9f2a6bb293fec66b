//! Types and functions for the command-line interface.

use std::{
    net::Ipv4Addr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Args;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::debug;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serialport::{FlowControl, SerialPortType};

use crate::{
    cli::config::Config,
    connection::Connection,
    error::Error,
    interface::{Interface, ReplayPort},
    prompt::ExtractEntry,
    recovery::Recovery,
    session::{SessionConfig, Timeouts, DEFAULT_ENABLE_PASSWORD},
    transcript::Transcript,
    transfer::{TransferObserver, TransferOutcome},
};

pub mod config;

mod monitor;
mod serial;

pub use monitor::monitor;
pub use serial::detect_serial_ports;

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to the device console
    #[arg(short = 'p', long, env = "APFLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate of the console connection
    #[arg(short = 'b', long, default_value_t = 9600)]
    pub baud: u32,
    /// Confirm the selected serial port before using it
    #[arg(long)]
    pub confirm_port: bool,
}

#[derive(Debug, Args)]
pub struct RecoverArgs {
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    /// Address assigned to the device in ROMMON
    #[arg(long)]
    pub ip: Ipv4Addr,
    /// Netmask of the recovery network
    #[arg(long, default_value = "255.255.255.0")]
    pub netmask: Ipv4Addr,
    /// Default gateway assigned to the device
    #[arg(long)]
    pub gateway: Ipv4Addr,
    /// TFTP server the device pulls the firmware from
    #[arg(long)]
    pub server: Option<Ipv4Addr>,
    /// Firmware tar filename served by the TFTP server
    #[arg(long)]
    pub file: String,
    /// Enable password of the recovered image
    #[arg(long)]
    pub enable_password: Option<String>,
    /// Overall deadline for the TFTP pull and extraction, in seconds
    #[arg(long, value_name = "SECS")]
    pub extract_timeout: Option<u64>,
    /// Deadline for the reboot into the recovered image, in seconds
    #[arg(long, value_name = "SECS")]
    pub boot_timeout: Option<u64>,
    /// Path the session transcript is written to
    #[arg(long, default_value = "apflash-session.log")]
    pub transcript: PathBuf,
    /// Open the serial monitor once the device is recovered
    #[arg(long)]
    pub monitor: bool,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Captured session transcript to drive the procedure from
    pub transcript: PathBuf,
    /// Per-step deadline applied during the replay, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub step_timeout: u64,
    /// Firmware tar filename recorded in the transcript
    #[arg(long, default_value = "ap3g2-k9w7-tar.153-3.JF15.tar")]
    pub file: String,
}

/// Open the configured serial port at the console baud rate.
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Interface> {
    let port_info = serial::get_serial_port_info(args, config)?;

    println!("Serial port: {}", port_info.port_name);
    let serial = serialport::new(&port_info.port_name, args.baud)
        .flow_control(FlowControl::None)
        .open()
        .map_err(Error::from)
        .wrap_err_with(|| format!("Failed to open serial port {}", port_info.port_name))?;

    Ok(Interface::new(serial))
}

/// Run the full recovery procedure against a connected device.
pub fn recover(args: RecoverArgs, config: &Config) -> Result<()> {
    let session_config = session_config(&args, config)?;
    // A bad firmware name should be rejected before the device is touched.
    let boot_image = session_config.boot_image()?;
    debug!("boot image path: {boot_image}");

    let interface = connect(&args.connect_args, config)?;
    let transcript = Transcript::to_file(&args.transcript)?;

    let abort = Arc::new(AtomicBool::new(false));
    let handler_flag = abort.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .into_diagnostic()
        .wrap_err("Failed to install the abort handler")?;

    let connection = Connection::new(Box::new(interface), transcript).with_abort(abort);
    let mut recovery = Recovery::new(connection, session_config);
    let mut observer = ExtractionProgress::default();

    match recovery.run(&mut observer) {
        Ok(()) => {
            println!("Recovery complete; the device is at its privileged prompt.");
            println!("Transcript saved to {}", args.transcript.display());

            if args.monitor {
                let (connection, _session) = recovery.into_parts();
                let (transport, _transcript) = connection.into_parts();
                monitor(transport)?;
            }

            Ok(())
        }
        Err(err) => {
            observer.clear();
            match recovery.session().halted_at() {
                Some(stage) => eprintln!("Recovery failed during {stage}"),
                None => eprintln!("Recovery interrupted at {}", recovery.stage()),
            }
            eprintln!("Transcript saved to {}", args.transcript.display());
            Err(err.into())
        }
    }
}

/// Drive the procedure from a captured transcript, without hardware.
pub fn replay(args: ReplayArgs) -> Result<()> {
    let capture = Transcript::load(&args.transcript)?;
    let connection = Connection::new(
        Box::new(ReplayPort::new(capture)),
        Transcript::in_memory(),
    );

    let mut recovery = Recovery::new(connection, replay_config(&args));
    let mut observer = ExtractionProgress::default();

    match recovery.run(&mut observer) {
        Ok(()) => {
            println!("Replay reached {}", recovery.stage());
            Ok(())
        }
        Err(err) => {
            observer.clear();
            match recovery.session().halted_at() {
                Some(stage) => eprintln!("Replay failed during {stage}"),
                None => eprintln!("Replay halted at {}", recovery.stage()),
            }
            Err(err.into())
        }
    }
}

/// Open the serial monitor without running the procedure.
pub fn serial_monitor(args: ConnectArgs, config: &Config) -> Result<()> {
    let interface = connect(&args, config)?;
    monitor(Box::new(interface))
}

/// Print the candidate console ports on this host.
pub fn list_ports() -> Result<()> {
    let ports = detect_serial_ports()?;
    if ports.is_empty() {
        return Err(Error::NoSerial.into());
    }

    for port in ports {
        match &port.port_type {
            SerialPortType::UsbPort(info) => {
                let product = info.product.as_deref().unwrap_or("unknown");
                println!(
                    "{} ({:04x}:{:04x}) - {}",
                    port.port_name, info.vid, info.pid, product
                );
            }
            _ => println!("{}", port.port_name),
        }
    }

    Ok(())
}

fn session_config(args: &RecoverArgs, config: &Config) -> Result<SessionConfig> {
    let server = args
        .server
        .or(config.recovery.server)
        .ok_or_else(|| miette!("No TFTP server address given; pass `--server` or set one in the config file"))?;

    let enable_password = args
        .enable_password
        .clone()
        .or_else(|| config.recovery.enable_password.clone())
        .unwrap_or_else(|| DEFAULT_ENABLE_PASSWORD.to_string());

    let mut timeouts = Timeouts::default();
    if let Some(secs) = args.extract_timeout.or(config.recovery.extract_timeout_secs) {
        timeouts.extract = Duration::from_secs(secs);
    }
    if let Some(secs) = args.boot_timeout.or(config.recovery.boot_timeout_secs) {
        timeouts.boot = Duration::from_secs(secs);
    }

    Ok(SessionConfig {
        ip_addr: args.ip,
        netmask: args.netmask,
        gateway: args.gateway,
        server,
        filename: args.file.clone(),
        enable_password,
        timeouts,
    })
}

// The commands a replay sends go nowhere, so the addresses are placeholders;
// only the filename matters, for the boot path derivation.
fn replay_config(args: &ReplayArgs) -> SessionConfig {
    SessionConfig {
        ip_addr: Ipv4Addr::new(10, 0, 0, 1),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(10, 0, 0, 254),
        server: Ipv4Addr::new(10, 0, 0, 2),
        filename: args.file.clone(),
        enable_password: DEFAULT_ENABLE_PASSWORD.to_string(),
        timeouts: Timeouts::uniform(Duration::from_millis(args.step_timeout)),
    }
}

/// Extraction progress rendered as a file counter with the latest entry.
#[derive(Default)]
struct ExtractionProgress {
    bar: Option<ProgressBar>,
}

impl ExtractionProgress {
    fn clear(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl TransferObserver for ExtractionProgress {
    fn start(&mut self, filename: &str) {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} [{elapsed_precise}] {pos} files {msg}")
                .unwrap(),
        );
        bar.set_message(format!("- extracting {filename}"));
        bar.enable_steady_tick(Duration::from_millis(100));
        self.bar = Some(bar);
    }

    fn entry(&mut self, entry: &ExtractEntry) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("- {} ({})", entry.path, HumanBytes(entry.bytes)));
            bar.inc(1);
        }
    }

    fn finish(&mut self, outcome: &TransferOutcome) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!(
                "- extraction complete, {} total",
                HumanBytes(outcome.total_bytes)
            ));
        }
    }
}
