//! bwflash CLI - Command-line tool for flashing Brightway and Leqi
//! scooter controllers.
//!
//! ## Features
//!
//! - Flash firmware over a serial link, with type auto-detection
//! - Simulation mode: full protocol run against the in-process fake
//!   device, no hardware required
//! - Firmware inspection (`info`, with JSON output)
//! - Serial port listing and shell completion generation
//!
//! Exit codes are part of the contract: 0 success, 2 usage, 3 invalid
//! image, 4 device/port not found, 5 device/firmware mismatch, 6 flash
//! failed with the device likely still bootable, 7 flash failed with
//! the device state unknown, 130 cancelled.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use bwflash::{
    CancelToken, DeviceHealth, Error, FirmwareImage, FirmwareKind, FlashError, FlashEvent,
    FlashState, RetryPolicy, SimulatedDevice, run_flash, select_flasher,
};

mod config;
use config::Config;

/// bwflash - flash Brightway and Leqi scooter controllers over UART.
///
/// Environment variables:
///   BWFLASH_PORT   - Default serial port
///   BWFLASH_BAUD   - Default baud rate (default: 19200)
#[derive(Parser)]
#[command(name = "bwflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BWFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the serial link (default: 19200).
    #[arg(short, long, global = true, env = "BWFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of guessing).
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Firmware kind override for `flash --force-kind`.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    /// Brightway controllers (authenticated DFU).
    Brightway,
    /// Leqi controllers (binary packet protocol).
    Leqi,
}

impl From<Kind> for FirmwareKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Brightway => FirmwareKind::Brightway,
            Kind::Leqi => FirmwareKind::Leqi,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware image.
    Flash {
        /// Path to the firmware file.
        firmware: PathBuf,

        /// Run against the simulated device instead of hardware.
        #[arg(long)]
        simulate: bool,

        /// Skip auto-detection and force the firmware type.
        #[arg(long, value_enum)]
        force_kind: Option<Kind>,
    },

    /// Show information about a firmware file.
    Info {
        /// Path to the firmware file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// CLI failure classified by exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Bad invocation or unusable combination of flags.
    #[error("{0}")]
    Usage(String),
    /// Malformed or undetected firmware image.
    #[error("{0}")]
    Image(String),
    /// Serial port missing or device not responding.
    #[error("{0}")]
    DeviceNotFound(String),
    /// Image and attached device disagree on the protocol family.
    #[error("{0}")]
    Mismatch(String),
    /// Flash failed before anything was erased.
    #[error("{0}")]
    Recoverable(String),
    /// Flash failed after erase; the device state is unknown.
    #[error("{0}")]
    Unrecoverable(String),
    /// Interrupted by the user.
    #[error("operation cancelled")]
    Cancelled,
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Other(_) => 1,
            Self::Usage(_) => 2,
            Self::Image(_) => 3,
            Self::DeviceNotFound(_) => 4,
            Self::Mismatch(_) => 5,
            Self::Recoverable(_) => 6,
            Self::Unrecoverable(_) => 7,
            Self::Cancelled => 130,
        }
    }
}

/// Map a terminal session failure onto the exit-code contract.
///
/// The recoverable/unrecoverable distinction is safety-critical: once
/// the erase command is out, a failure means the device may not boot,
/// and the caller must be told so distinctly.
fn classify_flash_error(err: FlashError) -> CliError {
    match &err.error {
        Error::Cancelled => CliError::Cancelled,
        Error::DeviceNotFound => CliError::DeviceNotFound(err.to_string()),
        Error::DeviceMismatch { .. } => CliError::Mismatch(err.to_string()),
        _ => match err.device {
            DeviceHealth::Bootable => CliError::Recoverable(format!(
                "{err}\nThe device was not erased and should still boot its old firmware."
            )),
            DeviceHealth::Unknown => CliError::Unrecoverable(format!(
                "{err}\nThe device may not boot until a flash completes. \
                 Keep it powered and retry."
            )),
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("bwflash v{}", env!("CARGO_PKG_VERSION"));

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", style("Error:").red().bold());
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = cli
        .config_path
        .as_deref()
        .map_or_else(Config::load, Config::load_from_path);

    match &cli.command {
        Commands::Flash {
            firmware,
            simulate,
            force_kind,
        } => cmd_flash(cli, &config, firmware, *simulate, *force_kind),
        Commands::Info { firmware, json } => cmd_info(firmware, *json),
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}

/// Load and validate a firmware image, honouring `--force-kind`.
fn load_image(firmware: &PathBuf, force_kind: Option<Kind>) -> Result<FirmwareImage, CliError> {
    let data = std::fs::read(firmware)
        .map_err(|e| CliError::Image(format!("cannot read {}: {e}", firmware.display())))?;

    let result = match force_kind {
        Some(kind) => FirmwareImage::parse(data, kind.into()),
        None => FirmwareImage::from_bytes(data),
    };
    result.map_err(|e| CliError::Image(format!("{}: {e}", firmware.display())))
}

/// Resolve the serial port from flags, config or auto-detection.
fn resolve_port(cli: &Cli, config: &Config) -> Result<String, CliError> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }
    if let Some(port) = &config.connection.serial {
        debug!("using configured port {port}");
        return Ok(port.clone());
    }

    let ports = bwflash::list_ports()
        .map_err(|e| CliError::DeviceNotFound(format!("cannot enumerate serial ports: {e}")))?;
    let usb: Vec<_> = ports.iter().filter(|p| p.vid.is_some()).collect();

    match usb.as_slice() {
        [] => Err(CliError::DeviceNotFound(
            "no serial port found; connect the programmer or pass --port".into(),
        )),
        [single] => {
            debug!("auto-detected port {}", single.name);
            Ok(single.name.clone())
        }
        _ if cli.non_interactive => Err(CliError::Usage(
            "multiple serial ports found; pass --port to choose one".into(),
        )),
        many => {
            eprintln!("Multiple serial ports found:");
            for p in many {
                eprintln!("  {}", p.name);
            }
            Err(CliError::Usage("pass --port to choose one".into()))
        }
    }
}

/// Flash command implementation.
fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &PathBuf,
    simulate: bool,
    force_kind: Option<Kind>,
) -> Result<(), CliError> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware from {}",
            style("*").cyan(),
            firmware.display()
        );
    }

    let image = load_image(firmware, force_kind)?;
    if !cli.quiet {
        eprintln!(
            "{} Detected {} firmware, {} bytes ({} payload)",
            style("*").cyan(),
            style(image.kind()).yellow(),
            image.data().len(),
            image.declared_size()
        );
    }

    // Cooperative cancellation: Ctrl-C takes effect at the next state
    // or block boundary, never mid-frame.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || {
            eprintln!("\ninterrupt received, stopping at the next safe point...");
            cancel.cancel();
        });
    }

    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(bwflash::DEFAULT_BAUD);
    let flasher = if simulate {
        if !cli.quiet {
            eprintln!("{} Simulation mode: no hardware involved", style("*").cyan());
        }
        let sim = SimulatedDevice::new(image.kind(), &image)
            .map_err(|e| CliError::Other(anyhow::Error::from(e)))?;
        select_flasher(&image, sim, RetryPolicy::immediate(10))
    } else {
        let port = resolve_port(cli, config)?;
        if !cli.quiet {
            eprintln!("{} Using port {port} at {baud} baud", style("*").cyan());
        }
        let transport = bwflash::SerialTransport::open(&port, baud)
            .map_err(|e| CliError::DeviceNotFound(format!("cannot open {port}: {e}")))?;
        select_flasher(&image, transport, RetryPolicy::default())
    }
    .map_err(|e| CliError::Image(e.to_string()))?;

    let pb = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(1);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let summary = run_flash(
        flasher,
        &mut |event| match event {
            FlashEvent::StateChanged { to, .. } => {
                if !matches!(to, FlashState::Writing(_)) {
                    pb.set_message(to.to_string());
                }
            }
            FlashEvent::BlockWritten { index, total } => {
                pb.set_length(total as u64);
                pb.set_position((index + 1) as u64);
                pb.set_message("Writing");
            }
        },
        cancel,
    )
    .map_err(classify_flash_error)?;

    pb.finish_with_message("Complete");

    if !cli.quiet {
        if let Some(version) = &summary.identity.version {
            eprintln!("{} Device version: {version}", style("*").cyan());
        }
        eprintln!(
            "\n{} Flashed {}/{} blocks successfully",
            style("OK").green().bold(),
            summary.blocks_written,
            summary.total_blocks
        );
    }

    Ok(())
}

/// Info command implementation.
fn cmd_info(firmware: &PathBuf, json: bool) -> Result<(), CliError> {
    let image = load_image(firmware, None)?;

    let checksum = match image.checksum() {
        bwflash::ImageChecksum::Crc32(crc) => format!("crc32:{crc:08x}"),
        bwflash::ImageChecksum::Crc16(crc) => format!("crc16:{crc:04x}"),
    };
    let block_size = match image.kind() {
        FirmwareKind::Brightway => 0x800,
        _ => 128,
    };

    if json {
        let info = serde_json::json!({
            "kind": image.kind().to_string(),
            "file_size": image.data().len(),
            "payload_size": image.declared_size(),
            "checksum": checksum,
            "block_size": block_size,
            "blocks": image.block_count(block_size),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Firmware information").bold().underlined());
    eprintln!("  Type:         {}", style(image.kind()).yellow());
    eprintln!("  File size:    {} bytes", image.data().len());
    eprintln!("  Payload size: {} bytes", image.declared_size());
    eprintln!("  Checksum:     {checksum}");
    eprintln!(
        "  Transfer:     {} blocks of {} bytes",
        image.block_count(block_size),
        block_size
    );
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let ports = bwflash::list_ports().unwrap_or_default();

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("none found").dim());
        return;
    }
    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("*").green(),
            style(&port.name).cyan()
        );
    }
}
