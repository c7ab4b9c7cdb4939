//! pvstab - photovoltaic stability acquisition controller
//!
//! Finds every measurement board on the serial bus, identifies them, runs the
//! same measurement on all of them in parallel and writes one CSV file per
//! device.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pvstab_core::cli::{print_exit_codes, CliResult, ExitCodes};
use pvstab_core::config::AppConfig;
use pvstab_core::core::locator::{DeviceLocator, PortSource, SerialPorts};
use pvstab_core::core::logger::{generate_log_filename, EventLog, Level, LogFormat};
use pvstab_core::core::notify::LogNotifier;
use pvstab_core::core::protocol::RunRequest;
use pvstab_core::core::transport::SerialConnector;
use pvstab_core::core::{Coordinator, RunOutcome};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Event log file format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventFormat {
    /// One line of text per entry
    Text,
    /// JSON lines
    Json,
}

impl From<EventFormat> for LogFormat {
    fn from(format: EventFormat) -> Self {
        match format {
            EventFormat::Text => LogFormat::Text,
            EventFormat::Json => LogFormat::JsonLines,
        }
    }
}

/// pvstab CLI
#[derive(Parser, Debug)]
#[command(
    name = "pvstab",
    version,
    about = "Multi-device photovoltaic stability acquisition controller",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Trial name added to output file names
    #[arg(short, long, global = true)]
    trial: Option<String>,

    /// Directory for measurement files
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output; failures print the whole event log
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Mirror the event log to this file, or to a timestamped file in this directory
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,

    /// Format of the event log file and of dumped diagnostics
    #[arg(long, global = true, value_enum, default_value_t = EventFormat::Text)]
    event_format: EventFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    ListPorts {
        /// Include ports that do not look like measurement boards
        #[arg(short, long)]
        all: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Connect to every board and print its identity
    Identify,

    /// Voltage sweep on every board
    Scan {
        /// Sweep range (V)
        range: f32,
        /// Step size (V)
        step: f32,
        /// Reads per step
        reads: u32,
        /// Sweep rate (mV/s)
        rate: u32,
        /// Illuminated measurement
        #[arg(long)]
        light: bool,
    },

    /// Perturb-and-observe tracking on every board
    #[command(allow_negative_numbers = true)]
    Pno {
        /// Start voltage (V)
        start: f32,
        /// Step size (V)
        step: f32,
        /// Measurements per step
        measurements: u32,
        /// Delay between steps (ms)
        delay_ms: u32,
        /// Total tracking time
        total_time: u32,
    },

    /// Hold a fixed voltage on every board
    #[command(allow_negative_numbers = true)]
    ConstantVoltage {
        /// Voltage (V)
        voltage: f32,
    },

    /// Print the exit code table
    ExitCodes,
}

fn load_config(cli: &Cli) -> Result<AppConfig, CliResult> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_default()?,
    };
    if let Some(trial) = &cli.trial {
        config.data.trial_name = Some(trial.clone());
    }
    if let Some(dir) = &cli.data_dir {
        config.data.base_dir = Some(dir.clone());
    }
    Ok(config)
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "pvstab.log"));
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(file_layer)
        .try_init();
    guard
}

fn list_ports(all: bool, format: OutputFormat, config: &AppConfig) -> Result<CliResult, CliResult> {
    let source = SerialPorts;
    let locator = DeviceLocator::new(&source);
    let ports = if all {
        source.ports()?
    } else {
        locator.matching(&config.serial.port_patterns)?
    };

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&ports)
                .map_err(|e| CliResult::error(ExitCodes::INTERNAL_ERROR, e.to_string()))?;
            println!("{}", json);
        }
        OutputFormat::Text => {
            if ports.is_empty() {
                println!("No matching serial ports found.");
            }
            for port in &ports {
                println!("{:<16} {}", port.port, port.descriptor);
            }
        }
    }
    Ok(CliResult::success())
}

fn start_event_log(log: &EventLog, target: &Path, format: LogFormat) -> std::io::Result<PathBuf> {
    let path = if target.is_dir() {
        target.join(generate_log_filename("events", format))
    } else {
        target.to_path_buf()
    };
    log.start_file(path.clone(), format)?;
    Ok(path)
}

/// Warnings and errors, or the whole event log when `dump` is set
fn print_diagnostics(log: &EventLog, dump: Option<LogFormat>) {
    match dump {
        Some(format) => eprint!("{}", log.export(format)),
        None => {
            for entry in log.entries_at_least(Level::Warn) {
                eprintln!("  {}", entry.to_text());
            }
        }
    }
}

async fn connect_all(config: &AppConfig, log: &EventLog, dump: Option<LogFormat>) -> Result<Coordinator, CliResult> {
    config.validate()?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let coordinator = Coordinator::new(
        config.coordinator_options(),
        Arc::new(SerialConnector),
        Arc::new(LogNotifier::new(log.clone())),
        log.clone(),
    );
    if !coordinator.initialize(&SerialPorts).await {
        eprintln!("Initialization failed:");
        print_diagnostics(log, dump);
        return Err(CliResult::error(ExitCodes::IDENTITY_ERROR, "device initialization failed"));
    }
    Ok(coordinator)
}

async fn identify(config: &AppConfig, log: &EventLog, dump: Option<LogFormat>) -> Result<CliResult, CliResult> {
    let coordinator = connect_all(config, log, dump).await?;
    for device in coordinator.descriptors().await {
        println!(
            "ID{:<4} {:<24} {:<16} {}",
            device.logical_id,
            device.hardware_id.unwrap_or_default(),
            device.port,
            device.descriptor
        );
    }
    coordinator.shutdown().await;
    Ok(CliResult::success())
}

async fn measure(
    config: &AppConfig,
    log: &EventLog,
    dump: Option<LogFormat>,
    request: RunRequest,
) -> anyhow::Result<CliResult> {
    let coordinator = match connect_all(config, log, dump).await {
        Ok(c) => c,
        Err(result) => return Ok(result),
    };

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("installing Ctrl-C handler")?;

    let started = match coordinator.run_request(&request).await {
        Ok(n) => n,
        Err(e) => return Ok(CliResult::from(e)),
    };
    if started == 0 {
        coordinator.shutdown().await;
        return Ok(CliResult::error(ExitCodes::STREAM_FAILED, "no device accepted the command"));
    }
    eprintln!("{} running on {} device(s). Press Ctrl+C to stop.", request.mode(), started);

    let mut cancelled = false;
    tokio::select! {
        () = coordinator.wait_idle() => {}
        Some(()) = stop_rx.recv() => {
            eprintln!("Stopping...");
            cancelled = true;
            if let Err(e) = coordinator.run_request(&RunRequest::stop()).await {
                tracing::error!("stop failed: {}", e);
            }
            coordinator.wait_idle().await;
        }
    }

    let outcomes = coordinator.outcomes();
    for (id, outcome) in &outcomes {
        println!("device {}: {}", id, outcome.summary());
    }
    coordinator.shutdown().await;

    if cancelled {
        return Ok(CliResult::error(ExitCodes::CANCELLED, "stopped by user"));
    }
    if outcomes.values().any(|o| matches!(o, RunOutcome::Failed { .. })) {
        print_diagnostics(log, dump);
        return Ok(CliResult::error(ExitCodes::STREAM_FAILED, "at least one device failed"));
    }
    Ok(CliResult::success())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::ExitCodes) {
        print_exit_codes();
        return Ok(ExitCode::SUCCESS);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(result) => {
            eprintln!("Error: {}", result.message().unwrap_or_default());
            return Ok(result.to_exit_code());
        }
    };

    if let Err(e) = pvstab_core::config::init_directories() {
        eprintln!("Warning: could not create application directories: {}", e);
    }
    let log_dir = pvstab_core::config::log_dir().unwrap_or_else(|| config.data_dir().join("logs"));
    std::fs::create_dir_all(&log_dir).with_context(|| format!("creating {}", log_dir.display()))?;
    let _guard = init_logging(cli.verbose, Some(&log_dir));
    tracing::info!("Starting pvstab v{}", pvstab_core::VERSION);

    let log = EventLog::default();
    let format = LogFormat::from(cli.event_format);
    if let Some(target) = &cli.event_log {
        match start_event_log(&log, target, format) {
            Ok(path) => tracing::info!("event log mirrored to {}", path.display()),
            Err(e) => eprintln!("Warning: could not open event log {}: {}", target.display(), e),
        }
    }
    let dump = cli.verbose.then_some(format);

    let request = match &cli.command {
        Commands::Scan { range, step, reads, rate, light } => Some(RunRequest::scan(*range, *step, *reads, *rate, *light)),
        Commands::Pno { start, step, measurements, delay_ms, total_time } => {
            Some(RunRequest::pno(*start, *step, *measurements, *delay_ms, *total_time))
        }
        Commands::ConstantVoltage { voltage } => Some(RunRequest::constant_voltage(*voltage)),
        _ => None,
    };

    let result = match (&cli.command, request) {
        (_, Some(request)) => measure(&config, &log, dump, request).await?,
        (Commands::ListPorts { all, format }, None) => {
            list_ports(*all, *format, &config).unwrap_or_else(|e| e)
        }
        (Commands::Identify, None) => identify(&config, &log, dump).await.unwrap_or_else(|e| e),
        _ => CliResult::success(),
    };
    log.stop_file();

    if let Some(message) = result.message() {
        if result.is_success() {
            println!("{}", message);
        } else {
            eprintln!("Error: {}", message);
        }
    }
    Ok(result.to_exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan() {
        let cli = Cli::parse_from(["pvstab", "--trial", "batch7", "scan", "1.2", "0.03", "3", "50", "--light"]);
        assert_eq!(cli.trial.as_deref(), Some("batch7"));
        assert!(matches!(cli.command, Commands::Scan { reads: 3, rate: 50, light: true, .. }));
    }

    #[test]
    fn test_parse_constant_voltage() {
        let cli = Cli::parse_from(["pvstab", "constant-voltage", "0.8", "-d", "/tmp/pv"]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/pv")));
        assert!(matches!(cli.command, Commands::ConstantVoltage { .. }));
    }

    #[test]
    fn test_parse_event_log_options() {
        let cli = Cli::parse_from(["pvstab", "identify", "--event-log", "/tmp/pv", "--event-format", "json"]);
        assert_eq!(cli.event_log, Some(PathBuf::from("/tmp/pv")));
        assert_eq!(LogFormat::from(cli.event_format), LogFormat::JsonLines);
    }

    #[test]
    fn test_event_log_in_directory_gets_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::default();
        let path = start_event_log(&log, dir.path(), LogFormat::JsonLines).unwrap();
        log.warn("board COM3 did not answer");
        log.stop_file();

        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path.to_string_lossy().ends_with(".jsonl"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("board COM3 did not answer"));
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
