//! ToneScan operator CLI
//!
//! Thin front end over the scanner service for technicians and kiosk
//! bring-up: list devices, scan, fetch reports, run the self-test.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tonescan_core::config::Settings;
use tonescan_core::demo::DemoTransport;
use tonescan_core::diagnostics::{run_self_test, DebugControls};
use tonescan_core::protocol::{
    DeviceChooser, DeviceDescriptor, DeviceSession, SerialTransport, Transport,
};
use tonescan_core::service::{ConnectionState, ScannerService};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tonescan", version, about = "Colorimeter tools for the skin-tone kiosk")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated colorimeter
    #[arg(long, global = true)]
    demo: bool,

    /// Serial port to use instead of discovery
    #[arg(long, global = true)]
    port: Option<String>,

    /// Debug logging with frame hex dumps
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices the host can open
    Ports,
    /// Take one or more Lab measurements
    Scan {
        #[arg(short, long, default_value_t = 1)]
        count: u32,
    },
    /// Fetch the full ASCII report for a fresh measurement
    Report,
    /// Show device name and firmware version
    Info,
    /// Run the self-test
    Diagnose,
    /// Write the effective settings to the settings file
    SaveConfig,
}

/// Prompts on stderr and reads the choice from stdin
struct StdinChooser;

impl DeviceChooser for StdinChooser {
    fn choose(&self, candidates: &[DeviceDescriptor]) -> Option<DeviceDescriptor> {
        if candidates.is_empty() {
            eprintln!("No colorimeter found.");
            return None;
        }

        let mut stderr = io::stderr();
        for (i, d) in candidates.iter().enumerate() {
            let _ = writeln!(
                stderr,
                "  [{}] {} {}",
                i,
                d.path,
                d.product.as_deref().unwrap_or("")
            );
        }
        let _ = write!(stderr, "Select device (empty to cancel): ");
        let _ = stderr.flush();

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        let index: usize = line.trim().parse().ok()?;
        candidates.get(index).cloned()
    }
}

fn init_tracing(settings: &Settings, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(scanner: &ScannerService, settings: &Settings) -> Result<()> {
    let status = match &settings.preferred_port {
        Some(port) => {
            scanner
                .connect_to(&DeviceDescriptor::from_path(port.clone()))
                .await
        }
        None => {
            let status = scanner.auto_connect().await;
            if status.needs_manual_connect {
                // Running the command is the operator's gesture
                scanner.manual_connect().await
            } else {
                status
            }
        }
    };

    if status.state != ConnectionState::Connected {
        bail!(
            "colorimeter not connected: {}",
            status
                .last_error
                .unwrap_or_else(|| "no device selected".to_string())
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(Settings::default_path);
    let mut settings = match &config_path {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if cli.demo {
        settings.demo_mode = true;
    }
    if cli.port.is_some() {
        settings.preferred_port = cli.port.clone();
    }

    init_tracing(&settings, cli.verbose);

    let transport: Arc<dyn Transport> = if settings.demo_mode {
        tracing::info!("Using simulated colorimeter");
        Arc::new(DemoTransport::default())
    } else {
        Arc::new(SerialTransport::with_chooser(Arc::new(StdinChooser)))
    };

    let session = DeviceSession::new(transport, settings.session.clone());
    DebugControls::new(&session).set_verbose(cli.verbose);
    let scanner = ScannerService::with_vendor(session, settings.vendor_id);

    let result = run(&cli, &scanner, &settings, config_path).await;
    scanner.shutdown().await;
    result
}

async fn run(
    cli: &Cli,
    scanner: &ScannerService,
    settings: &Settings,
    config_path: Option<PathBuf>,
) -> Result<()> {
    match cli.command {
        Commands::Ports => {
            let devices = scanner
                .session()
                .list_devices()
                .await
                .context("listing serial devices")?;
            for d in devices {
                let marker = if d.matches_vendor(settings.vendor_id) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {} vid={} pid={} {}",
                    marker,
                    d.path,
                    d.vid.map(|v| format!("{:04x}", v)).unwrap_or_else(|| "-".into()),
                    d.pid.map(|p| format!("{:04x}", p)).unwrap_or_else(|| "-".into()),
                    d.product.unwrap_or_default()
                );
            }
        }
        Commands::Scan { count } => {
            connect(scanner, settings).await?;
            for _ in 0..count {
                match scanner.trigger_scan().await {
                    Some(measurement) => print_json(&measurement)?,
                    None => bail!(
                        "scan failed: {}",
                        scanner.status().last_error.unwrap_or_default()
                    ),
                }
            }
        }
        Commands::Report => {
            connect(scanner, settings).await?;
            let report = scanner
                .session()
                .fetch_full_report()
                .await
                .context("fetching full report")?;
            print_json(&report)?;
        }
        Commands::Info => {
            connect(scanner, settings).await?;
            let name = scanner.session().query_name().await.context("querying name")?;
            let version = scanner
                .session()
                .query_version()
                .await
                .context("querying version")?;
            println!("{} (firmware {})", name, version);
        }
        Commands::Diagnose => {
            let report = run_self_test(scanner.session(), settings.vendor_id).await;
            print_json(&report)?;
            if !report.passed() {
                bail!("self-test failed");
            }
        }
        Commands::SaveConfig => {
            let path = config_path.context("no config directory on this platform")?;
            settings.save(&path)?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}
