//! Armbench Daemon - Arm Telemetry Test Bench
//!
//! Headless operator process for the bench. It loads the layered
//! configuration, starts the TCP server, prints every bench event to stdout
//! and reads operator commands from stdin.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:19738)
//! armbench-daemon
//!
//! # Custom address and a preset selection
//! armbench-daemon --ip 127.0.0.1 --port 20000 --select 1:is_selected=true
//!
//! # Unattended: auto-send every 250 ms without a console
//! armbench-daemon --interval-ms 250 --select 2:is_clutched=change --auto-send --no-console
//!
//! # Verbose logging
//! RUST_LOG=debug armbench-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop schedulers and the server, then exit

mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use armbench_core::{
    default_config_path, load_config_from_path, Bench, BenchConfig, ConfigOverrides,
    SelectionSpec,
};

/// Armbench Daemon - device-side telemetry test bench
#[derive(Parser, Debug)]
#[command(name = "armbench-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ARMBENCH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "IP")]
    ip: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<String>,

    /// Scheduler interval in milliseconds
    #[arg(short = 'i', long, value_name = "MS")]
    interval_ms: Option<String>,

    /// Enable an attribute selection, e.g. `2:esu_state=coag` (repeatable)
    #[arg(long = "select", value_name = "ARM:ATTRIBUTE=VALUE")]
    selections: Vec<SelectionSpec>,

    /// Start auto-send once the server is up
    #[arg(long)]
    auto_send: bool,

    /// Start swap-pedal-auto once the server is up
    #[arg(long)]
    swap_pedal_auto: bool,

    /// Do not read commands from stdin
    #[arg(long)]
    no_console: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ARMBENCH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref ip) = self.ip {
            overrides = overrides.with_ip(ip.clone());
        }
        if let Some(ref port) = self.port {
            overrides = overrides.with_port(port.clone());
        }
        if let Some(ref interval) = self.interval_ms {
            overrides = overrides.with_interval_ms(interval.clone());
        }
        for selection in &self.selections {
            overrides = overrides.with_selection(selection.clone());
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries the console and bench events.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "armbench_daemon={level},armbench_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Defaults, then file, then environment, then command line
fn resolve_config(args: &Args) -> Result<BenchConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.clone())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;
    args.overrides().apply(&mut config);
    Ok(config)
}

/// Print every bench event until the sink closes
fn spawn_event_printer(bench: &Bench) -> tokio::task::JoinHandle<()> {
    let mut events = bench.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{event}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Armbench daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        ip = %config.ip,
        port = %config.port,
        interval_ms = %config.interval.as_millis(),
        selections = config.selections.len(),
        "Configuration loaded"
    );

    let bench = Arc::new(Bench::new());
    bench
        .apply_config(&config)
        .context("Invalid selection in configuration")?;
    let printer = spawn_event_printer(&bench);

    match bench.start(&config.ip, &config.port).await {
        Ok(addr) => info!(%addr, "Server listening"),
        // With a console the operator can fix things up and `start` again.
        Err(e) if !args.no_console => error!(error = %e, "Server failed to start"),
        Err(e) => return Err(e).context("Server failed to start"),
    }

    if args.auto_send {
        if let Err(e) = bench.scheduler().start_auto_send() {
            warn!(error = %e, "Auto-send not started");
        }
    }
    if args.swap_pedal_auto {
        if let Err(e) = bench.scheduler().start_swap_pedal_auto() {
            warn!(error = %e, "Swap-pedal-auto not started");
        }
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let console = async {
        if args.no_console {
            std::future::pending::<Result<()>>().await
        } else {
            console::run(&bench, &config).await
        }
    };

    tokio::select! {
        result = console => {
            match result {
                Ok(()) => info!("Console closed, initiating shutdown"),
                Err(e) => error!(error = %e, "Console failed, initiating shutdown"),
            }
        }
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }

    bench.shutdown().await;
    printer.abort();

    info!("Armbench daemon stopped cleanly");
    Ok(())
}
