//! Zonefan Daemon (zonefand)
//!
//! Runs the closed-loop fan controller for the chassis: CPU fan,
//! system fan, and one fan per accelerator card, driven over the serial
//! controller board or the SuperIO register interface depending on the
//! deployment profile.
//!
//! # Coordination
//! The daemon polls `/etc/zonefan/params.json` at ~1 Hz. When the
//! operator flips the record to manual mode (via `zonefanctl`), the
//! daemon closes the hardware channel, publishes a released marker, and
//! idles until the flag returns - then reopens the channel and resumes
//! from a cold controller state.
//!
//! # Failure policy
//! - Sensor failures bias toward maximum cooling, never less.
//! - Transport write failures are retried on the next tick.
//! - Failure to open the hardware channel, at startup or at resume, is
//!   fatal: the daemon must not pretend to manage fans it cannot reach.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use zf_core::config::{DeploymentProfile, ParamsStore, SharedParams};
use zf_core::constants::{paths, timing};
use zf_core::control::{ControlLoop, ModeMachine, Supervisor};
use zf_core::hw::{FanTransport, HwmonInventory, IoctlTransport, SerialTransport};
use zf_protocol::TransportKind;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

struct Args {
    params_path: String,
}

fn print_help() {
    eprintln!("zonefand {} - Zonefan fan control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    zonefand [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Params file (default {})", paths::PARAMS_FILE);
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    ZONEFAN_LOG         Log level (trace, debug, info, warn, error)");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        params_path: paths::PARAMS_FILE.to_string(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("zonefand {}", VERSION);
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                parsed.params_path = args[i].clone();
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging() {
    let log_level = std::env::var("ZONEFAN_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer journald on systemd systems, fall back to stdout.
    let journal_available = Path::new("/run/systemd/journal/socket").exists();
    if journal_available {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
}

// ============================================================================
// PID File Management
// ============================================================================

fn write_pid_file() -> std::io::Result<()> {
    use std::io::Write;

    let path = paths::PID_FILE;

    // Check for a stale PID file from a previous run.
    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only checks process existence.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("Another instance is running (PID {})", old_pid),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;

    debug!("PID file written: {}", path);
    Ok(())
}

fn cleanup() {
    for path in [paths::PID_FILE, paths::RELEASED_MARKER] {
        if Path::new(path).exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove {}: {}", path, e);
            }
        }
    }
    info!("Cleanup complete");
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn build_transport(kind: &TransportKind) -> Box<dyn FanTransport> {
    match kind {
        TransportKind::Serial { device } => {
            Box::new(SerialTransport::new(device, timing::SETTLE_DAEMON))
        }
        TransportKind::Ioctl { device } => Box::new(IoctlTransport::new(device)),
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args();
    init_logging();

    info!("STARTUP: zonefand {} starting", VERSION);

    // SAFETY: geteuid just returns the effective user id.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!("STARTUP: not running as root (euid={}), device access may fail", euid);
    }

    // Load (or create) the params record; the deployment profile is
    // fixed from this first read, only mode and mapping stay hot.
    let store = ParamsStore::new(&args.params_path);
    let initial = store
        .ensure()
        .with_context(|| format!("cannot initialize params file {}", args.params_path))?;
    let profile = DeploymentProfile::from(&initial);
    info!(
        "STARTUP: strategy {:?}, transport {:?}, system fan {}",
        profile.strategy, profile.transport, profile.system_fan
    );

    if let Err(e) = write_pid_file() {
        error!("Could not write PID file: {}", e);
        std::process::exit(1);
    }

    // Open the hardware channel. Fatal if it cannot be opened: the
    // daemon must never run blind.
    let mut transport = build_transport(&profile.transport);
    if let Err(e) = transport.open() {
        error!("FATAL: cannot open control channel: {}", e);
        cleanup();
        std::process::exit(1);
    }

    let inventory = Box::new(HwmonInventory::new());
    let params = Arc::new(SharedParams::new(initial));

    let driver = match ControlLoop::new(transport, inventory, params.clone(), profile) {
        Ok(driver) => driver,
        Err(e) => {
            error!("FATAL: cannot enumerate accelerator cards: {}", e);
            cleanup();
            std::process::exit(1);
        }
    };
    info!("STARTUP: controlling {} accelerator card(s)", driver.cards().len());

    // Shutdown plumbing: signal handler raises the flag, threads drain.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("SIGNAL: received SIGINT/SIGTERM, shutting down");
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to set signal handler: {}", e);
        }
    }

    // Params poll thread: the single writer of the shared snapshot.
    let poller = {
        let params = params.clone();
        let shutdown = shutdown.clone();
        let store = ParamsStore::new(&args.params_path);
        std::thread::Builder::new()
            .name("params-poll".to_string())
            .spawn(move || store.poll_loop(&params, &shutdown))
            .context("cannot spawn params poll thread")?
    };

    // The control thread is the main thread: mode machine + driver.
    let mut supervisor = Supervisor::new(ModeMachine::new(), driver, params);
    let result = supervisor.run(&shutdown);

    shutdown.store(true, Ordering::SeqCst);
    if poller.join().is_err() {
        warn!("params poll thread panicked");
    }
    cleanup();

    if let Err(e) = result {
        error!("FATAL: {}", e);
        std::process::exit(1);
    }

    info!("SHUTDOWN: zonefand terminated gracefully");
    Ok(())
}
