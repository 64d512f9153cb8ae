//! Mode arbitration
//!
//! The daemon and the manual CLI share one hardware channel and must
//! never hold it at the same time. The polled `mode` flag arbitrates:
//!
//! ```text
//! Automatic --flag false--> ManualPending --channel closed--> Manual
//!     ^                                                         |
//!     +-- Restarting <--------------------------flag true ------+
//! ```
//!
//! On the way into manual mode the daemon closes its channel and then
//! publishes a released-marker file; the CLI waits for the marker before
//! opening the device, which closes the race window a bare sleep would
//! leave. On the way back the channel is reopened (fatal if that fails)
//! and every controller starts cold - the operator may have moved the
//! fans while the daemon was idle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use zf_error::{Result, ZonefanError};

use crate::config::SharedParams;
use crate::constants::{paths, timing};
use crate::control::driver::ControlLoop;

/// Arbitration states between automatic and manual operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    /// The control loop owns the hardware channel
    Automatic,
    /// Told to relinquish the channel, not yet confirmed closed
    ManualPending,
    /// The operator owns the channel; the daemon idles and polls
    Manual,
    /// Flag flipped back; reopen and reset before resuming
    Restarting,
}

/// Drives [`ModeState`] transitions from the polled mode flag
pub struct ModeMachine {
    state: ModeState,
    marker: PathBuf,
}

impl ModeMachine {
    pub fn new() -> Self {
        Self::with_marker(paths::RELEASED_MARKER)
    }

    pub fn with_marker(marker: impl Into<PathBuf>) -> Self {
        Self {
            state: ModeState::Automatic,
            marker: marker.into(),
        }
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    /// Advance the machine one step and return how long to sleep before
    /// the next one. `Duration::ZERO` means step again immediately -
    /// intermediate states complete their work without waiting out a
    /// poll interval.
    ///
    /// The only error path is the `Restarting` reopen, which the caller
    /// must treat as fatal: a daemon that cannot reach the fans must not
    /// keep running as if it could.
    pub fn step(&mut self, auto_flag: bool, driver: &mut ControlLoop) -> Result<Duration> {
        match self.state {
            ModeState::Automatic => {
                if !auto_flag {
                    self.state = ModeState::ManualPending;
                    return Ok(Duration::ZERO);
                }
                driver.tick();
                Ok(timing::CONTROL_TICK)
            }
            ModeState::ManualPending => {
                driver.close();
                self.publish_marker();
                info!("control channel closed, mode is Manual");
                self.state = ModeState::Manual;
                Ok(timing::MODE_POLL)
            }
            ModeState::Manual => {
                if auto_flag {
                    self.state = ModeState::Restarting;
                    return Ok(Duration::ZERO);
                }
                Ok(timing::MODE_POLL)
            }
            ModeState::Restarting => {
                self.remove_marker();
                driver.restart()?;
                info!("mode is Automatic, resuming control loop cold");
                self.state = ModeState::Automatic;
                Ok(Duration::ZERO)
            }
        }
    }

    fn publish_marker(&self) {
        if let Some(parent) = self.marker.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("cannot create {:?}: {}", parent, e);
            }
        }
        if let Err(e) = std::fs::write(&self.marker, format!("{}\n", std::process::id())) {
            // The marker is an optimization; the CLI falls back to a
            // fixed delay without it.
            warn!("cannot publish released marker {:?}: {}", self.marker, e);
        }
    }

    fn remove_marker(&self) {
        if self.marker.exists() {
            if let Err(e) = std::fs::remove_file(&self.marker) {
                warn!("cannot remove released marker {:?}: {}", self.marker, e);
            }
        }
    }
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the daemon has published its released marker, up to
/// [`timing::HANDSHAKE_WAIT`]. Falls back to sitting out the full wait
/// when no marker appears - the daemon may be an older build, or not
/// running at all.
pub fn await_channel_release(marker: impl AsRef<Path>) -> bool {
    let marker = marker.as_ref();
    let mut waited = Duration::ZERO;
    while waited < timing::HANDSHAKE_WAIT {
        if marker.exists() {
            return true;
        }
        std::thread::sleep(timing::HANDSHAKE_STEP);
        waited += timing::HANDSHAKE_STEP;
    }
    marker.exists()
}

/// Owns the driver and the machine; runs until shutdown
pub struct Supervisor {
    machine: ModeMachine,
    driver: ControlLoop,
    params: Arc<SharedParams>,
}

impl Supervisor {
    pub fn new(machine: ModeMachine, driver: ControlLoop, params: Arc<SharedParams>) -> Self {
        Self {
            machine,
            driver,
            params,
        }
    }

    /// Run the arbitration loop until the shutdown flag is raised.
    /// Returns an error only on a fatal reopen failure.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            let delay = self
                .machine
                .step(self.params.mode(), &mut self.driver)
                .map_err(|e| {
                    ZonefanError::generic(format!("cannot reopen control channel: {}", e))
                })?;
            sleep_interruptible(delay, shutdown);
        }
        info!("supervisor stopping");
        Ok(())
    }

    pub fn driver(&self) -> &ControlLoop {
        &self.driver
    }
}

/// Sleep in short slices so shutdown stays responsive.
fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}
