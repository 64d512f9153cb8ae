//! Constants and configuration values for Zonefan
//!
//! Centralizes all magic numbers, paths, and tuning defaults.
//! This is the SINGLE SOURCE OF TRUTH for all configuration values.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Directory holding the shared control-params file
    pub const PARAMS_DIR: &str = "/etc/zonefan";

    /// The control-params record both processes coordinate through
    pub const PARAMS_FILE: &str = "/etc/zonefan/params.json";

    /// Runtime directory for daemon state
    pub const RUN_DIR: &str = "/run/zonefan";

    /// Marker the daemon publishes once it has released the control
    /// channel; the CLI waits on it before opening the device itself
    pub const RELEASED_MARKER: &str = "/run/zonefan/released";

    /// Daemon PID file
    pub const PID_FILE: &str = "/run/zonefand.pid";

    /// CPU package temperature, millidegrees Celsius
    pub const CPU_TEMP_FILE: &str = "/sys/class/thermal/thermal_zone0/temp";

    /// Mainboard temperature on SuperIO chassis, millidegrees Celsius
    pub const SIO_SYS_TEMP_FILE: &str = "/sys/class/hwmon/hwmon0/temp1_input";

    /// Serial controller board device node
    pub const SERIAL_DEVICE: &str = "/dev/fanctrl";

    /// SuperIO register device node (ioctl deployments)
    pub const SIO_DEVICE: &str = "/dev/aaeon_sio";

    /// hwmon root scanned by the accelerator inventory
    pub const HWMON_BASE: &str = "/sys/class/hwmon";
}

/// PWM duty limits (percent)
pub mod pwm {
    /// Lowest duty the controller will command; fans stall below this
    pub const MIN: u8 = 20;

    /// Full speed
    pub const MAX: u8 = 100;

    /// Park duty for card-fan channels with no card behind them
    pub const PARKED: u8 = 30;
}

/// Thermal thresholds (degrees Celsius)
pub mod thermal {
    /// Nominal regulation target for every zone on serial chassis
    pub const TARGET: i32 = 65;

    /// Critical flag clears once the zone cools below this
    pub const SAFE: i32 = 75;

    /// Crossing this latches the critical override
    pub const CRITICAL: i32 = 80;

    /// Floor for the stepped-down accelerator target
    pub const CARD_MIN_TARGET: i32 = 50;

    /// Lookup-table deployments: mainboard temperature above which the
    /// CPU fan is driven to full speed regardless of the CPU table
    pub const MAINBOARD_CPU_GUARD: i32 = 54;

    /// SuperIO chassis run the system zone against tighter limits
    pub const SIO_SYS_TARGET: i32 = 50;
    pub const SIO_SYS_SAFE: i32 = 60;
    pub const SIO_SYS_CRITICAL: i32 = 70;
    pub const SIO_CARD_CRITICAL: i32 = 85;
}

/// PID gains and power ceilings per zone kind / accelerator product
pub mod tuning {
    pub const CPU_KP: f64 = 5.5;
    pub const CPU_KI: f64 = 0.5;
    pub const CPU_KD: f64 = 0.1;
    /// CPU package power ceiling, milliwatts
    pub const CPU_MAX_POWER_MW: i64 = 95_000;

    pub const SYS_KP: f64 = 7.5;
    pub const SYS_KI: f64 = 0.5;
    pub const SYS_KD: f64 = 0.1;

    pub const ACCEL_KP: f64 = 7.5;
    pub const ACCEL_KI: f64 = 0.5;
    pub const ACCEL_KD: f64 = 0.1;

    /// Accelerator power ceilings, deciwatts (inventory unit)
    pub const STANDARD_MAX_POWER_DW: i64 = 720;
    pub const PRO_MAX_POWER_DW: i64 = 720;
    pub const DUO_MAX_POWER_DW: i64 = 1500;
}

/// Power banding for the lookup-table strategy
pub mod power {
    /// Below this fraction of the zone's ceiling the band is Safe
    pub const SAFE_RANGE: f64 = 0.2;

    /// Below this fraction the band is Warn; above it, Danger
    pub const WARN_RANGE: f64 = 0.7;

    /// Inventory sentinels meaning "reading unavailable"
    pub const UNAVAILABLE_SENTINELS: [i32; 2] = [0x7FFD, 0x7FFF];
}

/// Timing
pub mod timing {
    use super::Duration;

    /// Control-loop period in automatic mode
    pub const CONTROL_TICK: Duration = Duration::from_secs(5);

    /// Params-file poll period, and the idle period while in manual mode
    pub const MODE_POLL: Duration = Duration::from_secs(1);

    /// Post-write settle delay before reading a serial response (daemon)
    pub const SETTLE_DAEMON: Duration = Duration::from_millis(100);

    /// Settle delay used by the one-shot CLI
    pub const SETTLE_CLI: Duration = Duration::from_millis(200);

    /// Floor applied to the PID sample interval; sub-millisecond ticks
    /// would blow up the derivative term
    pub const DT_FLOOR_SECS: f64 = 0.001;

    /// How long the CLI waits for the daemon's released marker
    pub const HANDSHAKE_WAIT: Duration = Duration::from_secs(1);

    /// Marker poll granularity during the handshake
    pub const HANDSHAKE_STEP: Duration = Duration::from_millis(50);
}
