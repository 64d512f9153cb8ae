//! Zonefan Core Library
//!
//! Closed-loop thermal management for accelerator appliance chassis.
//!
//! # Features
//!
//! - **Zone control**: PID and lookup-table strategies behind one
//!   `Zone::compute` entry point, with critical-temperature override
//! - **Aggregation**: max-of-demands per shared fan channel, with a
//!   danger counter that forces full speed while any card is critical
//! - **Mode arbitration**: safe hand-over of the hardware channel
//!   between the daemon and the manual CLI
//! - **Hardware seams**: serial and SuperIO ioctl transports, a
//!   hwmon-backed accelerator inventory, fail-safe sensor reads
//!
//! # Module Structure
//!
//! - `hw/` - Hardware interaction (transport, inventory, sensors)
//! - `engine/` - Zone controllers, tables, aggregation
//! - `control/` - Control-loop driver and mode state machine
//! - `config` - Shared params snapshot and flock-guarded store

// Grouped modules
pub mod control;
pub mod engine;
pub mod hw;

// Standalone modules
pub mod config;
pub mod constants;

// Re-export the error types every component uses
pub use zf_error::{Result, ZonefanError};

// Re-export primary engine types
pub use engine::{
    aggregate, ChannelDemand, DangerCounter, PidController, PowerBand, ThermalLimits, Zone,
    ZoneId, ZoneKind, ZoneTuning,
};

// Re-export hardware seams
pub use hw::{
    CardId, DeviceInventory, FanTransport, HwmonInventory, IoctlTransport, ProductType,
    SerialTransport,
};

// Re-export configuration types
pub use config::{DeploymentProfile, ParamsStore, SharedParams};

// Re-export control types
pub use control::{await_channel_release, ControlLoop, ModeMachine, ModeState, Supervisor};
