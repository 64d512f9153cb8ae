//! Control loop and mode arbitration

pub mod driver;
pub mod mode;

pub use driver::{CardZone, ControlLoop};
pub use mode::{await_channel_release, ModeMachine, ModeState, Supervisor};
