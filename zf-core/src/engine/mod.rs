//! Controller engine: per-zone strategies, aggregation, danger signal

pub mod aggregate;
pub mod pid;
pub mod table;
pub mod zone;

pub use aggregate::{aggregate, ChannelDemand, DangerCounter};
pub use pid::PidController;
pub use table::PowerBand;
pub use zone::{ThermalLimits, Zone, ZoneId, ZoneKind, ZoneTuning};
