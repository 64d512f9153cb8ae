//! Fail-safe sensor reads
//!
//! Every read here substitutes a pessimistic value on failure instead of
//! propagating: a missing or garbled temperature becomes the zone's
//! critical temperature and a missing power reading becomes the zone's
//! power ceiling. The controller then errs toward maximum cooling rather
//! than under-cooling on uncertainty.

use std::path::Path;

use tracing::warn;

use crate::hw::inventory::{CardId, DeviceInventory};
use crate::hw::transport::FanTransport;
use zf_protocol::serial::{self, QUERY_BOARD_TEMP, QUERY_CPU_POWER};

/// Temperature from a sysfs millidegree file, substituting `critical` on
/// any failure.
pub fn file_temperature(path: impl AsRef<Path>, critical: i32) -> i32 {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(millidegrees) => millidegrees / 1000,
            Err(_) => {
                warn!(
                    "unparsable temperature in {:?}, substituting critical {} C",
                    path, critical
                );
                critical
            }
        },
        Err(e) => {
            warn!(
                "cannot read {:?} ({}), substituting critical {} C",
                path, e, critical
            );
            critical
        }
    }
}

/// Mainboard temperature via the controller board's `!GTP` query,
/// substituting `critical` on transport or parse failure.
pub fn board_temperature(transport: &mut dyn FanTransport, critical: i32) -> i32 {
    match transport
        .query(QUERY_BOARD_TEMP)
        .and_then(|response| serial::parse_board_temp(&response))
    {
        Ok(temp) => temp,
        Err(e) => {
            warn!(
                "mainboard temperature query failed ({}), substituting critical {} C",
                e, critical
            );
            critical
        }
    }
}

/// CPU power via `#GPV` in milliwatts, substituting `max_power` on failure.
pub fn cpu_power_milliwatts(transport: &mut dyn FanTransport, max_power: i64) -> i64 {
    match transport
        .query(QUERY_CPU_POWER)
        .and_then(|response| serial::parse_cpu_power(&response))
    {
        Ok(power) => power,
        Err(e) => {
            warn!(
                "CPU power query failed ({}), substituting ceiling {} mW",
                e, max_power
            );
            max_power
        }
    }
}

/// Card temperature via the inventory, substituting `critical` on failure.
pub fn card_temperature(inventory: &dyn DeviceInventory, card: CardId, critical: i32) -> i32 {
    match inventory.temperature(card) {
        Ok(temp) => temp,
        Err(e) => {
            warn!(
                "card {} temperature read failed ({}), substituting critical {} C",
                card, e, critical
            );
            critical
        }
    }
}

/// Card power via the inventory, substituting `max_power` (deciwatts) on
/// failure or sentinel readings.
pub fn card_power_deciwatts(inventory: &dyn DeviceInventory, card: CardId, max_power: i64) -> i64 {
    match inventory.power_deciwatts(card) {
        Ok(power) => power,
        Err(e) => {
            warn!(
                "card {} power read failed ({}), substituting ceiling {} dW",
                card, e, max_power
            );
            max_power
        }
    }
}
