//! Multi-zone aggregation and the global danger counter
//!
//! One physical fan may serve several logical zones; a channel's duty is
//! the maximum of its zones' demands. The danger counter overrides that:
//! while any accelerator zone is in critical state, every zone-backed
//! channel runs at full speed regardless of computed demands. Any single
//! overheating unit behind a shared fan wins.

use std::sync::atomic::{AtomicI32, Ordering};

use tracing::warn;

use zf_protocol::{BUS_ID_MIRROR_CPU, BUS_ID_UNPOPULATED, FIRST_CARD_CHANNEL};

use crate::constants::pwm;
use crate::engine::zone::ZoneId;

/// Process-wide critical-state signal, owned by the aggregator and
/// handed to accelerator zones by reference.
///
/// A zone entering critical adds `zone_id + 1`; leaving critical
/// subtracts the same amount, so the counter is zero exactly when no
/// zone is critical. The per-zone weights make a stuck counter
/// attributable in the logs.
#[derive(Debug, Default)]
pub struct DangerCounter {
    value: AtomicI32,
}

impl DangerCounter {
    pub fn new() -> Self {
        Self { value: AtomicI32::new(0) }
    }

    pub fn raise(&self, zone: ZoneId) {
        self.value.fetch_add(zone.0 as i32 + 1, Ordering::SeqCst);
    }

    pub fn release(&self, zone: ZoneId) {
        let prev = self.value.fetch_sub(zone.0 as i32 + 1, Ordering::SeqCst);
        if prev < zone.0 as i32 + 1 {
            // Asymmetric release; restore and complain rather than go negative.
            self.value.fetch_add(zone.0 as i32 + 1, Ordering::SeqCst);
            warn!("danger counter underflow releasing zone {}", zone.0);
        }
    }

    pub fn is_raised(&self) -> bool {
        self.value.load(Ordering::SeqCst) > 0
    }

    pub fn value(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Drop all contributions. Used when the controller restarts cold.
    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

/// Combine the demands of the zones sharing one channel.
///
/// Returns `None` for an empty demand set. A raised danger counter
/// forces full speed unconditionally.
pub fn aggregate(demands: &[u8], danger: &DangerCounter) -> Option<u8> {
    if demands.is_empty() {
        return None;
    }
    if danger.is_raised() {
        return Some(pwm::MAX);
    }
    demands.iter().copied().max()
}

/// What a card-fan channel should be driven by this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDemand {
    /// Demands of the cards mapped onto this channel
    Zones(Vec<u8>),
    /// No card behind this fan; hold the park duty
    Park,
    /// Mirror whatever the CPU fan channel runs at
    MirrorCpu,
}

/// Build the card-channel plan from the configured bus-id list and the
/// per-card `(bus_id, demand)` pairs computed this tick.
pub fn plan_card_channels(
    bus_ids: &[i32],
    card_demands: &[(i32, u8)],
) -> Vec<(usize, ChannelDemand)> {
    bus_ids
        .iter()
        .enumerate()
        .map(|(index, &bus_id)| {
            let channel = FIRST_CARD_CHANNEL + index;
            let demand = match bus_id {
                BUS_ID_UNPOPULATED => ChannelDemand::Park,
                BUS_ID_MIRROR_CPU => ChannelDemand::MirrorCpu,
                bus_id => ChannelDemand::Zones(
                    card_demands
                        .iter()
                        .filter(|(bus, _)| *bus == bus_id)
                        .map(|(_, duty)| *duty)
                        .collect(),
                ),
            };
            (channel, demand)
        })
        .collect()
}

/// Resolve a channel demand to the duty to command.
///
/// A mapped bus with no matching card means the configuration and the
/// inventory disagree; the channel is forced to full speed until an
/// operator fixes the mapping.
pub fn resolve(demand: &ChannelDemand, cpu_duty: u8, danger: &DangerCounter) -> u8 {
    match demand {
        ChannelDemand::Park => pwm::PARKED,
        ChannelDemand::MirrorCpu => {
            if danger.is_raised() {
                pwm::MAX
            } else {
                cpu_duty
            }
        }
        ChannelDemand::Zones(demands) => match aggregate(demands, danger) {
            Some(duty) => duty,
            None => {
                warn!("no card matches a mapped bus id, forcing channel to full speed");
                pwm::MAX
            }
        },
    }
}
