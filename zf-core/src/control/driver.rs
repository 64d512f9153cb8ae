//! Control-loop driver
//!
//! Once per tick: read temperatures, compute each zone's demand, build
//! the channel plan from the current config snapshot, aggregate, and
//! command every channel whose duty changed since the last successful
//! write. A failed transport write leaves the recorded duty untouched,
//! so the next tick retries the same target - no backoff, no cap, the
//! outer period is the retry interval.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use zf_error::Result;
use zf_protocol::{Strategy, TransportKind, CPU_CHANNEL, SYSTEM_CHANNEL};

use crate::config::{DeploymentProfile, SharedParams};
use crate::constants::{paths, pwm, thermal};
use crate::engine::aggregate::{aggregate, plan_card_channels, resolve, ChannelDemand, DangerCounter};
use crate::engine::zone::{ThermalLimits, Zone, ZoneId, ZoneKind, ZoneTuning};
use crate::hw::inventory::{CardId, DeviceInventory, ProductType};
use crate::hw::sensors;
use crate::hw::transport::FanTransport;

/// An accelerator zone together with its inventory identity
pub struct CardZone {
    pub card: CardId,
    pub bus_id: i32,
    pub zone: Zone,
}

/// The per-tick orchestrator owning zones, transport and channel state
pub struct ControlLoop {
    transport: Box<dyn FanTransport>,
    inventory: Box<dyn DeviceInventory>,
    params: Arc<SharedParams>,
    profile: DeploymentProfile,
    danger: Arc<DangerCounter>,
    cpu: Zone,
    system: Option<Zone>,
    cards: Vec<CardZone>,
    /// Duty last successfully written per channel
    last_applied: HashMap<usize, u8>,
    cpu_temp_path: PathBuf,
}

impl ControlLoop {
    /// Build the controller: construct the fixed zones and discover the
    /// accelerator cards. Failing to enumerate the inventory here is an
    /// error the daemon treats as fatal, like a failed channel open.
    pub fn new(
        transport: Box<dyn FanTransport>,
        inventory: Box<dyn DeviceInventory>,
        params: Arc<SharedParams>,
        profile: DeploymentProfile,
    ) -> Result<Self> {
        let danger = Arc::new(DangerCounter::new());

        let sio = matches!(profile.transport, TransportKind::Ioctl { .. });
        let cpu_limits = ThermalLimits::serial_default();
        let sys_limits = if sio {
            ThermalLimits::sio_system()
        } else {
            ThermalLimits::serial_default()
        };
        let card_limits = if sio {
            ThermalLimits::sio_card()
        } else {
            ThermalLimits::serial_default()
        };

        let make_zone = |id, kind, tuning: ZoneTuning, danger: &Arc<DangerCounter>| match profile
            .strategy
        {
            Strategy::Pid => Zone::pid(id, kind, tuning, danger.clone()),
            Strategy::Table => Zone::table(id, kind, tuning, danger.clone()),
        };

        let cpu = make_zone(
            ZoneId(CPU_CHANNEL),
            ZoneKind::Cpu,
            ZoneTuning::cpu(cpu_limits),
            &danger,
        );
        let system = profile.system_fan.then(|| {
            make_zone(
                ZoneId(SYSTEM_CHANNEL),
                ZoneKind::System,
                ZoneTuning::system(sys_limits),
                &danger,
            )
        });

        let mut cards = Vec::new();
        for card in inventory.list()? {
            let bus_id = match inventory.bus_id(card) {
                Ok(bus_id) => bus_id,
                Err(e) => {
                    warn!("skipping card {}: cannot read bus id: {}", card, e);
                    continue;
                }
            };
            let product = match inventory.product_type(card) {
                Ok(product) => ProductType::from_product_string(&product),
                Err(e) => {
                    warn!("card {}: cannot read product type ({}), assuming Standard", card, e);
                    ProductType::Standard
                }
            };
            info!("discovered card {} ({:?}) on bus {:#x}", card, product, bus_id);
            cards.push(CardZone {
                card,
                bus_id,
                zone: make_zone(
                    ZoneId(card as usize),
                    ZoneKind::Accelerator { product },
                    ZoneTuning::accelerator(product, card_limits, profile.target_step_offset),
                    &danger,
                ),
            });
        }

        Ok(Self {
            transport,
            inventory,
            params,
            profile,
            danger,
            cpu,
            system,
            cards,
            last_applied: HashMap::new(),
            cpu_temp_path: PathBuf::from(paths::CPU_TEMP_FILE),
        })
    }

    /// Override the CPU temperature source (deployment configuration).
    pub fn with_cpu_temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cpu_temp_path = path.into();
        self
    }

    /// Run one control iteration.
    pub fn tick(&mut self) {
        // A dead inventory means blind card zones; their channels are
        // forced to full speed below.
        let inventory_ok = match self.inventory.list() {
            Ok(_) => true,
            Err(e) => {
                warn!("device enumeration failed ({}), forcing card channels to full speed", e);
                false
            }
        };

        let table = self.profile.strategy == Strategy::Table;

        let cpu_temp = sensors::file_temperature(&self.cpu_temp_path, self.cpu.limits().critical);

        let sys_temp = if let Some(zone) = &self.system {
            let critical = zone.limits().critical;
            Some(match &self.profile.transport {
                TransportKind::Serial { .. } => {
                    sensors::board_temperature(self.transport.as_mut(), critical)
                }
                TransportKind::Ioctl { .. } => {
                    sensors::file_temperature(paths::SIO_SYS_TEMP_FILE, critical)
                }
            })
        } else {
            None
        };

        let cpu_power = if table {
            Some(sensors::cpu_power_milliwatts(
                self.transport.as_mut(),
                self.cpu.max_power(),
            ))
        } else {
            None
        };

        let mut cpu_demand = self.cpu.compute(cpu_temp, cpu_power);
        // Lookup chassis drive the CPU fan flat out once the chassis air
        // itself is hot; the table only covers package heat.
        if table {
            if let Some(sys_temp) = sys_temp {
                if sys_temp > thermal::MAINBOARD_CPU_GUARD {
                    cpu_demand = pwm::MAX;
                }
            }
        }

        let sys_demand = match (&mut self.system, sys_temp) {
            (Some(zone), Some(temp)) => Some(zone.compute(temp, None)),
            _ => None,
        };

        let mut card_demands = Vec::with_capacity(self.cards.len());
        for card in &mut self.cards {
            let critical = card.zone.limits().critical;
            let temp = sensors::card_temperature(self.inventory.as_ref(), card.card, critical);
            let power = if table {
                Some(sensors::card_power_deciwatts(
                    self.inventory.as_ref(),
                    card.card,
                    card.zone.max_power(),
                ))
            } else {
                None
            };
            card_demands.push((card.bus_id, card.zone.compute(temp, power)));
        }

        let mut commands: Vec<(usize, u8)> = Vec::new();
        let cpu_duty = aggregate(&[cpu_demand], &self.danger).unwrap_or(pwm::MAX);
        commands.push((CPU_CHANNEL, cpu_duty));
        if let Some(demand) = sys_demand {
            commands.push((
                SYSTEM_CHANNEL,
                aggregate(&[demand], &self.danger).unwrap_or(pwm::MAX),
            ));
        }

        let bus_ids = self.params.bus_ids();
        for (channel, demand) in plan_card_channels(&bus_ids, &card_demands) {
            let duty = if !inventory_ok && matches!(demand, ChannelDemand::Zones(_)) {
                pwm::MAX
            } else {
                resolve(&demand, cpu_duty, &self.danger)
            };
            commands.push((channel, duty));
        }

        self.apply(&commands);
    }

    fn apply(&mut self, commands: &[(usize, u8)]) {
        for &(channel, duty) in commands {
            if self.last_applied.get(&channel) == Some(&duty) {
                continue;
            }
            match self.transport.set_duty(channel, duty) {
                Ok(()) => {
                    info!("channel {} set to {}%", channel, duty);
                    self.last_applied.insert(channel, duty);
                }
                Err(e) => {
                    // Stale last_applied means the same target is retried
                    // on the next tick.
                    warn!("failed to set channel {} to {}%: {}", channel, duty, e);
                }
            }
        }
    }

    /// Release the hardware channel for manual operation.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Reopen the channel and resume from a cold state: every zone's
    /// controller state zeroed, the danger counter cleared, and all
    /// channels considered unknown. The physical fans may have been
    /// repositioned while the operator held the channel.
    pub fn restart(&mut self) -> Result<()> {
        self.transport.open()?;
        self.cpu.reset();
        if let Some(zone) = &mut self.system {
            zone.reset();
        }
        for card in &mut self.cards {
            card.zone.reset();
        }
        self.danger.reset();
        self.last_applied.clear();
        info!("control channel reopened, controller state reset");
        Ok(())
    }

    pub fn transport_is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn cpu_zone(&self) -> &Zone {
        &self.cpu
    }

    pub fn system_zone(&self) -> Option<&Zone> {
        self.system.as_ref()
    }

    pub fn cards(&self) -> &[CardZone] {
        &self.cards
    }

    pub fn danger(&self) -> &DangerCounter {
        &self.danger
    }

    pub fn last_applied(&self, channel: usize) -> Option<u8> {
        self.last_applied.get(&channel).copied()
    }
}
