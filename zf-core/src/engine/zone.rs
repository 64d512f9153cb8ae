//! Per-zone control
//!
//! A zone is one thermally monitored subsystem: the CPU package, the
//! mainboard, or one accelerator card. Zone kinds are a tagged variant
//! dispatched through a single `compute` path, so the control loop never
//! cares which kind (or which strategy) it is driving.
//!
//! Critical override: crossing the critical threshold latches the zone
//! at full speed until it cools below the safe threshold, at which point
//! the controller state is zeroed and regulation restarts cold.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::constants::{pwm, thermal, tuning};
use crate::engine::aggregate::DangerCounter;
use crate::engine::pid::PidController;
use crate::engine::table::{self, PowerBand};
use crate::hw::inventory::ProductType;

/// Stable zone identifier. Accelerator zones use their card id, which
/// also weights their danger-counter contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneId(pub usize);

/// What kind of subsystem a zone monitors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneKind {
    Cpu,
    System,
    Accelerator { product: ProductType },
}

/// Thermal thresholds for one zone
#[derive(Debug, Clone, Copy)]
pub struct ThermalLimits {
    pub target: i32,
    pub safe: i32,
    pub critical: i32,
    pub min_target: i32,
}

impl ThermalLimits {
    /// Limits used by every zone on serial-controller chassis
    pub fn serial_default() -> Self {
        Self {
            target: thermal::TARGET,
            safe: thermal::SAFE,
            critical: thermal::CRITICAL,
            min_target: thermal::CARD_MIN_TARGET,
        }
    }

    /// SuperIO chassis run the system zone against tighter limits
    pub fn sio_system() -> Self {
        Self {
            target: thermal::SIO_SYS_TARGET,
            safe: thermal::SIO_SYS_SAFE,
            critical: thermal::SIO_SYS_CRITICAL,
            min_target: thermal::SIO_SYS_TARGET,
        }
    }

    /// SuperIO chassis tolerate slightly hotter accelerator silicon
    pub fn sio_card() -> Self {
        Self {
            critical: thermal::SIO_CARD_CRITICAL,
            ..Self::serial_default()
        }
    }
}

/// Gains plus thresholds selected at zone construction
#[derive(Debug, Clone)]
pub struct ZoneTuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub limits: ThermalLimits,
    /// Offset added to the stepped-down accelerator target
    pub step_offset: u8,
    /// Power ceiling for the lookup strategy's banding
    pub max_power: i64,
}

impl ZoneTuning {
    pub fn cpu(limits: ThermalLimits) -> Self {
        Self {
            kp: tuning::CPU_KP,
            ki: tuning::CPU_KI,
            kd: tuning::CPU_KD,
            limits,
            step_offset: 0,
            max_power: tuning::CPU_MAX_POWER_MW,
        }
    }

    pub fn system(limits: ThermalLimits) -> Self {
        Self {
            kp: tuning::SYS_KP,
            ki: tuning::SYS_KI,
            kd: tuning::SYS_KD,
            limits,
            step_offset: 0,
            max_power: 0,
        }
    }

    pub fn accelerator(product: ProductType, limits: ThermalLimits, step_offset: u8) -> Self {
        Self {
            kp: tuning::ACCEL_KP,
            ki: tuning::ACCEL_KI,
            kd: tuning::ACCEL_KD,
            limits,
            step_offset,
            max_power: product.max_power_deciwatts(),
        }
    }
}

/// Which control strategy the zone runs
#[derive(Debug, Clone)]
enum ZoneStrategy {
    Pid(PidController),
    Table,
}

/// One controlled zone with its continuous state
#[derive(Debug, Clone)]
pub struct Zone {
    id: ZoneId,
    kind: ZoneKind,
    tuning: ZoneTuning,
    strategy: ZoneStrategy,
    critical: bool,
    last_temp: i32,
    last_sample: Instant,
    danger: Arc<DangerCounter>,
}

impl Zone {
    pub fn pid(id: ZoneId, kind: ZoneKind, tuning: ZoneTuning, danger: Arc<DangerCounter>) -> Self {
        let pid = PidController::new(tuning.kp, tuning.ki, tuning.kd);
        Self {
            id,
            kind,
            tuning,
            strategy: ZoneStrategy::Pid(pid),
            critical: false,
            last_temp: 0,
            last_sample: Instant::now(),
            danger,
        }
    }

    pub fn table(id: ZoneId, kind: ZoneKind, tuning: ZoneTuning, danger: Arc<DangerCounter>) -> Self {
        Self {
            id,
            kind,
            tuning,
            strategy: ZoneStrategy::Table,
            critical: false,
            last_temp: 0,
            last_sample: Instant::now(),
            danger,
        }
    }

    pub fn id(&self) -> ZoneId {
        self.id
    }

    pub fn kind(&self) -> &ZoneKind {
        &self.kind
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn last_temp(&self) -> i32 {
        self.last_temp
    }

    pub fn limits(&self) -> ThermalLimits {
        self.tuning.limits
    }

    pub fn max_power(&self) -> i64 {
        self.tuning.max_power
    }

    /// Compute this zone's duty demand for the current reading.
    ///
    /// `power` feeds the lookup strategy's band selection and is ignored
    /// by the PID strategy.
    pub fn compute(&mut self, temp: i32, power: Option<i64>) -> u8 {
        self.last_temp = temp;

        if self.critical {
            if temp < self.tuning.limits.safe {
                info!("zone {} cooled to {} C, leaving critical state", self.id.0, temp);
                self.leave_critical();
            } else {
                return pwm::MAX;
            }
        } else if temp > self.tuning.limits.critical {
            warn!(
                "zone {} at {} C exceeds critical {} C, forcing full speed",
                self.id.0, temp, self.tuning.limits.critical
            );
            self.critical = true;
            if matches!(self.kind, ZoneKind::Accelerator { .. }) {
                self.danger.raise(self.id);
            }
            return pwm::MAX;
        }

        match &mut self.strategy {
            ZoneStrategy::Pid(pid) => {
                let target = effective_target(&self.kind, &self.tuning, temp);
                let now = Instant::now();
                let dt = now.duration_since(self.last_sample).as_secs_f64();
                self.last_sample = now;
                pid.step((temp - target) as f64, dt)
            }
            ZoneStrategy::Table => {
                let band = power
                    .map(|p| PowerBand::classify(p, self.tuning.max_power))
                    .unwrap_or(PowerBand::Danger);
                match &self.kind {
                    ZoneKind::Cpu => table::cpu_duty(temp, band),
                    ZoneKind::System => table::system_duty(temp),
                    ZoneKind::Accelerator { product } => {
                        table::accelerator_duty(*product, temp, band)
                    }
                }
            }
        }
    }

    fn leave_critical(&mut self) {
        self.critical = false;
        if matches!(self.kind, ZoneKind::Accelerator { .. }) {
            self.danger.release(self.id);
        }
        if let ZoneStrategy::Pid(pid) = &mut self.strategy {
            pid.reset();
        }
        self.last_sample = Instant::now();
    }

    /// Zero all controller state without touching the danger counter.
    ///
    /// Used when the control channel restarts: the counter is reset once
    /// by the owner, not per zone, so partially-critical zones cannot
    /// double-release.
    pub fn reset(&mut self) {
        self.critical = false;
        if let ZoneStrategy::Pid(pid) = &mut self.strategy {
            pid.reset();
        }
        self.last_sample = Instant::now();
        self.last_temp = 0;
    }

    /// Controller state snapshot, for tests and diagnostics.
    pub fn pid_state(&self) -> Option<(f64, f64)> {
        match &self.strategy {
            ZoneStrategy::Pid(pid) => Some((pid.integral(), pid.prev_error())),
            ZoneStrategy::Table => None,
        }
    }
}

/// Accelerator zones regulate against a lowered target while the card is
/// below its nominal target: the target steps down in 10-degree
/// increments (plus the configured offset), floored at the minimum. This
/// decelerates the fan gently as the card cools instead of dropping
/// straight to minimum duty.
fn effective_target(kind: &ZoneKind, tuning: &ZoneTuning, temp: i32) -> i32 {
    if !matches!(kind, ZoneKind::Accelerator { .. }) {
        return tuning.limits.target;
    }
    if temp < tuning.limits.min_target {
        tuning.limits.min_target
    } else if temp < tuning.limits.target {
        ((temp / 10) * 10 + tuning.step_offset as i32).max(tuning.limits.min_target)
    } else {
        tuning.limits.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accel_zone(step_offset: u8) -> (Zone, Arc<DangerCounter>) {
        let danger = Arc::new(DangerCounter::new());
        let zone = Zone::pid(
            ZoneId(0),
            ZoneKind::Accelerator { product: ProductType::Standard },
            ZoneTuning::accelerator(
                ProductType::Standard,
                ThermalLimits::serial_default(),
                step_offset,
            ),
            danger.clone(),
        );
        (zone, danger)
    }

    fn cpu_zone() -> Zone {
        let danger = Arc::new(DangerCounter::new());
        Zone::pid(
            ZoneId(0),
            ZoneKind::Cpu,
            ZoneTuning::cpu(ThermalLimits::serial_default()),
            danger,
        )
    }

    #[test]
    fn critical_latches_until_safe() {
        let mut zone = cpu_zone();
        assert_eq!(zone.compute(85, None), 100);
        assert!(zone.is_critical());
        // Still above safe: stays pinned even though the reading dropped
        assert_eq!(zone.compute(78, None), 100);
        assert_eq!(zone.compute(76, None), 100);
        assert!(zone.is_critical());
    }

    #[test]
    fn leaving_critical_resets_controller_state() {
        let mut zone = cpu_zone();
        // Accumulate some integral first
        zone.compute(70, None);
        zone.compute(72, None);
        zone.compute(85, None);
        assert!(zone.is_critical());

        // Cooling below safe clears the latch and computes from zero:
        // prev_error must equal this call's error, with no carry-over.
        let duty = zone.compute(74, None);
        assert!(!zone.is_critical());
        assert!(duty >= pwm::MIN && duty <= pwm::MAX);
        let (_, prev_error) = zone.pid_state().unwrap();
        assert_eq!(prev_error, (74 - thermal::TARGET) as f64);
    }

    #[test]
    fn accelerator_critical_raises_and_releases_danger() {
        let (mut zone, danger) = accel_zone(0);
        assert!(!danger.is_raised());
        zone.compute(85, None);
        assert!(danger.is_raised());
        assert_eq!(danger.value(), 1);
        // Latched ticks do not double-raise
        zone.compute(90, None);
        assert_eq!(danger.value(), 1);
        zone.compute(70, None);
        assert!(!danger.is_raised());
    }

    #[test]
    fn accelerator_target_steps_down_as_card_cools() {
        let tuning = ZoneTuning::accelerator(
            ProductType::Standard,
            ThermalLimits::serial_default(),
            0,
        );
        let kind = ZoneKind::Accelerator { product: ProductType::Standard };
        // At or above nominal: regulate against nominal
        assert_eq!(effective_target(&kind, &tuning, 70), 65);
        assert_eq!(effective_target(&kind, &tuning, 65), 65);
        // Between minimum and nominal: step down in 10-degree increments
        assert_eq!(effective_target(&kind, &tuning, 63), 60);
        assert_eq!(effective_target(&kind, &tuning, 58), 50);
        assert_eq!(effective_target(&kind, &tuning, 52), 50);
        // Below the floor
        assert_eq!(effective_target(&kind, &tuning, 45), 50);
    }

    #[test]
    fn step_offset_raises_the_lowered_target() {
        let tuning = ZoneTuning::accelerator(
            ProductType::Standard,
            ThermalLimits::serial_default(),
            5,
        );
        let kind = ZoneKind::Accelerator { product: ProductType::Standard };
        assert_eq!(effective_target(&kind, &tuning, 63), 65);
        assert_eq!(effective_target(&kind, &tuning, 58), 55);
        assert_eq!(effective_target(&kind, &tuning, 52), 55);
    }

    #[test]
    fn cpu_target_is_fixed() {
        let tuning = ZoneTuning::cpu(ThermalLimits::serial_default());
        assert_eq!(effective_target(&ZoneKind::Cpu, &tuning, 40), 65);
        assert_eq!(effective_target(&ZoneKind::Cpu, &tuning, 80), 65);
    }

    #[test]
    fn reset_clears_critical_without_releasing_danger() {
        let (mut zone, danger) = accel_zone(0);
        zone.compute(85, None);
        assert!(danger.is_raised());
        zone.reset();
        assert!(!zone.is_critical());
        // The restart path resets the counter itself, exactly once.
        assert!(danger.is_raised());
        danger.reset();
        assert!(!danger.is_raised());
    }

    #[test]
    fn table_zone_uses_power_band() {
        let danger = Arc::new(DangerCounter::new());
        let mut zone = Zone::table(
            ZoneId(1),
            ZoneKind::Accelerator { product: ProductType::Standard },
            ZoneTuning::accelerator(
                ProductType::Standard,
                ThermalLimits::serial_default(),
                0,
            ),
            danger,
        );
        // 58 C -> bucket 12; Safe vs Danger columns differ
        let low = zone.compute(58, Some(100));
        let high = zone.compute(58, Some(700));
        assert!(low < high);
        // Missing power reading biases to the Danger column
        let missing = zone.compute(58, None);
        assert_eq!(missing, high);
    }

    #[test]
    fn table_zone_latches_critical_too() {
        let danger = Arc::new(DangerCounter::new());
        let mut zone = Zone::table(
            ZoneId(0),
            ZoneKind::System,
            ZoneTuning::system(ThermalLimits::serial_default()),
            danger,
        );
        assert_eq!(zone.compute(85, None), 100);
        assert_eq!(zone.compute(77, None), 100);
        let duty = zone.compute(60, None);
        assert_eq!(duty, table::system_duty(60));
    }
}
