//! Shared protocol definitions for Zonefan
//!
//! Everything the daemon and the manual CLI must agree on lives here:
//! the serial command grammar of the fan controller board, the SuperIO
//! ioctl register interface, and the on-disk control-params record the
//! two processes coordinate through.

use serde::{Deserialize, Serialize};

use zf_error::{Result, ZonefanError};

pub mod serial;
pub mod sio;

/// Maximum serial response size the controller board produces
pub const MAX_RESPONSE_SIZE: usize = 1024;

/// Fan channel assignment on the controller board.
///
/// Channel 0 drives the CPU fan, channel 1 the system (mainboard) fan,
/// channels 2 and up the accelerator-card fans. Card channels are mapped
/// to PCIe bus ids through [`ControlParams::card_fan_bus_id_list`].
pub const CPU_CHANNEL: usize = 0;
pub const SYSTEM_CHANNEL: usize = 1;
pub const FIRST_CARD_CHANNEL: usize = 2;

/// Bus-id sentinel: no card sits behind this fan; park it at a low duty.
pub const BUS_ID_UNPOPULATED: i32 = -1;

/// Bus-id sentinel: this fan mirrors whatever duty the CPU fan runs at.
pub const BUS_ID_MIRROR_CPU: i32 = -2;

/// Validate a duty cycle percentage (0-100)
pub fn validate_duty(value: i64) -> Result<u8> {
    if (0..=100).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ZonefanError::InvalidDuty { value })
    }
}

// ============================================================================
// Control-params record
// ============================================================================

/// Controller strategy selected by the deployment profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Continuous PID control with anti-windup and critical override
    #[default]
    Pid,
    /// Discrete lookup-table control bucketed by temperature and power band
    Table,
}

/// Transport selected by the deployment profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// Textual command channel over a serial line
    Serial { device: String },
    /// SuperIO control-register interface
    Ioctl { device: String },
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Serial {
            device: "/dev/fanctrl".to_string(),
        }
    }
}

/// The persisted control-params record, polled by the daemon at ~1 Hz and
/// rewritten by the CLI when the operator switches modes.
///
/// The record is replaced wholesale on every poll; there is no partial
/// merge. `mode == true` means automatic (the daemon owns the channel),
/// `mode == false` means manual (the CLI owns it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlParams {
    pub mode: bool,
    pub card_fan_bus_id_list: Vec<i32>,

    /// Deployment profile fields, read once at daemon startup.
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_system_fan")]
    pub system_fan: bool,
    /// Offset added to the stepped-down accelerator target temperature.
    /// The fleet runs either 0 or 5 depending on the chassis generation.
    #[serde(default)]
    pub target_step_offset: u8,
}

fn default_system_fan() -> bool {
    true
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            mode: true,
            card_fan_bus_id_list: vec![1, 2],
            strategy: Strategy::default(),
            transport: TransportKind::default(),
            system_fan: true,
            target_step_offset: 0,
        }
    }
}

impl ControlParams {
    /// Parse and validate a params document.
    ///
    /// A record that deserializes but carries nonsense values is rejected
    /// so the store can fall back to regenerating the default file.
    pub fn from_json(text: &str) -> Result<Self> {
        let params: ControlParams = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.card_fan_bus_id_list.len() > 8 {
            return Err(ZonefanError::InvalidConfig {
                field: "card_fan_bus_id_list".to_string(),
                reason: format!(
                    "{} entries exceeds the 8 card-fan channels",
                    self.card_fan_bus_id_list.len()
                ),
            });
        }
        for &bus_id in &self.card_fan_bus_id_list {
            if bus_id < BUS_ID_MIRROR_CPU {
                return Err(ZonefanError::InvalidConfig {
                    field: "card_fan_bus_id_list".to_string(),
                    reason: format!("invalid bus id {}", bus_id),
                });
            }
        }
        if self.target_step_offset > 9 {
            return Err(ZonefanError::InvalidConfig {
                field: "target_step_offset".to_string(),
                reason: format!("{} would raise the target past the next step", self.target_step_offset),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_round_trip() {
        let params = ControlParams::default();
        let json = params.to_json().unwrap();
        let parsed = ControlParams::from_json(&json).unwrap();
        assert_eq!(parsed, params);
        assert!(parsed.mode);
        assert_eq!(parsed.card_fan_bus_id_list, vec![1, 2]);
    }

    #[test]
    fn minimal_document_fills_profile_defaults() {
        let parsed =
            ControlParams::from_json(r#"{ "mode": false, "card_fan_bus_id_list": [3] }"#).unwrap();
        assert!(!parsed.mode);
        assert_eq!(parsed.strategy, Strategy::Pid);
        assert!(parsed.system_fan);
        assert_eq!(parsed.target_step_offset, 0);
        assert_eq!(
            parsed.transport,
            TransportKind::Serial { device: "/dev/fanctrl".to_string() }
        );
    }

    #[test]
    fn rejects_oversized_bus_list() {
        let params = ControlParams {
            card_fan_bus_id_list: vec![0; 9],
            ..ControlParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_unknown_sentinel() {
        let params = ControlParams {
            card_fan_bus_id_list: vec![-3],
            ..ControlParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_duty_bounds() {
        assert_eq!(validate_duty(0).unwrap(), 0);
        assert_eq!(validate_duty(100).unwrap(), 100);
        assert!(validate_duty(101).is_err());
        assert!(validate_duty(-1).is_err());
    }
}
