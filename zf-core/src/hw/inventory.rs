//! Accelerator device inventory
//!
//! The control loop only needs a handful of facts per card: identity,
//! product type, temperature, power draw, and PCIe bus location. The
//! [`DeviceInventory`] trait is that seam; the shipped implementation
//! enumerates hwmon chips registered by the accelerator driver.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use zf_error::{Result, ZonefanError};

use crate::constants::{paths, power, tuning};

#[cfg(test)]
use mockall::automock;

/// Inventory-assigned card identifier, stable for the process lifetime
pub type CardId = i32;

/// Accelerator product families, selected from the inventory's product
/// string at zone construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductType {
    /// Single-die inference card
    Standard,
    /// Higher-clocked single-die card
    Pro,
    /// Dual-die card with twice the power ceiling
    Duo,
}

impl ProductType {
    /// Classify a product string. Unknown products fall back to
    /// `Standard`, which carries the most conservative power ceiling.
    pub fn from_product_string(product: &str) -> Self {
        if product.contains("Duo") {
            ProductType::Duo
        } else if product.contains("Pro") {
            ProductType::Pro
        } else {
            ProductType::Standard
        }
    }

    /// Power ceiling in deciwatts, for lookup-table banding.
    pub fn max_power_deciwatts(&self) -> i64 {
        match self {
            ProductType::Standard => tuning::STANDARD_MAX_POWER_DW,
            ProductType::Pro => tuning::PRO_MAX_POWER_DW,
            ProductType::Duo => tuning::DUO_MAX_POWER_DW,
        }
    }
}

/// Reject the driver's "reading unavailable" sentinels.
///
/// The management controller reports `0x7FFD`/`0x7FFF` when the power
/// rail cannot be sampled; treating those as watts would park the fans.
pub fn check_power_sentinel(raw: i32) -> Result<i64> {
    if power::UNAVAILABLE_SENTINELS.contains(&raw) {
        Err(ZonefanError::PowerUnavailable { raw })
    } else {
        Ok(raw as i64)
    }
}

/// Provider of accelerator telemetry
#[cfg_attr(test, automock)]
pub trait DeviceInventory: Send {
    /// Enumerate the cards present in the system.
    fn list(&self) -> Result<Vec<CardId>>;

    fn product_type(&self, card: CardId) -> Result<String>;

    /// Hottest die temperature in degrees Celsius. Dual-die cards report
    /// the maximum across dies.
    fn temperature(&self, card: CardId) -> Result<i32>;

    /// Card power draw in deciwatts, sentinel-checked.
    fn power_deciwatts(&self, card: CardId) -> Result<i64>;

    /// PCIe bus number, matched against the configured channel mapping.
    fn bus_id(&self, card: CardId) -> Result<i32>;
}

// ============================================================================
// hwmon-backed implementation
// ============================================================================

/// Inventory backed by the accelerator driver's hwmon registration.
///
/// Cards appear as hwmon chips whose `name` attribute starts with one of
/// the known driver prefixes; temperature and power come from the
/// standard `tempN_input` / `power1_input` attributes and the bus id
/// from the chip's device symlink.
pub struct HwmonInventory {
    base: PathBuf,
    driver_prefixes: Vec<String>,
}

struct CardDir {
    dir: PathBuf,
    name: String,
}

impl HwmonInventory {
    pub fn new() -> Self {
        Self::with_base(paths::HWMON_BASE)
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            driver_prefixes: vec!["npu".to_string(), "accel".to_string()],
        }
    }

    fn scan(&self) -> Result<Vec<CardDir>> {
        let mut cards = Vec::new();
        let entries = fs::read_dir(&self.base).map_err(|e| {
            ZonefanError::Inventory(format!("cannot scan {:?}: {}", self.base, e))
        })?;
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(name) = read_trimmed(dir.join("name")) else {
                continue;
            };
            if self.driver_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                debug!("inventory: accelerator chip {} at {:?}", name, dir);
                cards.push(CardDir { dir, name });
            }
        }
        // Directory iteration order is not stable; card ids must be.
        cards.sort_by(|a, b| a.dir.cmp(&b.dir));
        Ok(cards)
    }

    fn card_dir(&self, card: CardId) -> Result<CardDir> {
        self.scan()?
            .into_iter()
            .nth(card as usize)
            .ok_or(ZonefanError::UnknownCard(card))
    }
}

impl Default for HwmonInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceInventory for HwmonInventory {
    fn list(&self) -> Result<Vec<CardId>> {
        Ok((0..self.scan()?.len() as i32).collect())
    }

    fn product_type(&self, card: CardId) -> Result<String> {
        let entry = self.card_dir(card)?;
        // Prefer the device's product attribute; fall back to the chip name.
        match read_trimmed(entry.dir.join("device").join("product")) {
            Ok(product) => Ok(product),
            Err(_) => Ok(entry.name),
        }
    }

    fn temperature(&self, card: CardId) -> Result<i32> {
        let entry = self.card_dir(card)?;
        let mut hottest: Option<i32> = None;
        for index in 1..=8 {
            let path = entry.dir.join(format!("temp{}_input", index));
            if !path.exists() {
                break;
            }
            let millidegrees: i32 = read_trimmed(&path)?.parse().map_err(|_| {
                ZonefanError::TemperatureRead {
                    zone: format!("card {}", card),
                    reason: format!("unparsable value in {:?}", path),
                }
            })?;
            let celsius = millidegrees / 1000;
            hottest = Some(hottest.map_or(celsius, |t| t.max(celsius)));
        }
        hottest.ok_or_else(|| ZonefanError::TemperatureRead {
            zone: format!("card {}", card),
            reason: "no temperature channels".to_string(),
        })
    }

    fn power_deciwatts(&self, card: CardId) -> Result<i64> {
        let entry = self.card_dir(card)?;
        let path = entry.dir.join("power1_input");
        let microwatts: i64 = read_trimmed(&path)?.parse().map_err(|_| {
            ZonefanError::Inventory(format!("unparsable power in {:?}", path))
        })?;
        // The raw register value surfaces sentinels untranslated.
        if microwatts <= i32::MAX as i64 {
            check_power_sentinel(microwatts as i32)?;
        }
        Ok(microwatts / 100_000)
    }

    fn bus_id(&self, card: CardId) -> Result<i32> {
        let entry = self.card_dir(card)?;
        let device = fs::canonicalize(entry.dir.join("device")).map_err(|e| {
            ZonefanError::Inventory(format!("cannot resolve device link for card {}: {}", card, e))
        })?;
        parse_pci_bus(&device).ok_or_else(|| {
            ZonefanError::Inventory(format!("no PCI address in {:?}", device))
        })
    }
}

/// Extract the bus number from a sysfs device path ending in a PCI
/// address (`.../0000:3b:00.0` -> `0x3b`).
fn parse_pci_bus(device: &Path) -> Option<i32> {
    let name = device.file_name()?.to_str()?;
    let mut parts = name.split(':');
    let _domain = parts.next()?;
    let bus = parts.next()?;
    i32::from_str_radix(bus, 16).ok()
}

fn read_trimmed(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| ZonefanError::FileRead {
            path: path.to_path_buf(),
            source,
        })
}
