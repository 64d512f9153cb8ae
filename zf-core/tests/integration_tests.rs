/*
 * Integration tests for zf-core
 *
 * These drive the control loop, mode machine, and config store through
 * the public API with purpose-built fakes for the hardware seams.
 */

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;

use zf_core::config::{DeploymentProfile, ParamsStore, SharedParams};
use zf_core::control::{ControlLoop, ModeMachine, ModeState};
use zf_core::hw::inventory::{CardId, DeviceInventory};
use zf_core::hw::transport::FanTransport;
use zf_core::{Result, ZonefanError};
use zf_protocol::{ControlParams, Strategy, TransportKind, CPU_CHANNEL, SYSTEM_CHANNEL};

// ============================================================================
// Fakes
// ============================================================================

/// Transport that records every duty command and answers queries from a
/// canned table.
#[derive(Clone, Default)]
struct FakeTransport {
    commands: Arc<Mutex<Vec<(usize, u8)>>>,
    responses: Arc<Mutex<HashMap<String, String>>>,
    open: Arc<Mutex<bool>>,
}

impl FakeTransport {
    fn new() -> Self {
        let transport = Self::default();
        *transport.open.lock().unwrap() = true;
        transport
    }

    fn respond(&self, cmd: &str, response: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(cmd.to_string(), response.to_string());
    }

    fn commands(&self) -> Vec<(usize, u8)> {
        self.commands.lock().unwrap().clone()
    }

    fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }

    fn last_for(&self, channel: usize) -> Option<u8> {
        self.commands()
            .iter()
            .rev()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, duty)| *duty)
    }
}

impl FanTransport for FakeTransport {
    fn open(&mut self) -> Result<()> {
        *self.open.lock().unwrap() = true;
        Ok(())
    }

    fn close(&mut self) {
        *self.open.lock().unwrap() = false;
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<()> {
        if !self.is_open() {
            return Err(ZonefanError::TransportNotOpen);
        }
        self.commands.lock().unwrap().push((channel, duty));
        Ok(())
    }

    fn query(&mut self, cmd: &str) -> Result<String> {
        self.responses
            .lock()
            .unwrap()
            .get(cmd)
            .cloned()
            .ok_or(ZonefanError::TransportNotOpen)
    }
}

/// Inventory with fixed cards and adjustable readings.
#[derive(Clone, Default)]
struct FakeInventory {
    cards: Arc<Mutex<HashMap<CardId, FakeCard>>>,
}

#[derive(Clone)]
struct FakeCard {
    product: String,
    bus_id: i32,
    temperature: i32,
    power_dw: i64,
}

impl FakeInventory {
    fn with_card(self, card: CardId, product: &str, bus_id: i32, temp: i32, power_dw: i64) -> Self {
        self.cards.lock().unwrap().insert(
            card,
            FakeCard {
                product: product.to_string(),
                bus_id,
                temperature: temp,
                power_dw,
            },
        );
        self
    }

    fn set_temperature(&self, card: CardId, temp: i32) {
        self.cards.lock().unwrap().get_mut(&card).unwrap().temperature = temp;
    }

    fn get(&self, card: CardId) -> Result<FakeCard> {
        self.cards
            .lock()
            .unwrap()
            .get(&card)
            .cloned()
            .ok_or(ZonefanError::UnknownCard(card))
    }
}

impl DeviceInventory for FakeInventory {
    fn list(&self) -> Result<Vec<CardId>> {
        let mut ids: Vec<CardId> = self.cards.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn product_type(&self, card: CardId) -> Result<String> {
        Ok(self.get(card)?.product)
    }

    fn temperature(&self, card: CardId) -> Result<i32> {
        Ok(self.get(card)?.temperature)
    }

    fn power_deciwatts(&self, card: CardId) -> Result<i64> {
        Ok(self.get(card)?.power_dw)
    }

    fn bus_id(&self, card: CardId) -> Result<i32> {
        Ok(self.get(card)?.bus_id)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn table_profile() -> DeploymentProfile {
    DeploymentProfile {
        strategy: Strategy::Table,
        transport: TransportKind::Serial { device: "/dev/fanctrl".to_string() },
        system_fan: true,
        target_step_offset: 0,
    }
}

fn pid_profile() -> DeploymentProfile {
    DeploymentProfile {
        strategy: Strategy::Pid,
        transport: TransportKind::Serial { device: "/dev/fanctrl".to_string() },
        system_fan: true,
        target_step_offset: 0,
    }
}

fn shared_params(bus_ids: Vec<i32>) -> Arc<SharedParams> {
    Arc::new(SharedParams::new(ControlParams {
        card_fan_bus_id_list: bus_ids,
        ..ControlParams::default()
    }))
}

fn cpu_temp_file(dir: &tempfile::TempDir, celsius: i32) -> PathBuf {
    let path = dir.path().join("cpu_temp");
    std::fs::write(&path, format!("{}\n", celsius * 1000)).unwrap();
    path
}

// ============================================================================
// Control pipeline
// ============================================================================

#[test]
fn table_pipeline_drives_all_channels() {
    let dir = tempfile::tempdir().unwrap();
    let cpu_temp = cpu_temp_file(&dir, 65);

    let transport = FakeTransport::new();
    transport.respond("!GTP", "$GTP=50C ok");
    transport.respond("#GPV", "#GPV P=10000 mW");

    // Two Standard cards sharing bus 7: one lightly loaded, one heavy.
    let inventory = FakeInventory::default()
        .with_card(0, "NPU-300V", 7, 58, 100)
        .with_card(1, "NPU-300V", 7, 58, 600);

    let mut driver = ControlLoop::new(
        Box::new(transport.clone()),
        Box::new(inventory),
        shared_params(vec![7]),
        table_profile(),
    )
    .unwrap()
    .with_cpu_temp_path(&cpu_temp);

    driver.tick();

    // CPU 65 C at Safe power, mainboard 50 C, shared card channel takes
    // the max of the two cards' table demands (Safe 45 vs Danger 70).
    assert_eq!(transport.last_for(CPU_CHANNEL), Some(50));
    assert_eq!(transport.last_for(SYSTEM_CHANNEL), Some(30));
    assert_eq!(transport.last_for(2), Some(70));
}

#[test]
fn table_pipeline_is_idempotent_across_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let cpu_temp = cpu_temp_file(&dir, 65);

    let transport = FakeTransport::new();
    transport.respond("!GTP", "$GTP=50C ok");
    transport.respond("#GPV", "#GPV P=10000 mW");

    let inventory = FakeInventory::default().with_card(0, "NPU-300V", 7, 58, 100);

    let mut driver = ControlLoop::new(
        Box::new(transport.clone()),
        Box::new(inventory),
        shared_params(vec![7]),
        table_profile(),
    )
    .unwrap()
    .with_cpu_temp_path(&cpu_temp);

    driver.tick();
    let first = transport.commands().len();
    assert!(first > 0);

    transport.clear_commands();
    driver.tick();
    assert!(transport.commands().is_empty());
}

#[test]
fn critical_card_propagates_to_shared_chassis_fans() {
    let dir = tempfile::tempdir().unwrap();
    let cpu_temp = cpu_temp_file(&dir, 65);

    let transport = FakeTransport::new();
    transport.respond("!GTP", "$GTP=50C ok");
    transport.respond("#GPV", "#GPV P=10000 mW");

    let inventory = FakeInventory::default().with_card(0, "NPU-300V", 7, 58, 100);

    let mut driver = ControlLoop::new(
        Box::new(transport.clone()),
        Box::new(inventory.clone()),
        shared_params(vec![7]),
        table_profile(),
    )
    .unwrap()
    .with_cpu_temp_path(&cpu_temp);

    driver.tick();
    assert_eq!(transport.last_for(CPU_CHANNEL), Some(50));

    // Card overheats: every zone-backed channel goes to full speed.
    inventory.set_temperature(0, 85);
    transport.clear_commands();
    driver.tick();
    assert_eq!(transport.last_for(CPU_CHANNEL), Some(100));
    assert_eq!(transport.last_for(SYSTEM_CHANNEL), Some(100));
    assert_eq!(transport.last_for(2), Some(100));
    assert!(driver.danger().is_raised());

    // Cooling below safe releases the override; demands resume.
    inventory.set_temperature(0, 70);
    transport.clear_commands();
    driver.tick();
    assert!(!driver.danger().is_raised());
    assert_eq!(transport.last_for(CPU_CHANNEL), Some(50));
}

// ============================================================================
// Mode arbitration
// ============================================================================

#[test]
#[serial]
fn manual_round_trip_resumes_cold() {
    let dir = tempfile::tempdir().unwrap();
    let cpu_temp = cpu_temp_file(&dir, 65);
    let marker = dir.path().join("released");

    let transport = FakeTransport::new();
    transport.respond("!GTP", "$GTP=65C ok");

    let inventory = FakeInventory::default().with_card(0, "NPU-300V", 7, 85, 100);

    let mut driver = ControlLoop::new(
        Box::new(transport.clone()),
        Box::new(inventory),
        shared_params(vec![7]),
        pid_profile(),
    )
    .unwrap()
    .with_cpu_temp_path(&cpu_temp);

    let mut machine = ModeMachine::with_marker(&marker);

    // One automatic tick latches the hot card.
    machine.step(true, &mut driver).unwrap();
    assert!(driver.danger().is_raised());

    // Operator takes the channel and hands it back within one interval.
    machine.step(false, &mut driver).unwrap();
    machine.step(false, &mut driver).unwrap();
    assert_eq!(machine.state(), ModeState::Manual);
    assert!(marker.exists());
    assert!(!driver.transport_is_open());

    machine.step(true, &mut driver).unwrap();
    machine.step(true, &mut driver).unwrap();
    assert_eq!(machine.state(), ModeState::Automatic);
    assert!(!marker.exists());
    assert!(driver.transport_is_open());

    // Cold start: zeroed PID state, no latches, no danger.
    assert!(!driver.danger().is_raised());
    assert!(!driver.cards()[0].zone.is_critical());
    assert_eq!(driver.cpu_zone().pid_state(), Some((0.0, 0.0)));
    assert_eq!(driver.cards()[0].zone.pid_state(), Some((0.0, 0.0)));
}

#[test]
fn manual_mode_blocks_transport_commands() {
    let mut transport = FakeTransport::new();
    transport.close();
    assert!(matches!(
        transport.set_duty(0, 50),
        Err(ZonefanError::TransportNotOpen)
    ));
}

// ============================================================================
// Config store
// ============================================================================

#[test]
fn params_file_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = ParamsStore::new(dir.path().join("params.json"));

    // First run creates the default record.
    let params = store.ensure().unwrap();
    assert!(params.mode);

    // The CLI flips the mode flag; the daemon's next poll sees it.
    let mut manual = params.clone();
    manual.mode = false;
    store.write(&manual).unwrap();

    let shared = SharedParams::new(params);
    assert!(shared.mode());
    shared.update(store.load().unwrap());
    assert!(!shared.mode());

    // Garbage is repaired to defaults rather than wedging the daemon.
    std::fs::write(store.path(), "]] nonsense [[").unwrap();
    let repaired = store.ensure().unwrap();
    assert_eq!(repaired, ControlParams::default());
}

#[test]
fn released_marker_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("released");

    // Marker published ahead of the wait: release observed immediately.
    std::fs::write(&marker, "42\n").unwrap();
    assert!(zf_core::await_channel_release(&marker));

    // Marker appearing mid-wait is also observed.
    let late_marker = dir.path().join("late");
    let publisher = {
        let late_marker = late_marker.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            std::fs::write(&late_marker, "42\n").unwrap();
        })
    };
    assert!(zf_core::await_channel_release(&late_marker));
    publisher.join().unwrap();
}
