//! Zonefan manual CLI (zonefanctl)
//!
//! One-shot commands against the fan hardware and the shared params
//! record. Commands that touch the device first flip the record to
//! manual mode and wait for the daemon to confirm it has released the
//! channel (released-marker handshake, bounded by a fixed fallback
//! delay), so the two processes never hold the channel together.
//!
//! Exit code is 0 on success and -1 on any validation or I/O failure.

use std::process;

use anyhow::{anyhow, Context, Result};
use regex::Regex;

use zf_core::config::ParamsStore;
use zf_core::constants::{paths, timing};
use zf_core::control::await_channel_release;
use zf_core::hw::inventory::{DeviceInventory, HwmonInventory};
use zf_core::hw::{FanTransport, IoctlTransport, SerialTransport};
use zf_protocol::serial::{QUERY_BOARD_TEMP, QUERY_CPU_POWER, QUERY_FAN_SPEED};
use zf_protocol::{
    validate_duty, ControlParams, TransportKind, CPU_CHANNEL, FIRST_CARD_CHANNEL, SYSTEM_CHANNEL,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("Get devices temperature: zonefanctl -t");
    println!("Get devices power: zonefanctl -p");
    println!("Set PWM: zonefanctl -s <device_name> <PWM>, supported device_name: cpu, sysFan, AI_CARD1 .. AI_CARD9, example: zonefanctl -s cpu 10");
    println!("Get AI_CARDX --- bus_id list: zonefanctl -l");
    println!("Set auto mode: zonefanctl -a");
    println!("Get version information: zonefanctl -v");
    println!("Get cpu fan speed: zonefanctl -r");
}

/// Flip the record to manual mode if the daemon currently owns the
/// channel, then wait for the daemon to confirm the release.
fn ensure_manual(store: &ParamsStore) -> Result<ControlParams> {
    let mut params = store
        .load()
        .with_context(|| format!("cannot read params file {:?}", store.path()))?;
    if params.mode {
        params.mode = false;
        store.write(&params).context("cannot update params file")?;
        // Wait for the daemon to close its side; an absent marker means
        // an older daemon (or none), in which case the full wait doubles
        // as the legacy fixed delay.
        if !await_channel_release(paths::RELEASED_MARKER) {
            std::thread::sleep(timing::MODE_POLL);
        }
    }
    Ok(params)
}

fn open_transport(params: &ControlParams) -> Result<Box<dyn FanTransport>> {
    let mut transport: Box<dyn FanTransport> = match &params.transport {
        TransportKind::Serial { device } => {
            Box::new(SerialTransport::new(device, timing::SETTLE_CLI))
        }
        TransportKind::Ioctl { device } => Box::new(IoctlTransport::new(device)),
    };
    transport.open().context("cannot open the control device")?;
    Ok(transport)
}

fn get_temperatures(transport: &mut dyn FanTransport) -> Result<()> {
    let cpu_temp = std::fs::read_to_string(paths::CPU_TEMP_FILE)
        .ok()
        .and_then(|content| content.trim().parse::<f32>().ok())
        .map(|millidegrees| millidegrees / 1000.0);
    match cpu_temp {
        Some(temp) => println!("CPU Temperature: {:.1} C\n", temp),
        None => eprintln!("[ERROR] Failed to read the CPU temperature file."),
    }

    match transport.query(QUERY_BOARD_TEMP) {
        Ok(response) => println!("Mainboard Temperature: {}", response),
        Err(e) => eprintln!("[ERROR] Failed to get mainboard temperature: {}", e),
    }

    let inventory = HwmonInventory::new();
    let cards = inventory
        .list()
        .context("failed to obtain the accelerator card list")?;
    for card in cards {
        let product = inventory
            .product_type(card)
            .unwrap_or_else(|_| "unknown".to_string());
        match inventory.temperature(card) {
            Ok(temp) => println!("{} (card_id: {}) Temperature: {} C\n", product, card, temp),
            Err(e) => eprintln!("[ERROR] Failed to obtain {} temperature: {}", product, e),
        }
    }

    Ok(())
}

fn get_powers(transport: &mut dyn FanTransport) -> Result<()> {
    match transport.query(QUERY_CPU_POWER) {
        Ok(response) => println!("CPU Power:\n{}", response),
        Err(e) => eprintln!("[ERROR] Failed to get CPU power: {}", e),
    }

    let inventory = HwmonInventory::new();
    let cards = inventory
        .list()
        .context("failed to obtain the accelerator card list")?;
    for card in cards {
        let product = inventory
            .product_type(card)
            .unwrap_or_else(|_| "unknown".to_string());
        match inventory.power_deciwatts(card) {
            Ok(deciwatts) => {
                println!("{} (card_id: {}) Power: {:.1} W\n", product, card, deciwatts as f64 / 10.0)
            }
            Err(e) => eprintln!("[ERROR] Failed to obtain {} power: {}", product, e),
        }
    }

    Ok(())
}

fn set_fan(transport: &mut dyn FanTransport, device: &str, value: &str) -> Result<()> {
    let duty = value
        .parse::<i64>()
        .map_err(|_| anyhow!("The input fan PWM duty cycle contains illegal characters. Please enter numbers 0-100."))
        .and_then(|raw| {
            validate_duty(raw).map_err(|_| {
                anyhow!("The entered fan PWM duty cycle is invalid. Please enter a value ranging from 0 to 100.")
            })
        })?;

    let card_pattern = Regex::new(r"^AI_CARD([1-9])$").expect("static pattern");
    let channel = if device == "cpu" {
        CPU_CHANNEL
    } else if device == "sysFan" {
        SYSTEM_CHANNEL
    } else if let Some(captures) = card_pattern.captures(device) {
        let index: usize = captures[1].parse().expect("single digit");
        FIRST_CARD_CHANNEL + index - 1
    } else {
        return Err(anyhow!(
            "The device name is invalid. Supported input: cpu, sysFan, AI_CARD1 .. AI_CARD9."
        ));
    };

    transport
        .set_duty(channel, duty)
        .with_context(|| format!("failed to set {} duty", device))?;
    println!("Set PWM success");
    Ok(())
}

fn get_card_fan_list(store: &ParamsStore) -> Result<()> {
    let params = store
        .load()
        .with_context(|| format!("cannot read params file {:?}", store.path()))?;
    for (index, bus_id) in params.card_fan_bus_id_list.iter().enumerate() {
        println!("AI_CARD{} ----- bus_id: {}", index + 1, bus_id);
    }
    Ok(())
}

fn set_auto(store: &ParamsStore) -> Result<()> {
    let mut params = store
        .load()
        .with_context(|| format!("cannot read params file {:?}", store.path()))?;
    params.mode = true;
    store.write(&params).context("cannot update params file")?;
    println!("Set automatic mode success!");
    Ok(())
}

fn get_fan_speed(transport: &mut dyn FanTransport) -> Result<()> {
    let response = transport
        .query(QUERY_FAN_SPEED)
        .context("failed to get CPU fan speed")?;
    println!("{}", response);
    Ok(())
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Err(anyhow!(
            "Parameters are too few, please enter zonefanctl -h to view the format!"
        ));
    }

    let store = ParamsStore::new(paths::PARAMS_FILE);

    match args[1].as_str() {
        "-h" => {
            print_help();
            Ok(())
        }
        "-v" => {
            println!("zonefanctl {}", VERSION);
            Ok(())
        }
        "-l" => get_card_fan_list(&store),
        "-a" => set_auto(&store),
        "-t" => {
            let params = ensure_manual(&store)?;
            let mut transport = open_transport(&params)?;
            get_temperatures(transport.as_mut())
        }
        "-p" => {
            let params = ensure_manual(&store)?;
            let mut transport = open_transport(&params)?;
            get_powers(transport.as_mut())
        }
        "-r" => {
            let params = ensure_manual(&store)?;
            let mut transport = open_transport(&params)?;
            get_fan_speed(transport.as_mut())
        }
        "-s" => {
            if args.len() < 4 {
                return Err(anyhow!(
                    "Parameters are too few: zonefanctl -s <device_name> <PWM>, device_name: cpu, sysFan, AI_CARD1 .. AI_CARD9"
                ));
            }
            let params = ensure_manual(&store)?;
            let mut transport = open_transport(&params)?;
            set_fan(transport.as_mut(), &args[2], &args[3])
        }
        _ => Err(anyhow!(
            "First param error, supported type: -h(help), -l(card fan list), -t(temperature), -p(power), -s(set PWM), -a(auto mode), -r(fan speed), -v(version)!"
        )),
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("[ERROR] {:#}", e);
        process::exit(-1);
    }
}
