//! Solar Modbus Demo
//!
//! Connects to an inverter, refreshes the whole plant and prints every field.
//!
//! Usage: `demo [HOST] [PORT] [UNIT_ID]` or `demo --config plant.json`

use solar_modbus::utils::format::format_metrics;
use solar_modbus::{ClientConfig, DeviceSnapshot, ModbusResult, PlantClient};

fn parse_args() -> ModbusResult<ClientConfig> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("--config") {
        let path = args
            .get(1)
            .ok_or_else(|| solar_modbus::ModbusError::configuration("--config needs a path"))?;
        return ClientConfig::from_json_file(path);
    }

    let mut config = ClientConfig::default();
    if let Some(host) = args.first() {
        config.host = host.clone();
    }
    if let Some(port) = args.get(1) {
        config.port = port
            .parse()
            .map_err(|e| solar_modbus::ModbusError::configuration(format!("Invalid port: {}", e)))?;
    }
    if let Some(unit) = args.get(2) {
        let parsed = match unit.strip_prefix("0x") {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => unit.parse(),
        };
        config.unit_id = parsed.map_err(|e| solar_modbus::ModbusError::configuration(format!("Invalid unit id: {}", e)))?;
    }
    config.validate()?;
    Ok(config)
}

fn print_snapshot(title: &str, snapshot: &DeviceSnapshot) {
    println!("\n📊 {} ({}, serial {:?})", title, snapshot.model, snapshot.serial_number);
    println!("   refreshed at {}", snapshot.last_refreshed_at);
    for field in snapshot.fields() {
        println!("   {}", field);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("🚀 Solar Modbus Demo");
    println!("====================");
    println!("{}", solar_modbus::info());

    let config = parse_args()?;
    println!("Connecting to {}:{} (unit 0x{:02X})...", config.host, config.port, config.unit_id);

    let plant = match PlantClient::with_config(config).await {
        Ok(plant) => {
            println!("✅ Connected successfully!");
            plant
        }
        Err(e) => {
            eprintln!("❌ Failed to connect: {}", e);
            return Ok(());
        }
    };

    if let Err(e) = plant.refresh(true).await {
        eprintln!("❌ Refresh failed: {}", e);
    }

    if let Some(inverter) = plant.inverter() {
        print_snapshot("Inverter", &inverter);
    }
    for (index, battery) in plant.batteries().iter().enumerate() {
        print_snapshot(&format!("Battery {}", index), battery);
    }

    println!("\n📈 {}", format_metrics("Refreshes", &plant.plant().metrics()));

    plant.close().await?;
    println!("\n👋 Done");
    Ok(())
}
