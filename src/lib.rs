//! # Solar Modbus - Async Modbus TCP client for hybrid solar inverters
//!
//! Talks to a hybrid inverter and the battery packs behind it (low-voltage
//! packs or a high-voltage BCU/BMU stack) over Modbus TCP, decodes their register maps into named typed fields and
//! executes validated control commands with read-back verification.
//!
//! ## Features
//!
//! - **Async**: one TCP connection, many concurrent requests matched by transaction id
//! - **Typed register maps**: static schemas for the inverter and each battery
//! - **Polling**: `PlantClient::watch` refreshes on a fixed period
//! - **Consistent snapshots**: refreshed devices are swapped in atomically
//! - **Safe writes**: every command is validated before anything reaches the wire
//! - **Telemetry**: frame dumps, timeouts and failed verifications through a callback sink
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used for |
//! |------|----------|----------|
//! | 0x03 | Read Holding Registers | configuration and clock |
//! | 0x04 | Read Input Registers | measurements and battery data |
//! | 0x06 | Write Single Register | control commands |
//! | 0x10 | Write Multiple Registers | raw client API |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use solar_modbus::{Command, DeviceId, ModbusResult, TimeSlot};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let plant = solar_modbus::connect("192.168.1.20", 502, 0x32).await?;
//!
//!     plant.refresh(true).await?;
//!     println!("{}", plant.get(DeviceId::Inverter, "battery_percent")?);
//!     for battery in plant.batteries().iter() {
//!         println!("{:?} soc={:?}", battery.serial_number, battery.field("soc").map(|f| &f.value));
//!     }
//!
//!     plant.exec(&Command::SetChargeSlot { index: 1, slot: TimeSlot::from_hhmm(30, 430)? }).await?;
//!     plant.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                PlantClient                  │
//! └─────────────────────────────────────────────┘
//!          │                          │
//! ┌─────────────────┐       ┌──────────────────┐
//! │  Plant cache    │◄──────│ Command          │
//! │  (snapshots)    │       │ dispatcher       │
//! └─────────────────┘       └──────────────────┘
//!          │   Register decoder / models  │
//! ┌─────────────────────────────────────────────┐
//! │          ModbusClient (0x03/04/06/10)       │
//! └─────────────────────────────────────────────┘
//!          │
//! ┌─────────────────┐       ┌──────────────────┐
//! │ TcpTransport    │◄─────►│  MBAP codec      │
//! │ (transactions)  │       │  (framing)       │
//! └─────────────────┘       └──────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// MBAP frame encoding and decoding
pub mod codec;

/// TCP transport with transaction matching
pub mod transport;

/// Register-level Modbus client
pub mod client;

/// Register schemas and typed decoding
pub mod register;

/// Device register maps
pub mod model;

/// Snapshot cache for the inverter and its batteries
pub mod plant;

/// Control commands, validation and dispatch
pub mod command;

/// Connected plant session
pub mod session;

/// Client configuration
pub mod config;

/// Utility functions and performance monitoring
pub mod utils;

/// Telemetry events and callback logging
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, RegisterRange, RegisterType, UnitId};
pub use codec::{Frame, FrameStatus, MbapCodec};
pub use transport::{ModbusTransport, TcpTransport, TransportStats};
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use register::{
    decode_entry, decode_map, decode_range, encode_value, DecodeKind, DecodedField, DecodedValue,
    RegisterMap, SchemaEntry, SchemaSource, Unit,
};
pub use model::{
    lookup_model, register_model, DeviceClass, DeviceModel, HvBcu, HvBmu, HybridInverter, LvBattery, TimeSlot,
    HV_BCU_BASE_UNIT, HV_BMU_BASE_UNIT,
};
pub use plant::{DeviceId, DeviceSnapshot, Plant};
pub use command::{Command, CommandDispatcher, CommandReport, CommandValidator, WriteIntent};
pub use session::{connect, PlantClient};
pub use config::ClientConfig;
pub use utils::{OperationTimer, PerformanceMetrics};
pub use logging::{EventCallback, EventLogger, LogLevel, LoggingMode, TelemetryEvent};

/// Largest register block the inverter answers in one read
pub const MAX_REGISTERS_PER_REQUEST: u16 = 60;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default connect timeout (2 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Default per-request timeout (1.5 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1500;

/// Unit id the inverter answers on out of the box
pub const DEFAULT_UNIT_ID: u8 = 0x32;

/// Batteries scanned unless configured otherwise
pub const DEFAULT_MAX_BATTERIES: usize = 5;

/// Hard limit on batteries behind one inverter
pub const MAX_BATTERIES: usize = 6;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Solar Modbus v{} - Modbus TCP client for hybrid inverters and batteries", VERSION)
}
