//! Device models
//!
//! A device model is a typed capability: it names the device, exposes a
//! static register schema and lists the contiguous ranges that cover it. The
//! decoder and the plant cache only ever talk to [`DeviceModel`], so adding a
//! device means adding a schema and registering it, never touching the decode
//! engine.
//!
//! Models are looked up by name in a process-wide table. The table starts
//! empty; [`init_builtin_models`] registers the bundled inverter, LV battery
//! and HV battery (BCU and BMU) models and must be called once at startup.
//!
//! ```rust
//! use solar_modbus::model::{init_builtin_models, lookup_model, DeviceClass};
//!
//! init_builtin_models();
//! let inverter = lookup_model("hybrid-inverter").unwrap();
//! assert_eq!(inverter.device_class(), DeviceClass::Inverter);
//! assert!(inverter.entry("charge_target_soc").unwrap().writable);
//! ```

mod battery;
mod hv_battery;
mod inverter;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::plant::DeviceSnapshot;
use crate::protocol::{RegisterRange, UnitId};
use crate::register::SchemaSource;

pub use battery::LvBattery;
pub use hv_battery::{HvBcu, HvBmu, HV_BCU_BASE_UNIT, HV_BMU_BASE_UNIT};
pub use inverter::{BatteryPauseMode, BatteryPowerMode, HybridInverter, InverterStatus};

/// Class of a physical device in the plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Inverter,
    Battery,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Inverter => write!(f, "inverter"),
            DeviceClass::Battery => write!(f, "battery"),
        }
    }
}

/// Static description of one kind of device
pub trait DeviceModel: SchemaSource + Send + Sync {
    /// Registry key, e.g. `hybrid-inverter`
    fn name(&self) -> &'static str;

    fn device_class(&self) -> DeviceClass;

    /// Ranges read on every refresh; together they cover the whole schema
    fn read_ranges(&self) -> &[RegisterRange];

    /// Unit id of the `index`-th device of this model behind an inverter on `base`
    fn unit_id(&self, base: UnitId, index: usize) -> Option<UnitId> {
        u8::try_from(index).ok().and_then(|i| base.checked_add(i))
    }

    /// Field holding the device serial number
    fn serial_number_field(&self) -> &'static str {
        "serial_number"
    }

    /// Number of batteries reported by an inverter snapshot
    ///
    /// `None` means the model has no such register and batteries are found by
    /// scanning.
    fn battery_count(&self, _snapshot: &DeviceSnapshot) -> Option<usize> {
        None
    }

    /// Whether a snapshot describes a device that actually exists
    fn is_present(&self, snapshot: &DeviceSnapshot) -> bool {
        snapshot
            .serial_number
            .as_deref()
            .map(|serial| !serial.trim().is_empty())
            .unwrap_or(false)
    }
}

impl fmt::Debug for dyn DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceModel")
            .field("name", &self.name())
            .field("class", &self.device_class())
            .field("fields", &self.schema().len())
            .finish()
    }
}

type ModelTable = RwLock<HashMap<&'static str, Arc<dyn DeviceModel>>>;

static REGISTRY: OnceLock<ModelTable> = OnceLock::new();

fn registry() -> &'static ModelTable {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a model under its name, returning any model it replaces
pub fn register_model(model: Arc<dyn DeviceModel>) -> Option<Arc<dyn DeviceModel>> {
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    log::debug!("Registering device model '{}'", model.name());
    table.insert(model.name(), model)
}

/// Register the bundled models. Safe to call more than once.
pub fn init_builtin_models() {
    register_model(Arc::new(HybridInverter));
    register_model(Arc::new(LvBattery));
    register_model(Arc::new(HvBcu));
    register_model(Arc::new(HvBmu));
}

/// Find a registered model by name
pub fn lookup_model(name: &str) -> ModbusResult<Arc<dyn DeviceModel>> {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table.get(name).cloned().ok_or_else(|| {
        ModbusError::configuration(format!(
            "Unknown device model '{}' (registered: {:?})",
            name,
            sorted_names(&table)
        ))
    })
}

/// Names of every registered model, sorted
pub fn registered_models() -> Vec<&'static str> {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    sorted_names(&table)
}

fn sorted_names(table: &HashMap<&'static str, Arc<dyn DeviceModel>>) -> Vec<&'static str> {
    let mut names: Vec<_> = table.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Convert an `HHMM` register value (e.g. 1630) to a time of day
pub fn hhmm_to_time(value: u16) -> ModbusResult<NaiveTime> {
    NaiveTime::from_hms_opt((value / 100) as u32, (value % 100) as u32, 0)
        .ok_or_else(|| ModbusError::invalid_intent(format!("{:04} is not a valid time of day", value)))
}

/// Convert a time of day to its `HHMM` register value, dropping seconds
pub fn time_to_hhmm(time: NaiveTime) -> u16 {
    (time.hour() * 100 + time.minute()) as u16
}

/// Start and end time of a charge or discharge window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build from hours and minutes
    pub fn from_components(start_hour: u32, start_minute: u32, end_hour: u32, end_minute: u32) -> ModbusResult<Self> {
        let time = |hour, minute| {
            NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
                ModbusError::invalid_intent(format!("{:02}:{:02} is not a valid time of day", hour, minute))
            })
        };
        Ok(Self::new(time(start_hour, start_minute)?, time(end_hour, end_minute)?))
    }

    /// Build from two `HHMM` register values
    pub fn from_hhmm(start: u16, end: u16) -> ModbusResult<Self> {
        Ok(Self::new(hhmm_to_time(start)?, hhmm_to_time(end)?))
    }

    pub fn start_hhmm(&self) -> u16 {
        time_to_hhmm(self.start)
    }

    pub fn end_hhmm(&self) -> u16 {
        time_to_hhmm(self.end)
    }

    /// The end must come after the start within the same day
    pub fn validate(&self) -> ModbusResult<()> {
        if self.end <= self.start {
            return Err(ModbusError::invalid_intent(format!(
                "time slot ends at {} which is not after its start {}",
                self.end.format("%H:%M"),
                self.start.format("%H:%M")
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}
