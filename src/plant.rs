//! Plant model and snapshot cache
//!
//! The plant owns one inverter snapshot and an ordered list of battery
//! snapshots. A snapshot is built completely off to the side from fresh
//! register reads and then published by swapping a single `Arc`, so readers
//! either see the previous snapshot or the new one, never a mix.
//!
//! Battery `i` answers on unit id `inverter_unit + i`. When the inverter
//! model reports a battery count it is used directly; otherwise batteries are
//! scanned in order until the first one that is absent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::client::ModbusClient;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{EventLogger, TelemetryEvent};
use crate::model::{DeviceClass, DeviceModel};
use crate::protocol::{ModbusAddress, RegisterType, UnitId};
use crate::register::{decode_map, DecodedField, DecodedValue, RegisterMap, SchemaSource};
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Identifies one device of the plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceId {
    Inverter,
    Battery(usize),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Inverter => write!(f, "inverter"),
            DeviceId::Battery(index) => write!(f, "battery[{}]", index),
        }
    }
}

/// Immutable, fully decoded view of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device: DeviceId,
    pub device_class: DeviceClass,
    pub model: &'static str,
    pub unit_id: UnitId,
    pub serial_number: Option<String>,
    pub last_refreshed_at: DateTime<Utc>,
    fields: BTreeMap<&'static str, DecodedField>,
    #[serde(skip)]
    registers: RegisterMap,
}

impl DeviceSnapshot {
    /// Decode every field of `model` from `registers`
    pub fn decode(
        device: DeviceId,
        unit_id: UnitId,
        model: &dyn DeviceModel,
        registers: RegisterMap,
    ) -> ModbusResult<Self> {
        let fields: BTreeMap<_, _> = decode_map(model, &registers)?
            .into_iter()
            .map(|field| (field.name, field))
            .collect();

        let serial_number = fields
            .get(model.serial_number_field())
            .and_then(|field| match &field.value {
                DecodedValue::Ascii(serial) => Some(serial.clone()),
                _ => None,
            });

        Ok(Self {
            device,
            device_class: model.device_class(),
            model: model.name(),
            unit_id,
            serial_number,
            last_refreshed_at: Utc::now(),
            fields,
            registers,
        })
    }

    pub fn field(&self, name: &str) -> Option<&DecodedField> {
        self.fields.get(name)
    }

    /// Fields in name order
    pub fn fields(&self) -> impl Iterator<Item = &DecodedField> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Raw registers the snapshot was decoded from
    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }
}

/// Cached state of the inverter and its batteries
pub struct Plant {
    client: Arc<dyn ModbusClient>,
    unit_id: UnitId,
    inverter_model: Arc<dyn DeviceModel>,
    battery_model: Arc<dyn DeviceModel>,
    max_batteries: usize,
    inverter: RwLock<Option<Arc<DeviceSnapshot>>>,
    batteries: RwLock<Arc<Vec<Arc<DeviceSnapshot>>>>,
    metrics: Mutex<PerformanceMetrics>,
    events: EventLogger,
}

impl Plant {
    /// Create an empty plant; nothing is read until the first refresh
    pub fn new(
        client: Arc<dyn ModbusClient>,
        unit_id: UnitId,
        inverter_model: Arc<dyn DeviceModel>,
        battery_model: Arc<dyn DeviceModel>,
    ) -> Self {
        Self {
            client,
            unit_id,
            inverter_model,
            battery_model,
            max_batteries: crate::DEFAULT_MAX_BATTERIES,
            inverter: RwLock::new(None),
            batteries: RwLock::new(Arc::new(Vec::new())),
            metrics: Mutex::new(PerformanceMetrics::new()),
            events: EventLogger::disabled(),
        }
    }

    /// Upper bound on scanned batteries
    pub fn with_max_batteries(mut self, max_batteries: usize) -> Self {
        self.max_batteries = max_batteries;
        self
    }

    pub fn with_events(mut self, events: EventLogger) -> Self {
        self.events = events;
        self
    }

    pub fn client(&self) -> &Arc<dyn ModbusClient> {
        &self.client
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn inverter_model(&self) -> &Arc<dyn DeviceModel> {
        &self.inverter_model
    }

    pub fn events(&self) -> &EventLogger {
        &self.events
    }

    /// Model that describes `device`
    pub fn model_for(&self, device: DeviceId) -> &Arc<dyn DeviceModel> {
        match device {
            DeviceId::Inverter => &self.inverter_model,
            DeviceId::Battery(_) => &self.battery_model,
        }
    }

    /// Unit id a device answers on
    pub fn unit_for(&self, device: DeviceId) -> ModbusResult<UnitId> {
        match device {
            DeviceId::Inverter => Ok(self.unit_id),
            DeviceId::Battery(index) => self
                .battery_model
                .unit_id(self.unit_id, index)
                .ok_or_else(|| ModbusError::device_unavailable(device.to_string(), "no unit id for this index")),
        }
    }

    /// Latest inverter snapshot
    pub fn inverter(&self) -> Option<Arc<DeviceSnapshot>> {
        self.inverter.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Latest battery snapshots, index ordered
    pub fn batteries(&self) -> Arc<Vec<Arc<DeviceSnapshot>>> {
        self.batteries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn battery_count(&self) -> usize {
        self.batteries().len()
    }

    /// Latest snapshot of any device
    pub fn snapshot(&self, device: DeviceId) -> ModbusResult<Arc<DeviceSnapshot>> {
        let snapshot = match device {
            DeviceId::Inverter => self.inverter(),
            DeviceId::Battery(index) => self.batteries().get(index).cloned(),
        };
        snapshot.ok_or_else(|| ModbusError::device_unavailable(device.to_string(), "not refreshed yet"))
    }

    /// Look up one decoded field
    pub fn get(&self, device: DeviceId, field: &str) -> ModbusResult<DecodedField> {
        if self.model_for(device).entry(field).is_none() {
            return Err(ModbusError::not_found(device.to_string(), field));
        }
        self.snapshot(device)?
            .field(field)
            .cloned()
            .ok_or_else(|| ModbusError::not_found(device.to_string(), field))
    }

    /// Refresh metrics so far
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Read every range of a device and decode a new snapshot
    async fn fetch(&self, device: DeviceId) -> ModbusResult<DeviceSnapshot> {
        let unit_id = self.unit_for(device)?;
        let model = self.model_for(device);

        let mut registers = RegisterMap::new();
        for range in model.read_ranges() {
            let values = self.client.read_range(unit_id, range).await?;
            registers.insert_block(range.register_type, range.start, &values);
        }

        DeviceSnapshot::decode(device, unit_id, model.as_ref(), registers).map_err(|e| {
            self.events.emit(TelemetryEvent::DecodeFailure {
                device: device.to_string(),
                message: e.to_string(),
            });
            e
        })
    }

    /// Refresh one device and publish its new snapshot
    ///
    /// `full = false` is accepted for the future incremental mode but
    /// currently reads every range, exactly like `full = true`.
    pub async fn refresh(&self, device: DeviceId, full: bool) -> ModbusResult<Arc<DeviceSnapshot>> {
        debug!("Refreshing {} (full={})", device, full);
        let timer = OperationTimer::start(&format!("refresh {}", device));

        let result = self.fetch(device).await;
        let duration = timer.elapsed();
        let snapshot = match result {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                self.record_failure(duration, &e);
                return Err(e);
            }
        };

        match device {
            DeviceId::Inverter => self.publish_inverter(snapshot.clone()),
            DeviceId::Battery(index) => {
                let published = {
                    let mut slot = self.batteries.write().unwrap_or_else(|e| e.into_inner());
                    let mut batteries = slot.as_ref().clone();
                    let known = batteries.len();
                    if index < known {
                        batteries[index] = snapshot.clone();
                    } else if index == known {
                        batteries.push(snapshot.clone());
                    }
                    if index <= known {
                        *slot = Arc::new(batteries);
                    }
                    index <= known
                };
                if !published {
                    let e = ModbusError::device_unavailable(device.to_string(), "battery index beyond those discovered");
                    self.record_failure(duration, &e);
                    return Err(e);
                }
                self.announce(&snapshot);
            }
        }

        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).record_success(duration);
        Ok(snapshot)
    }

    /// Refresh the inverter, then discover and refresh batteries
    pub async fn refresh_all(&self, full: bool) -> ModbusResult<()> {
        let timer = OperationTimer::start("refresh plant");
        let result = self.refresh_all_inner(full).await;
        let duration = timer.stop_and_log(result.is_ok());
        match result {
            Ok(()) => self
                .metrics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_success(duration),
            Err(ref e) => self.record_failure(duration, e),
        }
        result
    }

    async fn refresh_all_inner(&self, full: bool) -> ModbusResult<()> {
        let inverter = Arc::new(self.fetch(DeviceId::Inverter).await?);
        self.publish_inverter(inverter.clone());

        let known = self.battery_count();
        let batteries = match self.inverter_model.battery_count(&inverter) {
            Some(count) => {
                let count = count.min(self.max_batteries);
                let mut batteries = Vec::with_capacity(count);
                for index in 0..count {
                    batteries.push(Arc::new(self.fetch(DeviceId::Battery(index)).await?));
                }
                batteries
            }
            None if full || known == 0 => self.scan_batteries().await?,
            None => {
                let mut batteries = Vec::with_capacity(known);
                for index in 0..known {
                    batteries.push(Arc::new(self.fetch(DeviceId::Battery(index)).await?));
                }
                batteries
            }
        };

        if batteries.len() != known {
            info!("Battery count changed from {} to {}", known, batteries.len());
        }
        let batteries = Arc::new(batteries);
        *self.batteries.write().unwrap_or_else(|e| e.into_inner()) = batteries.clone();
        for snapshot in batteries.iter() {
            self.announce(snapshot);
        }
        Ok(())
    }

    /// Read batteries in order until one is missing
    async fn scan_batteries(&self) -> ModbusResult<Vec<Arc<DeviceSnapshot>>> {
        let mut batteries = Vec::new();
        for index in 0..self.max_batteries {
            let device = DeviceId::Battery(index);
            match self.fetch(device).await {
                Ok(snapshot) if self.battery_model.is_present(&snapshot) => batteries.push(Arc::new(snapshot)),
                Ok(_) => {
                    debug!("{} has a blank serial number, stopping scan", device);
                    break;
                }
                Err(e) if e.is_transport_error() && !matches!(e, ModbusError::Timeout { .. }) => return Err(e),
                Err(e) => {
                    debug!("{} did not answer cleanly ({}), stopping scan", device, e);
                    break;
                }
            }
        }
        Ok(batteries)
    }

    /// Patch one raw register of a cached snapshot and publish the result
    ///
    /// Returns `None` when the device has no snapshot yet.
    pub fn apply_register(
        &self,
        device: DeviceId,
        register_type: RegisterType,
        address: ModbusAddress,
        value: u16,
    ) -> ModbusResult<Option<Arc<DeviceSnapshot>>> {
        let model = self.model_for(device);
        let rebuild = |current: &DeviceSnapshot| -> ModbusResult<Arc<DeviceSnapshot>> {
            let mut registers = current.registers.clone();
            registers.set(register_type, address, value);
            let snapshot = DeviceSnapshot::decode(device, current.unit_id, model.as_ref(), registers).map_err(|e| {
                self.events.emit(TelemetryEvent::DecodeFailure {
                    device: device.to_string(),
                    message: e.to_string(),
                });
                e
            })?;
            Ok(Arc::new(snapshot))
        };

        let updated = match device {
            DeviceId::Inverter => {
                let mut slot = self.inverter.write().unwrap_or_else(|e| e.into_inner());
                let Some(current) = slot.as_ref() else {
                    return Ok(None);
                };
                let snapshot = rebuild(current)?;
                *slot = Some(snapshot.clone());
                snapshot
            }
            DeviceId::Battery(index) => {
                let mut slot = self.batteries.write().unwrap_or_else(|e| e.into_inner());
                let Some(current) = slot.get(index) else {
                    return Ok(None);
                };
                let snapshot = rebuild(current)?;
                let mut batteries = slot.as_ref().clone();
                batteries[index] = snapshot.clone();
                *slot = Arc::new(batteries);
                snapshot
            }
        };

        debug!("{} {}{} updated to {}", device, register_type.prefix(), address, value);
        self.announce(&updated);
        Ok(Some(updated))
    }

    fn publish_inverter(&self, snapshot: Arc<DeviceSnapshot>) {
        if let Some(serial) = snapshot.serial_number.as_deref() {
            debug!("Inverter serial number {}", serial);
        }
        *self.inverter.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        self.announce(&snapshot);
    }

    fn announce(&self, snapshot: &DeviceSnapshot) {
        self.events.emit(TelemetryEvent::SnapshotPublished {
            device: snapshot.device.to_string(),
            fields: snapshot.len(),
        });
    }

    fn record_failure(&self, duration: std::time::Duration, error: &ModbusError) {
        warn!("Refresh failed: {}", error);
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_failure(duration, error);
    }
}

impl fmt::Debug for Plant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plant")
            .field("unit_id", &self.unit_id)
            .field("inverter_model", &self.inverter_model.name())
            .field("battery_model", &self.battery_model.name())
            .field("batteries", &self.battery_count())
            .finish()
    }
}
