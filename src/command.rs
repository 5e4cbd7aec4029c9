//! Command validation and dispatch
//!
//! High-level commands ("set charge target to 80%") are expanded into
//! ordered lists of single-register [`WriteIntent`]s using the inverter
//! schema, so writes are addressed exactly like reads. The whole list is
//! validated before anything is sent: a command that fails validation causes
//! no network traffic at all.
//!
//! Dispatch writes each intent with function 0x06, checks the echo, reads the
//! register back with 0x03 and patches the plant cache with what the device
//! actually stored. A step whose read-back differs from the written value
//! fails with `WriteVerification` and the remaining steps are not sent. There
//! is no rollback: the error reports how many steps already reached the
//! device.
//!
//! | Command | Writes, in order |
//! |---------|------------------|
//! | `EnableChargeTarget(t)` | `charge_target_soc = t` |
//! | `SetChargeTarget(t)` | `enable_charge = 1`, `enable_charge_target = 1`, `charge_target_soc = t` |
//! | `SetChargeTarget(100)` | `enable_charge = 1`, `enable_charge_target = 0`, `charge_target_soc = 100` |
//! | `DisableChargeTarget` | `enable_charge_target = 0`, `charge_target_soc = 100` |
//! | `SetModeDynamic` | `battery_power_mode = 1`, `battery_soc_reserve = 4`, `enable_discharge = 0` |
//! | `SetModeStorage` | `battery_power_mode`, `battery_soc_reserve = 100`, `enable_discharge = 1`, discharge slots 1 and 2 |
//! | `SetSystemDateTime` | year - 2000, month, day, hour, minute, second |

use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime, Timelike};
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::TelemetryEvent;
use crate::model::{BatteryPauseMode, BatteryPowerMode, DeviceModel, TimeSlot};
use crate::plant::{DeviceId, Plant};
use crate::protocol::{ModbusAddress, RegisterType};
use crate::register::{SchemaSource, Unit};
use crate::utils::validation::validate_hhmm;

/// High-level operation on the inverter
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set the charge target without touching the enable flags
    EnableChargeTarget(u16),
    /// Stop charging at `target` percent; 100 disables the target
    SetChargeTarget(u16),
    DisableChargeTarget,
    SetEnableCharge(bool),
    SetEnableDischarge(bool),
    SetChargeSlot { index: u8, slot: TimeSlot },
    ResetChargeSlot(u8),
    SetDischargeSlot { index: u8, slot: TimeSlot },
    ResetDischargeSlot(u8),
    /// Charge from surplus solar, discharge to cover demand
    SetModeDynamic,
    /// Hold energy for the given discharge windows
    SetModeStorage {
        discharge_slot_1: TimeSlot,
        discharge_slot_2: Option<TimeSlot>,
        discharge_for_export: bool,
    },
    SetDischargeModeMaxPower,
    SetDischargeModeToMatchDemand,
    SetBatterySocReserve(u16),
    SetBatteryChargeLimit(u16),
    SetBatteryDischargeLimit(u16),
    SetBatteryPowerReserve(u16),
    SetBatteryPauseMode(BatteryPauseMode),
    SetSystemDateTime(NaiveDateTime),
    RebootInverter,
    CalibrateBatterySoc,
    /// Raw write of any writable field by name
    WriteRegister { name: String, value: i64 },
}

impl Command {
    /// Stable snake_case name used in reports and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::EnableChargeTarget(_) => "enable_charge_target",
            Command::SetChargeTarget(_) => "set_charge_target",
            Command::DisableChargeTarget => "disable_charge_target",
            Command::SetEnableCharge(_) => "set_enable_charge",
            Command::SetEnableDischarge(_) => "set_enable_discharge",
            Command::SetChargeSlot { .. } => "set_charge_slot",
            Command::ResetChargeSlot(_) => "reset_charge_slot",
            Command::SetDischargeSlot { .. } => "set_discharge_slot",
            Command::ResetDischargeSlot(_) => "reset_discharge_slot",
            Command::SetModeDynamic => "set_mode_dynamic",
            Command::SetModeStorage { .. } => "set_mode_storage",
            Command::SetDischargeModeMaxPower => "set_discharge_mode_max_power",
            Command::SetDischargeModeToMatchDemand => "set_discharge_mode_to_match_demand",
            Command::SetBatterySocReserve(_) => "set_battery_soc_reserve",
            Command::SetBatteryChargeLimit(_) => "set_battery_charge_limit",
            Command::SetBatteryDischargeLimit(_) => "set_battery_discharge_limit",
            Command::SetBatteryPowerReserve(_) => "set_battery_power_reserve",
            Command::SetBatteryPauseMode(_) => "set_battery_pause_mode",
            Command::SetSystemDateTime(_) => "set_system_date_time",
            Command::RebootInverter => "reboot_inverter",
            Command::CalibrateBatterySoc => "calibrate_battery_soc",
            Command::WriteRegister { .. } => "write_register",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One validated single-register write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteIntent {
    pub field: &'static str,
    pub address: ModbusAddress,
    pub value: u16,
}

/// Outcome of a fully applied command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    pub command: &'static str,
    /// Writes in the order they were applied, each verified by read-back
    pub writes: Vec<WriteIntent>,
}

/// Turns commands into validated write intents
#[derive(Debug, Clone)]
pub struct CommandValidator {
    model: Arc<dyn DeviceModel>,
}

impl CommandValidator {
    pub fn new(model: Arc<dyn DeviceModel>) -> Self {
        Self { model }
    }

    /// Validate a write of `value` to the named field
    pub fn intent(&self, field: &str, value: i64) -> ModbusResult<WriteIntent> {
        let entry = self
            .model
            .entry(field)
            .ok_or_else(|| ModbusError::not_found(self.model.name(), field))?;

        if !entry.writable || entry.register_type != RegisterType::Holding {
            return Err(ModbusError::not_writable(entry.name));
        }
        if entry.width != 1 {
            return Err(ModbusError::invalid_intent(format!(
                "{} spans {} registers; only single-register writes are supported",
                entry.name, entry.width
            )));
        }
        entry.check_range(value)?;
        if entry.unit == Unit::Hhmm {
            validate_hhmm(entry.name, value)?;
        }

        let word = if entry.kind.is_signed() {
            i16::try_from(value)
                .map(|v| v as u16)
                .map_err(|_| ModbusError::out_of_range(entry.name, value, i16::MIN as i64, i16::MAX as i64))?
        } else {
            u16::try_from(value).map_err(|_| ModbusError::out_of_range(entry.name, value, 0, u16::MAX as i64))?
        };

        Ok(WriteIntent {
            field: entry.name,
            address: entry.address,
            value: word,
        })
    }

    fn flag(&self, field: &str, enabled: bool) -> ModbusResult<WriteIntent> {
        self.intent(field, enabled as i64)
    }

    fn slot(&self, kind: &str, index: u8, slot: Option<&TimeSlot>) -> ModbusResult<Vec<WriteIntent>> {
        let start_field = format!("{}_slot_{}_start", kind, index);
        let end_field = format!("{}_slot_{}_end", kind, index);
        if self.model.entry(&start_field).is_none() || self.model.entry(&end_field).is_none() {
            return Err(ModbusError::invalid_intent(format!("{} has no {} slot {}", self.model.name(), kind, index)));
        }
        let (start, end) = match slot {
            Some(slot) => {
                slot.validate()?;
                (slot.start_hhmm(), slot.end_hhmm())
            }
            None => (0, 0),
        };
        Ok(vec![
            self.intent(&start_field, start as i64)?,
            self.intent(&end_field, end as i64)?,
        ])
    }

    /// Expand a command into its ordered write intents
    ///
    /// Performs no I/O. Any validation failure rejects the whole command.
    pub fn plan(&self, command: &Command) -> ModbusResult<Vec<WriteIntent>> {
        let intents = match command {
            Command::EnableChargeTarget(target) => vec![self.intent("charge_target_soc", *target as i64)?],
            Command::SetChargeTarget(100) => {
                let mut intents = vec![self.flag("enable_charge", true)?];
                intents.extend(self.plan(&Command::DisableChargeTarget)?);
                intents
            }
            Command::SetChargeTarget(target) => vec![
                self.flag("enable_charge", true)?,
                self.flag("enable_charge_target", true)?,
                self.intent("charge_target_soc", *target as i64)?,
            ],
            Command::DisableChargeTarget => vec![
                self.flag("enable_charge_target", false)?,
                self.intent("charge_target_soc", 100)?,
            ],
            Command::SetEnableCharge(enabled) => vec![self.flag("enable_charge", *enabled)?],
            Command::SetEnableDischarge(enabled) => vec![self.flag("enable_discharge", *enabled)?],
            Command::SetChargeSlot { index, slot } => self.slot("charge", *index, Some(slot))?,
            Command::ResetChargeSlot(index) => self.slot("charge", *index, None)?,
            Command::SetDischargeSlot { index, slot } => self.slot("discharge", *index, Some(slot))?,
            Command::ResetDischargeSlot(index) => self.slot("discharge", *index, None)?,
            Command::SetModeDynamic => vec![
                self.intent("battery_power_mode", BatteryPowerMode::SelfConsumption as i64)?,
                self.intent("battery_soc_reserve", 4)?,
                self.flag("enable_discharge", false)?,
            ],
            Command::SetModeStorage {
                discharge_slot_1,
                discharge_slot_2,
                discharge_for_export,
            } => {
                let mode = if *discharge_for_export {
                    BatteryPowerMode::Export
                } else {
                    BatteryPowerMode::SelfConsumption
                };
                let mut intents = vec![
                    self.intent("battery_power_mode", mode as i64)?,
                    self.intent("battery_soc_reserve", 100)?,
                    self.flag("enable_discharge", true)?,
                ];
                intents.extend(self.slot("discharge", 1, Some(discharge_slot_1))?);
                intents.extend(self.slot("discharge", 2, discharge_slot_2.as_ref())?);
                intents
            }
            Command::SetDischargeModeMaxPower => {
                vec![self.intent("battery_power_mode", BatteryPowerMode::Export as i64)?]
            }
            Command::SetDischargeModeToMatchDemand => {
                vec![self.intent("battery_power_mode", BatteryPowerMode::SelfConsumption as i64)?]
            }
            Command::SetBatterySocReserve(value) => vec![self.intent("battery_soc_reserve", *value as i64)?],
            Command::SetBatteryChargeLimit(value) => vec![self.intent("battery_charge_limit", *value as i64)?],
            Command::SetBatteryDischargeLimit(value) => vec![self.intent("battery_discharge_limit", *value as i64)?],
            Command::SetBatteryPowerReserve(value) => {
                vec![self.intent("battery_discharge_min_power_reserve", *value as i64)?]
            }
            Command::SetBatteryPauseMode(mode) => vec![self.intent("battery_pause_mode", mode.to_u16() as i64)?],
            Command::SetSystemDateTime(dt) => vec![
                self.intent("system_time_year", dt.year() as i64 - 2000)?,
                self.intent("system_time_month", dt.month() as i64)?,
                self.intent("system_time_day", dt.day() as i64)?,
                self.intent("system_time_hour", dt.hour() as i64)?,
                self.intent("system_time_minute", dt.minute() as i64)?,
                self.intent("system_time_second", dt.second() as i64)?,
            ],
            Command::RebootInverter => vec![self.intent("inverter_reboot", 100)?],
            Command::CalibrateBatterySoc => vec![self.intent("soc_force_adjust", 1)?],
            Command::WriteRegister { name, value } => vec![self.intent(name, *value)?],
        };
        Ok(intents)
    }
}

/// Sends validated writes and keeps the plant cache in line with the device
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    plant: Arc<Plant>,
    validator: CommandValidator,
}

impl CommandDispatcher {
    pub fn new(plant: Arc<Plant>) -> Self {
        let validator = CommandValidator::new(plant.inverter_model().clone());
        Self { plant, validator }
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    /// Validate and apply a command
    pub async fn exec(&self, command: &Command) -> ModbusResult<CommandReport> {
        let intents = self.validator.plan(command)?;
        let total = intents.len();
        info!("Executing {} ({} write{})", command, total, if total == 1 { "" } else { "s" });

        for (step, intent) in intents.iter().enumerate() {
            if let Err(e) = self.write_verified(intent).await {
                warn!("{} failed at step {}/{} ({}): {}", command, step + 1, total, intent.field, e);
                return Err(if total == 1 {
                    e
                } else {
                    ModbusError::command_aborted(command.name(), step + 1, total, step, e)
                });
            }
        }

        Ok(CommandReport {
            command: command.name(),
            writes: intents,
        })
    }

    async fn write_verified(&self, intent: &WriteIntent) -> ModbusResult<()> {
        let client = self.plant.client();
        let unit_id = self.plant.unit_id();

        debug!("Writing {} = {} (HR{})", intent.field, intent.value, intent.address);
        client.write_06(unit_id, intent.address, intent.value).await?;

        let actual = client
            .read_03(unit_id, intent.address, 1)
            .await?
            .first()
            .copied()
            .ok_or_else(|| ModbusError::protocol("empty read-back"))?;

        if actual != intent.value {
            self.plant.events().emit(TelemetryEvent::WriteVerificationFailure {
                device: DeviceId::Inverter.to_string(),
                field: intent.field.to_string(),
                address: intent.address,
                written: intent.value,
                actual,
            });
            // A read-back that does not decode leaves the cache untouched
            if let Err(e) = self
                .plant
                .apply_register(DeviceId::Inverter, RegisterType::Holding, intent.address, actual)
            {
                warn!("Read-back of {} not cached: {}", intent.field, e);
            }
            return Err(ModbusError::write_verification(intent.field, intent.address, intent.value, actual));
        }

        self.plant
            .apply_register(DeviceId::Inverter, RegisterType::Holding, intent.address, actual)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModbusClient;
    use crate::model::{DeviceClass, HybridInverter, LvBattery};
    use crate::protocol::{RegisterRange, UnitId};
    use crate::register::{DecodeKind, DecodedValue, SchemaEntry};
    use crate::transport::TransportStats;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Read(u16),
        Write(u16, u16),
    }

    /// Records every request; stores writes unless the address clamps
    #[derive(Default)]
    struct SpyClient {
        calls: Mutex<Vec<Call>>,
        registers: Mutex<HashMap<u16, u16>>,
        clamp: HashMap<u16, u16>,
    }

    impl SpyClient {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn writes(&self) -> Vec<(u16, u16)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Write(a, v) => Some((a, v)),
                    Call::Read(_) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ModbusClient for SpyClient {
        async fn read_03(&self, _unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
            self.calls.lock().unwrap().push(Call::Read(address));
            let registers = self.registers.lock().unwrap();
            Ok((address..address + quantity)
                .map(|a| registers.get(&a).copied().unwrap_or(0))
                .collect())
        }
        async fn read_04(&self, _unit_id: UnitId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
            self.calls.lock().unwrap().push(Call::Read(address));
            Ok(vec![0; quantity as usize])
        }
        async fn write_06(&self, _unit_id: UnitId, address: u16, value: u16) -> ModbusResult<()> {
            self.calls.lock().unwrap().push(Call::Write(address, value));
            let stored = self.clamp.get(&address).copied().unwrap_or(value);
            self.registers.lock().unwrap().insert(address, stored);
            Ok(())
        }
        async fn write_10(&self, _unit_id: UnitId, _address: u16, _values: &[u16]) -> ModbusResult<()> {
            unreachable!("commands only use single-register writes")
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn reconnect(&self) -> ModbusResult<()> {
            Ok(())
        }
        async fn close(&self) -> ModbusResult<()> {
            Ok(())
        }
        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn dispatcher(spy: Arc<SpyClient>) -> CommandDispatcher {
        let plant = Plant::new(spy, 0x32, Arc::new(HybridInverter), Arc::new(LvBattery));
        CommandDispatcher::new(Arc::new(plant))
    }

    fn validator() -> CommandValidator {
        CommandValidator::new(Arc::new(HybridInverter))
    }

    const PANEL_SCHEMA: &[SchemaEntry] = &[
        SchemaEntry::holding("quiet_start", 1, DecodeKind::UInt)
            .unit(Unit::Hhmm)
            .writable(0, 2359),
        // Same bounds as a time of day, but a plain number
        SchemaEntry::holding("fan_setpoint", 2, DecodeKind::UInt).writable(0, 2359),
        SchemaEntry::holding("label", 3, DecodeKind::Ascii).writable(0, 0xFFFF),
    ];

    static PANEL_RANGES: &[RegisterRange] = &[RegisterRange::holding(0, 4)];

    /// Small holding-register device for schema-driven edge cases
    struct PanelModel;

    impl SchemaSource for PanelModel {
        fn schema(&self) -> &[SchemaEntry] {
            PANEL_SCHEMA
        }
    }

    impl DeviceModel for PanelModel {
        fn name(&self) -> &'static str {
            "panel"
        }

        fn device_class(&self) -> DeviceClass {
            DeviceClass::Inverter
        }

        fn read_ranges(&self) -> &[RegisterRange] {
            PANEL_RANGES
        }
    }

    fn panel_dispatcher(spy: Arc<SpyClient>) -> CommandDispatcher {
        let plant = Plant::new(spy, 0x32, Arc::new(PanelModel), Arc::new(LvBattery));
        CommandDispatcher::new(Arc::new(plant))
    }

    #[tokio::test]
    async fn test_enable_charge_target_single_write() {
        let spy = Arc::new(SpyClient::default());
        let report = dispatcher(spy.clone())
            .exec(&Command::EnableChargeTarget(80))
            .await
            .unwrap();

        assert_eq!(spy.writes(), vec![(116, 80)]);
        assert_eq!(spy.calls(), vec![Call::Write(116, 80), Call::Read(116)]);
        assert_eq!(report.writes.len(), 1);
        assert_eq!(report.writes[0].field, "charge_target_soc");
    }

    #[tokio::test]
    async fn test_out_of_range_sends_nothing() {
        let spy = Arc::new(SpyClient::default());
        let result = dispatcher(spy.clone()).exec(&Command::EnableChargeTarget(150)).await;

        match result {
            Err(ModbusError::OutOfRange { field, value, min, max }) => {
                assert_eq!(field, "charge_target_soc");
                assert_eq!((value, min, max), (150, 4, 100));
            }
            other => panic!("expected OutOfRange, got {:?}", other),
        }
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_late_invalid_step_rejects_whole_command() {
        let spy = Arc::new(SpyClient::default());
        let result = dispatcher(spy.clone()).exec(&Command::SetChargeTarget(2)).await;
        assert!(matches!(result, Err(ModbusError::OutOfRange { .. })));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_verification_mismatch_caches_device_value() {
        let spy = Arc::new(SpyClient {
            clamp: HashMap::from([(116, 75)]),
            ..Default::default()
        });
        let dispatcher = dispatcher(spy.clone());
        dispatcher.plant.refresh(DeviceId::Inverter, true).await.unwrap();

        let err = dispatcher.exec(&Command::EnableChargeTarget(80)).await.unwrap_err();
        match err {
            ModbusError::WriteVerification { field, written, actual, .. } => {
                assert_eq!(field, "charge_target_soc");
                assert_eq!((written, actual), (80, 75));
            }
            other => panic!("expected WriteVerification, got {:?}", other),
        }
        assert_eq!(
            dispatcher.plant.get(DeviceId::Inverter, "charge_target_soc").unwrap().value,
            DecodedValue::UInt(75)
        );
    }

    #[tokio::test]
    async fn test_undecodable_read_back_still_reports_mismatch() {
        let spy = Arc::new(SpyClient {
            clamp: HashMap::from([(3, 0x00FF)]),
            ..Default::default()
        });
        let dispatcher = panel_dispatcher(spy.clone());
        dispatcher.plant.refresh(DeviceId::Inverter, true).await.unwrap();

        let err = dispatcher
            .exec(&Command::WriteRegister {
                name: "label".into(),
                value: 0x4142,
            })
            .await
            .unwrap_err();

        match err {
            ModbusError::WriteVerification {
                field,
                address,
                written,
                actual,
            } => {
                assert_eq!(field, "label");
                assert_eq!((address, written, actual), (3, 0x4142, 0x00FF));
            }
            other => panic!("expected WriteVerification, got {:?}", other),
        }
        // 0xFF is not ASCII, so the previous snapshot stays cached
        assert_eq!(
            dispatcher.plant.get(DeviceId::Inverter, "label").unwrap().value,
            DecodedValue::Ascii(String::new())
        );
    }

    #[test]
    fn test_time_of_day_check_follows_unit() {
        let v = CommandValidator::new(Arc::new(PanelModel));

        // 12:75 is in range but not a time of day
        assert!(matches!(v.intent("quiet_start", 1275), Err(ModbusError::InvalidIntent { .. })));
        assert_eq!(v.intent("quiet_start", 2330).unwrap().value, 2330);
        assert!(matches!(v.intent("quiet_start", 2400), Err(ModbusError::OutOfRange { .. })));

        let setpoint = v.intent("fan_setpoint", 1275).unwrap();
        assert_eq!((setpoint.address, setpoint.value), (2, 1275));
    }

    #[tokio::test]
    async fn test_multi_step_abort_reports_progress() {
        let spy = Arc::new(SpyClient {
            clamp: HashMap::from([(20, 0)]),
            ..Default::default()
        });
        let err = dispatcher(spy.clone())
            .exec(&Command::SetChargeTarget(80))
            .await
            .unwrap_err();

        match &err {
            ModbusError::CommandAborted {
                command,
                step,
                total,
                committed,
                ..
            } => {
                assert_eq!(command, "set_charge_target");
                assert_eq!((*step, *total, *committed), (2, 3, 1));
            }
            other => panic!("expected CommandAborted, got {:?}", other),
        }
        assert!(matches!(err.root_cause(), ModbusError::WriteVerification { .. }));
        // charge_target_soc never sent
        assert_eq!(spy.writes(), vec![(96, 1), (20, 1)]);
    }

    #[test]
    fn test_plans() {
        let v = validator();
        let fields = |command: Command| -> Vec<(&'static str, u16)> {
            v.plan(&command).unwrap().into_iter().map(|i| (i.field, i.value)).collect()
        };

        assert_eq!(
            fields(Command::SetChargeTarget(100)),
            vec![("enable_charge", 1), ("enable_charge_target", 0), ("charge_target_soc", 100)]
        );
        assert_eq!(
            fields(Command::SetModeDynamic),
            vec![("battery_power_mode", 1), ("battery_soc_reserve", 4), ("enable_discharge", 0)]
        );
        assert_eq!(
            fields(Command::ResetChargeSlot(2)),
            vec![("charge_slot_2_start", 0), ("charge_slot_2_end", 0)]
        );

        let storage = fields(Command::SetModeStorage {
            discharge_slot_1: TimeSlot::from_hhmm(1600, 1900).unwrap(),
            discharge_slot_2: None,
            discharge_for_export: true,
        });
        assert_eq!(storage[0], ("battery_power_mode", 0));
        assert_eq!(storage[3], ("discharge_slot_1_start", 1600));
        assert_eq!(storage[6], ("discharge_slot_2_end", 0));

        let dt = chrono::NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(15, 9, 26)
            .unwrap();
        assert_eq!(
            fields(Command::SetSystemDateTime(dt)),
            vec![
                ("system_time_year", 26),
                ("system_time_month", 3),
                ("system_time_day", 14),
                ("system_time_hour", 15),
                ("system_time_minute", 9),
                ("system_time_second", 26)
            ]
        );
    }

    #[test]
    fn test_validation_errors() {
        let v = validator();

        assert!(matches!(
            v.plan(&Command::WriteRegister {
                name: "no_such_field".into(),
                value: 1
            }),
            Err(ModbusError::NotFound { .. })
        ));
        assert!(matches!(
            v.plan(&Command::WriteRegister {
                name: "v_pv1".into(),
                value: 1
            }),
            Err(ModbusError::NotWritable { .. })
        ));
        assert!(matches!(
            v.plan(&Command::WriteRegister {
                name: "serial_number".into(),
                value: 1
            }),
            Err(ModbusError::NotWritable { .. })
        ));
        assert!(matches!(
            v.plan(&Command::WriteRegister {
                name: "discharge_slot_1_start".into(),
                value: 1275
            }),
            Err(ModbusError::InvalidIntent { .. })
        ));
        assert!(matches!(
            v.plan(&Command::SetChargeSlot {
                index: 1,
                slot: TimeSlot::from_hhmm(1600, 700).unwrap()
            }),
            Err(ModbusError::InvalidIntent { .. })
        ));
        assert!(matches!(
            v.plan(&Command::ResetDischargeSlot(9)),
            Err(ModbusError::InvalidIntent { .. })
        ));
        assert!(matches!(
            v.plan(&Command::SetBatteryChargeLimit(51)),
            Err(ModbusError::OutOfRange { .. })
        ));
        assert!(v.plan(&Command::RebootInverter).is_ok());
    }
}
