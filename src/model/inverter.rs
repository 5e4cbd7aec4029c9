//! Single-phase hybrid inverter register map.

use serde::{Deserialize, Serialize};

use super::{DeviceClass, DeviceModel};
use crate::protocol::RegisterRange;
use crate::register::{BitName, DecodeKind, DecodedField, DecodedValue, SchemaEntry, SchemaSource, Unit};

use crate::register::DecodeKind::{Ascii, Int, UInt};

const fn hr(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::holding(name, address, UInt)
}

const fn ir(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, UInt)
}

/// Boolean flag register; anything but 0/1 reads as absent
const fn hr_flag(name: &'static str, address: u16) -> SchemaEntry {
    hr(name, address).range(0, 1)
}

/// Writable `HHMM` time-of-day register
const fn hr_time(name: &'static str, address: u16) -> SchemaEntry {
    hr(name, address).unit(Unit::Hhmm).writable(0, 2359)
}

const fn deci(name: &'static str, address: u16, unit: Unit) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(10)).unit(unit)
}

const fn centi(name: &'static str, address: u16, unit: Unit) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(100)).unit(unit)
}

/// Energy counter split over two input registers, in 0.1 kWh
const fn energy_total(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(10))
        .width(2)
        .unit(Unit::KilowattHour)
}

/// Fault code bits reported across IR 39 (high word) and IR 40 (low word)
pub const FAULT_CODES: &[BitName] = &[
    (0, "grid_voltage_high"),
    (1, "grid_voltage_low"),
    (2, "grid_frequency_high"),
    (3, "grid_frequency_low"),
    (4, "grid_lost"),
    (5, "pv_insulation_low"),
    (6, "residual_current_high"),
    (7, "dc_injection_high"),
    (8, "bus_voltage_high"),
    (9, "inverter_over_temperature"),
    (10, "battery_voltage_high"),
    (11, "battery_voltage_low"),
    (12, "battery_communication_lost"),
    (13, "meter_communication_lost"),
    (16, "eps_overload"),
    (17, "eps_short_circuit"),
    (20, "pv1_over_voltage"),
    (21, "pv2_over_voltage"),
    (24, "arm_dsp_communication_lost"),
    (31, "hardware_fault"),
];

static SCHEMA: &[SchemaEntry] = &[
    // Holding registers 0-59
    hr("device_type_code", 0),
    hr("module", 1).width(2),
    hr("num_mppt_and_phases", 3),
    hr_flag("enable_ammeter", 7),
    SchemaEntry::holding("first_battery_serial_number", 8, Ascii).width(5),
    SchemaEntry::holding("serial_number", 13, Ascii).width(5),
    hr("first_battery_bms_firmware_version", 18),
    hr("dsp_firmware_version", 19),
    hr("enable_charge_target", 20).writable(0, 1),
    hr("arm_firmware_version", 21),
    hr("usb_device_inserted", 22),
    hr_flag("select_arm_chip", 23),
    hr("variable_address", 24),
    hr("variable_value", 25),
    hr("grid_port_max_power_output", 26).unit(Unit::Watt),
    hr("battery_power_mode", 27).writable(0, 1),
    hr_flag("enable_60hz_freq_mode", 28),
    hr("soc_force_adjust", 29).writable(0, 3),
    hr("modbus_address", 30),
    hr("user_code", 33),
    SchemaEntry::holding("modbus_version", 34, DecodeKind::fixed(100)),
    hr("system_time_year", 35).writable(0, 99),
    hr("system_time_month", 36).writable(1, 12),
    hr("system_time_day", 37).writable(1, 31),
    hr("system_time_hour", 38).writable(0, 23),
    hr("system_time_minute", 39).writable(0, 59),
    hr("system_time_second", 40).writable(0, 59),
    hr_flag("enable_drm_rj45_port", 41),
    hr_flag("enable_reversed_ct_clamp", 42),
    hr("charge_and_discharge_soc", 43),
    hr_time("discharge_slot_2_start", 44),
    hr_time("discharge_slot_2_end", 45),
    hr("bms_firmware_version", 46),
    hr("meter_type", 47),
    hr_flag("enable_reversed_115_meter", 48),
    hr_flag("enable_reversed_418_meter", 49),
    hr("active_power_rate", 50).unit(Unit::Percent),
    hr("reactive_power_rate", 51).unit(Unit::Percent),
    hr("power_factor", 52),
    hr("enable_inverter", 53),
    hr("battery_type", 54),
    hr("battery_nominal_capacity", 55).unit(Unit::AmpereHour),
    hr_time("discharge_slot_1_start", 56),
    hr_time("discharge_slot_1_end", 57),
    hr_flag("enable_auto_judge_battery_type", 58),
    hr("enable_discharge", 59).writable(0, 1),
    // Holding registers 60-119
    SchemaEntry::holding("v_pv_start", 60, DecodeKind::fixed(10)).unit(Unit::Volt),
    hr("start_countdown_timer", 61).unit(Unit::Second),
    hr("restart_delay_time", 62).unit(Unit::Second),
    hr_time("charge_slot_1_start", 94),
    hr_time("charge_slot_1_end", 95),
    hr("enable_charge", 96).writable(0, 1),
    SchemaEntry::holding("battery_low_voltage_protection_limit", 97, DecodeKind::fixed(100)).unit(Unit::Volt),
    SchemaEntry::holding("battery_high_voltage_protection_limit", 98, DecodeKind::fixed(100)).unit(Unit::Volt),
    SchemaEntry::holding("battery_voltage_adjust", 105, DecodeKind::fixed(100)).unit(Unit::Volt),
    hr("battery_low_force_charge_time", 108),
    hr_flag("enable_bms_read", 109),
    hr("battery_soc_reserve", 110).unit(Unit::Percent).writable(4, 100),
    hr("battery_charge_limit", 111).unit(Unit::Percent).writable(0, 50),
    hr("battery_discharge_limit", 112).unit(Unit::Percent).writable(0, 50),
    hr_flag("enable_buzzer", 113),
    hr("battery_discharge_min_power_reserve", 114).unit(Unit::Percent).writable(4, 100),
    hr("charge_target_soc", 116).unit(Unit::Percent).writable(4, 100),
    hr("charge_soc_stop_2", 117).unit(Unit::Percent),
    hr("discharge_soc_stop_2", 118).unit(Unit::Percent),
    hr("charge_soc_stop_1", 119).unit(Unit::Percent),
    // Holding registers 120-179
    hr("discharge_soc_stop_1", 120).unit(Unit::Percent),
    hr_flag("enable_local_command_test", 121),
    hr("power_factor_function_model", 122),
    hr("frequency_load_limit_rate", 123),
    hr_flag("enable_low_voltage_fault_ride_through", 124),
    hr_flag("enable_frequency_derating", 125),
    hr_flag("enable_above_6kw_system", 126),
    hr_flag("start_system_auto_test", 127),
    hr_flag("enable_spi", 128),
    hr("inverter_reboot", 163).writable(100, 100),
    hr("threephase_balance_mode", 167),
    hr_flag("enable_battery_on_pv_or_grid", 175),
    hr("debug_inverter", 176),
    hr_flag("enable_ups_mode", 177),
    hr_flag("enable_g100_limit_switch", 178),
    hr_flag("enable_battery_cable_impedance_alarm", 179),
    // Holding registers 240-299
    hr("charge_target_soc_1", 242).unit(Unit::Percent).writable(4, 100),
    hr_time("charge_slot_2_start", 243),
    hr_time("charge_slot_2_end", 244),
    hr("charge_target_soc_2", 245).unit(Unit::Percent).writable(4, 100),
    hr_time("charge_slot_3_start", 246),
    hr_time("charge_slot_3_end", 247),
    hr("charge_target_soc_3", 248).unit(Unit::Percent).writable(4, 100),
    hr("discharge_target_soc_1", 272).unit(Unit::Percent),
    hr("discharge_target_soc_2", 275).unit(Unit::Percent),
    hr_time("discharge_slot_3_start", 276),
    hr_time("discharge_slot_3_end", 277),
    hr("discharge_target_soc_3", 278).unit(Unit::Percent),
    // Holding registers 300-359
    hr("battery_charge_limit_ac", 313).unit(Unit::Percent),
    hr("battery_discharge_limit_ac", 314).unit(Unit::Percent),
    hr("battery_pause_mode", 318).writable(0, 3),
    hr_time("battery_pause_slot_1_start", 319),
    hr_time("battery_pause_slot_1_end", 320),
    // Input registers 0-59
    ir("status", 0).range(0, 4),
    deci("v_pv1", 1, Unit::Volt),
    deci("v_pv2", 2, Unit::Volt),
    deci("v_p_bus", 3, Unit::Volt),
    deci("v_n_bus", 4, Unit::Volt),
    deci("v_ac1", 5, Unit::Volt),
    energy_total("e_battery_throughput_total", 6),
    deci("i_pv1", 8, Unit::Ampere),
    deci("i_pv2", 9, Unit::Ampere),
    deci("i_ac1", 10, Unit::Ampere),
    energy_total("e_pv_total", 11),
    centi("f_ac1", 13, Unit::Hertz),
    deci("e_pv1_day", 17, Unit::KilowattHour),
    ir("p_pv1", 18).unit(Unit::Watt),
    deci("e_pv2_day", 19, Unit::KilowattHour),
    ir("p_pv2", 20).unit(Unit::Watt),
    energy_total("e_grid_out_total", 21),
    deci("e_solar_diverter", 23, Unit::KilowattHour),
    SchemaEntry::input("p_inverter_out", 24, Int).unit(Unit::Watt),
    deci("e_grid_out_day", 25, Unit::KilowattHour),
    deci("e_grid_in_day", 26, Unit::KilowattHour),
    energy_total("e_inverter_in_total", 27),
    deci("e_discharge_year", 29, Unit::KilowattHour),
    SchemaEntry::input("p_grid_out", 30, Int).unit(Unit::Watt),
    ir("p_eps_backup", 31).unit(Unit::Watt),
    energy_total("e_grid_in_total", 32),
    deci("e_inverter_in_day", 35, Unit::KilowattHour),
    deci("e_battery_charge_today", 36, Unit::KilowattHour),
    deci("e_battery_discharge_today", 37, Unit::KilowattHour),
    ir("inverter_countdown", 38).unit(Unit::Second),
    SchemaEntry::input("fault_code", 39, DecodeKind::Bitflags(FAULT_CODES)).width(2),
    SchemaEntry::input("temp_inverter_heatsink", 41, DecodeKind::signed_fixed(10)).unit(Unit::Celsius),
    ir("p_load_demand", 42).unit(Unit::Watt),
    ir("p_grid_apparent", 43).unit(Unit::VoltAmpere),
    deci("e_inverter_out_day", 44, Unit::KilowattHour),
    energy_total("e_inverter_out_total", 45),
    ir("work_time_total", 47).width(2),
    ir("system_mode", 49),
    centi("v_battery", 50, Unit::Volt),
    SchemaEntry::input("i_battery", 51, DecodeKind::signed_fixed(100)).unit(Unit::Ampere),
    SchemaEntry::input("p_battery", 52, Int).unit(Unit::Watt),
    deci("v_eps_backup", 53, Unit::Volt),
    centi("f_eps_backup", 54, Unit::Hertz),
    SchemaEntry::input("temp_charger", 55, DecodeKind::signed_fixed(10)).unit(Unit::Celsius),
    SchemaEntry::input("temp_battery", 56, DecodeKind::signed_fixed(10)).unit(Unit::Celsius),
    centi("i_grid_port", 58, Unit::Ampere),
    ir("battery_percent", 59).unit(Unit::Percent).range(0, 100),
    // Input registers 180-239
    deci("e_battery_discharge_total", 180, Unit::KilowattHour),
    deci("e_battery_charge_total", 181, Unit::KilowattHour),
    deci("e_battery_discharge_today_2", 182, Unit::KilowattHour),
    deci("e_battery_charge_today_2", 183, Unit::KilowattHour),
];

static RANGES: &[RegisterRange] = &[
    RegisterRange::holding(0, 60),
    RegisterRange::holding(60, 60),
    RegisterRange::holding(120, 60),
    RegisterRange::holding(240, 60),
    RegisterRange::holding(300, 60),
    RegisterRange::input(0, 60),
    RegisterRange::input(180, 60),
];

/// Single-phase hybrid inverter at the plant's base unit id
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridInverter;

impl SchemaSource for HybridInverter {
    fn schema(&self) -> &[SchemaEntry] {
        SCHEMA
    }
}

impl DeviceModel for HybridInverter {
    fn name(&self) -> &'static str {
        "hybrid-inverter"
    }

    fn device_class(&self) -> DeviceClass {
        DeviceClass::Inverter
    }

    fn read_ranges(&self) -> &[RegisterRange] {
        RANGES
    }
}

/// Operating state from IR 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverterStatus {
    Waiting = 0,
    Normal = 1,
    Warning = 2,
    Fault = 3,
    FlashingFirmwareUpdate = 4,
}

impl InverterStatus {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Waiting),
            1 => Some(Self::Normal),
            2 => Some(Self::Warning),
            3 => Some(Self::Fault),
            4 => Some(Self::FlashingFirmwareUpdate),
            _ => None,
        }
    }

    /// Interpret a decoded `status` field
    pub fn from_field(field: &DecodedField) -> Option<Self> {
        match field.value {
            DecodedValue::UInt(raw) => u16::try_from(raw).ok().and_then(Self::from_u16),
            _ => None,
        }
    }
}

/// Battery discharge strategy (HR 27)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryPowerMode {
    /// Discharge at full power, exporting any surplus
    Export = 0,
    /// Discharge only to match demand
    SelfConsumption = 1,
}

/// Battery pause mode (HR 318)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryPauseMode {
    Disabled = 0,
    PauseCharge = 1,
    PauseDischarge = 2,
    PauseBoth = 3,
}

impl BatteryPauseMode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::PauseCharge),
            2 => Some(Self::PauseDischarge),
            3 => Some(Self::PauseBoth),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}
