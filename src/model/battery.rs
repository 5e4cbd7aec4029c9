//! Low-voltage battery pack register map.
//!
//! Each pack answers on its own unit id (`inverter unit + index`) with input
//! registers 60-119. A missing pack usually answers with an all-zero block,
//! which decodes to a blank serial number.

use super::{DeviceClass, DeviceModel};
use crate::protocol::RegisterRange;
use crate::register::{BitName, DecodeKind, SchemaEntry, SchemaSource, Unit};

const fn cell_voltage(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(1000)).unit(Unit::Volt)
}

/// Temperatures use 0x8000 for "no sensor"
const fn temperature(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::signed_fixed(10))
        .unit(Unit::Celsius)
        .sentinel(0x8000)
}

const fn capacity(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(100))
        .width(2)
        .unit(Unit::AmpereHour)
}

/// BMS warning bits (IR 94-95)
pub const BMS_WARNINGS: &[BitName] = &[
    (0, "cell_over_voltage"),
    (1, "cell_under_voltage"),
    (2, "pack_over_voltage"),
    (3, "pack_under_voltage"),
    (4, "charge_over_current"),
    (5, "discharge_over_current"),
    (6, "charge_over_temperature"),
    (7, "discharge_over_temperature"),
    (8, "charge_under_temperature"),
    (9, "discharge_under_temperature"),
    (10, "mosfet_over_temperature"),
    (11, "cell_imbalance"),
];

static SCHEMA: &[SchemaEntry] = &[
    cell_voltage("v_cell_01", 60),
    cell_voltage("v_cell_02", 61),
    cell_voltage("v_cell_03", 62),
    cell_voltage("v_cell_04", 63),
    cell_voltage("v_cell_05", 64),
    cell_voltage("v_cell_06", 65),
    cell_voltage("v_cell_07", 66),
    cell_voltage("v_cell_08", 67),
    cell_voltage("v_cell_09", 68),
    cell_voltage("v_cell_10", 69),
    cell_voltage("v_cell_11", 70),
    cell_voltage("v_cell_12", 71),
    cell_voltage("v_cell_13", 72),
    cell_voltage("v_cell_14", 73),
    cell_voltage("v_cell_15", 74),
    cell_voltage("v_cell_16", 75),
    temperature("t_cells_01_04", 76),
    temperature("t_cells_05_08", 77),
    temperature("t_cells_09_12", 78),
    temperature("t_cells_13_16", 79),
    cell_voltage("v_cells_sum", 80),
    temperature("t_bms_mosfet", 81),
    SchemaEntry::input("v_out", 82, DecodeKind::fixed(1000)).width(2).unit(Unit::Volt),
    capacity("cap_calibrated", 84),
    capacity("cap_design", 86),
    capacity("cap_remaining", 88),
    SchemaEntry::input("status", 90, DecodeKind::UInt).width(4),
    SchemaEntry::input("warning", 94, DecodeKind::Bitflags(BMS_WARNINGS)).width(2),
    SchemaEntry::input("num_cycles", 96, DecodeKind::UInt),
    SchemaEntry::input("num_cells", 97, DecodeKind::UInt),
    SchemaEntry::input("bms_firmware_version", 98, DecodeKind::UInt),
    SchemaEntry::input("soc", 100, DecodeKind::UInt).unit(Unit::Percent).range(0, 100),
    capacity("cap_design_2", 101),
    temperature("t_max", 103),
    temperature("t_min", 104),
    SchemaEntry::input("e_battery_discharge_total", 105, DecodeKind::fixed(10)).unit(Unit::KilowattHour),
    SchemaEntry::input("e_battery_charge_total", 106, DecodeKind::fixed(10)).unit(Unit::KilowattHour),
    SchemaEntry::input("serial_number", 110, DecodeKind::Ascii).width(5),
    SchemaEntry::input("usb_inserted", 115, DecodeKind::UInt),
];

static RANGES: &[RegisterRange] = &[RegisterRange::input(60, 60)];

/// Low-voltage battery pack behind a hybrid inverter
#[derive(Debug, Clone, Copy, Default)]
pub struct LvBattery;

impl SchemaSource for LvBattery {
    fn schema(&self) -> &[SchemaEntry] {
        SCHEMA
    }
}

impl DeviceModel for LvBattery {
    fn name(&self) -> &'static str {
        "lv-battery"
    }

    fn device_class(&self) -> DeviceClass {
        DeviceClass::Battery
    }

    fn read_ranges(&self) -> &[RegisterRange] {
        RANGES
    }
}
