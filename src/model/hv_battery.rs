//! High-voltage battery stack register maps.
//!
//! An HV stack is a battery control unit (BCU) per cluster plus one battery
//! management unit (BMU) per module. Neither answers on the inverter's unit
//! id: BCUs sit on units 0x70-0x8F and BMUs on 0x50-0x6F. Both expose their
//! data in input registers 60-119. This crate reads a single battery array,
//! so every device starts at register 60 on its own unit.

use super::{DeviceClass, DeviceModel};
use crate::plant::DeviceSnapshot;
use crate::protocol::{RegisterRange, UnitId};
use crate::register::{DecodeKind, DecodedValue, SchemaEntry, SchemaSource, Unit};

/// Unit id of the first BCU
pub const HV_BCU_BASE_UNIT: UnitId = 0x70;
/// Unit id of the first BMU
pub const HV_BMU_BASE_UNIT: UnitId = 0x50;

const BCU_LAST_UNIT: UnitId = 0x8F;
const BMU_LAST_UNIT: UnitId = 0x6F;

static RANGES: &[RegisterRange] = &[RegisterRange::input(60, 60)];

fn unit_in_block(first: UnitId, last: UnitId, index: usize) -> Option<UnitId> {
    u8::try_from(index)
        .ok()
        .and_then(|i| first.checked_add(i))
        .filter(|unit| *unit <= last)
}

const fn total(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::UInt).width(2)
}

static BCU_SCHEMA: &[SchemaEntry] = &[
    SchemaEntry::input("pack_software_version", 60, DecodeKind::Ascii).width(4),
    SchemaEntry::input("number_of_module", 64, DecodeKind::UInt),
    SchemaEntry::input("cells_per_module", 65, DecodeKind::UInt),
    SchemaEntry::input("cluster_cell_voltage", 67, DecodeKind::UInt),
    SchemaEntry::input("cluster_cell_temperature", 68, DecodeKind::UInt),
    SchemaEntry::input("status", 70, DecodeKind::UInt),
    SchemaEntry::input("battery_voltage", 73, DecodeKind::fixed(10)).unit(Unit::Volt),
    SchemaEntry::input("load_voltage", 74, DecodeKind::fixed(10)).unit(Unit::Volt),
    SchemaEntry::input("battery_current", 76, DecodeKind::fixed(1000)).unit(Unit::Ampere),
    SchemaEntry::input("battery_power", 79, DecodeKind::fixed(1000)).unit(Unit::Watt),
    SchemaEntry::input("battery_soc_max", 80, DecodeKind::high_byte()).unit(Unit::Percent),
    SchemaEntry::input("battery_soc_min", 80, DecodeKind::low_byte()).unit(Unit::Percent),
    SchemaEntry::input("battery_soh", 81, DecodeKind::UInt).unit(Unit::Percent),
    total("charge_energy_total", 82),
    total("discharge_energy_total", 84),
    total("charge_capacity_total", 86),
    total("discharge_capacity_total", 88),
    total("charge_energy_today", 90),
    total("discharge_energy_today", 92),
    total("charge_capacity_today", 94),
    total("discharge_capacity_today", 96),
    SchemaEntry::input("design_battery_capacity", 98, DecodeKind::fixed(10)).unit(Unit::AmpereHour),
    SchemaEntry::input("remaining_battery_capacity", 99, DecodeKind::fixed(10)).unit(Unit::AmpereHour),
    SchemaEntry::input("number_of_cycles", 100, DecodeKind::fixed(10)),
    SchemaEntry::input("min_discharge_voltage", 102, DecodeKind::fixed(10)).unit(Unit::Volt),
    SchemaEntry::input("min_charge_voltage", 103, DecodeKind::fixed(10)).unit(Unit::Volt),
    SchemaEntry::input("min_discharge_current", 104, DecodeKind::fixed(10)).unit(Unit::Ampere),
    SchemaEntry::input("min_charge_current", 105, DecodeKind::fixed(10)).unit(Unit::Ampere),
];

/// Control unit of one HV battery cluster
#[derive(Debug, Clone, Copy, Default)]
pub struct HvBcu;

impl SchemaSource for HvBcu {
    fn schema(&self) -> &[SchemaEntry] {
        BCU_SCHEMA
    }
}

impl DeviceModel for HvBcu {
    fn name(&self) -> &'static str {
        "hv-bcu"
    }

    fn device_class(&self) -> DeviceClass {
        DeviceClass::Battery
    }

    fn read_ranges(&self) -> &[RegisterRange] {
        RANGES
    }

    fn unit_id(&self, _base: UnitId, index: usize) -> Option<UnitId> {
        unit_in_block(HV_BCU_BASE_UNIT, BCU_LAST_UNIT, index)
    }

    /// A BCU has no serial number; an absent cluster reports a blank version
    fn is_present(&self, snapshot: &DeviceSnapshot) -> bool {
        match snapshot.field("pack_software_version").map(|f| &f.value) {
            Some(DecodedValue::Ascii(version)) => !version.trim().is_empty(),
            _ => false,
        }
    }
}

const fn cell_voltage(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(1000)).unit(Unit::Volt)
}

const fn cell_temperature(name: &'static str, address: u16) -> SchemaEntry {
    SchemaEntry::input(name, address, DecodeKind::fixed(10)).unit(Unit::Celsius)
}

static BMU_SCHEMA: &[SchemaEntry] = &[
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
    cell_voltage("v_cell_17", 76),
    cell_voltage("v_cell_18", 77),
    cell_voltage("v_cell_19", 78),
    cell_voltage("v_cell_20", 79),
    cell_voltage("v_cell_21", 80),
    cell_voltage("v_cell_22", 81),
    cell_voltage("v_cell_23", 82),
    cell_voltage("v_cell_24", 83),
    cell_temperature("t_cell_01", 90),
    cell_temperature("t_cell_02", 91),
    cell_temperature("t_cell_03", 92),
    cell_temperature("t_cell_04", 93),
    cell_temperature("t_cell_05", 94),
    cell_temperature("t_cell_06", 95),
    cell_temperature("t_cell_07", 96),
    cell_temperature("t_cell_08", 97),
    cell_temperature("t_cell_09", 98),
    cell_temperature("t_cell_10", 99),
    cell_temperature("t_cell_11", 100),
    cell_temperature("t_cell_12", 101),
    cell_temperature("t_cell_13", 102),
    cell_temperature("t_cell_14", 103),
    cell_temperature("t_cell_15", 104),
    cell_temperature("t_cell_16", 105),
    cell_temperature("t_cell_17", 106),
    cell_temperature("t_cell_18", 107),
    cell_temperature("t_cell_19", 108),
    cell_temperature("t_cell_20", 109),
    cell_temperature("t_cell_21", 110),
    cell_temperature("t_cell_22", 111),
    cell_temperature("t_cell_23", 112),
    cell_temperature("t_cell_24", 113),
    SchemaEntry::input("serial_number", 114, DecodeKind::Ascii).width(5),
];

/// Management unit of one HV battery module
#[derive(Debug, Clone, Copy, Default)]
pub struct HvBmu;

impl SchemaSource for HvBmu {
    fn schema(&self) -> &[SchemaEntry] {
        BMU_SCHEMA
    }
}

impl DeviceModel for HvBmu {
    fn name(&self) -> &'static str {
        "hv-bmu"
    }

    fn device_class(&self) -> DeviceClass {
        DeviceClass::Battery
    }

    fn read_ranges(&self) -> &[RegisterRange] {
        RANGES
    }

    fn unit_id(&self, _base: UnitId, index: usize) -> Option<UnitId> {
        unit_in_block(HV_BMU_BASE_UNIT, BMU_LAST_UNIT, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::DeviceId;
    use crate::protocol::RegisterType;
    use crate::register::{decode_range, RegisterMap};

    fn bcu_block() -> Vec<u16> {
        let mut raw = vec![0u16; 60];
        raw[0..4].copy_from_slice(&[0x5632, 0x2E31, 0x3000, 0x0000]); // "V2.10"
        raw[4] = 8; // number_of_module
        raw[13] = 4032; // battery_voltage
        raw[20] = 0x6405; // soc max 100, min 5
        raw[22..24].copy_from_slice(&[0x0001, 0x86A0]); // charge_energy_total
        raw[38] = 1000; // design_battery_capacity
        raw
    }

    #[test]
    fn test_bcu_block() {
        let fields = decode_range(HvBcu.schema(), RegisterType::Input, 60, &bcu_block()).unwrap();
        let value = |name: &str| fields.iter().find(|f| f.name == name).unwrap().value.clone();

        assert_eq!(value("pack_software_version"), DecodedValue::Ascii("V2.10".to_string()));
        assert_eq!(value("number_of_module"), DecodedValue::UInt(8));
        assert_eq!(value("battery_voltage"), DecodedValue::Fixed(403.2));
        assert_eq!(value("battery_soc_max"), DecodedValue::UInt(100));
        assert_eq!(value("battery_soc_min"), DecodedValue::UInt(5));
        assert_eq!(value("charge_energy_total"), DecodedValue::UInt(100_000));
        assert_eq!(value("design_battery_capacity"), DecodedValue::Fixed(100.0));
    }

    #[test]
    fn test_bcu_presence_uses_software_version() {
        let snapshot = |raw: &[u16]| {
            let mut registers = RegisterMap::new();
            registers.insert_block(RegisterType::Input, 60, raw);
            DeviceSnapshot::decode(DeviceId::Battery(0), HV_BCU_BASE_UNIT, &HvBcu, registers).unwrap()
        };

        assert!(HvBcu.is_present(&snapshot(&bcu_block())));
        assert!(!HvBcu.is_present(&snapshot(&[0u16; 60])));
    }

    #[test]
    fn test_bmu_block() {
        let mut raw = vec![0u16; 60];
        raw[0] = 3312;
        raw[23] = 3298;
        raw[30] = 215;
        raw[54..59].copy_from_slice(&[0x4858, 0x3132, 0x3334, 0x4735, 0x3637]);

        let fields = decode_range(HvBmu.schema(), RegisterType::Input, 60, &raw).unwrap();
        let value = |name: &str| fields.iter().find(|f| f.name == name).unwrap().value.clone();

        assert_eq!(value("v_cell_01"), DecodedValue::Fixed(3.312));
        assert_eq!(value("v_cell_24"), DecodedValue::Fixed(3.298));
        assert_eq!(value("t_cell_01"), DecodedValue::Fixed(21.5));
        assert_eq!(value("serial_number"), DecodedValue::Ascii("HX1234G567".to_string()));
    }

    #[test]
    fn test_unit_blocks() {
        assert_eq!(HvBcu.unit_id(0x32, 0), Some(0x70));
        assert_eq!(HvBcu.unit_id(0x32, 31), Some(0x8F));
        assert_eq!(HvBcu.unit_id(0x32, 32), None);
        assert_eq!(HvBmu.unit_id(0x32, 2), Some(0x52));
        assert_eq!(HvBmu.unit_id(0x32, 32), None);
    }
}
