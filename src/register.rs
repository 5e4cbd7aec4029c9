//! Register decoder
//!
//! Turns raw 16-bit register words into typed, unit-annotated fields using a
//! static per-device schema, and turns typed values back into words for
//! writes.
//!
//! | Kind | Words | Value |
//! |------|-------|-------|
//! | `UInt` | 1-4 | big-endian concatenation |
//! | `Int` | 1-4 | two's complement of the concatenation |
//! | `Fixed { scale, signed }` | 1-4 | integer divided by `scale` |
//! | `Ascii` | any | two characters per word, trailing NULs trimmed |
//! | `Bitflags(table)` | 1-4 | named bits plus a residual mask of unknown bits |
//!
//! A value equal to an entry's sentinel, or a read-only value outside the
//! entry's valid range, decodes to [`DecodedValue::Absent`] rather than a
//! number.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::data_utils::{registers_to_u64, u64_to_registers};
use crate::protocol::{ModbusAddress, RegisterType};

/// Bit position (0 = least significant) and its name
pub type BitName = (u8, &'static str);

/// Physical unit of a decoded field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    None,
    Volt,
    Ampere,
    Watt,
    VoltAmpere,
    KilowattHour,
    AmpereHour,
    Hertz,
    Celsius,
    Percent,
    Second,
    /// Time of day packed as `HH * 100 + MM`
    Hhmm,
}

impl Unit {
    /// Unit symbol, empty for dimensionless values
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::VoltAmpere => "VA",
            Unit::KilowattHour => "kWh",
            Unit::AmpereHour => "Ah",
            Unit::Hertz => "Hz",
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::Second => "s",
            Unit::Hhmm => "",
        }
    }
}

/// How the words of a schema entry are interpreted
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeKind {
    UInt,
    Int,
    Fixed { scale: u32, signed: bool },
    Ascii,
    Bitflags(&'static [BitName]),
    /// One unsigned byte of a single register
    Byte { high: bool },
}

impl DecodeKind {
    /// Unsigned fixed point with the given divisor
    pub const fn fixed(scale: u32) -> Self {
        DecodeKind::Fixed { scale, signed: false }
    }

    /// Signed fixed point with the given divisor
    pub const fn signed_fixed(scale: u32) -> Self {
        DecodeKind::Fixed { scale, signed: true }
    }

    pub const fn high_byte() -> Self {
        DecodeKind::Byte { high: true }
    }

    pub const fn low_byte() -> Self {
        DecodeKind::Byte { high: false }
    }

    /// Whether the raw words are two's complement
    pub fn is_signed(self) -> bool {
        matches!(self, DecodeKind::Int | DecodeKind::Fixed { signed: true, .. })
    }
}

/// Static description of one logical field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchemaEntry {
    pub name: &'static str,
    pub register_type: RegisterType,
    pub address: ModbusAddress,
    pub width: u16,
    pub kind: DecodeKind,
    pub unit: Unit,
    pub writable: bool,
    /// Inclusive bounds on the integer register value
    pub valid_range: Option<(i64, i64)>,
    /// Raw value the device uses for "not applicable"
    pub sentinel: Option<u64>,
}

impl SchemaEntry {
    /// Single holding register, read-only until [`SchemaEntry::writable`] is applied
    pub const fn holding(name: &'static str, address: ModbusAddress, kind: DecodeKind) -> Self {
        Self::new(name, RegisterType::Holding, address, kind)
    }

    /// Single input register
    pub const fn input(name: &'static str, address: ModbusAddress, kind: DecodeKind) -> Self {
        Self::new(name, RegisterType::Input, address, kind)
    }

    const fn new(name: &'static str, register_type: RegisterType, address: ModbusAddress, kind: DecodeKind) -> Self {
        Self {
            name,
            register_type,
            address,
            width: 1,
            kind,
            unit: Unit::None,
            writable: false,
            valid_range: None,
            sentinel: None,
        }
    }

    pub const fn width(self, width: u16) -> Self {
        Self { width, ..self }
    }

    pub const fn unit(self, unit: Unit) -> Self {
        Self { unit, ..self }
    }

    /// Mark writable with inclusive bounds on the register value
    pub const fn writable(self, min: i64, max: i64) -> Self {
        Self {
            writable: true,
            valid_range: Some((min, max)),
            ..self
        }
    }

    /// Bounds outside of which a read-only value is treated as absent
    pub const fn range(self, min: i64, max: i64) -> Self {
        Self {
            valid_range: Some((min, max)),
            ..self
        }
    }

    pub const fn sentinel(self, raw: u64) -> Self {
        Self {
            sentinel: Some(raw),
            ..self
        }
    }

    /// Addresses this entry occupies
    pub fn addresses(&self) -> Range<u32> {
        self.address as u32..self.address as u32 + self.width as u32
    }

    /// Check an integer register value against `valid_range`
    pub fn check_range(&self, value: i64) -> ModbusResult<()> {
        match self.valid_range {
            Some((min, max)) if value < min || value > max => {
                Err(ModbusError::out_of_range(self.name, value, min, max))
            }
            _ => Ok(()),
        }
    }
}

/// Anything that can describe its registers with a static schema
pub trait SchemaSource {
    fn schema(&self) -> &[SchemaEntry];

    /// Look up an entry by field name
    fn entry(&self, name: &str) -> Option<&SchemaEntry> {
        self.schema().iter().find(|entry| entry.name == name)
    }
}

impl SchemaSource for [SchemaEntry] {
    fn schema(&self) -> &[SchemaEntry] {
        self
    }
}

/// Decoded bitfield
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bitflags {
    /// Every named bit of the table and whether it is set
    pub flags: BTreeMap<&'static str, bool>,
    /// Set bits that the table does not name
    pub residual: u64,
}

impl Bitflags {
    pub fn is_set(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// Names of the bits that are set
    pub fn active(&self) -> Vec<&'static str> {
        self.flags
            .iter()
            .filter(|(_, set)| **set)
            .map(|(&name, _)| name)
            .collect()
    }
}

/// Typed value of a field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecodedValue {
    UInt(u64),
    Int(i64),
    Fixed(f64),
    Ascii(String),
    Bitflags(Bitflags),
    /// The device reports no meaningful value
    Absent,
}

impl DecodedValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, DecodedValue::Absent)
    }

    /// Numeric view of integer and fixed-point values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::UInt(v) => Some(*v as f64),
            DecodedValue::Int(v) => Some(*v as f64),
            DecodedValue::Fixed(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view of integer values
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::UInt(v) => i64::try_from(*v).ok(),
            DecodedValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::Ascii(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::UInt(v) => write!(f, "{}", v),
            DecodedValue::Int(v) => write!(f, "{}", v),
            DecodedValue::Fixed(v) => write!(f, "{}", v),
            DecodedValue::Ascii(s) => write!(f, "{}", s),
            DecodedValue::Bitflags(b) => write!(f, "{:?} residual=0x{:X}", b.active(), b.residual),
            DecodedValue::Absent => write!(f, "n/a"),
        }
    }
}

/// A decoded value together with where it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedField {
    pub name: &'static str,
    pub value: DecodedValue,
    pub unit: Unit,
    pub register_type: RegisterType,
    pub address: ModbusAddress,
    pub width: u16,
}

impl DecodedField {
    /// Registers the value was decoded from
    pub fn source_addresses(&self) -> Range<u32> {
        self.address as u32..self.address as u32 + self.width as u32
    }
}

impl fmt::Display for DecodedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)?;
        if !self.value.is_absent() && !self.unit.symbol().is_empty() {
            write!(f, " {}", self.unit.symbol())?;
        }
        Ok(())
    }
}

/// Raw registers of one device, keyed by class and address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterMap {
    registers: BTreeMap<(RegisterType, ModbusAddress), u16>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block read starting at `base`
    pub fn insert_block(&mut self, register_type: RegisterType, base: ModbusAddress, values: &[u16]) {
        for (offset, &value) in values.iter().enumerate() {
            self.registers.insert((register_type, base.wrapping_add(offset as u16)), value);
        }
    }

    pub fn set(&mut self, register_type: RegisterType, address: ModbusAddress, value: u16) {
        self.registers.insert((register_type, address), value);
    }

    pub fn get(&self, register_type: RegisterType, address: ModbusAddress) -> Option<u16> {
        self.registers.get(&(register_type, address)).copied()
    }

    /// `width` consecutive words, or `None` if any is missing
    pub fn words(&self, register_type: RegisterType, address: ModbusAddress, width: u16) -> Option<Vec<u16>> {
        (0..width)
            .map(|i| {
                let addr = address.checked_add(i)?;
                self.get(register_type, addr)
            })
            .collect()
    }

    pub fn covers(&self, register_type: RegisterType, address: ModbusAddress, width: u16) -> bool {
        self.words(register_type, address, width).is_some()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// All registers of one class in address order
    pub fn iter(&self, register_type: RegisterType) -> impl Iterator<Item = (ModbusAddress, u16)> + '_ {
        self.registers
            .iter()
            .filter(move |((t, _), _)| *t == register_type)
            .map(|((_, a), v)| (*a, *v))
    }
}

fn sign_extend(raw: u64, width: u16) -> i64 {
    let bits = width as u32 * 16;
    if bits >= 64 {
        raw as i64
    } else {
        ((raw << (64 - bits)) as i64) >> (64 - bits)
    }
}

/// Decode one entry from exactly `entry.width` words
pub fn decode_entry(entry: &SchemaEntry, words: &[u16]) -> ModbusResult<DecodedValue> {
    if words.len() != entry.width as usize {
        return Err(ModbusError::decode(
            entry.name,
            format!("expected {} words, got {}", entry.width, words.len()),
        ));
    }

    if let DecodeKind::Ascii = entry.kind {
        return decode_ascii(entry, words);
    }
    if entry.width == 0 || entry.width > 4 {
        return Err(ModbusError::decode(
            entry.name,
            format!("width {} is only supported for ascii", entry.width),
        ));
    }

    let raw = registers_to_u64(words).map_err(|e| ModbusError::decode(entry.name, e.to_string()))?;
    let raw = match entry.kind {
        DecodeKind::Byte { .. } if entry.width != 1 => {
            return Err(ModbusError::decode(entry.name, "byte fields span exactly one register"));
        }
        DecodeKind::Byte { high: true } => raw >> 8,
        DecodeKind::Byte { high: false } => raw & 0xFF,
        _ => raw,
    };
    if entry.sentinel == Some(raw) {
        return Ok(DecodedValue::Absent);
    }

    let integer = if entry.kind.is_signed() {
        sign_extend(raw, entry.width)
    } else {
        // Widths above three words could overflow i64; those values are
        // compared as saturated.
        i64::try_from(raw).unwrap_or(i64::MAX)
    };
    if !entry.writable && entry.check_range(integer).is_err() {
        return Ok(DecodedValue::Absent);
    }

    Ok(match entry.kind {
        DecodeKind::UInt | DecodeKind::Byte { .. } => DecodedValue::UInt(raw),
        DecodeKind::Int => DecodedValue::Int(integer),
        DecodeKind::Fixed { scale, signed } => {
            let numerator = if signed { integer as f64 } else { raw as f64 };
            DecodedValue::Fixed(numerator / scale as f64)
        }
        DecodeKind::Bitflags(table) => {
            let mut flags = BTreeMap::new();
            let mut known = 0u64;
            for &(bit, name) in table {
                let mask = 1u64 << bit;
                known |= mask;
                flags.insert(name, raw & mask != 0);
            }
            DecodedValue::Bitflags(Bitflags {
                flags,
                residual: raw & !known,
            })
        }
        DecodeKind::Ascii => return decode_ascii(entry, words),
    })
}

fn decode_ascii(entry: &SchemaEntry, words: &[u16]) -> ModbusResult<DecodedValue> {
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if let Some(bad) = bytes.iter().find(|b| !b.is_ascii()) {
        return Err(ModbusError::decode(
            entry.name,
            format!("byte 0x{:02X} is not ASCII", bad),
        ));
    }
    Ok(DecodedValue::Ascii(bytes.into_iter().map(char::from).collect()))
}

/// Encode a typed value into `entry.width` words
pub fn encode_value(entry: &SchemaEntry, value: &DecodedValue) -> ModbusResult<Vec<u16>> {
    let bits = entry.width as u32 * 16;
    let fits_unsigned = |v: u64| bits >= 64 || v < (1u64 << bits);
    let fits_signed = |v: i64| {
        bits >= 64 || (v >= -(1i64 << (bits - 1)) && v < (1i64 << (bits - 1)))
    };
    let mismatch = || {
        ModbusError::decode(
            entry.name,
            format!("cannot encode {:?} as {:?}", value, entry.kind),
        )
    };

    let raw: u64 = match (entry.kind, value) {
        (DecodeKind::Ascii, DecodedValue::Ascii(text)) => {
            let capacity = entry.width as usize * 2;
            if !text.is_ascii() || text.len() > capacity {
                return Err(ModbusError::decode(
                    entry.name,
                    format!("'{}' does not fit {} ASCII characters", text, capacity),
                ));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(capacity, 0);
            return Ok(bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect());
        }
        (_, DecodedValue::Absent) => entry.sentinel.ok_or_else(|| {
            ModbusError::decode(entry.name, "no sentinel to encode an absent value")
        })?,
        (DecodeKind::Ascii, _) => return Err(mismatch()),
        (DecodeKind::UInt, DecodedValue::UInt(v)) if fits_unsigned(*v) => *v,
        (DecodeKind::Int, DecodedValue::Int(v)) if fits_signed(*v) => *v as u64,
        (DecodeKind::Byte { high }, DecodedValue::UInt(v)) if *v <= 0xFF => {
            if high {
                *v << 8
            } else {
                *v
            }
        }
        (DecodeKind::Fixed { scale, signed }, DecodedValue::Fixed(v)) => {
            let scaled = (v * scale as f64).round();
            if signed {
                let scaled = scaled as i64;
                if !fits_signed(scaled) {
                    return Err(mismatch());
                }
                scaled as u64
            } else {
                if scaled < 0.0 || !fits_unsigned(scaled as u64) {
                    return Err(mismatch());
                }
                scaled as u64
            }
        }
        (DecodeKind::Bitflags(table), DecodedValue::Bitflags(flags)) => {
            let mut raw = flags.residual;
            for (name, &set) in &flags.flags {
                let (bit, _) = table
                    .iter()
                    .find(|(_, n)| n == name)
                    .ok_or_else(|| ModbusError::decode(entry.name, format!("unknown flag '{}'", name)))?;
                if set {
                    raw |= 1u64 << bit;
                }
            }
            raw
        }
        _ => return Err(mismatch()),
    };

    let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
    Ok(u64_to_registers(raw & mask, entry.width))
}

fn decode_field(entry: &SchemaEntry, words: &[u16]) -> ModbusResult<DecodedField> {
    Ok(DecodedField {
        name: entry.name,
        value: decode_entry(entry, words)?,
        unit: entry.unit,
        register_type: entry.register_type,
        address: entry.address,
        width: entry.width,
    })
}

/// Decode every entry of `register_type` from one contiguous read
///
/// Fails with `MissingRegisters` if any such entry is not fully inside
/// `base..base + raw.len()`.
pub fn decode_range(
    schema: &[SchemaEntry],
    register_type: RegisterType,
    base: ModbusAddress,
    raw: &[u16],
) -> ModbusResult<Vec<DecodedField>> {
    let end = base as u32 + raw.len() as u32;
    schema
        .iter()
        .filter(|entry| entry.register_type == register_type)
        .map(|entry| {
            let span = entry.addresses();
            if span.start < base as u32 || span.end > end {
                return Err(ModbusError::missing_registers(entry.name, entry.address, entry.width));
            }
            let offset = (entry.address - base) as usize;
            decode_field(entry, &raw[offset..offset + entry.width as usize])
        })
        .collect()
}

/// Decode every entry of a schema from a register map
pub fn decode_map<S: SchemaSource + ?Sized>(source: &S, map: &RegisterMap) -> ModbusResult<Vec<DecodedField>> {
    source
        .schema()
        .iter()
        .map(|entry| {
            let words = map
                .words(entry.register_type, entry.address, entry.width)
                .ok_or_else(|| ModbusError::missing_registers(entry.name, entry.address, entry.width))?;
            decode_field(entry, &words)
        })
        .collect()
}

/// Decode the entries a register map covers, skipping the rest
pub fn decode_covered<S: SchemaSource + ?Sized>(source: &S, map: &RegisterMap) -> ModbusResult<Vec<DecodedField>> {
    source
        .schema()
        .iter()
        .filter_map(|entry| {
            map.words(entry.register_type, entry.address, entry.width)
                .map(|words| decode_field(entry, &words))
        })
        .collect()
}
