//! Modbus protocol definitions and data structures
//!
//! Function codes, exception codes, register classes and ranges, and the
//! request/response PDUs exchanged with the inverter. Only the register
//! subset of Modbus is modelled: read holding (0x03), read input (0x04),
//! write single (0x06) and write multiple (0x10).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};
use crate::MAX_REGISTERS_PER_REQUEST;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier
pub type UnitId = u8;

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// The two register classes exposed by the devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegisterType {
    /// Holding registers: configuration, read with 0x03, written with 0x06/0x10
    Holding,
    /// Input registers: live measurements, read-only, read with 0x04
    Input,
}

impl RegisterType {
    /// Function code used to read this register class
    pub fn read_function(self) -> ModbusFunction {
        match self {
            RegisterType::Holding => ModbusFunction::ReadHoldingRegisters,
            RegisterType::Input => ModbusFunction::ReadInputRegisters,
        }
    }

    /// Short prefix used in logs, `HR` or `IR`
    pub fn prefix(self) -> &'static str {
        match self {
            RegisterType::Holding => "HR",
            RegisterType::Input => "IR",
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A contiguous block of registers read with one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterRange {
    pub register_type: RegisterType,
    pub start: ModbusAddress,
    pub count: u16,
}

impl RegisterRange {
    /// Create a validated range
    pub fn new(register_type: RegisterType, start: ModbusAddress, count: u16) -> ModbusResult<Self> {
        let range = Self {
            register_type,
            start,
            count,
        };
        range.validate()?;
        Ok(range)
    }

    /// Holding register range, for static device tables
    pub const fn holding(start: ModbusAddress, count: u16) -> Self {
        Self {
            register_type: RegisterType::Holding,
            start,
            count,
        }
    }

    /// Input register range, for static device tables
    pub const fn input(start: ModbusAddress, count: u16) -> Self {
        Self {
            register_type: RegisterType::Input,
            start,
            count,
        }
    }

    /// Check `1 <= count <= MAX_REGISTERS_PER_REQUEST` and `start + count <= 0xFFFF`
    pub fn validate(&self) -> ModbusResult<()> {
        if self.count == 0
            || self.count > MAX_REGISTERS_PER_REQUEST
            || self.start as u32 + self.count as u32 > 0xFFFF
        {
            return Err(ModbusError::invalid_address(self.start, self.count));
        }
        Ok(())
    }

    /// One past the last address
    pub fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    /// Check whether `width` registers starting at `address` lie inside the range
    pub fn covers(&self, address: ModbusAddress, width: u16) -> bool {
        address >= self.start && address as u32 + width as u32 <= self.end()
    }
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}..{})",
            self.register_type,
            self.start,
            self.end()
        )
    }
}

/// Modbus request structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    /// Register values for write requests, empty for reads
    pub values: Vec<ModbusValue>,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(unit_id: UnitId, function: ModbusFunction, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            values: Vec::new(),
        }
    }

    /// Read request covering a register range
    pub fn read_range(unit_id: UnitId, range: &RegisterRange) -> Self {
        Self::new_read(unit_id, range.register_type.read_function(), range.start, range.count)
    }

    /// Create a write single register request
    pub fn write_single(unit_id: UnitId, address: ModbusAddress, value: ModbusValue) -> Self {
        Self {
            unit_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            values: vec![value],
        }
    }

    /// Create a write multiple registers request
    pub fn write_multiple(unit_id: UnitId, address: ModbusAddress, values: &[ModbusValue]) -> Self {
        Self {
            unit_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            values: values.to_vec(),
        }
    }

    /// Validate the request
    pub fn validate(&self) -> ModbusResult<()> {
        if self.quantity == 0 || self.quantity > MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }
        if self.address as u32 + self.quantity as u32 > 0xFFFF {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }

        match self.function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                if !self.values.is_empty() {
                    return Err(ModbusError::invalid_data("Read request cannot carry values"));
                }
            }
            ModbusFunction::WriteSingleRegister => {
                if self.values.len() != 1 {
                    return Err(ModbusError::invalid_data(format!(
                        "Write single register needs exactly one value, got {}",
                        self.values.len()
                    )));
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                if self.values.len() != self.quantity as usize {
                    return Err(ModbusError::invalid_data(format!(
                        "Quantity {} does not match {} values",
                        self.quantity,
                        self.values.len()
                    )));
                }
            }
        }

        Ok(())
    }

    /// PDU body that follows the function code
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5 + self.values.len() * 2);
        payload.extend_from_slice(&self.address.to_be_bytes());
        match self.function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                payload.extend_from_slice(&self.quantity.to_be_bytes());
            }
            ModbusFunction::WriteSingleRegister => {
                let value = self.values.first().copied().unwrap_or_default();
                payload.extend_from_slice(&value.to_be_bytes());
            }
            ModbusFunction::WriteMultipleRegisters => {
                payload.extend_from_slice(&self.quantity.to_be_bytes());
                payload.push((self.values.len() * 2) as u8);
                payload.extend_from_slice(&data_utils::registers_to_bytes(&self.values));
            }
        }
        payload
    }
}

/// Modbus response structure
///
/// Exception responses never become a `ModbusResponse`; they are turned into
/// [`ModbusError::Exception`] by [`ModbusResponse::from_pdu`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(unit_id: UnitId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
        }
    }

    /// Interpret a function code and payload received from the device
    pub fn from_pdu(unit_id: UnitId, function_code: u8, payload: &[u8]) -> ModbusResult<Self> {
        if function_code & 0x80 != 0 {
            let code = payload.first().copied().ok_or_else(|| {
                ModbusError::protocol(format!(
                    "Exception response 0x{:02X} without exception code",
                    function_code
                ))
            })?;
            return Err(ModbusError::exception(function_code & 0x7F, code));
        }

        let function = ModbusFunction::from_u8(function_code)?;
        Ok(Self::new_success(unit_id, function, payload.to_vec()))
    }

    /// Parse a read response into exactly `expected` registers
    pub fn parse_registers(&self, expected: u16) -> ModbusResult<Vec<ModbusValue>> {
        let (&byte_count, body) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::protocol("Empty response data"))?;
        let byte_count = byte_count as usize;

        if byte_count != expected as usize * 2 {
            return Err(ModbusError::protocol(format!(
                "Expected {} register bytes, device reported {}",
                expected as usize * 2,
                byte_count
            )));
        }
        if body.len() != byte_count {
            return Err(ModbusError::protocol(format!(
                "Byte count {} disagrees with {} payload bytes",
                byte_count,
                body.len()
            )));
        }

        data_utils::bytes_to_registers(body)
    }

    /// Parse an address/value pair echoed by 0x06 and 0x10 responses
    pub fn parse_echo(&self) -> ModbusResult<(ModbusAddress, u16)> {
        if self.data.len() != 4 {
            return Err(ModbusError::protocol(format!(
                "Write echo must be 4 bytes, got {}",
                self.data.len()
            )));
        }
        let address = u16::from_be_bytes([self.data[0], self.data[1]]);
        let value = u16::from_be_bytes([self.data[2], self.data[3]]);
        Ok((address, value))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Concatenate up to four registers big-endian into one integer
    pub fn registers_to_u64(registers: &[u16]) -> ModbusResult<u64> {
        if registers.is_empty() || registers.len() > 4 {
            return Err(ModbusError::invalid_data(format!(
                "Cannot combine {} registers into an integer",
                registers.len()
            )));
        }
        Ok(registers.iter().fold(0u64, |acc, &r| (acc << 16) | r as u64))
    }

    /// Split an integer into `width` big-endian registers
    pub fn u64_to_registers(value: u64, width: u16) -> Vec<u16> {
        (0..width)
            .rev()
            .map(|i| (value >> (16 * i as u32)) as u16)
            .collect()
    }
}
