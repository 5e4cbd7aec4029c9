//! # Error Handling
//!
//! Every fallible operation in the crate returns [`ModbusResult`], whose error
//! side is the single [`ModbusError`] enumeration. The variants fall into four
//! families that callers usually treat differently:
//!
//! ### Transport Errors
//! - **I/O / Connection**: the socket failed or was closed. Every request that
//!   was in flight at that moment fails with `Connection`; call `reconnect()`.
//! - **Timeout**: one request exceeded its deadline. Only that caller is
//!   affected and it may retry.
//!
//! ### Protocol Errors
//! - **MalformedFrame**: bytes on the wire do not form a valid MBAP frame.
//! - **Exception**: the device answered with `function | 0x80` and an
//!   exception code.
//! - **Protocol**: a well-formed frame that does not answer the request
//!   (wrong function code, echo mismatch, bad byte count).
//!
//! ### Decode Errors
//! - **MissingRegisters**: the read ranges do not cover a schema entry.
//! - **Decode**: a schema entry cannot be decoded from the words supplied.
//! - **NotFound / DeviceUnavailable**: the field or device is unknown to the
//!   plant cache.
//!
//! ### Command Errors
//! - **NotWritable / OutOfRange / InvalidIntent**: rejected before any
//!   network I/O took place.
//! - **WriteVerification**: the device accepted the write but reads back a
//!   different value.
//! - **CommandAborted**: step `step` of a multi-write command failed after
//!   `committed` earlier steps reached the device.
//!
//! ```rust
//! use solar_modbus::{ModbusError, ModbusResult};
//!
//! fn report(result: ModbusResult<()>) {
//!     match result {
//!         Ok(()) => println!("done"),
//!         Err(ModbusError::OutOfRange { field, value, min, max }) => {
//!             println!("{} rejected: {} not in {}..={}", field, value, min, max);
//!         }
//!         Err(error) if error.is_recoverable() => println!("retry later: {}", error),
//!         Err(error) => println!("failed: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias used across the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the protocol engine, the decoder, the plant cache and
/// the command dispatcher.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Low-level I/O failure on the socket.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The connection could not be established, was closed, or was lost while
    /// requests were pending.
    ///
    /// # Examples
    /// - Connection refused by the inverter's dongle
    /// - Peer closed the socket with requests in flight
    /// - Request issued after `close()`
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// A single request exceeded its deadline.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A well-formed frame that does not answer the request that was sent.
    ///
    /// # Examples
    /// - Response function code differs from the request
    /// - Write echo carries a different address or value
    /// - Byte count disagrees with the requested quantity
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code outside the supported subset (0x03, 0x04, 0x06, 0x10).
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Register range rejected before it was sent.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Generic data validation failure.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Bytes that cannot be an MBAP frame.
    ///
    /// # Examples
    /// - Protocol identifier other than 0
    /// - Declared length disagrees with the bytes present
    /// - Buffer shorter than the MBAP header
    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    /// Exception response from the device.
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// A schema entry is not fully covered by the registers that were read.
    #[error("Missing registers for '{field}': {width} register(s) at {address}")]
    MissingRegisters { field: String, address: u16, width: u16 },

    /// A schema entry could not be decoded or encoded.
    #[error("Decode error for '{field}': {message}")]
    Decode { field: String, message: String },

    /// The requested field does not exist in the device's schema.
    #[error("Field '{field}' not found on {device}")]
    NotFound { device: String, field: String },

    /// The device has never been refreshed, or is not part of the plant.
    #[error("Device {device} unavailable: {message}")]
    DeviceUnavailable { device: String, message: String },

    /// Write attempted against a read-only schema entry.
    #[error("Field '{field}' is not writable")]
    NotWritable { field: String },

    /// Proposed value outside the entry's valid range.
    #[error("Value {value} out of range for '{field}' (allowed {min}..={max})")]
    OutOfRange { field: String, value: i64, min: i64, max: i64 },

    /// A command that is structurally invalid, independent of any register.
    ///
    /// # Examples
    /// - Time slot ending before it starts
    /// - Minutes component of 60 or more
    /// - Unknown slot index
    #[error("Invalid intent: {message}")]
    InvalidIntent { message: String },

    /// The device accepted a write but a read-back returned another value.
    #[error("Write verification failed for '{field}' at {address}: wrote {written}, device holds {actual}")]
    WriteVerification { field: String, address: u16, written: u16, actual: u16 },

    /// A multi-write command stopped part-way.
    ///
    /// `step` is the one-based position of the failing write, `committed` the
    /// number of earlier writes that were verified on the device. Nothing is
    /// rolled back.
    #[error("Command '{command}' aborted at step {step} of {total} ({committed} committed): {source}")]
    CommandAborted {
        command: String,
        step: usize,
        total: usize,
        committed: usize,
        source: Box<ModbusError>,
    },

    /// Client configuration problem.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal invariant violated.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a malformed frame error
    pub fn malformed_frame<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Maps the standard exception codes to their textual description.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a missing registers error
    pub fn missing_registers<S: Into<String>>(field: S, address: u16, width: u16) -> Self {
        Self::MissingRegisters {
            field: field.into(),
            address,
            width,
        }
    }

    /// Create a decode error
    pub fn decode<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Decode {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<D: Into<String>, F: Into<String>>(device: D, field: F) -> Self {
        Self::NotFound {
            device: device.into(),
            field: field.into(),
        }
    }

    /// Create a device unavailable error
    pub fn device_unavailable<D: Into<String>, M: Into<String>>(device: D, message: M) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create a not writable error
    pub fn not_writable<S: Into<String>>(field: S) -> Self {
        Self::NotWritable { field: field.into() }
    }

    /// Create an out of range error
    pub fn out_of_range<S: Into<String>>(field: S, value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
        }
    }

    /// Create an invalid intent error
    pub fn invalid_intent<S: Into<String>>(message: S) -> Self {
        Self::InvalidIntent { message: message.into() }
    }

    /// Create a write verification error
    pub fn write_verification<S: Into<String>>(field: S, address: u16, written: u16, actual: u16) -> Self {
        Self::WriteVerification {
            field: field.into(),
            address,
            written,
            actual,
        }
    }

    /// Wrap the failure of one step of a multi-write command
    pub fn command_aborted<S: Into<String>>(
        command: S,
        step: usize,
        total: usize,
        committed: usize,
        source: ModbusError,
    ) -> Self {
        Self::CommandAborted {
            command: command.into(),
            step,
            total,
            committed,
            source: Box::new(source),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// Nothing in the crate retries on its own; this only tells the caller
    /// whether a retry has a chance of succeeding.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use solar_modbus::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read_04", 1500).is_recoverable());
    /// assert!(!ModbusError::not_writable("serial_number").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            Self::CommandAborted { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a protocol issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use solar_modbus::ModbusError;
    ///
    /// assert!(ModbusError::exception(0x03, 0x02).is_protocol_error());
    /// assert!(!ModbusError::io("Network unreachable").is_protocol_error());
    /// ```
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::MalformedFrame { .. }
        )
    }

    /// Check if the error was raised by command validation, before any I/O
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::NotWritable { .. }
                | Self::OutOfRange { .. }
                | Self::InvalidIntent { .. }
        )
    }

    /// The innermost error, looking through `CommandAborted` wrappers
    pub fn root_cause(&self) -> &ModbusError {
        match self {
            Self::CommandAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Convert from std::io::Error
///
/// Resets and unexpected EOFs are reported as connection losses, everything
/// else as a plain I/O failure.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed duration is unknown here; callers that know it construct the
/// error with [`ModbusError::timeout`] directly.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}
