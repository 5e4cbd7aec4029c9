//! Structured telemetry sink
//!
//! The engine reports what happens on the wire and in the cache as
//! [`TelemetryEvent`] values handed to an [`EventLogger`]. The logger only
//! filters by level and forwards to a user callback; formatting and routing
//! belong to the callback.

use std::sync::Arc;

use serde::Serialize;

use crate::utils::format::bytes_to_hex;

/// Log levels for the telemetry sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Matching `log` crate level
    pub fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// How frame events are rendered by [`EventLogger::describe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Hex dump only
    Raw,
    /// Header fields and function names
    Interpreted,
    /// Interpreted summary followed by the hex dump
    Both,
}

/// Events emitted by the transport, the plant cache and the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    FrameSent {
        transaction_id: u16,
        unit_id: u8,
        function_code: u8,
        bytes: Vec<u8>,
    },
    FrameReceived {
        transaction_id: u16,
        unit_id: u8,
        function_code: u8,
        bytes: Vec<u8>,
    },
    /// A response whose transaction id matches nothing in flight
    UnsolicitedFrame {
        transaction_id: u16,
        unit_id: u8,
        function_code: u8,
    },
    RequestTimeout {
        transaction_id: u16,
        timeout_ms: u64,
    },
    ConnectionLost {
        reason: String,
        pending: usize,
    },
    DecodeFailure {
        device: String,
        message: String,
    },
    SnapshotPublished {
        device: String,
        fields: usize,
    },
    WriteVerificationFailure {
        device: String,
        field: String,
        address: u16,
        written: u16,
        actual: u16,
    },
}

impl TelemetryEvent {
    /// Severity used for filtering
    pub fn level(&self) -> LogLevel {
        match self {
            TelemetryEvent::FrameSent { .. } | TelemetryEvent::FrameReceived { .. } => LogLevel::Debug,
            TelemetryEvent::SnapshotPublished { .. } => LogLevel::Info,
            TelemetryEvent::UnsolicitedFrame { .. } | TelemetryEvent::RequestTimeout { .. } => LogLevel::Warn,
            TelemetryEvent::ConnectionLost { .. }
            | TelemetryEvent::DecodeFailure { .. }
            | TelemetryEvent::WriteVerificationFailure { .. } => LogLevel::Error,
        }
    }

    /// Stable snake_case name of the event
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::FrameSent { .. } => "frame_sent",
            TelemetryEvent::FrameReceived { .. } => "frame_received",
            TelemetryEvent::UnsolicitedFrame { .. } => "unsolicited_frame",
            TelemetryEvent::RequestTimeout { .. } => "request_timeout",
            TelemetryEvent::ConnectionLost { .. } => "connection_lost",
            TelemetryEvent::DecodeFailure { .. } => "decode_failure",
            TelemetryEvent::SnapshotPublished { .. } => "snapshot_published",
            TelemetryEvent::WriteVerificationFailure { .. } => "write_verification_failure",
        }
    }
}

/// Type alias for event callback functions
pub type EventCallback = Box<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Level-filtering event sink around an optional callback
#[derive(Clone)]
pub struct EventLogger {
    callback: Option<Arc<EventCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl EventLogger {
    /// Create a new event logger
    pub fn new(callback: Option<EventCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a new event logger with specific mode
    pub fn with_mode(callback: Option<EventCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Forward every event to the `log` facade with a timestamp
    pub fn console() -> Self {
        let renderer = EventLogger::with_mode(None, LogLevel::Debug, LoggingMode::Interpreted);
        let callback: EventCallback = Box::new(move |event| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            log::log!(
                event.level().to_log_level(),
                "[{}] {}",
                timestamp,
                renderer.describe(event)
            );
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that drops everything
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Whether events at `level` reach the callback
    ///
    /// Emitters check this before building expensive events such as frame
    /// dumps.
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Deliver an event to the callback if its level passes the filter
    pub fn emit(&self, event: TelemetryEvent) {
        if !self.is_enabled(event.level()) {
            return;
        }
        if let Some(ref callback) = self.callback {
            callback(&event);
        }
    }

    /// Render an event as one line of text according to the logging mode
    pub fn describe(&self, event: &TelemetryEvent) -> String {
        match event {
            TelemetryEvent::FrameSent {
                transaction_id,
                unit_id,
                function_code,
                bytes,
            } => self.describe_frame("->", *transaction_id, *unit_id, *function_code, bytes),
            TelemetryEvent::FrameReceived {
                transaction_id,
                unit_id,
                function_code,
                bytes,
            } => self.describe_frame("<-", *transaction_id, *unit_id, *function_code, bytes),
            TelemetryEvent::UnsolicitedFrame {
                transaction_id,
                unit_id,
                function_code,
            } => format!(
                "Discarded unsolicited frame tid:{} unit:{} function:{} (0x{:02X})",
                transaction_id,
                unit_id,
                get_function_name(*function_code),
                function_code
            ),
            TelemetryEvent::RequestTimeout {
                transaction_id,
                timeout_ms,
            } => format!("Request tid:{} timed out after {}ms", transaction_id, timeout_ms),
            TelemetryEvent::ConnectionLost { reason, pending } => {
                format!("Connection lost ({}), failing {} pending request(s)", reason, pending)
            }
            TelemetryEvent::DecodeFailure { device, message } => {
                format!("Decode failure on {}: {}", device, message)
            }
            TelemetryEvent::SnapshotPublished { device, fields } => {
                format!("Published {} snapshot with {} fields", device, fields)
            }
            TelemetryEvent::WriteVerificationFailure {
                device,
                field,
                address,
                written,
                actual,
            } => format!(
                "Write verification failed on {} {}@{}: wrote {}, read back {}",
                device, field, address, written, actual
            ),
        }
    }

    fn describe_frame(&self, direction: &str, transaction_id: u16, unit_id: u8, function_code: u8, bytes: &[u8]) -> String {
        let interpreted = format!(
            "Modbus {} tid:{} unit:{} function:{} (0x{:02X}) {} bytes",
            direction,
            transaction_id,
            unit_id,
            get_function_name(function_code),
            function_code,
            bytes.len()
        );
        match self.mode {
            LoggingMode::Raw => format!("Modbus {} {}", direction, bytes_to_hex(bytes)),
            LoggingMode::Interpreted => interpreted,
            LoggingMode::Both => format!("{} [{}]", interpreted, bytes_to_hex(bytes)),
        }
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Human-readable name of a function code, exception bit included
pub fn get_function_name(function_code: u8) -> &'static str {
    match function_code {
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x06 => "Write Single Register",
        0x10 => "Write Multiple Registers",
        0x83 | 0x84 | 0x86 | 0x90 => "Exception",
        _ => "Unknown",
    }
}
