//! Utility functions and helpers
//!
//! Refresh metrics, operation timing, argument validation, hex formatting and
//! test logger setup.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::{ModbusError, ModbusResult};

/// Success/failure counters and timings for a recurring operation
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful operation
    pub fn record_success(&mut self, duration: Duration) {
        self.record(duration);
        self.successful += 1;
        self.last_success_at = Some(Utc::now());
    }

    /// Record a failed operation
    pub fn record_failure(&mut self, duration: Duration, error: &ModbusError) {
        self.record(duration);
        self.failed += 1;
        self.last_error = Some(error.to_string());
    }

    fn record(&mut self, duration: Duration) {
        self.total += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
    }

    /// Mean duration over every recorded operation
    pub fn avg_duration(&self) -> Duration {
        if self.total == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.total as u32
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.successful as f64 / self.total as f64) * 100.0
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Time elapsed so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            info!("Operation '{}' succeeded in {}", self.operation_name, format::format_duration(duration));
        } else {
            warn!("Operation '{}' failed after {}", self.operation_name, format::format_duration(duration));
        }
        duration
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate a unit id (1-247)
    pub fn validate_unit_id(unit_id: u8) -> ModbusResult<()> {
        if unit_id == 0 || unit_id > 247 {
            return Err(ModbusError::configuration(format!(
                "Invalid unit id: {} (must be 1-247)",
                unit_id
            )));
        }
        Ok(())
    }

    /// Validate register count for one request
    pub fn validate_register_count(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST || start as u32 + count as u32 > 0xFFFF {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }

    /// Validate an `HHMM` register value such as 0530 or 2359
    pub fn validate_hhmm(field: &str, value: i64) -> ModbusResult<()> {
        if !(0..=2359).contains(&value) {
            return Err(ModbusError::out_of_range(field, value, 0, 2359));
        }
        if value % 100 >= 60 {
            return Err(ModbusError::invalid_intent(format!(
                "{}: {:04} is not a valid time of day",
                field, value
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .chunks(1)
            .map(hex::encode_upper)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| hex::encode_upper(r.to_be_bytes()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format metrics as a small table
    pub fn format_metrics(name: &str, metrics: &PerformanceMetrics) -> String {
        format!(
            "{}:\n\
             ├─ Total: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average Duration: {}\n\
             └─ Last Error: {}",
            name,
            metrics.total,
            metrics.successful,
            metrics.success_rate(),
            metrics.failed,
            format_duration(metrics.avg_duration()),
            metrics.last_error.as_deref().unwrap_or("none")
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
