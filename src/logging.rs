//! Telegram logging and subscriber setup
//!
//! Library diagnostics use the `tracing` macros. Telegram dumps go through a
//! [`TelegramLogger`], a callback based logger that the embedding
//! application points wherever it wants (console, file, a UI pane).

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::telegram::Telegram;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

/// Logging mode for telegram display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// No telegram dumps
    Off,
    /// Show raw telegram bytes only
    Raw,
    /// Show usage, addresses, type and offset
    #[default]
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

bitflags! {
    /// Verbosity bits understood by the bus driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DriverLogLevel: u8 {
        const ERROR = 0x01;
        const INFO = 0x02;
        const VERBOSE = 0x04;
        /// Dump every telegram
        const PACKET = 0x08;
        const MAC = 0x10;
        const CHAR = 0x20;
    }
}

impl Default for DriverLogLevel {
    fn default() -> Self {
        DriverLogLevel::ERROR
    }
}

impl DriverLogLevel {
    /// Whether telegrams should be dumped
    pub fn logs_packets(self) -> bool {
        self.contains(DriverLogLevel::PACKET)
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger for telegrams passing through the transport
#[derive(Clone)]
pub struct TelegramLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl std::fmt::Debug for TelegramLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl TelegramLogger {
    /// Create a telegram logger
    ///
    /// Messages above `min_level` are not passed to the callback.
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Logger forwarding to the `tracing` subscriber
    pub fn tracing(mode: LoggingMode) -> Self {
        let callback: LogCallback = Box::new(|level, message| match level {
            LogLevel::Error => tracing::error!("[EMS] {}", message),
            LogLevel::Warn => tracing::warn!("[EMS] {}", message),
            LogLevel::Info => tracing::info!("[EMS] {}", message),
            LogLevel::Debug => tracing::debug!("[EMS] {}", message),
        });
        Self::with_mode(Some(callback), LogLevel::Debug, mode)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::with_mode(None, LogLevel::Error, LoggingMode::Off)
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some() && self.mode != LoggingMode::Off
    }

    fn log(&self, level: LogLevel, message: &str) {
        if level as u8 > self.min_level as u8 {
            return;
        }
        if let Some(ref callback) = self.callback {
            callback(level, message);
        }
    }

    /// Log a telegram frame
    ///
    /// `direction` is `"RX"` or `"TX"`. Frames that do not parse as a
    /// telegram are dumped raw with the reason.
    pub fn log_telegram(&self, direction: &str, frame: &[u8]) {
        if !self.is_enabled() {
            return;
        }

        let raw = format!("{} raw ({} bytes): {}", direction, frame.len(), format_hex(frame));
        let telegram = match Telegram::parse(frame) {
            Ok(telegram) => telegram,
            Err(e) => {
                self.log(LogLevel::Warn, &format!("{} ({})", raw, e));
                return;
            }
        };

        match self.mode {
            LoggingMode::Off => {}
            LoggingMode::Raw => self.log(LogLevel::Info, &raw),
            LoggingMode::Interpreted => self.log(LogLevel::Info, &format!("{} {}", direction, telegram)),
            LoggingMode::Both => {
                self.log(LogLevel::Info, &format!("{} {}", direction, telegram));
                self.log(LogLevel::Debug, &raw);
            }
        }
    }
}

impl Default for TelegramLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Format raw bytes as a spaced hex string
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Install a `tracing` fmt subscriber
///
/// `filter` uses the `RUST_LOG` syntax and is overridden by the environment
/// variable when set. Calling this twice is harmless.
pub fn init_tracing(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Install a `tracing` subscriber writing through the test harness
///
/// Output is captured per test and shown for failing tests only.
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("ems_bus=debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn capture(mode: LoggingMode) -> (TelegramLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().push((level, message.to_string()));
        });
        (TelegramLogger::with_mode(Some(callback), LogLevel::Debug, mode), lines)
    }

    fn fast_monitor_frame() -> Vec<u8> {
        Telegram::new(0x08, 0x00, 0x18, 0, vec![0x32, 0x01])
            .unwrap()
            .to_bytes()
    }

    #[test]
    fn test_interpreted_dump() {
        let (logger, lines) = capture(LoggingMode::Interpreted);
        logger.log_telegram("RX", &fast_monitor_frame());

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1.starts_with("RX BROADCAST 0x08 -> 0x00 t 0x18, o 0"));
    }

    #[test]
    fn test_both_dump() {
        let (logger, lines) = capture(LoggingMode::Both);
        logger.log_telegram("TX", &fast_monitor_frame());

        let lines = lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].0, LogLevel::Debug);
        assert!(lines[1].1.contains("08 00 18 00 32 01"));
    }

    #[test]
    fn test_invalid_frame_is_warned() {
        let (logger, lines) = capture(LoggingMode::Raw);
        let mut frame = fast_monitor_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        logger.log_telegram("RX", &frame);

        assert_eq!(lines.lock()[0].0, LogLevel::Warn);
    }

    #[test]
    fn test_min_level_filters_debug_dump() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: LogCallback = Box::new(move |level, message: &str| {
            sink.lock().push((level, message.to_string()));
        });
        let logger = TelegramLogger::with_mode(Some(callback), LogLevel::Info, LoggingMode::Both);
        logger.log_telegram("RX", &fast_monitor_frame());

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Info);
    }

    #[test]
    fn test_off_and_disabled() {
        let (logger, lines) = capture(LoggingMode::Off);
        logger.log_telegram("RX", &fast_monitor_frame());
        assert!(lines.lock().is_empty());
        assert!(!logger.is_enabled());
        assert!(!TelegramLogger::disabled().is_enabled());
    }

    #[test]
    fn test_driver_log_level() {
        let level = DriverLogLevel::from_bits_truncate(0x09);
        assert!(level.logs_packets());
        assert!(level.contains(DriverLogLevel::ERROR));
        assert!(!DriverLogLevel::default().logs_packets());
    }
}
