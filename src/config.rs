//! Engine and transport configuration
//!
//! Every field has a default, so an empty document is a valid
//! configuration:
//!
//! ```yaml
//! link: /dev/ttyAMA0
//! client_id: 0x0B
//! log_level: 0x09          # ERROR | PACKET
//! telegram_logging: both   # off | raw | interpreted | both
//! transport:
//!   inbound_queue: /ems_bus_rx
//!   outbound_queue: /ems_bus_tx
//!   retry_interval_ms: 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EmsError, EmsResult};
use crate::logging::{DriverLogLevel, LoggingMode};
use crate::queue::{QUEUE_CAPACITY, RX_QUEUE_NAME, TX_QUEUE_NAME};
use crate::telegram::{MAX_TELEGRAM_LENGTH, MIN_TELEGRAM_LENGTH};

/// Default serial link of the bus adapter
pub const DEFAULT_LINK: &str = "/dev/ttyAMA0";

/// Default bus address of this node
pub const DEFAULT_CLIENT_ID: u8 = 0x0B;

/// Bus address of the boiler (bus master)
pub const DEFAULT_BOILER_ADDRESS: u8 = 0x08;

/// Queue and reconnect settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Queue the engine reads telegrams from
    pub inbound_queue: String,
    /// Queue the engine writes telegrams to
    pub outbound_queue: String,
    /// Queue capacity in messages
    pub capacity: usize,
    /// Largest frame in bytes
    pub max_frame: usize,
    /// Delay between connect attempts
    #[serde(alias = "retry_interval")]
    pub retry_interval_ms: u64,
    /// Longest single blocking receive; bounds shutdown latency
    pub receive_timeout_ms: u64,
    /// Target of the bootstrap online-devices request
    pub boiler_address: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbound_queue: RX_QUEUE_NAME.to_string(),
            outbound_queue: TX_QUEUE_NAME.to_string(),
            capacity: QUEUE_CAPACITY,
            max_frame: MAX_TELEGRAM_LENGTH,
            retry_interval_ms: 1000,
            receive_timeout_ms: 1000,
            boiler_address: DEFAULT_BOILER_ADDRESS,
        }
    }
}

impl TransportConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    fn validate(&self) -> EmsResult<()> {
        for (key, name) in [
            ("inbound_queue", &self.inbound_queue),
            ("outbound_queue", &self.outbound_queue),
        ] {
            if name.len() < 2 || !name.starts_with('/') {
                return Err(EmsError::configuration(format!(
                    "{} must be a name starting with '/', got {:?}",
                    key, name
                )));
            }
        }
        if self.inbound_queue == self.outbound_queue {
            return Err(EmsError::configuration(
                "inbound_queue and outbound_queue must differ",
            ));
        }
        if self.capacity == 0 {
            return Err(EmsError::configuration("capacity must be at least 1"));
        }
        if !(MIN_TELEGRAM_LENGTH..=MAX_TELEGRAM_LENGTH).contains(&self.max_frame) {
            return Err(EmsError::configuration(format!(
                "max_frame must be in {}..={}, got {}",
                MIN_TELEGRAM_LENGTH, MAX_TELEGRAM_LENGTH, self.max_frame
            )));
        }
        if self.boiler_address == 0 || self.boiler_address > 0x7F {
            return Err(EmsError::configuration(format!(
                "boiler_address 0x{:02x} is not a bus address",
                self.boiler_address
            )));
        }
        Ok(())
    }
}

/// Configuration consumed by the protocol engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Serial link identifier, passed through to the bus driver
    pub link: String,
    /// Bus address of this node, source of every outgoing telegram
    pub client_id: u8,
    /// Bus driver verbosity bits
    pub log_level: u8,
    /// How telegrams are dumped when the packet bit is set
    pub telegram_logging: LoggingMode,
    pub transport: TransportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            link: DEFAULT_LINK.to_string(),
            client_id: DEFAULT_CLIENT_ID,
            log_level: DriverLogLevel::ERROR.bits(),
            telegram_logging: LoggingMode::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> EmsResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> EmsResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn load<P: AsRef<Path>>(path: P) -> EmsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EmsError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(EmsError::configuration(format!(
                "Unsupported configuration format: {}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> EmsResult<()> {
        if self.link.trim().is_empty() {
            return Err(EmsError::configuration("link must not be empty"));
        }
        if self.client_id == 0 || self.client_id > 0x7F {
            return Err(EmsError::configuration(format!(
                "client_id 0x{:02x} is not a bus address",
                self.client_id
            )));
        }
        if self.client_id == self.transport.boiler_address {
            return Err(EmsError::configuration(format!(
                "client_id 0x{:02x} collides with the boiler address",
                self.client_id
            )));
        }
        self.transport.validate()
    }

    pub fn driver_log_level(&self) -> DriverLogLevel {
        DriverLogLevel::from_bits_truncate(self.log_level)
    }
}
