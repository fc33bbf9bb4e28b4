//! # EMS Bus - Heating Bus Telegram Codec and Protocol Engine
//!
//! A Rust implementation of the EMS two-wire bus used by Buderus, Nefit,
//! Junkers, Bosch and Worcester heating appliances. It decodes and encodes
//! bus telegrams, discovers the devices present on the bus and keeps their
//! state as typed, named values that can be read and, where the product
//! allows it, written.
//!
//! ## Features
//!
//! - **Telegram codec**: framing, EMS checksum, read request and write builders
//! - **Field model**: integers with fixed point scaling, single bits, on/off
//!   flags, dates, timestamps and ISO-8859-15 strings
//! - **Partial updates**: offset based merge with per field change detection
//! - **Discovery**: online bitmap tracking, product identification, initial reads
//! - **Safe writes**: read-modify-write of shared flag bytes, read-only products refused
//! - **Async**: Tokio based, blocking queue I/O kept off the runtime threads
//! - **Memory safe**: no unsafe code, POSIX queues through `posixmq`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ems_bus::{BusEvent, ChannelSink, EngineConfig, ExternalDriver, ProtocolEngine, TelegramTransport};
//! use ems_bus::queue::posix::PosixConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::load("ems.yaml")?;
//!     let transport = TelegramTransport::new(
//!         &config,
//!         Arc::new(PosixConnector),
//!         Arc::new(ExternalDriver::new()),
//!     );
//!     let (sink, mut events) = ChannelSink::new(64);
//!     let engine = ProtocolEngine::new(config, transport, Arc::new(sink))?;
//!     let _handle = engine.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             BusEvent::Discovered { device, .. } => println!("{:?}", device),
//!             BusEvent::Updated { device, message, changed_fields } => {
//!                 for name in &changed_fields {
//!                     if let Some(value) = message.value(name) {
//!                         println!("0x{:02x} {} = {}", device.address, name, value);
//!                     }
//!                 }
//!             }
//!         }
//!     }
//!
//!     // Writes go to identified, writable devices only
//!     engine.set_value(0x08, 0x1A, "boiler_temp", 55i64).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Application   │◄──── BusEvent (EventSink)
//! └─────────────────┘
//!          │ set_value
//! ┌─────────────────┐    ┌─────────────────┐
//! │ ProtocolEngine  │───►│ DeviceRegistry  │
//! │   (dispatch)    │    │ (Message cache) │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ TelegramTrans-  │    │    Catalogs     │
//! │ port (queues)   │    │ (layouts, ids)  │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Bus driver    │
//! └─────────────────┘
//! ```

#![forbid(unsafe_code)]

/// Core error types and result handling
pub mod error;

/// Telegram framing and checksum
pub mod telegram;

/// Display units, value ranges and labels
pub mod units;

/// Typed fields of a message
pub mod field;

/// Message layouts and buffers
pub mod message;

/// Built-in message and device catalogues
pub mod catalog;

/// Online bitmap and known devices
pub mod registry;

/// Inter-process telegram queues
pub mod queue;

/// Queue based telegram transport
pub mod transport;

/// Discovery, dispatch and writes
pub mod engine;

/// Engine and transport configuration
pub mod config;

/// Logging system for the library
pub mod logging;

// Re-export main types for convenience
pub use catalog::{DeviceCatalog, DeviceType, MessageCatalog, Product, ProductFlags, ProductVariant};
pub use config::{EngineConfig, TransportConfig};
pub use engine::{BusEvent, ChannelSink, EngineHandle, EventSink, NullSink, ProtocolEngine, TaskSpawner, TokioSpawner};
pub use error::{EmsError, EmsResult, EncodeError};
pub use field::{Field, FieldKind, Value};
pub use logging::{DriverLogLevel, LogCallback, LogLevel, LoggingMode, TelegramLogger};
pub use message::{Message, MessageLayout, MessageRow};
pub use registry::{DeviceInfo, DeviceRegistry};
pub use telegram::{BusAddress, Telegram, TelegramKind};
pub use transport::{BusDriver, ExternalDriver, TelegramTransport, TransportStats};
pub use units::Unit;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("EMS Bus v{} - EMS heating bus codec and protocol engine", VERSION)
}
