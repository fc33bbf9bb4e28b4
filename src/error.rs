//! # EMS Bus Error Handling
//!
//! This module provides the error types for the EMS bus library, covering the
//! telegram transport, the field/message codec, the catalogues and the write
//! path of the protocol engine.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: message queue or device node failures
//! - **Connection Errors**: queues not (yet) connected
//! - **Startup Errors**: the bus driver could not be started at all
//!
//! ### Protocol Errors
//! - **Frame Errors**: telegrams shorter than 6 or longer than 32 bytes
//! - **Checksum Errors**: trailing checksum byte does not match
//! - **Unknown Message**: identification code missing from the catalogue
//! - **Out Of Range**: partial update outside of the message bounds
//!
//! ### Write Path Errors
//! - **Device Not Online**: no identified device at the address
//! - **Write Not Supported**: the product is flagged read-only
//! - **Encode Errors**: a value cannot be turned into the field's bytes
//!
//! ## Usage Examples
//!
//! ```rust
//! use ems_bus::{EmsError, EmsResult};
//!
//! fn handle(result: EmsResult<()>) {
//!     match result {
//!         Ok(()) => println!("Value queued"),
//!         Err(EmsError::DeviceNotOnline { address }) => {
//!             println!("Device 0x{:02X} is not on the bus", address);
//!         }
//!         Err(error) if error.is_recoverable() => println!("Retry later: {}", error),
//!         Err(error) => println!("Fatal: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for EMS bus operations
pub type EmsResult<T> = Result<T, EmsError>;

/// EMS bus error types
///
/// Each variant carries enough context to log the failing telegram, message
/// or device without access to the original input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmsError {
    /// I/O related errors (message queues, device nodes)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Outbound queue not yet opened when a read request is issued
    /// - Queue closed during shutdown
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The bus driver could not be started; the engine never enters its run state
    #[error("Startup failure: {message}")]
    Startup { message: String },

    /// Frame errors (malformed telegrams)
    ///
    /// # Examples
    /// - Telegram shorter than 6 bytes
    /// - Telegram longer than 32 bytes
    /// - Payload too large for a write telegram
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Trailing checksum byte does not match the bytes before it
    #[error("Checksum mismatch: expected={expected:02X}, actual={actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Identification code not present in the message catalogue
    #[error("Unknown message 0x{code:02X}")]
    UnknownMessage { code: u8 },

    /// Partial update does not fit into the message buffer
    #[error("Update out of range: offset {offset} + length {len} exceeds message length {length}")]
    OutOfRange { offset: usize, len: usize, length: usize },

    /// Value could not be encoded into the field's bytes
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Field bytes could not be decoded into a value
    #[error("Decode error in field {field}: {message}")]
    Decode { field: String, message: String },

    /// No identified device at the address
    #[error("Device 0x{address:02X} is not online")]
    DeviceNotOnline { address: u8 },

    /// The device's product is flagged as read-only
    #[error("Write not supported for device 0x{address:02X} ({product})")]
    WriteNotSupported { address: u8, product: String },

    /// Field name not declared by the message layout
    #[error("Message 0x{message:02X} has no field {field}")]
    UnknownField { message: u8, field: String },

    /// Configuration errors (engine config or catalogue rows)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors turning a value into field bytes
///
/// Any of these aborts the enclosing write before a telegram is queued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// Encoded value length differs from the field's declared length
    #[error("length mismatch: field holds {expected} bytes, value encodes to {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Numeric value does not fit into the field's bytes
    #[error("value {value} does not fit into {length} byte(s)")]
    OutOfRange { value: String, length: usize },

    /// Value type does not match the field kind
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    /// Character outside of the field's character set
    #[error("character {character:?} cannot be represented in ISO-8859-15")]
    Unrepresentable { character: char },

    /// Date or time component outside of the encodable range
    #[error("date {value} cannot be encoded")]
    InvalidDate { value: String },
}

impl EmsError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new startup error
    pub fn startup<S: Into<String>>(message: S) -> Self {
        Self::Startup { message: message.into() }
    }

    /// Create a new frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a checksum mismatch error
    ///
    /// # Arguments
    ///
    /// * `expected` - Checksum calculated over the received bytes
    /// * `actual` - Checksum byte carried by the telegram
    pub fn checksum_mismatch(expected: u8, actual: u8) -> Self {
        Self::ChecksumMismatch { expected, actual }
    }

    /// Create an unknown message error
    pub fn unknown_message(code: u8) -> Self {
        Self::UnknownMessage { code }
    }

    /// Create an out of range error for a partial update
    pub fn out_of_range(offset: usize, len: usize, length: usize) -> Self {
        Self::OutOfRange { offset, len, length }
    }

    /// Create a decode error
    pub fn decode<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Decode { field: field.into(), message: message.into() }
    }

    /// Create a device not online error
    pub fn device_not_online(address: u8) -> Self {
        Self::DeviceNotOnline { address }
    }

    /// Create a write not supported error
    pub fn write_not_supported<S: Into<String>>(address: u8, product: S) -> Self {
        Self::WriteNotSupported { address, product: product.into() }
    }

    /// Create an unknown field error
    pub fn unknown_field<S: Into<String>>(message: u8, field: S) -> Self {
        Self::UnknownField { message, field: field.into() }
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
    /// Transport problems clear up once the bus driver and its queues are
    /// back; a device that is not online may come online later.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ems_bus::EmsError;
    ///
    /// assert!(EmsError::connection("queue not open").is_recoverable());
    /// assert!(!EmsError::write_not_supported(0x18, "RC100").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::DeviceNotOnline { .. }
        )
    }

    /// Check if the error is a transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Startup { .. }
        )
    }

    /// Check if the error is a telegram or message level protocol issue
    ///
    /// These only ever affect the telegram being decoded.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. }
                | Self::ChecksumMismatch { .. }
                | Self::UnknownMessage { .. }
                | Self::OutOfRange { .. }
                | Self::Decode { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for EmsError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for EmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for EmsError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

/// Convert from blocking task join errors
impl From<tokio::task::JoinError> for EmsError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("Blocking task failed: {}", err))
    }
}
