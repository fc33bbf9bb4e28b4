//! Typed fields of EMS messages
//!
//! A [`Field`] is a positioned view into a message buffer. It decodes its
//! bytes into a [`Value`] and encodes a value back into bytes. Fields are
//! plain `Copy` data so message layouts can be written as constant tables.

use byteorder::{BigEndian, ByteOrder};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EmsError, EmsResult, EncodeError};
use crate::units::Unit;

/// Years are stored as an offset from this epoch
pub const YEAR_EPOCH: i32 = 2000;

/// Fixed point scaling of integer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scale {
    /// Decoded value is the raw value divided by the factor (one decimal for 10)
    Divide(u16),
    /// Decoded value is the raw value multiplied by the factor
    Multiply(u16),
}

/// Kind of a field and its kind specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Big-endian integer, optionally signed and scaled
    Integer { scale: Option<Scale>, signed: bool },
    /// A single bit of a byte shared with other boolean fields
    Boolean { bit: u8 },
    /// Whole byte compared against an on value (e.g. `0xFF` = on)
    BooleanFlag { on_value: u8 },
    /// `[day, month, year - 2000]`
    Date,
    /// `[year - 2000, month, hour, day, minute, (second)]`
    DateTime,
    /// Fixed width ISO-8859-15 text
    String,
}

impl FieldKind {
    /// Inclusive length bounds for fields of this kind
    pub fn length_bounds(&self) -> (usize, usize) {
        match self {
            FieldKind::Integer { .. } => (1, 4),
            FieldKind::Boolean { .. } | FieldKind::BooleanFlag { .. } => (1, 1),
            FieldKind::Date => (3, 3),
            FieldKind::DateTime => (5, 6),
            FieldKind::String => (1, 8),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Integer { .. } => "integer",
            FieldKind::Boolean { .. } => "boolean",
            FieldKind::BooleanFlag { .. } => "boolean flag",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::String => "string",
        }
    }
}

/// Decoded field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Decimal(f64),
    Bool(bool),
    Date(NaiveDate),
    /// Timestamp plus the undocumented top bit of the year byte
    DateTime { value: NaiveDateTime, reserved_bit: bool },
    Text(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Bool(_) => "bool",
            Value::Date(_) => "date",
            Value::DateTime { .. } => "datetime",
            Value::Text(_) => "text",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Index into a label table
    pub(crate) fn as_index(&self) -> Option<usize> {
        match self {
            Value::Integer(v) => usize::try_from(*v).ok(),
            Value::Bool(v) => Some(usize::from(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::DateTime { value, .. } => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S")),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Decimal(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::DateTime { value, reserved_bit: false }
    }
}

/// One field of a message layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Field {
    /// Identifier used by the write API and in events
    pub name: &'static str,
    /// Human readable description
    pub label: &'static str,
    /// Byte offset within the message
    pub position: usize,
    pub length: usize,
    pub kind: FieldKind,
    pub unit: Option<Unit>,
}

impl Field {
    /// Unsigned, unscaled integer field
    pub const fn integer(position: usize, length: usize, name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            position,
            length,
            kind: FieldKind::Integer { scale: None, signed: false },
            unit: None,
        }
    }

    /// Single bit boolean field
    pub const fn boolean(position: usize, bit: u8, name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            position,
            length: 1,
            kind: FieldKind::Boolean { bit },
            unit: None,
        }
    }

    /// Whole byte on/off field
    pub const fn flag(position: usize, on_value: u8, name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            position,
            length: 1,
            kind: FieldKind::BooleanFlag { on_value },
            unit: None,
        }
    }

    pub const fn date(position: usize, name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            position,
            length: 3,
            kind: FieldKind::Date,
            unit: None,
        }
    }

    pub const fn date_time(position: usize, length: usize, name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            position,
            length,
            kind: FieldKind::DateTime,
            unit: None,
        }
    }

    pub const fn string(position: usize, length: usize, name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            position,
            length,
            kind: FieldKind::String,
            unit: None,
        }
    }

    /// Attach a display unit
    pub const fn with_unit(self, unit: Unit) -> Self {
        Self { unit: Some(unit), ..self }
    }

    /// Decode integers as signed two's complement
    pub const fn signed(self) -> Self {
        let scale = match self.kind {
            FieldKind::Integer { scale, .. } => scale,
            _ => None,
        };
        Self { kind: FieldKind::Integer { scale, signed: true }, ..self }
    }

    /// Divide the raw integer by `factor`
    pub const fn divided_by(self, factor: u16) -> Self {
        self.scaled(Scale::Divide(factor))
    }

    /// Multiply the raw integer by `factor`
    pub const fn multiplied_by(self, factor: u16) -> Self {
        self.scaled(Scale::Multiply(factor))
    }

    const fn scaled(self, scale: Scale) -> Self {
        let signed = match self.kind {
            FieldKind::Integer { signed, .. } => signed,
            _ => false,
        };
        Self { kind: FieldKind::Integer { scale: Some(scale), signed }, ..self }
    }

    /// One past the last byte of the field
    pub fn end(&self) -> usize {
        self.position + self.length
    }

    /// Bit index of boolean fields
    pub fn bit(&self) -> Option<u8> {
        match self.kind {
            FieldKind::Boolean { bit } => Some(bit),
            _ => None,
        }
    }

    /// Check the field against the rules of its kind and the message length
    pub fn validate(&self, message_length: usize) -> EmsResult<()> {
        let (min, max) = self.kind.length_bounds();
        if self.length < min || self.length > max {
            return Err(EmsError::configuration(format!(
                "Field {}: invalid length {} for {} field (allowed {}..={})",
                self.name,
                self.length,
                self.kind.name(),
                min,
                max
            )));
        }
        if self.end() > message_length {
            return Err(EmsError::configuration(format!(
                "Field {}: bytes {}..{} exceed message length {}",
                self.name,
                self.position,
                self.end(),
                message_length
            )));
        }
        match self.kind {
            FieldKind::Boolean { bit } if bit > 7 => Err(EmsError::configuration(format!(
                "Field {}: bit {} out of range",
                self.name, bit
            ))),
            FieldKind::Integer { scale: Some(Scale::Divide(0)), .. }
            | FieldKind::Integer { scale: Some(Scale::Multiply(0)), .. } => Err(
                EmsError::configuration(format!("Field {}: zero scale factor", self.name)),
            ),
            _ => Ok(()),
        }
    }

    /// Decode the field from a full message buffer
    pub fn decode(&self, buffer: &[u8]) -> EmsResult<Value> {
        let data = buffer.get(self.position..self.end()).ok_or_else(|| {
            EmsError::decode(self.name, format!("buffer of {} bytes too short", buffer.len()))
        })?;

        match self.kind {
            FieldKind::Integer { scale, signed } => {
                let raw = if signed {
                    BigEndian::read_int(data, self.length)
                } else {
                    BigEndian::read_uint(data, self.length) as i64
                };
                Ok(match scale {
                    None => Value::Integer(raw),
                    Some(Scale::Divide(factor)) => Value::Decimal(raw as f64 / f64::from(factor)),
                    Some(Scale::Multiply(factor)) => Value::Integer(raw * i64::from(factor)),
                })
            }
            FieldKind::Boolean { bit } => Ok(Value::Bool(data[0] & (1 << bit) != 0)),
            FieldKind::BooleanFlag { on_value } => Ok(Value::Bool(data[0] == on_value)),
            FieldKind::Date => {
                let year = YEAR_EPOCH + i32::from(data[2]);
                NaiveDate::from_ymd_opt(year, u32::from(data[1]), u32::from(data[0]))
                    .map(Value::Date)
                    .ok_or_else(|| EmsError::decode(self.name, format!("invalid date {}", hex::encode(data))))
            }
            FieldKind::DateTime => {
                let year = YEAR_EPOCH + i32::from(data[0] & 0x7F);
                let second = if self.length == 6 { data[5] } else { 0 };
                NaiveDate::from_ymd_opt(year, u32::from(data[1]), u32::from(data[3]))
                    .and_then(|date| {
                        date.and_hms_opt(u32::from(data[2]), u32::from(data[4]), u32::from(second))
                    })
                    .map(|value| Value::DateTime { value, reserved_bit: data[0] & 0x80 != 0 })
                    .ok_or_else(|| {
                        EmsError::decode(self.name, format!("invalid timestamp {}", hex::encode(data)))
                    })
            }
            FieldKind::String => Ok(Value::Text(iso8859_15::decode(data))),
        }
    }

    /// Encode a value into the field's bytes
    ///
    /// Boolean fields encode their bit alone; writes merge it into the last
    /// known byte with [`Field::apply_bit`].
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let bytes = match (self.kind, value) {
            (FieldKind::Integer { scale, signed }, _) => {
                let raw = self.raw_integer(scale, value)?;
                self.check_integer_range(raw, signed)?;
                let mut buf = vec![0u8; self.length];
                if signed {
                    BigEndian::write_int(&mut buf, raw, self.length);
                } else {
                    BigEndian::write_uint(&mut buf, raw as u64, self.length);
                }
                buf
            }
            (FieldKind::Boolean { .. }, Value::Bool(on)) => vec![self.apply_bit(0, *on)],
            (FieldKind::BooleanFlag { on_value }, Value::Bool(on)) => {
                vec![if *on { on_value } else { 0x00 }]
            }
            (FieldKind::Date, Value::Date(date)) => {
                let year = offset_year(date.year(), 0xFF, date)?;
                vec![date.day() as u8, date.month() as u8, year]
            }
            (FieldKind::DateTime, Value::DateTime { value, reserved_bit }) => {
                let year = offset_year(value.year(), 0x7F, value)?;
                let mut buf = vec![
                    year | if *reserved_bit { 0x80 } else { 0x00 },
                    value.month() as u8,
                    value.hour() as u8,
                    value.day() as u8,
                    value.minute() as u8,
                ];
                if self.length == 6 {
                    buf.push(value.second() as u8);
                }
                buf
            }
            (FieldKind::String, Value::Text(text)) => iso8859_15::encode(text)?,
            (kind, value) => {
                return Err(EncodeError::TypeMismatch {
                    expected: kind.name(),
                    found: value.type_name(),
                })
            }
        };

        if bytes.len() != self.length {
            return Err(EncodeError::LengthMismatch {
                expected: self.length,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    fn raw_integer(&self, scale: Option<Scale>, value: &Value) -> Result<i64, EncodeError> {
        match (scale, value) {
            (None, Value::Integer(v)) => return Ok(*v),
            (Some(Scale::Multiply(factor)), Value::Integer(v)) if v % i64::from(factor) == 0 => {
                return Ok(v / i64::from(factor))
            }
            _ => {}
        }

        let number = value.as_f64().ok_or(EncodeError::TypeMismatch {
            expected: "integer",
            found: value.type_name(),
        })?;
        let scaled = match scale {
            None => number,
            Some(Scale::Divide(factor)) => number * f64::from(factor),
            Some(Scale::Multiply(factor)) => number / f64::from(factor),
        };

        let rounded = scaled.round();
        if !rounded.is_finite() || rounded.abs() > i64::MAX as f64 {
            return Err(EncodeError::OutOfRange {
                value: value.to_string(),
                length: self.length,
            });
        }
        Ok(rounded as i64)
    }

    fn check_integer_range(&self, raw: i64, signed: bool) -> Result<(), EncodeError> {
        let bits = 8 * self.length as u32;
        let (min, max) = if signed {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        };
        if raw < min || raw > max {
            return Err(EncodeError::OutOfRange {
                value: raw.to_string(),
                length: self.length,
            });
        }
        Ok(())
    }

    /// Set or clear this field's bit in `byte`, leaving all other bits alone
    pub fn apply_bit(&self, byte: u8, on: bool) -> u8 {
        match self.kind {
            FieldKind::Boolean { bit } => {
                let mask = 1u8 << bit;
                if on {
                    byte | mask
                } else {
                    byte & !mask
                }
            }
            _ => byte,
        }
    }

    /// Compare the field's bytes in an update against the stored buffer
    ///
    /// `update` starts at message position `offset`; the field must be
    /// covered by it, otherwise nothing is reported as changed. Boolean
    /// fields only compare their own bit.
    pub(crate) fn changed(&self, update: &[u8], offset: usize, buffer: &[u8]) -> bool {
        let incoming = match self.position.checked_sub(offset) {
            Some(start) => update.get(start..start + self.length),
            None => None,
        };
        let (incoming, stored) = match (incoming, buffer.get(self.position..self.end())) {
            (Some(incoming), Some(stored)) => (incoming, stored),
            _ => return false,
        };
        match self.kind {
            FieldKind::Boolean { bit } => {
                let mask = 1u8 << bit;
                incoming[0] & mask != stored[0] & mask
            }
            _ => incoming != stored,
        }
    }

    /// Render a value with the field's unit
    pub fn display(&self, value: &Value) -> String {
        match self.unit {
            Some(unit) => unit.render(value),
            None => value.to_string(),
        }
    }
}

fn offset_year(year: i32, max: u8, value: &impl fmt::Display) -> Result<u8, EncodeError> {
    u8::try_from(year - YEAR_EPOCH)
        .ok()
        .filter(|offset| *offset <= max)
        .ok_or_else(|| EncodeError::InvalidDate { value: value.to_string() })
}

/// ISO-8859-15 (Latin-9) codec
///
/// Latin-9 equals Latin-1 except for eight code points.
mod iso8859_15 {
    use crate::error::EncodeError;

    const REPLACED: [(u8, char); 8] = [
        (0xA4, '\u{20AC}'),
        (0xA6, '\u{0160}'),
        (0xA8, '\u{0161}'),
        (0xB4, '\u{017D}'),
        (0xB8, '\u{017E}'),
        (0xBC, '\u{0152}'),
        (0xBD, '\u{0153}'),
        (0xBE, '\u{0178}'),
    ];

    pub fn decode(data: &[u8]) -> String {
        data.iter()
            .map(|&byte| {
                REPLACED
                    .iter()
                    .find(|(code, _)| *code == byte)
                    .map(|(_, c)| *c)
                    .unwrap_or(char::from(byte))
            })
            .collect()
    }

    pub fn encode(text: &str) -> Result<Vec<u8>, EncodeError> {
        text.chars()
            .map(|c| {
                if let Some((code, _)) = REPLACED.iter().find(|(_, r)| *r == c) {
                    return Ok(*code);
                }
                match u8::try_from(u32::from(c)) {
                    Ok(byte) if !REPLACED.iter().any(|(code, _)| *code == byte) => Ok(byte),
                    _ => Err(EncodeError::Unrepresentable { character: c }),
                }
            })
            .collect()
    }
}
