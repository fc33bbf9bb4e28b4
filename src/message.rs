//! Message layouts and per-device message buffers
//!
//! A [`MessageLayout`] is the validated, immutable description of one
//! identification code: its fixed length, its fields and the byte groups of
//! boolean fields sharing one byte. A [`Message`] couples a layout with the
//! last known bytes of one device and the values decoded from them.
//!
//! Updates arrive as partial windows (`offset` + bytes). [`Message::parse`]
//! detects which fields differ, merges the window into the buffer and
//! re-decodes only those fields.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EmsError, EmsResult, EncodeError};
use crate::field::{Field, FieldKind, Value};

/// Static description of a message type, as written in catalogue tables
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub identification: u8,
    pub name: &'static str,
    pub length: usize,
    pub writable: bool,
    pub fields: Vec<Field>,
}

impl MessageRow {
    pub fn new(identification: u8, name: &'static str, length: usize, fields: &[Field]) -> Self {
        Self {
            identification,
            name,
            length,
            writable: false,
            fields: fields.to_vec(),
        }
    }

    /// Mark the message as accepting writes
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

/// Boolean fields sharing one byte
///
/// Devices only accept whole-byte writes, so setting one bit means sending
/// the last observed byte with only that bit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitGroup {
    pub position: usize,
    /// Indices into the layout's field list
    pub fields: Vec<usize>,
    /// Bits claimed by declared fields
    pub mask: u8,
}

impl BitGroup {
    /// Byte to write when setting `field` to `on`, starting from the last known byte
    ///
    /// Returns `None` if the field is not a boolean of this byte.
    pub fn merge(&self, field: &Field, current: u8, on: bool) -> Option<u8> {
        match field.kind {
            FieldKind::Boolean { .. } if field.position == self.position => Some(field.apply_bit(current, on)),
            _ => None,
        }
    }

    /// Bits of the byte not described by any field
    pub fn undeclared_bits(&self) -> u8 {
        !self.mask
    }
}

/// Validated message layout
#[derive(Debug, Clone)]
pub struct MessageLayout {
    identification: u8,
    name: &'static str,
    length: usize,
    writable: bool,
    fields: Vec<Field>,
    bit_groups: Vec<BitGroup>,
    index: HashMap<&'static str, usize>,
}

impl MessageLayout {
    /// Validate a catalogue row
    ///
    /// Every field must fit the message and respect the length bounds of its
    /// kind. Field names must be unique. The only allowed overlap is boolean
    /// fields on distinct bits of the same byte.
    pub fn from_row(row: MessageRow) -> EmsResult<Self> {
        if row.length == 0 {
            return Err(EmsError::configuration(format!(
                "Message 0x{:02X} ({}) has zero length",
                row.identification, row.name
            )));
        }

        let mut index = HashMap::with_capacity(row.fields.len());
        for (i, field) in row.fields.iter().enumerate() {
            field.validate(row.length).map_err(|e| {
                EmsError::configuration(format!("Message 0x{:02X}: {}", row.identification, e))
            })?;
            if index.insert(field.name, i).is_some() {
                return Err(EmsError::configuration(format!(
                    "Message 0x{:02X}: duplicate field name {}",
                    row.identification, field.name
                )));
            }
        }

        for (i, a) in row.fields.iter().enumerate() {
            for b in &row.fields[i + 1..] {
                if a.position >= b.end() || b.position >= a.end() {
                    continue;
                }
                let shared_byte = match (a.bit(), b.bit()) {
                    (Some(bit_a), Some(bit_b)) => a.position == b.position && bit_a != bit_b,
                    _ => false,
                };
                if !shared_byte {
                    return Err(EmsError::configuration(format!(
                        "Message 0x{:02X}: fields {} and {} overlap",
                        row.identification, a.name, b.name
                    )));
                }
            }
        }

        let mut bit_groups: Vec<BitGroup> = Vec::new();
        for (i, field) in row.fields.iter().enumerate() {
            let Some(bit) = field.bit() else { continue };
            match bit_groups.iter_mut().find(|g| g.position == field.position) {
                Some(group) => {
                    group.fields.push(i);
                    group.mask |= 1 << bit;
                }
                None => bit_groups.push(BitGroup {
                    position: field.position,
                    fields: vec![i],
                    mask: 1 << bit,
                }),
            }
        }

        Ok(Self {
            identification: row.identification,
            name: row.name,
            length: row.length,
            writable: row.writable,
            fields: row.fields,
            bit_groups,
            index,
        })
    }

    pub fn identification(&self) -> u8 {
        self.identification
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn bit_groups(&self) -> &[BitGroup] {
        &self.bit_groups
    }

    /// Index of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    /// Byte group a boolean field belongs to
    pub fn bit_group(&self, position: usize) -> Option<&BitGroup> {
        self.bit_groups.iter().find(|g| g.position == position)
    }
}

/// Message buffer of one device
#[derive(Debug, Clone)]
pub struct Message {
    layout: Arc<MessageLayout>,
    buffer: Vec<u8>,
    values: Vec<Option<Value>>,
    /// Fields decoded at least once
    seen: Vec<bool>,
}

impl Message {
    /// Create an empty (all zero) message
    pub fn new(layout: Arc<MessageLayout>) -> Self {
        let fields = layout.fields.len();
        Self {
            buffer: vec![0; layout.length],
            values: vec![None; fields],
            seen: vec![false; fields],
            layout,
        }
    }

    pub fn layout(&self) -> &Arc<MessageLayout> {
        &self.layout
    }

    pub fn identification(&self) -> u8 {
        self.layout.identification
    }

    /// Last known bytes of the message
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Merge a partial update and report the fields that changed
    ///
    /// Returns indices into the layout's fields, in declaration order. An
    /// empty result means bytes arrived but no declared field differs.
    ///
    /// # Errors
    ///
    /// `EmsError::OutOfRange` if `offset + update.len()` exceeds the message
    /// length; the buffer and values are left untouched.
    pub fn parse(&mut self, update: &[u8], offset: usize) -> EmsResult<Vec<usize>> {
        let update_end = offset + update.len();
        if update_end > self.layout.length {
            return Err(EmsError::out_of_range(offset, update.len(), self.layout.length));
        }

        let mut changed = Vec::new();
        for (i, field) in self.layout.fields.iter().enumerate() {
            if field.end() <= offset || field.position >= update_end {
                continue;
            }
            if field.position < offset || field.end() > update_end {
                warn!(
                    "Update of message 0x{:02X} range [{}-{}] not covering whole field {}",
                    self.layout.identification, offset, update_end, field.name
                );
                continue;
            }
            if !self.seen[i] || field.changed(update, offset, &self.buffer) {
                changed.push(i);
            }
        }

        self.buffer[offset..update_end].copy_from_slice(update);

        for &i in &changed {
            let field = &self.layout.fields[i];
            self.seen[i] = true;
            self.values[i] = match field.decode(&self.buffer) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("Message 0x{:02X}: {}", self.layout.identification, e);
                    None
                }
            };
        }

        Ok(changed)
    }

    /// Encode a new value of a field into a write at `(position, bytes)`
    ///
    /// Boolean fields produce the whole last known byte with only their bit
    /// changed. The local buffer is not modified; the device reports the new
    /// state on its own.
    pub fn encode_field_for_write(&self, name: &str, value: &Value) -> EmsResult<(usize, Vec<u8>)> {
        let field = self
            .layout
            .field(name)
            .ok_or_else(|| EmsError::unknown_field(self.layout.identification, name))?;

        let bytes = match field.kind {
            FieldKind::Boolean { .. } => {
                let on = value.as_bool().ok_or(EncodeError::TypeMismatch {
                    expected: field.kind.name(),
                    found: value.type_name(),
                })?;
                let byte = self
                    .layout
                    .bit_group(field.position)
                    .and_then(|group| group.merge(field, self.buffer[field.position], on))
                    .ok_or_else(|| EmsError::internal(format!("No byte group for field {}", field.name)))?;
                vec![byte]
            }
            _ => field.encode(value)?,
        };
        Ok((field.position, bytes))
    }

    /// Decoded value of a field
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.layout
            .field_index(name)
            .and_then(|i| self.values[i].as_ref())
    }

    /// All fields with their decoded values
    pub fn values(&self) -> impl Iterator<Item = (&Field, Option<&Value>)> + '_ {
        self.layout
            .fields
            .iter()
            .zip(self.values.iter())
            .map(|(field, value)| (field, value.as_ref()))
    }

    /// Names of the fields at `indices`
    pub fn field_names(&self, indices: &[usize]) -> Vec<String> {
        indices
            .iter()
            .filter_map(|&i| self.layout.fields.get(i))
            .map(|field| field.name.to_string())
            .collect()
    }

    /// Log every field at debug level
    pub fn dump(&self) {
        debug!(
            "Message 0x{:02X} {}: {}",
            self.layout.identification,
            self.layout.name,
            hex::encode(&self.buffer)
        );
        for (field, value) in self.values() {
            let text = value.map_or_else(|| "-".to_string(), |v| field.display(v));
            debug!("{:40}: {}", field.label, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Unit;

    fn monitor_layout() -> Arc<MessageLayout> {
        let row = MessageRow::new(
            0x18,
            "UbaMonitorFast",
            25,
            &[
                Field::integer(0, 1, "forward_temp_set", "Set forward flow temperature")
                    .with_unit(Unit::Celsius)
                    .signed(),
                Field::integer(1, 2, "forward_temp", "Current forward flow temperature")
                    .with_unit(Unit::Celsius)
                    .divided_by(10)
                    .signed(),
                Field::boolean(7, 0, "valve1", "Gas valve 1").with_unit(Unit::OpenClosed),
                Field::boolean(7, 1, "valve2", "Gas valve 2").with_unit(Unit::OpenClosed),
                Field::string(18, 2, "service_code", "Service code"),
            ],
        );
        Arc::new(MessageLayout::from_row(row).unwrap())
    }

    #[test]
    fn test_full_then_partial_update() {
        let mut message = Message::new(monitor_layout());
        let mut frame = [0u8; 25];
        frame[0] = 0x32;
        frame[18..20].copy_from_slice(b"-H");

        let changed = message.parse(&frame, 0).unwrap();
        assert_eq!(changed.len(), 5);
        assert_eq!(message.value("forward_temp_set"), Some(&Value::Integer(50)));

        let changed = message.parse(&[0x28], 0).unwrap();
        assert_eq!(message.field_names(&changed), vec!["forward_temp_set"]);
        assert_eq!(message.value("forward_temp_set"), Some(&Value::Integer(40)));
        assert_eq!(message.value("service_code"), Some(&Value::from("-H")));
    }

    #[test]
    fn test_same_update_twice_is_unchanged() {
        let mut message = Message::new(monitor_layout());
        let update = [0x01, 0x02, 0x03];
        assert!(!message.parse(&update, 0).unwrap().is_empty());
        assert!(message.parse(&update, 0).unwrap().is_empty());
    }

    #[test]
    fn test_bit_siblings_are_isolated() {
        let mut message = Message::new(monitor_layout());
        message.parse(&[0b0000_0010], 7).unwrap();
        assert_eq!(message.value("valve2"), Some(&Value::Bool(true)));

        let changed = message.parse(&[0b0000_0011], 7).unwrap();
        assert_eq!(message.field_names(&changed), vec!["valve1"]);
        assert_eq!(message.value("valve1"), Some(&Value::Bool(true)));
        assert_eq!(message.value("valve2"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_out_of_range_leaves_buffer() {
        let mut message = Message::new(monitor_layout());
        message.parse(&[0x32], 0).unwrap();

        let result = message.parse(&[0u8; 10], 20);
        assert_eq!(result, Err(EmsError::out_of_range(20, 10, 25)));
        assert_eq!(message.buffer()[0], 0x32);
        assert_eq!(message.value("forward_temp_set"), Some(&Value::Integer(50)));
    }

    #[test]
    fn test_partially_covered_field_is_skipped() {
        let mut message = Message::new(monitor_layout());
        // Covers only the first byte of forward_temp
        let changed = message.parse(&[0x32, 0x01], 0).unwrap();
        assert_eq!(message.field_names(&changed), vec!["forward_temp_set"]);
        // Bytes are merged regardless
        assert_eq!(message.buffer()[1], 0x01);
        assert_eq!(message.value("forward_temp"), None);
    }

    #[test]
    fn test_boolean_write_keeps_other_bits() {
        let mut message = Message::new(monitor_layout());
        message.parse(&[0b1010_0001], 7).unwrap();

        let (position, bytes) = message
            .encode_field_for_write("valve2", &Value::Bool(true))
            .unwrap();
        assert_eq!(position, 7);
        assert_eq!(bytes, vec![0b1010_0011]);
        // Nothing is applied locally
        assert_eq!(message.buffer()[7], 0b1010_0001);

        let group = message.layout().bit_group(7).unwrap();
        assert_eq!(group.mask, 0b0000_0011);
        assert_eq!(group.undeclared_bits(), 0b1111_1100);

        let layout = message.layout();
        let valve1 = layout.field("valve1").unwrap();
        assert_eq!(group.merge(valve1, 0b1111_1111, false), Some(0b1111_1110));
        assert_eq!(group.merge(layout.field("forward_temp_set").unwrap(), 0, true), None);
    }

    #[test]
    fn test_write_errors() {
        let message = Message::new(monitor_layout());
        assert!(matches!(
            message.encode_field_for_write("service_code", &Value::from("ABC")),
            Err(EmsError::Encode(EncodeError::LengthMismatch { expected: 2, actual: 3 }))
        ));
        assert!(matches!(
            message.encode_field_for_write("missing", &Value::Integer(1)),
            Err(EmsError::UnknownField { .. })
        ));
        assert_eq!(
            message
                .encode_field_for_write("forward_temp", &Value::Decimal(45.5))
                .unwrap(),
            (1, vec![0x01, 0xC7])
        );
    }

    #[test]
    fn test_layout_validation() {
        let overlap = MessageRow::new(
            0x35,
            "Flags",
            2,
            &[Field::integer(0, 1, "data1", "Data 1"), Field::integer(0, 1, "data2", "Data 2")],
        );
        assert!(MessageLayout::from_row(overlap).is_err());

        let same_bit = MessageRow::new(
            0x34,
            "Monitor",
            8,
            &[Field::boolean(7, 3, "pump_day", "A"), Field::boolean(7, 3, "pump_on", "B")],
        );
        assert!(MessageLayout::from_row(same_bit).is_err());

        let too_long = MessageRow::new(0x1C, "Maintenance", 1, &[Field::integer(0, 2, "x", "X")]);
        assert!(MessageLayout::from_row(too_long).is_err());

        let duplicate = MessageRow::new(
            0x3E,
            "Monitor",
            15,
            &[Field::integer(5, 1, "t", "A"), Field::integer(6, 1, "t", "B")],
        );
        assert!(MessageLayout::from_row(duplicate).is_err());
    }
}
