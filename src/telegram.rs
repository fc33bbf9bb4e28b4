//! EMS telegram definitions and framing
//!
//! This module contains the wire format of a single bus telegram, the EMS
//! checksum and builders for the two kinds of telegrams the engine emits
//! (read requests and writes).
//!
//! ```text
//! [src:1][dst:1][type:1][offset:1][payload:1..27][checksum:1]
//! ```
//!
//! A destination with the high bit set marks a read request, destination
//! `0x00` marks a broadcast.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EmsError, EmsResult};

/// Smallest valid telegram (header, one payload byte, checksum)
pub const MIN_TELEGRAM_LENGTH: usize = 6;

/// Largest telegram the bus driver forwards
pub const MAX_TELEGRAM_LENGTH: usize = 32;

/// Source, destination, type and offset
pub const HEADER_LENGTH: usize = 4;

/// Largest payload fitting into one telegram
pub const MAX_PAYLOAD_LENGTH: usize = MAX_TELEGRAM_LENGTH - HEADER_LENGTH - 1;

/// Destination bit marking a read request
pub const READ_FLAG: u8 = 0x80;

/// Destination of broadcasts
pub const BROADCAST_ADDRESS: u8 = 0x00;

/// Bus address type (0x01-0x7F)
pub type BusAddress = u8;

/// Calculate the EMS checksum over `data`
///
/// Per byte the running value is rotated left by one bit, XORed with `0x0C`
/// when its top bit was set, and then XORed with the byte.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &byte| {
        let carry = crc & 0x80 != 0;
        let mut next = if carry { crc ^ 0x0C } else { crc };
        next = (next << 1) | u8::from(carry);
        next ^ byte
    })
}

/// Usage of a telegram on the bus, derived from its destination byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelegramKind {
    /// Destination 0x00, no answer expected
    Broadcast,
    /// Destination with the read flag, answered immediately by the target
    ReadRequest,
    /// Directed telegram (write, or the answer to a read request)
    Write,
}

impl TelegramKind {
    /// Classify a raw destination byte
    pub fn from_destination(dst: u8) -> Self {
        if dst == BROADCAST_ADDRESS {
            TelegramKind::Broadcast
        } else if dst & READ_FLAG != 0 {
            TelegramKind::ReadRequest
        } else {
            TelegramKind::Write
        }
    }

    /// Label used in telegram dumps
    pub fn as_str(self) -> &'static str {
        match self {
            TelegramKind::Broadcast => "BROADCAST",
            TelegramKind::ReadRequest => "REQUEST",
            TelegramKind::Write => "WRITE",
        }
    }
}

impl fmt::Display for TelegramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub src: BusAddress,
    /// Raw destination byte, including the read flag
    pub dst: u8,
    /// Identification code of the message
    pub identification: u8,
    /// Byte offset of the payload within the message
    pub offset: u8,
    pub payload: Bytes,
    pub checksum: u8,
}

impl Telegram {
    /// Build a telegram and compute its checksum
    pub fn new(
        src: BusAddress,
        dst: u8,
        identification: u8,
        offset: u8,
        payload: impl Into<Bytes>,
    ) -> EmsResult<Self> {
        let payload = payload.into();
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(EmsError::frame(format!(
                "Payload of {} bytes outside of 1..={}",
                payload.len(),
                MAX_PAYLOAD_LENGTH
            )));
        }

        let mut telegram = Self {
            src,
            dst,
            identification,
            offset,
            payload,
            checksum: 0,
        };
        telegram.checksum = checksum(&telegram.header_and_payload());
        Ok(telegram)
    }

    /// Create a read request for a whole message
    ///
    /// The single payload byte is the maximum length of the answer.
    pub fn read_request(client_id: BusAddress, dst: BusAddress, identification: u8) -> Self {
        let payload = Bytes::copy_from_slice(&[MAX_TELEGRAM_LENGTH as u8]);
        let mut telegram = Self {
            src: client_id,
            dst: dst | READ_FLAG,
            identification,
            offset: 0,
            payload,
            checksum: 0,
        };
        telegram.checksum = checksum(&telegram.header_and_payload());
        telegram
    }

    /// Create a write of `data` at `offset` of a device's message
    pub fn write(
        client_id: BusAddress,
        dst: BusAddress,
        identification: u8,
        offset: u8,
        data: &[u8],
    ) -> EmsResult<Self> {
        Self::new(
            client_id,
            dst & !READ_FLAG,
            identification,
            offset,
            Bytes::copy_from_slice(data),
        )
    }

    /// Parse and validate a received frame
    ///
    /// # Errors
    ///
    /// * `EmsError::Frame` - frame shorter than 6 or longer than 32 bytes
    /// * `EmsError::ChecksumMismatch` - trailing byte is not the checksum of the rest
    pub fn parse(frame: &[u8]) -> EmsResult<Self> {
        if frame.len() < MIN_TELEGRAM_LENGTH {
            return Err(EmsError::frame(format!(
                "Telegram too short: {} bytes",
                frame.len()
            )));
        }
        if frame.len() > MAX_TELEGRAM_LENGTH {
            return Err(EmsError::frame(format!(
                "Telegram too long: {} bytes",
                frame.len()
            )));
        }

        let (body, trailer) = frame.split_at(frame.len() - 1);
        let expected = checksum(body);
        if expected != trailer[0] {
            return Err(EmsError::checksum_mismatch(expected, trailer[0]));
        }

        Ok(Self {
            src: body[0],
            dst: body[1],
            identification: body[2],
            offset: body[3],
            payload: Bytes::copy_from_slice(&body[HEADER_LENGTH..]),
            checksum: trailer[0],
        })
    }

    /// Encode the telegram including its checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = self.header_and_payload();
        frame.put_u8(self.checksum);
        frame.to_vec()
    }

    fn header_and_payload(&self) -> BytesMut {
        let mut frame = BytesMut::with_capacity(HEADER_LENGTH + self.payload.len() + 1);
        frame.put_u8(self.src);
        frame.put_u8(self.dst);
        frame.put_u8(self.identification);
        frame.put_u8(self.offset);
        frame.put_slice(&self.payload);
        frame
    }

    /// Usage of this telegram
    pub fn kind(&self) -> TelegramKind {
        TelegramKind::from_destination(self.dst)
    }

    /// Check if the destination carries the read flag
    pub fn is_read_request(&self) -> bool {
        self.kind() == TelegramKind::ReadRequest
    }

    /// Destination address without the read flag
    pub fn destination(&self) -> BusAddress {
        self.dst & !READ_FLAG
    }

    /// Total length on the wire
    pub fn len(&self) -> usize {
        HEADER_LENGTH + self.payload.len() + 1
    }

    /// Telegrams always carry at least one payload byte
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>9} 0x{:02x} -> 0x{:02x} t 0x{:02x}, o {}: {}",
            self.kind().as_str(),
            self.src,
            self.destination(),
            self.identification,
            self.offset,
            hex::encode(self.to_bytes())
        )
    }
}
