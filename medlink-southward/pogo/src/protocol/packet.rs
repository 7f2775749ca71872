use super::error::ProtocolError;
use bytes::BufMut;
use medlink_sdk::{checksum::crc16_ccitt, WireEncode};
use std::fmt;

pub mod ascii {
    pub const STX: u8 = 0x02;
    pub const ETX: u8 = 0x03;
}

/// Length of the hex checksum trailing every frame.
pub const CHECKSUM_LEN: usize = 4;

/// CRC-16 CCITT, zero seed, as sent by the meter.
pub fn checksum(bytes: &[u8]) -> u16 {
    crc16_ccitt(bytes, 0, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    ReadSerial,
    NrRecords,
    GetEvent,
}

impl OpCode {
    pub fn as_char(self) -> char {
        match self {
            OpCode::ReadSerial => '?',
            OpCode::NrRecords => 'n',
            OpCode::GetEvent => 'D',
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Outbound command: `STX op payload CRC ETX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: OpCode,
    pub payload: String,
}

impl Command {
    pub fn new(op: OpCode) -> Self {
        Self {
            op,
            payload: String::new(),
        }
    }

    /// Read the record stored at `index`.
    pub fn get_event(index: u32) -> Self {
        Self {
            op: OpCode::GetEvent,
            payload: format!("{index:03}"),
        }
    }

    fn body(&self) -> String {
        format!("{}{}", self.op.as_char(), self.payload)
    }
}

impl WireEncode for Command {
    type Error = ProtocolError;
    type Context = ();

    fn encoded_len(&self, _: &()) -> usize {
        2 + self.body().len() + CHECKSUM_LEN
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, _: &()) -> Result<(), Self::Error> {
        let body = self.body();
        dst.put_u8(ascii::STX);
        dst.put_slice(body.as_bytes());
        dst.put_slice(format!("{:04X}", checksum(body.as_bytes())).as_bytes());
        dst.put_u8(ascii::ETX);
        Ok(())
    }
}

/// Check a received frame (everything before ETX) and return its body,
/// without STX and checksum.
pub fn extract_message(frame: &[u8]) -> Result<String, ProtocolError> {
    if frame.len() < 1 + CHECKSUM_LEN {
        return Err(ProtocolError::InvalidPacket(format!(
            "Response too short: {} bytes",
            frame.len()
        )));
    }
    let (head, trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
    let body = &head[1..];
    let received = std::str::from_utf8(trailer)
        .ok()
        .and_then(|hex| u16::from_str_radix(hex, 16).ok())
        .ok_or_else(|| ProtocolError::InvalidPacket("Checksum is not hex".into()))?;
    let expected = checksum(body);
    if received != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, received });
    }
    Ok(String::from_utf8_lossy(body).into_owned())
}
