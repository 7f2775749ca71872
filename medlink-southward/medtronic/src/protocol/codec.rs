use super::{
    error::ProtocolError,
    packet::{OutboundPacket, PumpIdentity, HID_PACKET_SIZE, MAGIC_HEADER},
};
use bytes::{Buf, Bytes, BytesMut};
use medlink_sdk::{checksum::to_hex, WireEncode};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// One 64-byte report received from the Contour Next Link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidReport(Bytes);

impl HidReport {
    pub fn new(raw: Bytes) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &[u8] {
        &self.0
    }

    pub fn has_magic(&self) -> bool {
        self.0.starts_with(MAGIC_HEADER)
    }

    /// Length byte following the magic.
    pub fn size(&self) -> usize {
        self.byte(3) as usize
    }

    pub fn first_byte(&self) -> u8 {
        self.byte(4)
    }

    pub fn nak_code(&self) -> u8 {
        self.byte(31)
    }

    pub fn frame_type(&self) -> Option<u8> {
        self.size().checked_sub(1).and_then(|i| self.0.get(i).copied())
    }

    /// Pump payload length when the report opens a Medtronic reply for
    /// `serial`.
    pub fn payload_length(&self, serial: &[u8]) -> Option<u32> {
        let raw = self.raw();
        if raw.len() < 36 || raw[4] != 0x51 || &raw[6..12] != serial {
            return None;
        }
        Some(u32::from_le_bytes([raw[32], raw[33], raw[34], raw[35]]))
    }

    /// Data carried by the report after dropping `discard` leading bytes; the
    /// first remaining byte is the data length.
    pub fn data(&self, discard: usize) -> &[u8] {
        let Some(rest) = self.0.get(discard..) else {
            return &[];
        };
        let Some((&len, data)) = rest.split_first() else {
            return &[];
        };
        &data[..(len as usize).min(data.len())]
    }

    fn byte(&self, i: usize) -> u8 {
        self.0.get(i).copied().unwrap_or(0)
    }
}

/// Fixed-size HID report codec for use with `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct HidPacketCodec {
    identity: PumpIdentity,
}

impl HidPacketCodec {
    pub fn new(identity: PumpIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &PumpIdentity {
        &self.identity
    }
}

impl Decoder for HidPacketCodec {
    type Item = HidReport;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HID_PACKET_SIZE {
            return Ok(None);
        }
        let raw = src.split_to(HID_PACKET_SIZE).freeze();
        trace!(packet = %to_hex(&raw), "received");
        Ok(Some(HidReport::new(raw)))
    }
}

impl Encoder<OutboundPacket> for HidPacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OutboundPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.encode_to(dst, &self.identity)
            .map_err(|e: ProtocolError| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        trace!(packet = %to_hex(&dst[start..]), "sending");
        Ok(())
    }
}

/// Splits the byte stream written by a [`HidPacketCodec`] back into packet
/// bodies. Used by link simulators.
pub fn split_outbound(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < 4 {
        return None;
    }
    let len = buf[3] as usize;
    if buf.len() < 4 + len {
        return None;
    }
    buf.advance(4);
    Some(buf.split_to(len).freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{ascii, ControlPacket};

    fn report(bytes: &[u8]) -> BytesMut {
        let mut raw = BytesMut::zeroed(HID_PACKET_SIZE);
        raw[..bytes.len()].copy_from_slice(bytes);
        raw
    }

    #[test]
    fn decodes_whole_reports_only() {
        let mut codec = HidPacketCodec::new(PumpIdentity::new("123456").unwrap());
        let mut buf = report(b"ABC\x01\x06");
        buf.extend_from_slice(b"ABC");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.has_magic());
        assert_eq!(first.first_byte(), ascii::ACK);
        assert_eq!(first.data(3), &[ascii::ACK]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn data_length_is_capped_by_report() {
        let r = HidReport::new(report(b"ABC\xFF").freeze());
        assert_eq!(r.data(3).len(), HID_PACKET_SIZE - 4);
    }

    #[test]
    fn payload_length_requires_matching_serial() {
        let mut raw = report(b"ABC\x3C\x51\x01123456");
        raw[32] = 2;
        let r = HidReport::new(raw.freeze());
        assert_eq!(r.payload_length(b"123456"), Some(2));
        assert_eq!(r.payload_length(b"654321"), None);
    }

    #[test]
    fn outbound_stream_round_trips_through_splitter() {
        let mut codec = HidPacketCodec::new(PumpIdentity::new("123456").unwrap());
        let mut buf = BytesMut::new();
        codec
            .encode(ControlPacket::byte(ascii::EOT).into(), &mut buf)
            .unwrap();
        codec
            .encode(ControlPacket::byte(ascii::NAK).into(), &mut buf)
            .unwrap();
        assert_eq!(&split_outbound(&mut buf).unwrap()[..], &[ascii::EOT]);
        assert_eq!(&split_outbound(&mut buf).unwrap()[..], &[ascii::NAK]);
        assert!(split_outbound(&mut buf).is_none());
    }
}
