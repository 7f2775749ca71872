use super::error::ProtocolError;
use bytes::BufMut;
use medlink_sdk::{
    checksum::{sum_lsb, MEDTRONIC_CRC8},
    WireEncode,
};

/// ASCII control bytes framing every exchange with the link.
pub mod ascii {
    pub const STX: u8 = 0x02;
    pub const ETX: u8 = 0x03;
    pub const EOT: u8 = 0x04;
    pub const ENQ: u8 = 0x05;
    pub const ACK: u8 = 0x06;
    pub const LF: u8 = 0x0A;
    pub const CR: u8 = 0x0D;
    pub const NAK: u8 = 0x15;
    pub const ETB: u8 = 0x17;
}

/// Contour Next Link remote-mode commands sent during the handshake.
pub mod remote {
    pub const WRITE: [u8; 2] = [0x57, 0x7C];
    pub const QUERY: [u8; 2] = [0x51, 0x7C];
    pub const MAGIC: [u8; 2] = [0x31, 0x7C];
    pub const END: [u8; 2] = [0x30, 0x7C];
}

pub const HID_PACKET_SIZE: usize = 64;
pub const MAGIC_HEADER: &[u8; 3] = b"ABC";
/// Offset of the pump payload inside an assembled reply.
pub const MEDTRONIC_PACKET_START: usize = 33;
pub const STROKES_PER_UNIT: f64 = 40.0;
pub const SUPPORTED_MODELS: [&str; 6] = ["523", "551", "554", "723", "751", "754"];

const MESSAGE_PARAMETER_WIDTH: usize = 22;
const PADDING_ZEROS: usize = 43;
const PADDING_PACKET_LEN: u8 = 44;

/// Link-level message class carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    OpenConnection,
    SendMessage,
}

impl LinkCommand {
    fn bytes(self) -> [u8; 3] {
        match self {
            LinkCommand::OpenConnection => [0x10, 0x01, 0x1E],
            LinkCommand::SendMessage => [0x12, 0x21, 0x05],
        }
    }
}

/// Pump message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    WriteCbgTimestamp = 0x28,
    ReadTime = 0x70,
    ReadBatteryStatus = 0x72,
    ReadHistory = 0x80,
    ReadWizardEnabled = 0x87,
    ReadCarbRatios = 0x8A,
    ReadInsulinSensitivities = 0x8B,
    ReadModel = 0x8D,
    ReadProfileStd = 0x92,
    ReadProfileA = 0x93,
    ReadProfileB = 0x94,
    ReadCbgHistory = 0x9A,
    ReadIsigHistory = 0x9B,
    ReadCurrentPage = 0x9D,
    ReadBgTargets = 0x9F,
    ReadSettings = 0xC0,
    ReadCurrentCbgPage = 0xCD,
}

impl Opcode {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// How many 256-byte parts a reply is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePartition {
    Three,
    Four,
    Eight,
}

impl PagePartition {
    pub fn parts(self) -> usize {
        match self {
            PagePartition::Three => 3,
            PagePartition::Four => 4,
            PagePartition::Eight => 8,
        }
    }

    fn expected_bytes(self) -> u16 {
        match self {
            PagePartition::Three => 192,
            PagePartition::Four => 1024,
            PagePartition::Eight => 2048,
        }
    }

    fn expected_packets(self) -> u16 {
        match self {
            PagePartition::Three => 4,
            PagePartition::Four | PagePartition::Eight => 16,
        }
    }

    fn payload_extra(self) -> u32 {
        match self {
            PagePartition::Three => 0,
            PagePartition::Four | PagePartition::Eight => PADDING_PACKET_LEN as u32,
        }
    }
}

/// Pump identity used as encoding context: the six character serial and the
/// four byte message header derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpIdentity {
    serial: String,
    header: [u8; 4],
}

impl PumpIdentity {
    pub fn new(serial: &str) -> Result<Self, ProtocolError> {
        let serial = serial.trim();
        if serial.len() != 6 || !serial.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Pump serial number must be six digits, got {serial:?}"
            )));
        }
        let mut header = [0xA7, 0, 0, 0];
        for (slot, chunk) in header[1..].iter_mut().zip(serial.as_bytes().chunks(2)) {
            let pair = std::str::from_utf8(chunk)
                .map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        }
        Ok(Self {
            serial: serial.to_string(),
            header,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn serial_bytes(&self) -> &[u8] {
        self.serial.as_bytes()
    }

    pub fn header(&self) -> [u8; 4] {
        self.header
    }

    /// Header, opcode and either the padded parameter or a CRC-8 trailer.
    fn message(&self, command: u8, parameter: Option<&[u8]>) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + 1 + MESSAGE_PARAMETER_WIDTH);
        payload.extend_from_slice(&self.header);
        payload.push(command);
        match parameter {
            Some(param) => {
                payload.extend_from_slice(param);
                payload.resize(
                    payload.len() + MESSAGE_PARAMETER_WIDTH.saturating_sub(param.len()),
                    0,
                );
            }
            None => {
                payload.push(0);
                let crc = MEDTRONIC_CRC8.checksum(&payload);
                payload.push(crc);
            }
        }
        payload
    }
}

/// Plain control bytes, e.g. EOT or a remote-mode command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket(Vec<u8>);

impl ControlPacket {
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn byte(byte: u8) -> Self {
        Self(vec![byte])
    }

    pub fn payload(&self) -> &[u8] {
        &self.0
    }
}

/// A pump message wrapped in the link header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedtronicPacket {
    pub link: LinkCommand,
    pub command: Option<u8>,
    pub parameter: Option<Vec<u8>>,
    pub partition: Option<PagePartition>,
}

impl MedtronicPacket {
    pub fn open_connection() -> Self {
        Self {
            link: LinkCommand::OpenConnection,
            command: None,
            parameter: None,
            partition: None,
        }
    }

    pub fn command(opcode: Opcode) -> Self {
        Self {
            link: LinkCommand::SendMessage,
            command: Some(opcode.code()),
            parameter: None,
            partition: None,
        }
    }

    /// A command whose reply spans several parts, e.g. a basal profile.
    pub fn multipart(opcode: Opcode, partition: PagePartition) -> Self {
        Self {
            partition: Some(partition),
            ..Self::command(opcode)
        }
    }

    /// Page read for `opcode` with a page selector parameter.
    pub fn page_request(opcode: Opcode, parameter: Vec<u8>, partition: PagePartition) -> Self {
        Self {
            parameter: Some(parameter),
            partition: Some(partition),
            ..Self::command(opcode)
        }
    }

    fn partition(&self) -> Option<PagePartition> {
        match (self.partition, &self.parameter) {
            (Some(p), _) => Some(p),
            (None, Some(_)) => Some(PagePartition::Four),
            (None, None) => None,
        }
    }

    fn payload(&self, ident: &PumpIdentity) -> Vec<u8> {
        match self.command {
            Some(command) => ident.message(command, self.parameter.as_deref()),
            None => Vec::new(),
        }
    }

    /// Bytes the link echoes back when the connection opens.
    pub fn body(&self, ident: &PumpIdentity) -> Vec<u8> {
        let payload = self.payload(ident);
        let (expected_bytes, mut expected_packets, payload_size) = match self.partition() {
            Some(p) => (
                p.expected_bytes(),
                p.expected_packets(),
                payload.len() as u32 + p.payload_extra(),
            ),
            None => (0, 0, payload.len() as u32),
        };
        if expected_packets > 0 {
            expected_packets += 4096;
        }

        let mut body = Vec::with_capacity(MEDTRONIC_PACKET_START + payload.len());
        body.put_u8(0x51);
        body.put_u8(0x01);
        body.put_slice(ident.serial_bytes());
        body.put_bytes(0, 10);
        body.put_slice(&self.link.bytes());
        body.put_bytes(0, 2);
        body.put_u16_le(expected_bytes);
        body.put_u16_le(expected_packets);
        body.put_u8(0);
        body.put_u32_le(payload_size);

        let mut checksum = sum_lsb(&body).wrapping_add(sum_lsb(&payload));
        if let (Some(command), Some(param)) = (self.command, self.parameter.as_deref()) {
            checksum = checksum.wrapping_add(PaddingPacket::crc(ident, command, param));
        }
        body.put_u8(checksum);
        body.put_slice(&payload);
        body
    }
}

/// Trailing packet sent after a page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingPacket {
    pub command: u8,
    pub parameter: Vec<u8>,
}

impl PaddingPacket {
    pub fn new(opcode: Opcode, parameter: Vec<u8>) -> Self {
        Self {
            command: opcode.code(),
            parameter,
        }
    }

    fn crc(ident: &PumpIdentity, command: u8, parameter: &[u8]) -> u8 {
        let mut bytes = ident.message(command, Some(parameter));
        bytes.resize(bytes.len() + PADDING_ZEROS, 0);
        MEDTRONIC_CRC8.checksum(&bytes)
    }
}

/// Anything the session writes to the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPacket {
    Control(ControlPacket),
    Medtronic(MedtronicPacket),
    Padding(PaddingPacket),
}

impl From<ControlPacket> for OutboundPacket {
    fn from(p: ControlPacket) -> Self {
        OutboundPacket::Control(p)
    }
}

impl From<MedtronicPacket> for OutboundPacket {
    fn from(p: MedtronicPacket) -> Self {
        OutboundPacket::Medtronic(p)
    }
}

impl From<PaddingPacket> for OutboundPacket {
    fn from(p: PaddingPacket) -> Self {
        OutboundPacket::Padding(p)
    }
}

impl WireEncode for OutboundPacket {
    type Error = ProtocolError;
    type Context = PumpIdentity;

    fn encoded_len(&self, ctx: &Self::Context) -> usize {
        match self {
            OutboundPacket::Control(p) => 4 + p.0.len(),
            OutboundPacket::Medtronic(p) => 4 + MEDTRONIC_PACKET_START + p.payload(ctx).len(),
            OutboundPacket::Padding(_) => 4 + PADDING_PACKET_LEN as usize,
        }
    }

    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<(), Self::Error> {
        let body = match self {
            OutboundPacket::Control(p) => p.0.clone(),
            OutboundPacket::Medtronic(p) => p.body(ctx),
            OutboundPacket::Padding(p) => {
                let mut body = vec![0u8; PADDING_ZEROS];
                body.push(PaddingPacket::crc(ctx, p.command, &p.parameter));
                body
            }
        };
        let len = u8::try_from(body.len()).map_err(|_| {
            ProtocolError::InvalidPacket(format!("packet body of {} bytes", body.len()))
        })?;
        dst.put_slice(&[0, 0, 0, len]);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> PumpIdentity {
        PumpIdentity::new("123456").unwrap()
    }

    #[test]
    fn header_is_hex_pairs_of_serial() {
        assert_eq!(ident().header(), [0xA7, 0x12, 0x34, 0x56]);
        assert!(PumpIdentity::new("12345").is_err());
    }

    #[test]
    fn control_packet_is_length_prefixed() {
        let out = OutboundPacket::from(ControlPacket::new(&remote::WRITE))
            .to_bytes(&ident())
            .unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 2, 0x57, 0x7C]);
    }

    #[test]
    fn open_connection_has_empty_payload() {
        let packet = MedtronicPacket::open_connection();
        let out = OutboundPacket::from(packet.clone()).to_bytes(&ident()).unwrap();
        assert_eq!(out.len(), 4 + 33);
        assert_eq!(out[3], 33);
        assert_eq!(&out[4..6], &[0x51, 0x01]);
        assert_eq!(&out[6..12], b"123456");
        assert_eq!(&out[22..25], &[0x10, 0x01, 0x1E]);
        let sum = sum_lsb(&out[4..36]);
        assert_eq!(out[36], sum);
        assert_eq!(&out[4..], &packet.body(&ident())[..]);
    }

    #[test]
    fn simple_command_carries_crc8_trailer() {
        let out = OutboundPacket::from(MedtronicPacket::command(Opcode::ReadModel))
            .to_bytes(&ident())
            .unwrap();
        let payload = &out[37..];
        assert_eq!(&payload[..6], &[0xA7, 0x12, 0x34, 0x56, 0x8D, 0x00]);
        assert_eq!(payload[6], MEDTRONIC_CRC8.checksum(&payload[..6]));
        // payload size field
        assert_eq!(&out[32..36], &[7, 0, 0, 0]);
        let expected = sum_lsb(&out[4..36]).wrapping_add(sum_lsb(payload));
        assert_eq!(out[36], expected);
    }

    #[test]
    fn page_request_reserves_padding_packet() {
        let packet = MedtronicPacket::page_request(
            Opcode::ReadHistory,
            vec![0x01, 0x03],
            PagePartition::Four,
        );
        let out = OutboundPacket::from(packet).to_bytes(&ident()).unwrap();
        let payload = &out[37..];
        assert_eq!(payload.len(), 27);
        assert_eq!(&payload[4..7], &[0x80, 0x01, 0x03]);
        assert!(payload[7..].iter().all(|b| *b == 0));
        // expected bytes 1024, expected packets 16 + 4096, payload 27 + 44
        assert_eq!(&out[27..29], &1024u16.to_le_bytes());
        assert_eq!(&out[29..31], &4112u16.to_le_bytes());
        assert_eq!(&out[32..36], &71u32.to_le_bytes());
        let padding = PaddingPacket::crc(&ident(), 0x80, &[0x01, 0x03]);
        let expected = sum_lsb(&out[4..36])
            .wrapping_add(sum_lsb(payload))
            .wrapping_add(padding);
        assert_eq!(out[36], expected);
    }

    #[test]
    fn padding_packet_layout() {
        let out = OutboundPacket::from(PaddingPacket::new(Opcode::ReadHistory, vec![0x01, 0x00]))
            .to_bytes(&ident())
            .unwrap();
        assert_eq!(out.len(), 48);
        assert_eq!(&out[..4], &[0, 0, 0, 44]);
        assert!(out[4..47].iter().all(|b| *b == 0));
        assert_eq!(out[47], PaddingPacket::crc(&ident(), 0x80, &[0x01, 0x00]));
    }
}
