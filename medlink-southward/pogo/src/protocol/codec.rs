use super::{
    error::ProtocolError,
    packet::{ascii, Command},
};
use bytes::{Buf, Bytes, BytesMut};
use medlink_sdk::{checksum::to_hex, WireEncode};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// ETX-delimited frame codec for use with `tokio_util::codec::Framed`.
///
/// Decoded items are the raw bytes before ETX, STX and checksum included.
#[derive(Debug, Clone, Default)]
pub struct PogoCodec;

impl Decoder for PogoCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(end) = src.iter().position(|b| *b == ascii::ETX) else {
                return Ok(None);
            };
            if end == 0 {
                debug!("dropping empty frame");
                src.advance(1);
                continue;
            }
            let frame = src.split_to(end).freeze();
            src.advance(1);
            trace!(packet = %to_hex(&frame), "received");
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Command> for PogoCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.encode_to(dst, &())
            .map_err(|e: ProtocolError| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        debug!(packet = %to_hex(&dst[start..]), "sending");
        Ok(())
    }
}
