use bytes::{BufMut, Bytes, BytesMut};

/// Encoding of outbound device packets.
pub trait WireEncode {
    type Error: std::fmt::Debug + Send + Sync + 'static;
    type Context;

    fn encoded_len(&self, ctx: &Self::Context) -> usize;
    fn encode_to<B: BufMut>(&self, dst: &mut B, ctx: &Self::Context) -> Result<(), Self::Error>;

    /// Encode into a freshly allocated, exactly sized buffer.
    fn to_bytes(&self, ctx: &Self::Context) -> Result<Bytes, Self::Error> {
        let mut buf = BytesMut::with_capacity(self.encoded_len(ctx));
        self.encode_to(&mut buf, ctx)?;
        Ok(buf.freeze())
    }
}

/// Decoding of device records out of a page buffer.
pub trait WireDecode: Sized {
    type Error: std::fmt::Debug + Send + Sync + 'static;
    type Context;

    /// Parse one item from the front of `input` and return the rest.
    /// `parent` owns `input` so parsed fields can be sliced without copying.
    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self), Self::Error>;
}
