use bytes::{BufMut, BytesMut};
use error::NatsError;
use protocol::op::PendingPayload;
use protocol::Op;
use tokio_codec::{Decoder, Encoder};

/// Frames `Op`s over a byte stream. Decoding tolerates arbitrary
/// fragmentation: a control line announcing a payload is remembered in
/// `pending` until the payload and its trailing CRLF are buffered.
#[derive(Debug, Default)]
pub struct OpCodec {
    pending: Option<PendingPayload>,
}

impl Encoder for OpCodec {
    type Item = Op;
    type Error = NatsError;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let buf = item.into_bytes()?;
        let buf_len = buf.len();
        let remaining_bytes = dst.remaining_mut();
        if remaining_bytes < buf_len {
            dst.reserve(buf_len);
        }
        dst.put(buf);
        Ok(())
    }
}

impl Decoder for OpCodec {
    type Item = Op;
    type Error = NatsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Op::poll_from(src, &mut self.pending).map_err(NatsError::from)
    }
}
