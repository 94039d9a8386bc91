//! Length-prefixed JSON framing.
//!
//! Every frame is a 4-byte big-endian length followed by one JSON document.
//! The same framing is used on the external socket and on the engine pipe.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. Payloads are small command arguments.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Raw frame codec shared by [`JsonCodec`] and the socket transport.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Strict codec: a frame that does not decode as `T` is an I/O error.
///
/// Used on the engine pipe, where both ends are this crate and a bad frame
/// means the stream is corrupt.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: frame_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = encode_json(&item)?;
        self.inner.encode(json, dst)
    }
}

/// Serialize one value into a frame body.
pub fn encode_json<T: Serialize>(item: &T) -> io::Result<Bytes> {
    let json =
        serde_json::to_vec(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
    Ok(Bytes::from(json))
}
