//! NDJSON line codec for intercom channels.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving peer cannot force an unbounded allocation for a single
//! message.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted on a channel: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line decoder for inbound intercom traffic.
///
/// Inbound lines longer than [`MAX_LINE_BYTES`] return
/// [`AppError::Protocol`]`("line too long: …")`; the codec then discards up to
/// the next newline so the following message still decodes. I/O errors map to
/// [`AppError::Io`].
#[derive(Debug)]
pub struct IntercomCodec(LinesCodec);

impl IntercomCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }
}

impl Default for IntercomCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IntercomCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

/// Map a [`LinesCodecError`] to an [`AppError`].
fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => AppError::Protocol("line too long".into()),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
