//! Line codec for child process streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length so a child that never emits a newline cannot make the supervisor
//! allocate without bound.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length in bytes.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of a child's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line longer than the limit was dropped.
    ///
    /// The codec keeps discarding input up to the next newline, then resumes.
    Oversized,
    /// A line that was not valid UTF-8 was dropped.
    Malformed,
}

/// Newline-delimited UTF-8 codec used for stdin, stdout and stderr.
#[derive(Debug)]
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec rejecting lines longer than `max_length` bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    /// Configured line limit.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` while `src` holds no complete line (the partial
    /// line stays buffered).
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        map_decoded(self.inner.decode(src))
    }

    /// Decode the final, possibly unterminated, line at EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        map_decoded(self.inner.decode_eof(src))
    }
}

impl<'a> Encoder<&'a str> for LineCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated line into `dst`.
    fn encode(&mut self, item: &'a str, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_decoded(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<Frame>> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
        Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(Frame::Malformed))
        }
        Err(err) => Err(map_codec_error(err)),
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Io("line too long".into()),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
