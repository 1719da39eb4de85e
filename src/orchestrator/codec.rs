//! Chunking codec for worker output streams.
//!
//! Worker output is opaque, so the codec never decodes text. Every read is
//! released as soon as it arrives: complete lines are split off one by one
//! (keeping the `\n`), and whatever follows the last newline is released
//! as its own chunk rather than held back, so a prompt or progress bar
//! without a trailing newline reaches subscribers while the worker waits.
//! Chunks are capped at [`MAX_CHUNK_BYTES`].
//!
//! Concatenating the decoded chunks always reproduces the input exactly.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Largest chunk emitted by [`OutputCodec`]: 64 KiB.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Line-splitting, never-buffering byte chunker.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputCodec;

impl OutputCodec {
    /// Create a codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for OutputCodec {
    type Item = Bytes;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        let window = &src[..src.len().min(MAX_CHUNK_BYTES)];
        let end = window
            .iter()
            .position(|b| *b == b'\n')
            .map_or(window.len(), |offset| offset + 1);
        Ok(Some(src.split_to(end).freeze()))
    }
}
