//! Audio codec framing.
//!
//! The wire carries Ogg-encapsulated Opus in both directions, base64-encoded
//! inside protocol events. PCM inside the gateway is 16-bit mono at 24 kHz.

mod codec;
mod ogg;

pub use codec::{OpusStreamDecoder, OpusStreamEncoder};
pub use ogg::{OggPageReader, OggPageWriter};

use thiserror::Error;

use crate::errors::SessionError;

/// PCM sample rate used throughout the gateway.
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per Opus frame (20 ms at 24 kHz).
pub const FRAME_SIZE: usize = 480;

/// Granule position advance per frame. Ogg-Opus granules count 48 kHz
/// samples regardless of the coded rate.
pub const GRANULES_PER_FRAME: u64 = 960;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed ogg page: {0}")]
    InvalidPage(&'static str),

    #[error("ogg page checksum mismatch")]
    CrcMismatch,

    #[error("opus: {0}")]
    Opus(#[from] opus::Error),
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Codec(e.to_string())
    }
}

/// Whether this chunk begins an Ogg page carrying the beginning-of-stream
/// flag. Used to discard stale audio a reconnecting client may flush from a
/// reused buffer before the fresh stream starts.
pub fn has_stream_start(bytes: &[u8]) -> bool {
    bytes.len() > 5 && bytes.starts_with(b"OggS") && bytes[5] & 0x02 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_start_flag() {
        let mut page = vec![0u8; 28];
        page[..4].copy_from_slice(b"OggS");
        assert!(!has_stream_start(&page));
        page[5] = 0x02;
        assert!(has_stream_start(&page));
        assert!(!has_stream_start(b"Ogg"));
        assert!(!has_stream_start(b"junk\x00\x02"));
    }
}
