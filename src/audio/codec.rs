//! Streaming Opus encode/decode over the Ogg page layer.

use super::ogg::{OggPageReader, OggPageWriter};
use super::{CodecError, FRAME_SIZE, GRANULES_PER_FRAME, SAMPLE_RATE};

/// Decoded samples can cover up to 120 ms per packet.
const MAX_PACKET_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * 120;

/// Encoded 20 ms frames stay far below this.
const MAX_PACKET_BYTES: usize = 4000;

/// Decodes a pushed Ogg-Opus byte stream into PCM.
pub struct OpusStreamDecoder {
    reader: OggPageReader,
    decoder: opus::Decoder,
}

impl OpusStreamDecoder {
    pub fn new() -> Result<Self, CodecError> {
        Ok(OpusStreamDecoder {
            reader: OggPageReader::new(),
            decoder: opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?,
        })
    }

    /// Feed bytes, get back whatever PCM they complete. An empty result just
    /// means no packet finished inside this chunk.
    pub fn append(&mut self, bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
        let packets = self.reader.push(bytes)?;
        let mut pcm = Vec::new();
        let mut scratch = vec![0i16; MAX_PACKET_SAMPLES];

        for packet in packets {
            // The identification and comment headers are not audio.
            if packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags") {
                continue;
            }
            let decoded = self.decoder.decode(&packet, &mut scratch, false)?;
            pcm.extend_from_slice(&scratch[..decoded]);
        }

        Ok(pcm)
    }
}

/// Encodes PCM into an Ogg-Opus byte stream.
///
/// The identification and comment headers are emitted lazily with the first
/// PCM append, so a freshly constructed encoder that never sees audio never
/// produces bytes. Input shorter than a full frame is buffered; callers must
/// treat an empty return as "nothing to emit yet", not a failure.
pub struct OpusStreamEncoder {
    encoder: opus::Encoder,
    writer: OggPageWriter,
    pending: Vec<i16>,
    granule: u64,
    started: bool,
}

impl OpusStreamEncoder {
    pub fn new() -> Result<Self, CodecError> {
        let encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
        Ok(OpusStreamEncoder {
            encoder,
            writer: OggPageWriter::new(0x5047_5353),
            pending: Vec::with_capacity(FRAME_SIZE * 4),
            granule: 0,
            started: false,
        })
    }

    pub fn append_pcm(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();

        if !self.started {
            let pre_skip = (self.encoder.get_lookahead()? as u16).saturating_mul(2);
            out.extend(self.writer.page(&opus_head(pre_skip), 0, true, false));
            out.extend(self.writer.page(&opus_tags(), 0, false, false));
            self.started = true;
        }

        self.pending.extend_from_slice(pcm);

        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        while self.pending.len() >= FRAME_SIZE {
            let written = self
                .encoder
                .encode(&self.pending[..FRAME_SIZE], &mut packet)?;
            self.pending.drain(..FRAME_SIZE);
            self.granule += GRANULES_PER_FRAME;
            out.extend(self.writer.page(&packet[..written], self.granule, false, false));
        }

        Ok(out)
    }
}

fn opus_head(pre_skip: u16) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(1); // channel count
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let vendor = b"sotto-gateway";
    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4);
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes()); // comment count
    tags
}
