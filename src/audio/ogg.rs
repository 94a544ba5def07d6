//! Minimal Ogg page layer.
//!
//! Only what the gateway needs: incremental page parsing of a pushed byte
//! stream on the way in, one-packet-per-page emission on the way out. The
//! pull-based readers in the ecosystem want an `io::Read + Seek` source,
//! which does not fit a websocket feed that arrives page by page.

use once_cell::sync::Lazy;

use super::CodecError;

const PAGE_HEADER_LEN: usize = 27;
const MAX_SEGMENTS: usize = 255;

/// CRC-32 with polynomial 0x04c11db7, zero init, no reflection (the Ogg
/// variant, not the zlib one).
static CRC_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut r = (i as u32) << 24;
        for _ in 0..8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
        }
        *entry = r;
    }
    table
});

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &b in bytes {
        crc = (crc << 8) ^ CRC_TABLE[(((crc >> 24) ^ b as u32) & 0xff) as usize];
    }
    crc
}

// Header type flags.
const FLAG_CONTINUATION: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

/// Incremental Ogg page parser. Bytes go in, whole packets come out.
pub struct OggPageReader {
    buf: Vec<u8>,
    /// Packet bytes continued from a previous page.
    partial: Vec<u8>,
}

impl Default for OggPageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl OggPageReader {
    pub fn new() -> Self {
        OggPageReader {
            buf: Vec::new(),
            partial: Vec::new(),
        }
    }

    /// Feed bytes and collect every packet completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            // Resync to the capture pattern, tolerating garbage from clients
            // that flush stale buffers.
            if let Some(offset) = find_capture(&self.buf) {
                if offset > 0 {
                    self.buf.drain(..offset);
                }
            } else {
                // Keep a tail that could be a partial capture pattern.
                let keep = self.buf.len().min(3);
                self.buf.drain(..self.buf.len() - keep);
                break;
            }

            if self.buf.len() < PAGE_HEADER_LEN {
                break;
            }
            let segment_count = self.buf[26] as usize;
            let header_len = PAGE_HEADER_LEN + segment_count;
            if self.buf.len() < header_len {
                break;
            }
            let body_len: usize = self.buf[PAGE_HEADER_LEN..header_len]
                .iter()
                .map(|&l| l as usize)
                .sum();
            let page_len = header_len + body_len;
            if self.buf.len() < page_len {
                break;
            }

            if self.buf[4] != 0 {
                return Err(CodecError::InvalidPage("unsupported ogg version"));
            }

            // Verify the checksum with the CRC field zeroed.
            let stored_crc = u32::from_le_bytes([
                self.buf[22],
                self.buf[23],
                self.buf[24],
                self.buf[25],
            ]);
            let mut page = self.buf[..page_len].to_vec();
            page[22..26].fill(0);
            if crc32(&page) != stored_crc {
                return Err(CodecError::CrcMismatch);
            }

            let continuation = self.buf[5] & FLAG_CONTINUATION != 0;
            if !continuation {
                self.partial.clear();
            }

            let mut pos = header_len;
            for i in 0..segment_count {
                let lacing = self.buf[PAGE_HEADER_LEN + i] as usize;
                self.partial.extend_from_slice(&self.buf[pos..pos + lacing]);
                pos += lacing;
                if lacing < 255 {
                    packets.push(std::mem::take(&mut self.partial));
                }
            }

            self.buf.drain(..page_len);
        }

        Ok(packets)
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"OggS")
}

/// One-packet-per-page Ogg writer. Fine for 20 ms Opus frames; nothing here
/// ever needs to pack multiple packets into a page.
pub struct OggPageWriter {
    serial: u32,
    sequence: u32,
}

impl OggPageWriter {
    pub fn new(serial: u32) -> Self {
        OggPageWriter {
            serial,
            sequence: 0,
        }
    }

    pub fn page(&mut self, packet: &[u8], granule: u64, bos: bool, eos: bool) -> Vec<u8> {
        // Lacing: floor(len / 255) full segments plus a terminator < 255.
        let full_segments = packet.len() / 255;
        let remainder = (packet.len() % 255) as u8;
        let segment_count = full_segments + 1;
        debug_assert!(segment_count <= MAX_SEGMENTS);

        let mut page = Vec::with_capacity(PAGE_HEADER_LEN + segment_count + packet.len());
        page.extend_from_slice(b"OggS");
        page.push(0);
        let mut flags = 0u8;
        if bos {
            flags |= FLAG_BOS;
        }
        if eos {
            flags |= FLAG_EOS;
        }
        page.push(flags);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.sequence.to_le_bytes());
        page.extend_from_slice(&[0, 0, 0, 0]);
        page.push(segment_count as u8);
        for _ in 0..full_segments {
            page.push(255);
        }
        page.push(remainder);
        page.extend_from_slice(packet);

        let crc = crc32(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_roundtrip() {
        let mut writer = OggPageWriter::new(42);
        let mut reader = OggPageReader::new();

        let first = writer.page(b"hello", 0, true, false);
        assert_eq!(first[5] & FLAG_BOS, FLAG_BOS);

        let second = writer.page(b"world", 960, false, false);

        let mut packets = reader.push(&first).expect("first page");
        packets.extend(reader.push(&second).expect("second page"));
        assert_eq!(packets, vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn test_partial_delivery() {
        let mut writer = OggPageWriter::new(7);
        let mut reader = OggPageReader::new();

        let page = writer.page(b"split", 0, true, false);
        let (head, tail) = page.split_at(10);

        assert!(reader.push(head).expect("head").is_empty());
        let packets = reader.push(tail).expect("tail");
        assert_eq!(packets, vec![b"split".to_vec()]);
    }

    #[test]
    fn test_garbage_before_capture_is_skipped() {
        let mut writer = OggPageWriter::new(7);
        let mut reader = OggPageReader::new();

        let mut bytes = b"leftover junk".to_vec();
        bytes.extend_from_slice(&writer.page(b"ok", 0, true, false));

        let packets = reader.push(&bytes).expect("push");
        assert_eq!(packets, vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_corrupted_page_fails_crc() {
        let mut writer = OggPageWriter::new(7);
        let mut reader = OggPageReader::new();

        let mut page = writer.page(b"payload", 0, true, false);
        let last = page.len() - 1;
        page[last] ^= 0xff;

        assert!(matches!(reader.push(&page), Err(CodecError::CrcMismatch)));
    }

    #[test]
    fn test_large_packet_lacing() {
        let mut writer = OggPageWriter::new(7);
        let mut reader = OggPageReader::new();

        let packet = vec![0xabu8; 600];
        let page = writer.page(&packet, 0, true, false);
        let packets = reader.push(&page).expect("push");
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], packet);
    }

    #[test]
    fn test_exact_multiple_of_255_gets_zero_lacing_terminator() {
        let mut writer = OggPageWriter::new(7);
        let mut reader = OggPageReader::new();

        let packet = vec![1u8; 510];
        let page = writer.page(&packet, 0, true, false);
        let packets = reader.push(&page).expect("push");
        assert_eq!(packets, vec![packet]);
    }
}
