// Jackson Coxson

use bytes::{Buf, BytesMut};
use log::{debug, warn};

use super::binary::MAGIC;

const XML_DECLARATION: &[u8] = b"<?xml";
const PLIST_OPEN: &[u8] = b"<plist";
const PLIST_CLOSE: &[u8] = b"</plist>";

/// Framing parameters for the splitter
///
/// Defaults match the lockdown wire format: a 4-byte big-endian length
/// prefix at offset zero with no adjustment. The generous maximum frame
/// length accommodates large IORegistry snapshots.
#[derive(Debug, Clone)]
pub struct SplitterConfig {
    /// Offset of the length field within the frame header
    pub header_offset: usize,
    /// Size of the length field in bytes
    pub length_size: usize,
    /// Whether the length field is little-endian
    pub little_endian: bool,
    /// Signed adjustment applied to the decoded length
    pub length_adjustment: i64,
    /// Upper bound on a single frame; larger declared lengths trigger
    /// re-synchronization
    pub max_frame_len: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            header_offset: 0,
            length_size: 4,
            little_endian: false,
            length_adjustment: 0,
            max_frame_len: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Framed,
    Xml,
}

/// Splits an arbitrary byte stream into whole plist messages
///
/// Runs a small state machine with a framed mode (length-prefixed binary or
/// XML payloads) and an XML scanning mode for paths where the length prefix
/// is unreliable. Complete messages are never dropped; leading garbage may
/// be discarded one byte at a time until the stream re-synchronizes.
pub struct PlistSplitter {
    buf: BytesMut,
    mode: Mode,
    config: SplitterConfig,
}

impl PlistSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            mode: Mode::Framed,
            config,
        }
    }

    /// Appends raw bytes from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pulls the next complete message, if one is buffered
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.is_empty() {
                return None;
            }
            match self.mode {
                Mode::Xml => match self.next_xml() {
                    Step::Emit(m) => return Some(m),
                    Step::NeedMore => return None,
                    Step::Continue => {}
                },
                Mode::Framed => match self.next_framed() {
                    Step::Emit(m) => return Some(m),
                    Step::NeedMore => return None,
                    Step::Continue => {}
                },
            }
        }
    }

    fn next_framed(&mut self) -> Step {
        // A bare binary plist with no length prefix is emitted whole
        if self.buf.starts_with(MAGIC) {
            let message = self.buf.split().to_vec();
            return Step::Emit(message);
        }

        let header_end = self.config.header_offset + self.config.length_size;
        if self.buf.len() < header_end {
            // Not enough for a header; but if what we have is the start of
            // an XML document, flip modes rather than wait forever
            if looks_like_xml(&self.buf) {
                self.mode = Mode::Xml;
                return Step::Continue;
            }
            return Step::NeedMore;
        }

        // The length prefix is unreliable on XML paths; a payload that opens
        // with an XML marker flips the machine into XML mode
        if looks_like_xml(&self.buf[header_end..]) {
            debug!("Framed payload opens with XML marker, switching to XML mode");
            self.mode = Mode::Xml;
            return Step::Continue;
        }
        if looks_like_xml(&self.buf) {
            self.mode = Mode::Xml;
            return Step::Continue;
        }

        let field = &self.buf[self.config.header_offset..header_end];
        let mut len = self.decode_length(field, self.config.little_endian);

        if !self.plausible(len) {
            // Try the opposite endianness before giving up on the frame
            let flipped = self.decode_length(field, !self.config.little_endian);
            if self.plausible(flipped) {
                len = flipped;
            } else if find_subslice(&self.buf, XML_DECLARATION).is_some()
                || find_subslice(&self.buf, PLIST_OPEN).is_some()
            {
                self.mode = Mode::Xml;
                return Step::Continue;
            } else {
                // Drop one byte and re-synchronize
                warn!("Implausible frame length {len}, dropping one byte to re-sync");
                self.buf.advance(1);
                return Step::Continue;
            }
        }

        let len = len as usize;
        if self.buf.len() < header_end + len {
            return Step::NeedMore;
        }

        self.buf.advance(header_end);
        let message = self.buf.split_to(len).to_vec();
        Step::Emit(message)
    }

    fn next_xml(&mut self) -> Step {
        let start = match find_subslice(&self.buf, XML_DECLARATION)
            .into_iter()
            .chain(find_subslice(&self.buf, PLIST_OPEN))
            .min()
        {
            Some(s) => s,
            None => return Step::NeedMore,
        };
        let close = match find_subslice(&self.buf[start..], PLIST_CLOSE) {
            Some(c) => start + c + PLIST_CLOSE.len(),
            None => return Step::NeedMore,
        };

        self.buf.advance(start);
        let message = self.buf.split_to(close - start).to_vec();

        // Decide whether the tail is still XML or a new framed message.
        // Inter-message whitespace is consumed so it cannot shift the next
        // frame's length field.
        let tail_start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        self.buf.advance(tail_start);
        if looks_like_xml(&self.buf) {
            self.mode = Mode::Xml;
        } else {
            self.mode = Mode::Framed;
        }

        Step::Emit(message)
    }

    fn decode_length(&self, field: &[u8], little_endian: bool) -> i64 {
        let mut value = 0u64;
        if little_endian {
            for b in field.iter().rev() {
                value = (value << 8) | *b as u64;
            }
        } else {
            for b in field {
                value = (value << 8) | *b as u64;
            }
        }
        value as i64 + self.config.length_adjustment
    }

    fn plausible(&self, len: i64) -> bool {
        len > 0 && len as usize <= self.config.max_frame_len
    }
}

enum Step {
    Emit(Vec<u8>),
    NeedMore,
    Continue,
}

fn looks_like_xml(data: &[u8]) -> bool {
    let trimmed = match data.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(p) => &data[p..],
        None => return false,
    };
    starts_with_or_is_prefix(trimmed, XML_DECLARATION)
        || starts_with_or_is_prefix(trimmed, PLIST_OPEN)
}

/// True when `data` starts with `marker`, or is a strict prefix of it (the
/// rest of the marker may still be in flight)
fn starts_with_or_is_prefix(data: &[u8], marker: &[u8]) -> bool {
    if data.len() >= marker.len() {
        data.starts_with(marker)
    } else {
        marker.starts_with(data) && !data.is_empty()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plist::{create_binary, create_xml, Dictionary, PlistValue};

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn sample(n: i64) -> Vec<u8> {
        let mut dict = Dictionary::new();
        dict.insert("n", n);
        create_binary(&PlistValue::Dictionary(dict))
    }

    #[test]
    fn splits_framed_messages_in_order() {
        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        let messages: Vec<Vec<u8>> = (0..5).map(sample).collect();
        let mut stream = Vec::new();
        for m in &messages {
            stream.extend_from_slice(&framed(m));
        }
        splitter.push(&stream);
        for expected in &messages {
            assert_eq!(splitter.next_message().as_ref(), Some(expected));
        }
        assert!(splitter.next_message().is_none());
    }

    #[test]
    fn arbitrary_chunk_sizes() {
        let messages: Vec<Vec<u8>> = (0..4).map(sample).collect();
        let mut stream = Vec::new();
        for m in &messages {
            stream.extend_from_slice(&framed(m));
        }

        for chunk_size in [1, 2, 3, 7, 16, 1024] {
            let mut splitter = PlistSplitter::new(SplitterConfig::default());
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                splitter.push(chunk);
                while let Some(m) = splitter.next_message() {
                    got.push(m);
                }
            }
            assert_eq!(got, messages, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn xml_message_without_reliable_prefix() {
        let mut dict = Dictionary::new();
        dict.insert("k", "v");
        let xml = create_xml(&PlistValue::Dictionary(dict));

        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        // Framed with a wildly wrong length prefix, as seen on XML paths
        let mut stream = 0xFFFF_FFF0u32.to_be_bytes().to_vec();
        stream.extend_from_slice(xml.as_bytes());
        splitter.push(&stream);

        let message = splitter.next_message().unwrap();
        let text = String::from_utf8(message).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.ends_with("</plist>"));
    }

    #[test]
    fn mixed_xml_and_framed() {
        let mut dict = Dictionary::new();
        dict.insert("k", "v");
        let xml = create_xml(&PlistValue::Dictionary(dict));
        let bin = sample(9);

        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        let mut stream = framed(xml.as_bytes());
        stream.extend_from_slice(&framed(&bin));
        splitter.push(&stream);

        let first = splitter.next_message().unwrap();
        assert!(first.starts_with(b"<?xml"));
        let second = splitter.next_message().unwrap();
        assert_eq!(second, bin);
    }

    #[test]
    fn garbage_before_xml_is_dropped() {
        let mut dict = Dictionary::new();
        dict.insert("k", "v");
        let xml = create_xml(&PlistValue::Dictionary(dict));

        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03];
        stream.extend_from_slice(xml.as_bytes());
        stream.extend_from_slice(&framed(&sample(1)));
        splitter.push(&stream);

        let first = splitter.next_message().unwrap();
        assert!(first.starts_with(b"<?xml"));
        let second = splitter.next_message().unwrap();
        assert_eq!(second, sample(1));
    }

    #[test]
    fn unframed_binary_plist_is_one_message() {
        let bin = sample(3);
        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        splitter.push(&bin);
        assert_eq!(splitter.next_message(), Some(bin));
    }

    #[test]
    fn opposite_endianness_recovers() {
        let payload = sample(4);
        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        // Little-endian length on a big-endian splitter
        let mut stream = (payload.len() as u32).to_le_bytes().to_vec();
        stream.extend_from_slice(&payload);
        splitter.push(&stream);
        assert_eq!(splitter.next_message(), Some(payload));
    }

    #[test]
    fn no_partial_message_is_emitted() {
        let payload = sample(5);
        let stream = framed(&payload);
        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        splitter.push(&stream[..stream.len() - 1]);
        assert!(splitter.next_message().is_none());
        splitter.push(&stream[stream.len() - 1..]);
        assert_eq!(splitter.next_message(), Some(payload));
    }

    #[test]
    fn zero_garbage_resyncs_by_dropping_bytes() {
        let payload = sample(8);
        let mut splitter = PlistSplitter::new(SplitterConfig::default());
        // Stray zero bytes decode as zero-length frames, which are
        // implausible in both endiannesses; the splitter must drop them
        // one at a time until it re-synchronizes on the real prefix
        let mut stream = vec![0x00, 0x00, 0x00];
        stream.extend_from_slice(&framed(&payload));
        splitter.push(&stream);
        assert_eq!(splitter.next_message(), Some(payload));
        assert!(splitter.next_message().is_none());
    }

    #[test]
    fn custom_config_little_endian() {
        let payload = sample(6);
        let config = SplitterConfig {
            little_endian: true,
            ..Default::default()
        };
        let mut splitter = PlistSplitter::new(config);
        let mut stream = (payload.len() as u32).to_le_bytes().to_vec();
        stream.extend_from_slice(&payload);
        splitter.push(&stream);
        assert_eq!(splitter.next_message(), Some(payload));
    }
}
