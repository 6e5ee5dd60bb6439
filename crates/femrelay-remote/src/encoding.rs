//! Text decoding for remote process output.
//!
//! Worker hosts do not always emit UTF-8 (Windows solver boxes often use a
//! legacy code page), so the output encoding is configurable per command.

use encoding_rs::{Decoder, Encoding, UTF_8};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown text encoding: {0}")]
pub struct UnknownEncoding(pub String);

/// A character encoding identified by its WHATWG label.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TextEncoding(&'static Encoding);

impl TextEncoding {
    pub const UTF8: TextEncoding = TextEncoding(UTF_8);

    /// Look up an encoding by label, e.g. `utf-8`, `shift_jis`, `gbk`, `windows-1252`.
    pub fn for_label(label: &str) -> Result<Self, UnknownEncoding> {
        Encoding::for_label(label.trim().as_bytes())
            .map(TextEncoding)
            .ok_or_else(|| UnknownEncoding(label.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Start decoding a new byte stream.
    pub fn stream_decoder(&self) -> StreamDecoder {
        StreamDecoder {
            inner: self.0.new_decoder(),
        }
    }

    /// Decode a complete buffer; malformed sequences become U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut decoder = self.stream_decoder();
        let mut text = decoder.feed(bytes);
        text.push_str(&decoder.finish());
        text
    }
}

impl Default for TextEncoding {
    fn default() -> Self {
        Self::UTF8
    }
}

impl fmt::Debug for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TextEncoding").field(&self.name()).finish()
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental decoder that keeps partial multi-byte sequences between chunks.
pub struct StreamDecoder {
    inner: Decoder,
}

impl StreamDecoder {
    /// Decode the next chunk of a stream.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.decode(bytes, false)
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        self.decode(&[], true)
    }

    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .inner
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 16);
        let mut out = String::with_capacity(capacity);
        let (_result, _read, _had_errors) = self.inner.decode_to_string(bytes, &mut out, last);
        out
    }
}
