//! Header block compression.
//!
//! The session never touches HPACK directly: it encodes and decodes lists of
//! [`HeaderField`] through [`HeaderCodec`]. The reader task owns one codec
//! instance for decoding and the writer task owns another for encoding, so
//! each dynamic table has exactly one user.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::h2::frame::ErrorCode;

/// Default HPACK dynamic table size (RFC 7541 Section 4.2).
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// One header field of a header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    /// Field must never enter a compression table (credentials, cookies).
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Size counted against SETTINGS_MAX_HEADER_LIST_SIZE (RFC 9113 Section 6.5.2).
    pub fn list_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// Header-block compression used by the session.
pub trait HeaderCodec: Send + 'static {
    /// Encode `fields` into one header block fragment.
    fn encode(&mut self, fields: &[HeaderField]) -> Bytes;

    /// Decode one complete header block.
    ///
    /// Failures are connection errors with COMPRESSION_ERROR: the shared
    /// dynamic table can no longer be trusted.
    fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>>;

    /// Record the negotiated dynamic table size.
    fn set_max_table_size(&mut self, size: u32);

    /// Negotiated dynamic table size.
    fn max_table_size(&self) -> u32;
}

/// HPACK codec backed by `fluke-hpack`.
///
/// The `fluke-hpack` encoder indexes into a fixed 4096-byte table. While the
/// peer allows at least that much it does all the encoding; below that, and
/// for sensitive fields, fields go out as literals that never touch the
/// table. Table size changes are announced at the start of the next block
/// (RFC 7541 Section 4.2).
pub struct HpackCodec {
    encoder: fluke_hpack::Encoder<'static>,
    decoder: fluke_hpack::Decoder<'static>,
    max_table_size: u32,
    pending_size_updates: Vec<u32>,
}

impl std::fmt::Debug for HpackCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackCodec")
            .field("max_table_size", &self.max_table_size)
            .finish()
    }
}

impl HpackCodec {
    pub fn new() -> Self {
        Self {
            encoder: fluke_hpack::Encoder::new(),
            decoder: fluke_hpack::Decoder::new(),
            max_table_size: DEFAULT_HEADER_TABLE_SIZE,
            pending_size_updates: Vec::new(),
        }
    }

    fn indexing(&self) -> bool {
        self.max_table_size >= DEFAULT_HEADER_TABLE_SIZE
    }

    /// Dynamic table size updates may only open a block and must stay within
    /// the size we advertised (RFC 7541 Section 6.3).
    fn check_size_updates(&self, block: &[u8]) -> Result<()> {
        let mut rest = block;
        while rest.first().is_some_and(|b| b & 0xe0 == 0x20) {
            let (size, used) = decode_integer(rest, 5).ok_or_else(|| {
                Error::connection(ErrorCode::CompressionError, "truncated table size update")
            })?;
            if size > u64::from(self.max_table_size) {
                return Err(Error::connection(
                    ErrorCode::CompressionError,
                    format!(
                        "table size update to {} exceeds {}",
                        size, self.max_table_size
                    ),
                ));
            }
            rest = &rest[used..];
        }
        Ok(())
    }
}

impl Default for HpackCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec for HpackCodec {
    fn encode(&mut self, fields: &[HeaderField]) -> Bytes {
        let mut block = Vec::new();
        for size in self.pending_size_updates.drain(..) {
            encode_integer(&mut block, size as usize, 5, 0x20);
        }

        let indexing = self.indexing();
        for field in fields {
            if field.sensitive {
                encode_literal(&mut block, LITERAL_NEVER_INDEXED, field);
            } else if indexing {
                let pair = (&field.name[..], &field.value[..]);
                block.extend_from_slice(&self.encoder.encode(std::iter::once(pair)));
            } else {
                encode_literal(&mut block, LITERAL_WITHOUT_INDEXING, field);
            }
        }
        Bytes::from(block)
    }

    fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>> {
        self.check_size_updates(block)?;
        let pairs = self.decoder.decode(block).map_err(|e| {
            Error::connection(
                ErrorCode::CompressionError,
                format!("HPACK decode error: {:?}", e),
            )
        })?;

        Ok(pairs
            .into_iter()
            .map(|(name, value)| HeaderField::new(name, value))
            .collect())
    }

    fn set_max_table_size(&mut self, size: u32) {
        if size == self.max_table_size {
            return;
        }
        let was_indexing = self.indexing();
        self.max_table_size = size;
        match (was_indexing, self.indexing()) {
            // Peer evicts down to the new size; nothing indexes past this point
            (true, false) => self.pending_size_updates = vec![size],
            // Both tables restart empty
            (false, true) => {
                self.encoder = fluke_hpack::Encoder::new();
                self.pending_size_updates = vec![0, DEFAULT_HEADER_TABLE_SIZE];
            }
            _ => {}
        }
    }

    fn max_table_size(&self) -> u32 {
        self.max_table_size
    }
}

const LITERAL_WITHOUT_INDEXING: u8 = 0x00;
const LITERAL_NEVER_INDEXED: u8 = 0x10;

/// Literal field with a literal name and raw (non-Huffman) strings
/// (RFC 7541 Sections 6.2.2 and 6.2.3).
fn encode_literal(dst: &mut Vec<u8>, kind: u8, field: &HeaderField) {
    dst.push(kind);
    encode_integer(dst, field.name.len(), 7, 0);
    dst.extend_from_slice(&field.name);
    encode_integer(dst, field.value.len(), 7, 0);
    dst.extend_from_slice(&field.value);
}

/// Prefixed integer (RFC 7541 Section 5.1).
fn encode_integer(dst: &mut Vec<u8>, value: usize, prefix: u8, flags: u8) {
    let max = (1usize << prefix) - 1;
    if value < max {
        dst.push(flags | value as u8);
        return;
    }
    dst.push(flags | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.push((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    dst.push(rest as u8);
}

/// Returns the value and the bytes it took, or `None` if truncated or
/// absurdly long.
fn decode_integer(src: &[u8], prefix: u8) -> Option<(u64, usize)> {
    let max = (1u8 << prefix) - 1;
    let first = src.first()? & max;
    if first < max {
        return Some((u64::from(first), 1));
    }
    let mut value = u64::from(max);
    for (i, byte) in src[1..].iter().enumerate() {
        let shift = 7 * i as u32;
        if shift > 56 {
            return None;
        }
        value += u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 2));
        }
    }
    None
}

/// Split an encoded header block at `max_frame_size` boundaries.
///
/// The first chunk goes in HEADERS or PUSH_PROMISE, the rest in CONTINUATION
/// frames (RFC 9113 Section 6.10). An empty block yields one empty chunk.
pub fn chunk_header_block(block: Bytes, max_frame_size: usize) -> Vec<Bytes> {
    if block.len() <= max_frame_size {
        return vec![block];
    }

    let mut chunks = Vec::with_capacity(block.len().div_ceil(max_frame_size));
    let mut rest = block;
    while !rest.is_empty() {
        let take = rest.len().min(max_frame_size);
        chunks.push(rest.split_to(take));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_indexed_status() {
        // 0x88 = indexed :status 200 from the static table
        let mut codec = HpackCodec::new();
        let fields = codec.decode(&[0x88]).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(&fields[0].name[..], b":status");
        assert_eq!(&fields[0].value[..], b"200");
    }

    #[test]
    fn test_encode_then_decode_preserves_order() {
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":authority", "example.com"),
            HeaderField::new(":path", "/"),
            HeaderField::new("user-agent", "h2mux"),
        ];

        let mut encoder = HpackCodec::new();
        let mut decoder = HpackCodec::new();
        let block = encoder.encode(&fields);
        let decoded = decoder.decode(&block).unwrap();

        assert_eq!(decoded, fields);
        assert!(decoded[0].is_pseudo());
        assert!(!decoded[4].is_pseudo());
    }

    #[test]
    fn test_garbage_block_is_compression_error() {
        // Indexed field 0 is never valid
        let mut codec = HpackCodec::new();
        let err = codec.decode(&[0x80]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::CompressionError));
    }

    #[test]
    fn test_zero_table_never_references_dynamic_entries() {
        let mut encoder = HpackCodec::new();
        encoder.set_max_table_size(0);
        let fields = vec![HeaderField::new(":method", "GET"), HeaderField::new("x-a", "1")];

        let first = encoder.encode(&fields);
        let second = encoder.encode(&fields);
        // Size update to 0 opens only the first block
        assert_eq!(first[0], 0x20);
        assert_ne!(second[0], 0x20);

        // Each block decodes on its own, so neither leans on table state
        for block in [&first, &second] {
            let mut decoder = HpackCodec::new();
            decoder.set_max_table_size(0);
            assert_eq!(decoder.decode(block).unwrap(), fields);
        }
    }

    #[test]
    fn test_table_regrowth_clears_both_tables() {
        let mut encoder = HpackCodec::new();
        let mut decoder = HpackCodec::new();
        let fields = vec![HeaderField::new("x-request-id", "abc")];

        decoder.decode(&encoder.encode(&fields)).unwrap();
        encoder.set_max_table_size(0);
        decoder.decode(&encoder.encode(&fields)).unwrap();
        encoder.set_max_table_size(4096);

        let block = encoder.encode(&fields);
        assert_eq!(&block[..4], &[0x20, 0x3f, 0xe1, 0x1f]);
        assert_eq!(decoder.decode(&block).unwrap(), fields);
        assert_eq!(decoder.decode(&encoder.encode(&fields)).unwrap(), fields);
    }

    #[test]
    fn test_sensitive_field_is_never_indexed() {
        let mut encoder = HpackCodec::new();
        let fields = vec![HeaderField::new("authorization", "secret").sensitive(true)];
        let block = encoder.encode(&fields);
        assert_eq!(block[0], 0x10);

        let mut decoder = HpackCodec::new();
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(&decoded[0].value[..], b"secret");
        // Never entered the table, so encoding again gives the same bytes
        assert_eq!(encoder.encode(&fields), block);
    }

    #[test]
    fn test_size_update_above_advertised_limit() {
        let mut decoder = HpackCodec::new();
        decoder.set_max_table_size(100);
        // Update to 4096, then :method GET
        let err = decoder.decode(&[0x3f, 0xe1, 0x1f, 0x82]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::CompressionError));

        let fields = decoder.decode(&[0x3f, 0x45, 0x82]).unwrap();
        assert_eq!(&fields[0].name[..], b":method");
    }

    #[test]
    fn test_chunk_header_block() {
        let block = Bytes::from(vec![7u8; 40_000]);
        let chunks = chunk_header_block(block, 16_384);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 16_384);
        assert_eq!(chunks[1].len(), 16_384);
        assert_eq!(chunks[2].len(), 40_000 - 2 * 16_384);

        let single = chunk_header_block(Bytes::new(), 16_384);
        assert_eq!(single.len(), 1);
    }
}
