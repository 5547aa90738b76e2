use bytes::{BufMut, Bytes, BytesMut};

use super::table;

/// A stateless-by-choice HPACK encoder: exact static matches are sent
/// indexed, known names are sent as literals with a static name index,
/// everything else as plain literals. Nothing is added to the peer's
/// dynamic table, so encoding never depends on what the peer remembers.
/// Sensitive fields go out never-indexed.
#[derive(Debug, Default)]
pub struct Encoder {
    /// A pending dynamic table size update to emit at the start of the
    /// next header block, after SETTINGS_HEADER_TABLE_SIZE changed.
    table_size_update: Option<u32>,
}

const NEVER_INDEXED: &[&[u8]] = &[
    b"authorization",
    b"cookie",
    b"proxy-authorization",
    b"set-cookie",
];

impl Encoder {
    pub fn new() -> Encoder {
        Encoder::default()
    }

    /// Record a header-table size change to announce in the next block.
    pub fn set_max_table_size(&mut self, size: u32) {
        self.table_size_update = Some(size);
    }

    /// Encode one complete header block.
    pub fn encode<I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = (Bytes, Bytes)>,
    {
        if let Some(size) = self.table_size_update.take() {
            encode_int(size as usize, 5, 0x20, dst);
        }

        for (name, value) in fields {
            if let Some(index) = table::static_exact(&name, &value) {
                encode_int(index, 7, 0x80, dst);
                continue;
            }

            let sensitive = NEVER_INDEXED.contains(&name.as_ref());
            // Literal without indexing (0x00) or never indexed (0x10),
            // both with a 4-bit name index prefix.
            let pattern = if sensitive { 0x10 } else { 0x00 };

            match table::static_name(&name) {
                Some(index) => encode_int(index, 4, pattern, dst),
                None => {
                    dst.put_u8(pattern);
                    encode_string(&name, dst);
                }
            }
            encode_string(&value, dst);
        }
    }
}

/// Encode an integer with the given prefix length, per RFC 7541
/// Section 5.1. `pattern` carries the representation bits above the
/// prefix.
fn encode_int(mut value: usize, prefix: u8, pattern: u8, dst: &mut BytesMut) {
    debug_assert!((1..=8).contains(&prefix));

    let mask = (1u16 << prefix) as usize - 1;

    if value < mask {
        dst.put_u8(pattern | value as u8);
        return;
    }

    dst.put_u8(pattern | mask as u8);
    value -= mask;
    while value >= 0x80 {
        dst.put_u8(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Raw (non-Huffman) string literal.
fn encode_string(src: &[u8], dst: &mut BytesMut) {
    encode_int(src.len(), 7, 0x00, dst);
    dst.put_slice(src);
}
