use bytes::Bytes;

use super::table::{DynamicTable, STATIC_TABLE};

/// Errors raised while decoding a header block fragment. Any of them is
/// a COMPRESSION_ERROR for the connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecoderError {
    /// The block ended in the middle of a representation.
    Truncated,

    /// An integer exceeded the representable range.
    IntegerOverflow,

    /// An index pointing at no table entry (including index zero).
    InvalidIndex,

    /// A dynamic table size update above the limit we advertised.
    TableSizeUpdateTooLarge,

    /// A Huffman-coded string literal. Peers are required to send raw
    /// octets; Huffman coding is outside the supported contract.
    HuffmanCoded,
}

/// A stateful HPACK decoder, one per connection, fed complete header
/// blocks after CONTINUATION assembly.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Upper bound for table size updates, from our
    /// SETTINGS_HEADER_TABLE_SIZE.
    max_size_limit: usize,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_table_size),
            max_size_limit: max_table_size,
        }
    }

    /// Decode one complete header block into an ordered field list.
    pub fn decode(&mut self, src: &[u8]) -> Result<Vec<(Bytes, Bytes)>, DecoderError> {
        let mut buf = src;
        let mut fields = Vec::new();

        while !buf.is_empty() {
            let octet = buf[0];

            if octet & 0x80 != 0 {
                // Indexed header field.
                let (index, rest) = decode_int(buf, 7)?;
                buf = rest;
                fields.push(self.lookup(index)?);
            } else if octet & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let (name, value, rest) = self.decode_literal(buf, 6)?;
                buf = rest;
                self.table.insert(name.clone(), value.clone());
                fields.push((name, value));
            } else if octet & 0xe0 == 0x20 {
                // Dynamic table size update.
                let (size, rest) = decode_int(buf, 5)?;
                buf = rest;
                if size > self.max_size_limit {
                    return Err(DecoderError::TableSizeUpdateTooLarge);
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0000) or never indexed (0001);
                // both leave the table untouched.
                let (name, value, rest) = self.decode_literal(buf, 4)?;
                buf = rest;
                fields.push((name, value));
            }
        }

        Ok(fields)
    }

    fn lookup(&self, index: usize) -> Result<(Bytes, Bytes), DecoderError> {
        if index == 0 {
            return Err(DecoderError::InvalidIndex);
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((
                Bytes::from_static(name.as_bytes()),
                Bytes::from_static(value.as_bytes()),
            ));
        }
        self.table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(DecoderError::InvalidIndex)
    }

    fn decode_literal<'a>(
        &self,
        buf: &'a [u8],
        prefix: u8,
    ) -> Result<(Bytes, Bytes, &'a [u8]), DecoderError> {
        let (name_index, rest) = decode_int(buf, prefix)?;

        let (name, rest) = if name_index == 0 {
            decode_string(rest)?
        } else {
            let (name, _) = self.lookup(name_index)?;
            (name, rest)
        };

        let (value, rest) = decode_string(rest)?;
        Ok((name, value, rest))
    }
}

/// Decode an integer with the given prefix length, per RFC 7541
/// Section 5.1.
fn decode_int(buf: &[u8], prefix: u8) -> Result<(usize, &[u8]), DecoderError> {
    debug_assert!((1..=8).contains(&prefix));

    if buf.is_empty() {
        return Err(DecoderError::Truncated);
    }

    let mask = (1u16 << prefix) as usize - 1;
    let mut value = (buf[0] as usize) & mask;
    let mut rest = &buf[1..];

    if value < mask {
        return Ok((value, rest));
    }

    let mut shift = 0u32;
    loop {
        let (&octet, tail) = rest.split_first().ok_or(DecoderError::Truncated)?;
        rest = tail;

        let add = ((octet & 0x7f) as usize)
            .checked_shl(shift)
            .ok_or(DecoderError::IntegerOverflow)?;
        value = value
            .checked_add(add)
            .ok_or(DecoderError::IntegerOverflow)?;

        if octet & 0x80 == 0 {
            return Ok((value, rest));
        }
        shift += 7;
        if shift > 28 {
            return Err(DecoderError::IntegerOverflow);
        }
    }
}

fn decode_string(buf: &[u8]) -> Result<(Bytes, &[u8]), DecoderError> {
    if buf.is_empty() {
        return Err(DecoderError::Truncated);
    }
    if buf[0] & 0x80 != 0 {
        return Err(DecoderError::HuffmanCoded);
    }

    let (len, rest) = decode_int(buf, 7)?;
    if rest.len() < len {
        return Err(DecoderError::Truncated);
    }

    Ok((Bytes::copy_from_slice(&rest[..len]), &rest[len..]))
}
