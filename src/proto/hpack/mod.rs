//! Header compression for HTTP/2 (RFC 7541).
//!
//! Header blocks travel as an ordered list of (name, value) octet pairs.
//! The decoder understands the full set of representations except
//! Huffman-coded string literals; the encoder emits indexed fields for
//! static-table hits and raw literals otherwise.

mod decoder;
mod encoder;
mod table;

pub use self::decoder::{Decoder, DecoderError};
pub use self::encoder::Encoder;
