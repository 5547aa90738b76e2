use bytes::BufMut;

use super::StreamId;

/// The 9-octet header that starts every HTTP/2 frame: a 24-bit payload
/// length, an 8-bit type, an 8-bit flag field, and a 31-bit stream id.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
    Unknown,
}

// Frame flags. The same bit means different things for different frame
// kinds; the name used at each call site picks the meaning.
pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;
pub const PADDED: u8 = 0x8;
pub const PRIORITY: u8 = 0x20;

// ===== impl Kind =====

impl Kind {
    pub fn new(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            _ => Kind::Unknown,
        }
    }
}

// ===== impl Head =====

impl Head {
    pub fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parse an HTTP/2 frame header, which is always 9 octets long.
    pub fn parse(header: &[u8]) -> Head {
        debug_assert!(header.len() >= 9);
        let (stream_id, _) = StreamId::parse(&header[5..9]);

        Head {
            kind: Kind::new(header[3]),
            flag: header[4],
            stream_id,
        }
    }

    /// The payload length carried in the first three octets.
    pub fn payload_len(header: &[u8]) -> usize {
        debug_assert!(header.len() >= 3);
        ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | (header[2] as usize)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn is_end_stream(&self) -> bool {
        self.flag & END_STREAM != 0
    }

    pub fn is_end_headers(&self) -> bool {
        self.flag & END_HEADERS != 0
    }

    pub fn is_padded(&self) -> bool {
        self.flag & PADDED != 0
    }

    pub fn encode<B: BufMut>(&self, payload_len: usize, dst: &mut B) {
        debug_assert!(payload_len < 1 << 24);
        debug_assert!(self.kind != Kind::Unknown);

        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.value());
    }
}
