use bytes::{BufMut, BytesMut};

use super::{Error, Head, Kind, StreamId};

/// A WINDOW_UPDATE frame: releases flow-control credit for a stream, or
/// for the whole connection when the stream id is zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WindowUpdate {
    stream_id: StreamId,
    increment: u32,
}

impl WindowUpdate {
    pub fn new(stream_id: StreamId, increment: u32) -> WindowUpdate {
        debug_assert!(increment <= super::settings::MAX_INITIAL_WINDOW_SIZE);
        WindowUpdate {
            stream_id,
            increment,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<WindowUpdate, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);

        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // The 31-bit increment; the leading bit is reserved.
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & !(1 << 31);

        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            increment,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::WindowUpdate, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.increment);
    }
}
