use bytes::{BufMut, BytesMut};

use super::{Error, Head, Kind, Reason, StreamId};

/// A RST_STREAM frame: immediate termination of a single stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Reset {
    stream_id: StreamId,
    reason: Reason,
}

impl Reset {
    pub fn new(stream_id: StreamId, reason: Reason) -> Reset {
        Reset { stream_id, reason }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Reset, Error> {
        debug_assert_eq!(head.kind(), Kind::Reset);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        let reason = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

        Ok(Reset {
            stream_id: head.stream_id(),
            reason: reason.into(),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Reset, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let reset = Reset::new(StreamId::new(7), Reason::REFUSED_STREAM);
        let mut buf = BytesMut::new();
        reset.encode(&mut buf);

        let head = Head::parse(&buf[..9]);
        assert_eq!(Reset::load(head, &buf[9..]).unwrap(), reset);
    }

    #[test]
    fn bad_length() {
        let head = Head::new(Kind::Reset, 0, StreamId::new(1));
        assert_eq!(Reset::load(head, &[0; 3]), Err(Error::BadFrameSize));
    }
}
