use bytes::{BufMut, Bytes, BytesMut};

use super::{Error, Head, Kind, Reason, StreamId};

/// A GOAWAY frame: initiates shutdown of a connection. Streams with an id
/// above `last_stream_id` were not processed by the sender and can be
/// retried elsewhere.
#[derive(Clone, Eq, PartialEq)]
pub struct GoAway {
    last_stream_id: StreamId,
    reason: Reason,
    debug_data: Bytes,
}

impl GoAway {
    pub fn new(last_stream_id: StreamId, reason: Reason) -> GoAway {
        GoAway {
            last_stream_id,
            reason,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(self, debug_data: impl Into<Bytes>) -> GoAway {
        GoAway {
            debug_data: debug_data.into(),
            ..self
        }
    }

    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn debug_data(&self) -> &Bytes {
        &self.debug_data
    }

    pub fn load(head: Head, payload: Bytes) -> Result<GoAway, Error> {
        debug_assert_eq!(head.kind(), Kind::GoAway);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }

        let (last_stream_id, _) = StreamId::parse(&payload[..4]);
        let reason = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let debug_data = payload.slice(8..);

        Ok(GoAway {
            last_stream_id,
            reason: reason.into(),
            debug_data,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);
        head.encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.value());
        dst.put_u32(self.reason.into());
        dst.put_slice(&self.debug_data);
    }
}

impl std::fmt::Debug for GoAway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builder = f.debug_struct("GoAway");
        builder.field("last_stream_id", &self.last_stream_id);
        builder.field("reason", &self.reason);
        if !self.debug_data.is_empty() {
            builder.field("debug_data", &self.debug_data);
        }
        builder.finish()
    }
}
