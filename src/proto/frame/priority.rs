use bytes::{BufMut, BytesMut};

use super::{Error, Head, Kind, StreamId};

/// A PRIORITY frame. The prioritisation scheme of RFC 7540 is deprecated;
/// these frames are parsed for validity and otherwise ignored.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Priority {
    stream_id: StreamId,
    dependency: StreamId,
    exclusive: bool,
    weight: u8,
}

impl Priority {
    pub fn new(stream_id: StreamId, dependency: StreamId, weight: u8) -> Priority {
        Priority {
            stream_id,
            dependency,
            exclusive: false,
            weight,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Priority, Error> {
        debug_assert_eq!(head.kind(), Kind::Priority);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 5 {
            return Err(Error::BadFrameSize);
        }

        let (dependency, exclusive) = StreamId::parse(&payload[..4]);

        // A stream cannot depend on itself.
        if dependency == head.stream_id() {
            return Err(Error::InvalidDependencyId);
        }

        Ok(Priority {
            stream_id: head.stream_id(),
            dependency,
            exclusive,
            weight: payload[4],
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Priority, 0, self.stream_id);
        head.encode(5, dst);

        let mut dependency = self.dependency.value();
        if self.exclusive {
            dependency |= 1 << 31;
        }
        dst.put_u32(dependency);
        dst.put_u8(self.weight);
    }
}
