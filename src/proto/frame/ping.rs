use bytes::{BufMut, BytesMut};

use super::{head, Error, Head, Kind, StreamId};

pub type Payload = [u8; 8];

/// A PING frame: a mechanism for measuring round-trip time and checking
/// whether an idle connection is still functional.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Ping {
    ack: bool,
    payload: Payload,
}

impl Ping {
    pub fn new(payload: Payload) -> Ping {
        Ping {
            ack: false,
            payload,
        }
    }

    pub fn pong(payload: Payload) -> Ping {
        Ping { ack: true, payload }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn load(head: Head, bytes: &[u8]) -> Result<Ping, Error> {
        debug_assert_eq!(head.kind(), Kind::Ping);

        // PING frames are not associated with any individual stream.
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        // In addition to the frame header, PING frames MUST contain 8
        // octets of opaque data in the payload.
        if bytes.len() != 8 {
            return Err(Error::BadFrameSize);
        }

        let mut payload = [0; 8];
        payload.copy_from_slice(bytes);

        let ack = head.flag() & head::ACK != 0;

        Ok(Ping { ack, payload })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let flags = if self.ack { head::ACK } else { 0 };
        let head = Head::new(Kind::Ping, flags, StreamId::ZERO);

        head.encode(8, dst);
        dst.put_slice(&self.payload);
    }
}
