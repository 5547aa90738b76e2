use bytes::{BufMut, Bytes, BytesMut};

use super::{head, Error, Head, Kind, StreamId};

/// A DATA frame: a variable-length sequence of octets associated with a
/// stream, optionally padded.
#[derive(Eq, PartialEq)]
pub struct Data {
    stream_id: StreamId,
    data: Bytes,
    end_stream: bool,
    /// Wire payload length, including any padding. Flow control accounts
    /// for the whole payload, not just the data octets.
    flow_len: u32,
}

impl Data {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Data {
        let flow_len = data.len() as u32;
        Data {
            stream_id,
            data,
            end_stream,
            flow_len,
        }
    }

    pub fn load(head: Head, mut payload: Bytes) -> Result<Data, Error> {
        debug_assert_eq!(head.kind(), Kind::Data);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let flow_len = payload.len() as u32;

        if head.is_padded() {
            if payload.is_empty() {
                return Err(Error::PayloadLengthTooShort);
            }
            let pad_len = payload[0] as usize;
            if pad_len >= payload.len() {
                return Err(Error::TooMuchPadding);
            }
            let _ = payload.split_to(1);
            let _ = payload.split_off(payload.len() - pad_len);
        }

        Ok(Data {
            stream_id: head.stream_id(),
            data: payload,
            end_stream: head.is_end_stream(),
            flow_len,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.end_stream
    }

    /// The number of bytes this frame counts against the receive window.
    pub fn flow_len(&self) -> u32 {
        self.flow_len
    }

    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let flags = if self.end_stream { head::END_STREAM } else { 0 };
        let head = Head::new(Kind::Data, flags, self.stream_id);

        head.encode(self.data.len(), dst);
        dst.put_slice(&self.data);
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("stream_id", &self.stream_id)
            .field("len", &self.data.len())
            .field("end_stream", &self.end_stream)
            .finish()
    }
}
