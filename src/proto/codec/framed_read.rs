use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::proto::frame::{
    self, Data, Frame, GoAway, Head, Headers, Kind, Ping, Priority, PushPromise, Reset, Settings,
    StreamId, WindowUpdate, HEADER_LEN,
};
use crate::proto::hpack;

/// Reads one typed frame at a time off the receive half of a connection.
///
/// Owns the HPACK decoder, because header blocks must be decoded in
/// arrival order to keep the compression context synchronized, and
/// assembles HEADERS / PUSH_PROMISE + CONTINUATION sequences into a
/// single decoded frame.
#[derive(Debug)]
pub(crate) struct FramedRead<R> {
    io: R,
    buf: BytesMut,
    hpack: hpack::Decoder,
    /// Our advertised SETTINGS_MAX_FRAME_SIZE; larger frames are a
    /// FRAME_SIZE_ERROR.
    max_frame_size: u32,
    /// Cap on the accumulated header block, when configured.
    max_header_block_size: Option<usize>,
}

#[derive(Debug)]
pub(crate) enum ReadError {
    Frame(frame::Error),
    Io(std::io::Error),
}

impl From<frame::Error> for ReadError {
    fn from(src: frame::Error) -> ReadError {
        ReadError::Frame(src)
    }
}

impl From<hpack::DecoderError> for ReadError {
    fn from(src: hpack::DecoderError) -> ReadError {
        ReadError::Frame(frame::Error::Hpack(src))
    }
}

impl From<std::io::Error> for ReadError {
    fn from(src: std::io::Error) -> ReadError {
        ReadError::Io(src)
    }
}

impl<R> FramedRead<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(io: R, header_table_size: usize) -> FramedRead<R> {
        FramedRead {
            io,
            buf: BytesMut::with_capacity(16 * 1024),
            hpack: hpack::Decoder::new(header_table_size),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_block_size: None,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub(crate) fn set_max_header_block_size(&mut self, size: usize) {
        self.max_header_block_size = Some(size);
    }

    /// Read the next frame. Returns `None` on a clean end of stream.
    /// Frames with an unknown type octet are skipped.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        loop {
            let (head, payload) = match self.read_raw().await? {
                Some(raw) => raw,
                None => return Ok(None),
            };

            trace!(
                "received frame; kind={:?} stream={} len={}",
                head.kind(),
                head.stream_id(),
                payload.len()
            );

            let frame = match head.kind() {
                Kind::Data => Data::load(head, payload)?.into(),
                Kind::Headers => self.read_headers(head, payload).await?,
                Kind::Priority => Priority::load(head, &payload)?.into(),
                Kind::Reset => Reset::load(head, &payload)?.into(),
                Kind::Settings => Settings::load(head, &payload)?.into(),
                Kind::PushPromise => self.read_push_promise(head, payload).await?,
                Kind::Ping => Ping::load(head, &payload)?.into(),
                Kind::GoAway => GoAway::load(head, payload)?.into(),
                Kind::WindowUpdate => WindowUpdate::load(head, &payload)?.into(),
                // A CONTINUATION outside a header block sequence.
                Kind::Continuation => return Err(frame::Error::UnexpectedContinuation.into()),
                // Implementations MUST ignore and discard frames of
                // unknown types.
                Kind::Unknown => continue,
            };

            return Ok(Some(frame));
        }
    }

    /// Read one raw frame header + payload, or `None` at a clean EOF.
    async fn read_raw(&mut self) -> Result<Option<(Head, Bytes)>, ReadError> {
        if !self.fill(HEADER_LEN).await? {
            return if self.buf.is_empty() {
                Ok(None)
            } else {
                Err(frame::Error::Short.into())
            };
        }

        let payload_len = Head::payload_len(&self.buf[..3]);
        if payload_len > self.max_frame_size as usize {
            return Err(frame::Error::OversizedPayload.into());
        }

        if !self.fill(HEADER_LEN + payload_len).await? {
            return Err(frame::Error::Short.into());
        }

        let head = Head::parse(&self.buf[..HEADER_LEN]);
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(payload_len).freeze();

        Ok(Some((head, payload)))
    }

    async fn read_headers(&mut self, head: Head, payload: Bytes) -> Result<Frame, ReadError> {
        if head.stream_id().is_zero() {
            return Err(frame::Error::InvalidStreamId.into());
        }

        let mut fragment = strip_headers_payload(head, payload)?;
        let end_headers = head.is_end_headers();

        self.assemble_block(head.stream_id(), &mut fragment, end_headers)
            .await?;

        let fields = self.hpack.decode(&fragment)?;
        let headers =
            Headers::from_fields(head.stream_id(), fields, head.is_end_stream())?;
        Ok(headers.into())
    }

    async fn read_push_promise(&mut self, head: Head, payload: Bytes) -> Result<Frame, ReadError> {
        if head.stream_id().is_zero() {
            return Err(frame::Error::InvalidStreamId.into());
        }

        let mut payload = strip_padding(head, payload)?;
        if payload.len() < 4 {
            return Err(frame::Error::PayloadLengthTooShort.into());
        }
        let (promised_id, _) = StreamId::parse(&payload[..4]);
        if promised_id.is_zero() {
            return Err(frame::Error::InvalidStreamId.into());
        }
        let mut fragment = BytesMut::from(&payload.split_off(4)[..]);

        self.assemble_block(head.stream_id(), &mut fragment, head.is_end_headers())
            .await?;

        let fields = self.hpack.decode(&fragment)?;
        let push = PushPromise::from_fields(head.stream_id(), promised_id, fields)?;
        Ok(push.into())
    }

    /// Append CONTINUATION fragments until END_HEADERS. The header block
    /// must be contiguous: any other frame, or a CONTINUATION for a
    /// different stream, is a connection error.
    async fn assemble_block(
        &mut self,
        stream_id: StreamId,
        fragment: &mut BytesMut,
        mut end_headers: bool,
    ) -> Result<(), ReadError> {
        loop {
            if let Some(max) = self.max_header_block_size {
                if fragment.len() > max {
                    return Err(frame::Error::MalformedHeaderBlock(
                        "header block exceeds configured maximum",
                    )
                    .into());
                }
            }
            if end_headers {
                return Ok(());
            }

            let (head, payload) = self
                .read_raw()
                .await?
                .ok_or(ReadError::Frame(frame::Error::Short))?;

            if head.kind() != Kind::Continuation || head.stream_id() != stream_id {
                return Err(frame::Error::UnexpectedContinuation.into());
            }

            fragment.extend_from_slice(&payload);
            end_headers = head.is_end_headers();
        }
    }

    /// Buffer until at least `n` bytes are available. Returns false on
    /// EOF before that.
    async fn fill(&mut self, n: usize) -> Result<bool, std::io::Error> {
        while self.buf.len() < n {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Remove padding and the deprecated priority section from a HEADERS
/// payload, leaving the header block fragment.
fn strip_headers_payload(head: Head, payload: Bytes) -> Result<BytesMut, frame::Error> {
    let mut payload = strip_padding(head, payload)?;

    if head.flag() & frame::PRIORITY != 0 {
        if payload.len() < 5 {
            return Err(frame::Error::PayloadLengthTooShort);
        }
        let (dependency, _) = StreamId::parse(&payload[..4]);
        if dependency == head.stream_id() {
            return Err(frame::Error::InvalidDependencyId);
        }
        let _ = payload.split_to(5);
    }

    Ok(BytesMut::from(&payload[..]))
}

fn strip_padding(head: Head, mut payload: Bytes) -> Result<Bytes, frame::Error> {
    if head.is_padded() {
        if payload.is_empty() {
            return Err(frame::Error::PayloadLengthTooShort);
        }
        let pad_len = payload[0] as usize;
        if pad_len >= payload.len() {
            return Err(frame::Error::TooMuchPadding);
        }
        let _ = payload.split_to(1);
        let _ = payload.split_off(payload.len() - pad_len);
    }
    Ok(payload)
}
