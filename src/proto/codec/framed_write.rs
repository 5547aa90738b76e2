use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::proto::frame::{
    self, Data, GoAway, Head, Headers, Kind, Ping, Reset, Settings, WindowUpdate,
};
use crate::proto::hpack;

/// The client connection preface (RFC 7540 Section 3.5).
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Serializes frames onto the send half of a connection.
///
/// Owns the HPACK encoder, so header blocks are produced in write order,
/// and splits oversized payloads: header blocks into HEADERS +
/// CONTINUATION, data into multiple DATA frames. Every public method
/// leaves the socket flushed, which keeps frames atomic as long as the
/// caller serializes access.
#[derive(Debug)]
pub(crate) struct FramedWrite<W> {
    io: W,
    buf: BytesMut,
    hpack: hpack::Encoder,
    /// The peer's SETTINGS_MAX_FRAME_SIZE; our frames must respect it.
    max_frame_size: u32,
}

impl<W> FramedWrite<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(io: W) -> FramedWrite<W> {
        FramedWrite {
            io,
            buf: BytesMut::with_capacity(16 * 1024),
            hpack: hpack::Encoder::new(),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub(crate) fn hpack_mut(&mut self) -> &mut hpack::Encoder {
        &mut self.hpack
    }

    pub(crate) async fn write_preface(&mut self) -> std::io::Result<()> {
        self.buf.put_slice(PREFACE);
        self.flush_buf().await
    }

    pub(crate) async fn write_settings(&mut self, settings: &Settings) -> std::io::Result<()> {
        trace!("sending frame; {:?}", settings);
        settings.encode(&mut self.buf);
        self.flush_buf().await
    }

    pub(crate) async fn write_ping(&mut self, ping: &Ping) -> std::io::Result<()> {
        trace!("sending frame; {:?}", ping);
        ping.encode(&mut self.buf);
        self.flush_buf().await
    }

    pub(crate) async fn write_go_away(&mut self, go_away: &GoAway) -> std::io::Result<()> {
        trace!("sending frame; {:?}", go_away);
        go_away.encode(&mut self.buf);
        self.flush_buf().await
    }

    pub(crate) async fn write_reset(&mut self, reset: &Reset) -> std::io::Result<()> {
        trace!("sending frame; {:?}", reset);
        reset.encode(&mut self.buf);
        self.flush_buf().await
    }

    pub(crate) async fn write_window_update(
        &mut self,
        update: &WindowUpdate,
    ) -> std::io::Result<()> {
        trace!("sending frame; {:?}", update);
        update.encode(&mut self.buf);
        self.flush_buf().await
    }

    /// Encode a header block and emit it as one HEADERS frame, plus
    /// CONTINUATION frames when the block exceeds the peer's maximum
    /// frame size.
    pub(crate) async fn write_headers(&mut self, headers: &Headers) -> std::io::Result<()> {
        trace!(
            "sending frame; HEADERS stream={} end_stream={}",
            headers.stream_id(),
            headers.is_end_stream()
        );

        let mut block = BytesMut::new();
        self.hpack.encode(headers.encode_fields(), &mut block);

        let max = self.max_frame_size as usize;
        let first_len = block.len().min(max);
        let first = block.split_to(first_len);

        let mut flags = 0;
        if headers.is_end_stream() {
            flags |= frame::END_STREAM;
        }
        if block.is_empty() {
            flags |= frame::END_HEADERS;
        }

        Head::new(Kind::Headers, flags, headers.stream_id()).encode(first.len(), &mut self.buf);
        self.buf.put_slice(&first);

        while !block.is_empty() {
            let chunk = block.split_to(block.len().min(max));
            let flags = if block.is_empty() {
                frame::END_HEADERS
            } else {
                0
            };
            Head::new(Kind::Continuation, flags, headers.stream_id())
                .encode(chunk.len(), &mut self.buf);
            self.buf.put_slice(&chunk);
        }

        self.flush_buf().await
    }

    /// Emit a data payload, split into DATA frames no larger than the
    /// peer's maximum frame size. END_STREAM goes on the last frame only.
    pub(crate) async fn write_data(&mut self, data: &Data) -> std::io::Result<()> {
        trace!("sending frame; {:?}", data);

        let max = self.max_frame_size as usize;
        let mut payload = data.payload().clone();

        loop {
            let chunk = payload.split_to(payload.len().min(max));
            let last = payload.is_empty();
            Data::new(data.stream_id(), chunk, last && data.is_end_stream())
                .encode(&mut self.buf);
            if last {
                break;
            }
        }

        self.flush_buf().await
    }

    pub(crate) async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.io
    }

    async fn flush_buf(&mut self) -> std::io::Result<()> {
        let buf = self.buf.split();
        self.io.write_all(&buf).await?;
        self.io.flush().await
    }
}
