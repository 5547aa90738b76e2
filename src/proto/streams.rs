//! Per-stream state, shared between the connection's reader task and the
//! consumer of the stream. All fields live under the connection lock;
//! the notifies wake consumers blocked on buffer or window availability.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::Notify;

use super::flow::{RecvWindow, SendWindow};
use super::frame::Headers;
use super::Error;

/// Stream states from RFC 7540 Section 5.1, reduced to the ones a client
/// endpoint can observe. Idle streams have no record at all; a record is
/// created when HEADERS are sent (locally initiated) or a PUSH_PROMISE is
/// received.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum State {
    /// Promised by the peer, no response begun.
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl State {
    pub(crate) fn opened(end_stream_sent: bool) -> State {
        if end_stream_sent {
            State::HalfClosedLocal
        } else {
            State::Open
        }
    }

    /// Our sending half is done: no more DATA or trailers may go out.
    pub(crate) fn is_send_closed(&self) -> bool {
        matches!(
            self,
            State::HalfClosedLocal | State::Closed | State::ReservedRemote
        )
    }

    /// The peer's sending half is done.
    pub(crate) fn is_recv_closed(&self) -> bool {
        matches!(self, State::HalfClosedRemote | State::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }

    pub(crate) fn close_send(&mut self) {
        *self = match *self {
            State::Open => State::HalfClosedLocal,
            State::HalfClosedRemote => State::Closed,
            other => other,
        };
    }

    pub(crate) fn close_recv(&mut self) {
        *self = match *self {
            State::Open | State::ReservedRemote => State::HalfClosedRemote,
            State::HalfClosedLocal => State::Closed,
            other => other,
        };
    }
}

/// The record the connection keeps for one stream.
#[derive(Debug)]
pub(crate) struct StreamSlot {
    pub(crate) state: State,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,

    /// Received DATA payloads not yet taken by the consumer.
    pub(crate) recv_buf: VecDeque<Bytes>,
    pub(crate) buffered: u32,

    /// Response header blocks awaiting delivery, informational ones
    /// included, in arrival order.
    pub(crate) pending_headers: VecDeque<Headers>,
    /// Whether a non-informational header block has arrived.
    pub(crate) headers_received: bool,
    pub(crate) trailers: Option<HeaderMap>,

    /// The failure this stream was torn down with, if any. Buffered
    /// bytes are delivered before the error is surfaced.
    pub(crate) error: Option<Error>,
    /// We already put a RST_STREAM for this stream on the wire.
    pub(crate) reset_sent: bool,

    pub(crate) readable: Arc<Notify>,
    pub(crate) writable: Arc<Notify>,
}

impl StreamSlot {
    pub(crate) fn new(state: State, send_window: u32, recv_window: u32) -> StreamSlot {
        StreamSlot {
            state,
            send_window: SendWindow::new(send_window),
            recv_window: RecvWindow::new(recv_window),
            recv_buf: VecDeque::new(),
            buffered: 0,
            pending_headers: VecDeque::new(),
            headers_received: false,
            trailers: None,
            error: None,
            reset_sent: false,
            readable: Arc::new(Notify::new()),
            writable: Arc::new(Notify::new()),
        }
    }

    /// Record a failure and close the stream. The first error wins.
    pub(crate) fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.state = State::Closed;
        self.wake();
    }

    pub(crate) fn wake(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Take the next buffered chunk, reporting how many bytes left the
    /// buffer.
    pub(crate) fn pop_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.recv_buf.pop_front()?;
        self.buffered -= chunk.len() as u32;
        Some(chunk)
    }
}
