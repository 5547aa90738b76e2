//! The HTTP/2 engine: typed frames, the codec, flow control, stream
//! state, and the multiplexed connection.

pub(crate) mod codec;
mod connection;
pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;
mod streams;

use std::fmt;
use std::io;
use std::sync::Arc;

pub(crate) use self::connection::{Connection, ConnectionConfig, StreamRef};
pub use self::flow::{EagerWindowUpdates, ThresholdWindowUpdates, WindowUpdateStrategy};
pub use self::frame::Reason;

/// A failure at the HTTP/2 layer. Stream-scoped failures kill one
/// exchange; the rest kill the connection. `is_retryable` says whether
/// the exchange may transparently move to another (or the same)
/// connection.
#[derive(Debug, Clone)]
pub(crate) enum Error {
    /// The stream was torn down with RST_STREAM semantics. `remote`
    /// records which side reset it.
    StreamReset { reason: Reason, remote: bool },

    /// GOAWAY arrived and this stream's id was above the peer's
    /// last-good id: the peer never processed it.
    GoAway { reason: Reason },

    /// The connection no longer accepts new streams.
    Shutdown,

    /// We detected a protocol violation by the peer. Fatal to the
    /// connection.
    Protocol {
        reason: Reason,
        message: &'static str,
    },

    /// The peer overran an advertised flow-control window. Fatal to the
    /// connection.
    FlowControl,

    /// The keepalive ping went unanswered.
    PingTimeout,

    /// Socket-level failure.
    Io(Arc<io::Error>),
}

impl Error {
    /// Whether the work lost to this error was never processed by the
    /// peer, so re-sending it cannot duplicate server-side effects.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Error::StreamReset { reason, .. } => *reason == Reason::REFUSED_STREAM,
            Error::GoAway { .. } => true,
            Error::Shutdown => true,
            _ => false,
        }
    }

    pub(crate) fn protocol(reason: Reason, message: &'static str) -> Error {
        Error::Protocol { reason, message }
    }

    pub(crate) fn io(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl From<codec::ReadError> for Error {
    fn from(src: codec::ReadError) -> Error {
        match src {
            codec::ReadError::Io(err) => Error::io(err),
            codec::ReadError::Frame(err) => {
                let reason = match err {
                    frame::Error::Hpack(_) => Reason::COMPRESSION_ERROR,
                    frame::Error::OversizedPayload | frame::Error::BadFrameSize => {
                        Reason::FRAME_SIZE_ERROR
                    }
                    _ => Reason::PROTOCOL_ERROR,
                };
                Error::Protocol {
                    reason,
                    message: "malformed frame received",
                }
            }
        }
    }
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::io(src)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StreamReset { reason, remote } => {
                let side = if *remote { "peer" } else { "local" };
                write!(f, "stream reset by {side}: {reason}")
            }
            Error::GoAway { reason } => write!(f, "connection going away: {reason}"),
            Error::Shutdown => f.write_str("connection is shut down"),
            Error::Protocol { reason, message } => {
                write!(f, "http2 protocol error ({reason:?}): {message}")
            }
            Error::FlowControl => f.write_str("flow-control window violated"),
            Error::PingTimeout => f.write_str("keepalive ping unanswered"),
            Error::Io(err) => write!(f, "connection i/o error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
