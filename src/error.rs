use std::{error::Error as StdError, fmt, io};

use http::{StatusCode, Uri};

use crate::proto;
use crate::proto::Reason;

/// A `Result` alias where the `Err` case is `creq::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur when processing a request.
///
/// Note: errors may include the full URI used to make the request. If
/// the URI contains sensitive information (e.g. an API key as a query
/// parameter), be sure to remove it ([`without_uri`](Error::without_uri)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                uri: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout, Some(TimedOut))
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, None::<Error>)
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn illegal_state(detail: &'static str) -> Error {
        Error::new(Kind::IllegalState(detail), None::<Error>)
    }

    /// Wrap an HTTP/2 layer failure, preserving its taxonomy.
    pub(crate) fn from_proto(e: proto::Error) -> Error {
        let kind = match &e {
            proto::Error::StreamReset {
                reason,
                remote: false,
            } if *reason == Reason::CANCEL => Kind::Canceled,
            proto::Error::StreamReset { reason, .. } => Kind::StreamReset(*reason),
            proto::Error::GoAway { .. } | proto::Error::Shutdown => Kind::Shutdown,
            proto::Error::Protocol { .. } | proto::Error::PingTimeout => Kind::Protocol,
            proto::Error::FlowControl => Kind::FlowControl,
            proto::Error::Io(_) => Kind::Request,
        };
        Error::new(kind, Some(e))
    }
}

impl Error {
    /// Returns a possible URI related to this error.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Returns a mutable reference to the URI related to this error.
    ///
    /// This is useful if you need to remove sensitive information from
    /// the URI (e.g. an API key in the query), but do not want to remove
    /// the URI entirely.
    pub fn uri_mut(&mut self) -> Option<&mut Uri> {
        self.inner.uri.as_mut()
    }

    /// Add a URI related to this error (overwriting any existing).
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }

    /// Strip the related URI from this error (if, for example, it
    /// contains sensitive information).
    pub fn without_uri(mut self) -> Self {
        self.inner.uri = None;
        self
    }

    /// Returns true if the error is from building a request.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the error is related to establishing a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the peer violated the HTTP/2 protocol and the
    /// connection was destroyed.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the request's stream was reset.
    pub fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset(_))
    }

    /// The RST_STREAM error code, if this error is a stream reset.
    pub fn reset_reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::StreamReset(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true if the connection was shut down (GOAWAY) before this
    /// request was processed.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::Shutdown)
    }

    /// Returns true if a flow-control invariant was violated.
    pub fn is_flow_control(&self) -> bool {
        matches!(self.inner.kind, Kind::FlowControl)
    }

    /// Returns true if the error is related to the request or response
    /// body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the error is related to decoding the response's
    /// body.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if an API contract was violated, such as executing a
    /// call twice.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self.inner.kind, Kind::IllegalState(_))
    }

    /// Returns true if the error is from `Response::error_for_status`.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status(_))
    }

    /// Returns the status code, if the error was generated from a
    /// response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }

    /// Whether the work lost to this error never reached the server, so
    /// the request can be transparently re-sent.
    pub(crate) fn is_retryable(&self) -> bool {
        match self.inner.kind {
            Kind::StreamReset(reason) => reason == Reason::REFUSED_STREAM,
            Kind::Shutdown => true,
            Kind::Connect => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("creq::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Connect => f.write_str("error connecting")?,
            Kind::Timeout => f.write_str("request timed out")?,
            Kind::Canceled => f.write_str("call canceled")?,
            Kind::Protocol => f.write_str("http2 protocol error")?,
            Kind::StreamReset(reason) => write!(f, "stream reset: {reason}")?,
            Kind::Shutdown => f.write_str("connection shut down before the request was processed")?,
            Kind::FlowControl => f.write_str("flow-control window violated")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::IllegalState(detail) => write!(f, "illegal state: {detail}")?,
            Kind::Status(code) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else {
                    debug_assert!(code.is_server_error());
                    "HTTP status server error"
                };
                write!(f, "{prefix} ({code})")?;
            }
        };

        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Request,
    Connect,
    Timeout,
    Canceled,
    Protocol,
    StreamReset(Reason),
    Shutdown,
    FlowControl,
    Body,
    Decode,
    IllegalState(&'static str),
    Status(StatusCode),
}

pub(crate) fn status_code(uri: Uri, status: StatusCode) -> Error {
    Error::new(Kind::Status(status), None::<Error>).with_uri(uri)
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URI scheme is not allowed")
    }
}

impl StdError for BadScheme {}
