use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode, Uri, Version};

use crate::body::Body;
use crate::call::Call;
use crate::events;
use crate::pool::Lease;
use crate::proto;
use crate::{Error, Result};

/// A response to a single request.
///
/// The body is a one-shot stream: it can be consumed once, and closing
/// it releases the underlying HTTP/2 stream back to the connection.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    uri: Uri,
    body: Option<BoxStream<'static, Result<Bytes>>>,
    exchange: Option<Exchange>,
    call: Option<Call>,
    body_complete: bool,
    bytes_read: Arc<AtomicU64>,
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
    sent_at: SystemTime,
    received_at: SystemTime,
}

/// The transport attachment of a network response: the stream it arrived
/// on and the claim on its connection. Dropping it releases both; an
/// unfinished stream is reset first.
pub(crate) struct Exchange {
    stream: proto::StreamRef,
    lease: Option<Lease>,
}

impl Exchange {
    pub(crate) fn new(stream: proto::StreamRef, lease: Lease) -> Exchange {
        Exchange {
            stream,
            lease: Some(lease),
        }
    }

    fn spawn_release(&mut self) {
        if let Some(lease) = self.lease.take() {
            let stream = self.stream.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        stream.release().await;
                        drop(lease);
                    });
                }
                // No runtime to run the release on; the connection will
                // notice the dead stream when it next touches it.
                Err(_) => drop(lease),
            }
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.spawn_release();
    }
}

impl Response {
    /// A synthesized response, carrying no network exchange. Interceptors
    /// use this to answer without touching the wire.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
        let stream = body
            .into_stream()
            .map(|chunk| chunk.map_err(Error::body))
            .boxed();
        Response {
            status,
            version: Version::HTTP_2,
            headers,
            uri: Uri::default(),
            body: Some(stream),
            exchange: None,
            call: None,
            body_complete: false,
            bytes_read: Arc::new(AtomicU64::new(0)),
            read_timeout: None,
            deadline: None,
            sent_at: SystemTime::now(),
            received_at: SystemTime::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_exchange(
        status: StatusCode,
        headers: HeaderMap,
        uri: Uri,
        exchange: Exchange,
        call: Call,
        read_timeout: Option<Duration>,
        deadline: Option<Instant>,
        sent_at: SystemTime,
    ) -> Response {
        let bytes_read = Arc::new(AtomicU64::new(0));
        let stream = raw_body_stream(
            exchange.stream.clone(),
            bytes_read.clone(),
            read_timeout,
            deadline,
        );
        Response {
            status,
            version: Version::HTTP_2,
            headers,
            uri,
            body: Some(stream),
            exchange: Some(exchange),
            call: Some(call),
            body_complete: false,
            bytes_read,
            read_timeout,
            deadline,
            sent_at,
            received_at: SystemTime::now(),
        }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the final `Uri` of this `Response`.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(crate) fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    /// Get the content length of the response, if it is known from the
    /// `Content-Length` header.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    /// When the request headers left this client.
    pub fn sent_at(&self) -> SystemTime {
        self.sent_at
    }

    /// When the response headers arrived.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Stream the next chunk of the response body. `None` once the body
    /// is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let stream = match self.body.as_mut() {
            Some(stream) => stream,
            None => return Ok(None),
        };

        match stream.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(err)) => {
                self.close();
                Err(self.with_uri(err))
            }
            None => {
                self.body_complete = true;
                if let (Some(call), Some(_)) = (&self.call, &self.exchange) {
                    let read = self.bytes_read.load(Ordering::Relaxed);
                    events::emit(call.listener(), |l| l.response_body_end(call, read));
                }
                Ok(None)
            }
        }
    }

    /// Get the full response body as `Bytes`.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Get the response text, lossily converted from UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The trailers the peer sent after the body, if any.
    ///
    /// The body must be fully consumed first; calling this earlier is an
    /// illegal state.
    pub async fn trailers(&mut self) -> Result<Option<HeaderMap>> {
        if !self.body_complete {
            return Err(Error::illegal_state(
                "trailers requested before the body was exhausted",
            ));
        }
        let exchange = match self.exchange.as_ref() {
            Some(exchange) => exchange,
            None => return Ok(None),
        };

        let wait = exchange.stream.trailers();
        let result = match effective_timeout(self.read_timeout, self.deadline) {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => return Err(self.with_uri(Error::timeout())),
            },
            None => wait.await,
        };
        result.map_err(|err| self.with_uri(Error::from_proto(err)))
    }

    /// Release the underlying stream and connection claim. Closing an
    /// already-closed response is a no-op; an unfinished stream is reset
    /// and its buffered bytes are returned to the connection window.
    pub fn close(&mut self) {
        self.body = None;
        if let Some(mut exchange) = self.exchange.take() {
            exchange.spawn_release();
            if let Some(call) = &self.call {
                events::emit(call.listener(), |l| l.connection_released(call));
            }
        }
    }

    /// Turn a response into an error if the server returned an error
    /// status.
    pub fn error_for_status(self) -> Result<Response> {
        if self.status.is_client_error() || self.status.is_server_error() {
            let uri = self.uri.clone();
            Err(crate::error::status_code(uri, self.status))
        } else {
            Ok(self)
        }
    }

    /// Swap the body for its decoded form and drop the headers that no
    /// longer describe it.
    pub(crate) fn decoded(mut self, encoding: crate::decoder::Encoding) -> Response {
        if let Some(stream) = self.body.take() {
            let raw = stream.map(|chunk| chunk.map_err(io::Error::other)).boxed();
            let decoded = crate::decoder::decode_stream(raw, encoding)
                .map(|chunk| chunk.map_err(restore_error))
                .boxed();
            self.body = Some(decoded);
        }
        self.headers.remove(http::header::CONTENT_ENCODING);
        self.headers.remove(http::header::CONTENT_LENGTH);
        self
    }

    fn with_uri(&self, err: Error) -> Error {
        if self.uri == Uri::default() {
            err
        } else {
            err.with_uri(self.uri.clone())
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("uri", &self.uri)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// The network body: chunks off the HTTP/2 stream, with the read timeout
/// and the call deadline applied to every pull.
fn raw_body_stream(
    stream: proto::StreamRef,
    bytes_read: Arc<AtomicU64>,
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> BoxStream<'static, Result<Bytes>> {
    futures_util::stream::unfold(
        (stream, bytes_read, false),
        move |(stream, bytes_read, done)| async move {
            if done {
                return None;
            }

            let pull = stream.read_chunk();
            let result = match effective_timeout(read_timeout, deadline) {
                Some(limit) => match tokio::time::timeout(limit, pull).await {
                    Ok(result) => result,
                    Err(_) => {
                        // A read timeout resets only this stream; the
                        // connection stays usable.
                        stream.reset(proto::Reason::CANCEL).await;
                        return Some((Err(Error::timeout()), (stream, bytes_read, true)));
                    }
                },
                None => pull.await,
            };

            match result {
                Ok(Some(bytes)) => {
                    bytes_read.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    Some((Ok(bytes), (stream, bytes_read, false)))
                }
                Ok(None) => None,
                Err(err) => Some((Err(Error::from_proto(err)), (stream, bytes_read, true))),
            }
        },
    )
    .boxed()
}

fn effective_timeout(
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Option<Duration> {
    let until_deadline = deadline.map(|at| at.saturating_duration_since(Instant::now()));
    match (read_timeout, until_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Pull a `creq::Error` back out of the io wrapper the decoder forced it
/// through; anything else really is a decode failure.
fn restore_error(err: io::Error) -> Error {
    if err.get_ref().map(|r| r.is::<Error>()).unwrap_or(false) {
        *err.into_inner()
            .expect("io::Error::get_ref was Some(_)")
            .downcast::<Error>()
            .expect("StdError::is() was true")
    } else {
        Error::decode(err)
    }
}
