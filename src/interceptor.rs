//! The interceptor chain: an ordered sequence of request/response
//! transformers ending in the interceptor that talks to the network.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use http::header::{CONNECTION, HOST, TE, TRANSFER_ENCODING, UPGRADE};
use http::HeaderMap;

use crate::body::Body;
use crate::call::Call;
use crate::connect::Address;
use crate::events;
use crate::proto::frame::Pseudo;
use crate::proto::{self, Reason};
use crate::request::Request;
use crate::response::{Exchange, Response};
use crate::{Error, Result};

/// Observes and transforms requests on their way out and responses on
/// their way back. Interceptors compose: each one receives the chain
/// positioned after itself and calls [`Chain::proceed`] to continue, or
/// returns a response of its own making.
pub trait Interceptor: Send + Sync + 'static {
    /// Handle the chain. `Chain::proceed` consumes the chain, so it can
    /// be called at most once per invocation.
    fn intercept(&self, chain: Chain) -> BoxFuture<'static, Result<Response>>;
}

/// A call's progress through the interceptor list, owning the request in
/// flight and the per-chain timeout overrides.
pub struct Chain {
    call: Call,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    request: Option<Request>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Chain {
    pub(crate) fn new(
        call: Call,
        interceptors: Arc<[Arc<dyn Interceptor>]>,
        request: Request,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Chain {
        Chain {
            call,
            interceptors,
            index: 0,
            request: Some(request),
            read_timeout,
            write_timeout,
            deadline,
        }
    }

    /// The call this chain serves.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// The request as it currently stands.
    pub fn request(&self) -> &Request {
        self.request
            .as_ref()
            .expect("request already taken from the chain")
    }

    /// Take ownership of the request, e.g. to move its body.
    pub fn take_request(&mut self) -> Request {
        self.request
            .take()
            .expect("request already taken from the chain")
    }

    /// The destination of the connection attached to this call, once a
    /// connect-stage interceptor has run. Network interceptors always
    /// see `Some`.
    pub fn connection(&self) -> Option<Address> {
        self.call.connection_address()
    }

    /// The read timeout applied to downstream waits.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// The write timeout applied to downstream writes.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A chain whose downstream reads time out after `timeout`.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Chain {
        self.read_timeout = timeout;
        self
    }

    /// A chain whose downstream writes time out after `timeout`.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Chain {
        self.write_timeout = timeout;
        self
    }

    /// Continue with the next interceptor, handing it `request`.
    pub fn proceed(mut self, request: Request) -> BoxFuture<'static, Result<Response>> {
        self.request = Some(request);
        self.run()
    }

    /// Continue with the next interceptor, keeping the current request.
    pub(crate) fn proceed_self(self) -> BoxFuture<'static, Result<Response>> {
        self.run()
    }

    pub(crate) fn run(mut self) -> BoxFuture<'static, Result<Response>> {
        let Some(interceptor) = self.interceptors.get(self.index).cloned() else {
            return Box::pin(async move {
                Err(Error::illegal_state("interceptor chain exhausted"))
            });
        };
        self.index += 1;
        Box::pin(async move { interceptor.intercept(self).await })
    }

    /// A copy of this chain for a fresh attempt. `None` when the request
    /// body is a one-shot stream.
    pub(crate) fn try_clone(&self) -> Option<Chain> {
        let request = self.request.as_ref()?.try_clone()?;
        Some(Chain {
            call: self.call.clone(),
            interceptors: self.interceptors.clone(),
            index: self.index,
            request: Some(request),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            deadline: self.deadline,
        })
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

/// Transparently re-sends requests whose failure is known to have
/// happened before the peer processed them: refused streams, GOAWAY
/// races, connections that died during establishment.
pub(crate) struct RetryInterceptor {
    max_retries: u32,
}

impl RetryInterceptor {
    pub(crate) fn new() -> RetryInterceptor {
        RetryInterceptor { max_retries: 20 }
    }
}

impl Interceptor for RetryInterceptor {
    fn intercept(&self, chain: Chain) -> BoxFuture<'static, Result<Response>> {
        let max_retries = self.max_retries;
        Box::pin(async move {
            let mut chain = chain;
            let mut attempts = 0u32;
            loop {
                let backup = chain.try_clone();
                let call = chain.call().clone();

                match chain.proceed_self().await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        if call.is_canceled()
                            || !err.is_retryable()
                            || attempts >= max_retries
                        {
                            return Err(err);
                        }
                        let Some(next) = backup else {
                            // One-shot body: nothing left to re-send.
                            return Err(err);
                        };
                        attempts += 1;
                        debug!("retrying after recoverable failure; attempt={}", attempts);
                        events::emit(call.listener(), |l| l.retry(&call, &err));
                        chain = next;
                    }
                }
            }
        })
    }
}

/// Binds a pooled connection to the call. Everything after this stage
/// sees a live connection.
pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: Chain) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let call = chain.call().clone();
            if call.is_canceled() {
                return Err(Error::canceled().with_uri(chain.request().uri().clone()));
            }

            let address = Address::from_uri(chain.request().uri())?;
            let lease = call.client().pool().acquire(&address).await?;
            let reused = lease.is_reused();
            call.set_lease(lease);
            events::emit(call.listener(), |l| l.connection_acquired(&call, reused));

            let result = chain.proceed_self().await;
            if result.is_err() {
                // Drop whatever claim the failed attempt left behind.
                drop(call.take_lease());
            }
            result
        })
    }
}

/// The terminal interceptor: opens the stream, writes the request body,
/// and turns the peer's answer into a [`Response`].
pub(crate) struct CallServerInterceptor;

impl Interceptor for CallServerInterceptor {
    fn intercept(&self, mut chain: Chain) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let call = chain.call().clone();
            let mut request = chain.take_request();
            let uri = request.uri().clone();

            let lease = call
                .take_lease()
                .ok_or_else(|| Error::illegal_state("no connection bound to the exchange"))?;
            let h2 = lease.connection().h2().clone();

            let pseudo = request_pseudo(&request)?;
            let fields = wire_headers(request.headers());
            let body = request.take_body().filter(|body| !body.is_empty());
            let end_stream = body.is_none();

            let sent_at = SystemTime::now();
            let stream = h2
                .new_stream(pseudo, fields, end_stream)
                .await
                .map_err(|err| Error::from_proto(err).with_uri(uri.clone()))?;
            call.attach_stream(stream.clone());
            events::emit(call.listener(), |l| l.request_headers_end(&call));

            if let Some(body) = body {
                match write_body(&stream, body, chain.write_timeout(), chain.deadline()).await {
                    Ok(written) => {
                        events::emit(call.listener(), |l| l.request_body_end(&call, written));
                    }
                    Err(err) => {
                        stream.release().await;
                        return Err(err.with_uri(uri));
                    }
                }
            }

            let wait = stream.response_headers();
            let head = match timeout_limit(chain.read_timeout(), chain.deadline()) {
                Some(limit) => match tokio::time::timeout(limit, wait).await {
                    Ok(result) => result,
                    Err(_) => {
                        // A server-wait timeout kills the stream, not the
                        // connection.
                        stream.release().await;
                        return Err(Error::timeout().with_uri(uri));
                    }
                },
                None => wait.await,
            };
            let head = match head {
                Ok(head) => head,
                Err(err) => {
                    stream.release().await;
                    return Err(Error::from_proto(err).with_uri(uri));
                }
            };

            let (head_pseudo, headers) = head.into_parts();
            let status = match head_pseudo.status {
                Some(status) => status,
                None => {
                    stream.release().await;
                    return Err(Error::request("response is missing :status").with_uri(uri));
                }
            };
            events::emit(call.listener(), |l| l.response_headers_end(&call, status));

            let exchange = Exchange::new(stream, lease);
            Ok(Response::from_exchange(
                status,
                headers,
                uri,
                exchange,
                call,
                chain.read_timeout(),
                chain.deadline(),
                sent_at,
            ))
        })
    }
}

/// The request pseudo-header fields for HTTP/2.
fn request_pseudo(request: &Request) -> Result<Pseudo> {
    let uri = request.uri();
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| Error::builder("URI is missing a scheme").with_uri(uri.clone()))?;
    let authority = uri
        .authority()
        .ok_or_else(|| Error::builder("URI is missing an authority").with_uri(uri.clone()))?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(Pseudo::request(
        request.method().clone(),
        scheme,
        authority.as_str(),
        path,
    ))
}

/// Regular header fields as they go on the wire: connection-specific
/// fields are forbidden in HTTP/2, and the authority travels as a
/// pseudo-header.
fn wire_headers(headers: &HeaderMap) -> HeaderMap {
    let mut fields = headers.clone();
    for name in [CONNECTION, HOST, TE, TRANSFER_ENCODING, UPGRADE] {
        fields.remove(name);
    }
    fields.remove("keep-alive");
    fields.remove("proxy-connection");
    fields
}

/// Stream the request body onto the wire, END_STREAM on the last chunk.
async fn write_body(
    stream: &proto::StreamRef,
    body: Body,
    write_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<u64> {
    let mut chunks = body.into_stream();
    let mut pending: Option<Bytes> = None;
    let mut written = 0u64;

    loop {
        match chunks.next().await {
            Some(Ok(bytes)) => {
                if let Some(prev) = pending.replace(bytes) {
                    written += prev.len() as u64;
                    send_chunk(stream, prev, false, write_timeout, deadline).await?;
                }
            }
            Some(Err(err)) => {
                stream.reset(Reason::CANCEL).await;
                return Err(Error::body(err));
            }
            None => break,
        }
    }

    let last = pending.unwrap_or_default();
    written += last.len() as u64;
    send_chunk(stream, last, true, write_timeout, deadline).await?;
    Ok(written)
}

async fn send_chunk(
    stream: &proto::StreamRef,
    chunk: Bytes,
    end_stream: bool,
    write_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<()> {
    let write = stream.write_data(chunk, end_stream);
    match timeout_limit(write_timeout, deadline) {
        Some(limit) => match tokio::time::timeout(limit, write).await {
            Ok(result) => result.map_err(Error::from_proto),
            Err(_) => {
                // The peer starved our flow-control window; give up on
                // the stream, not the connection.
                stream.reset(Reason::CANCEL).await;
                Err(Error::timeout())
            }
        },
        None => write.await.map_err(Error::from_proto),
    }
}

fn timeout_limit(timeout: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let until_deadline = deadline.map(|at| at.saturating_duration_since(Instant::now()));
    match (timeout, until_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
