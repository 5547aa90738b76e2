//! A call: one request/response execution, usable exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::{Method, Uri};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::connect::Address;
use crate::events::{self, EventListener};
use crate::ext::TagMap;
use crate::interceptor::Chain;
use crate::pool::Lease;
use crate::proto;
use crate::request::Request;
use crate::response::Response;
use crate::{Error, Result};

/// A one-shot request execution.
///
/// A `Call` can be run synchronously with [`execute`](Call::execute) or
/// handed to the dispatcher with [`enqueue`](Call::enqueue); starting it
/// a second time is an error. Cloning the handle refers to the same
/// call; [`try_clone`](Call::try_clone) makes a fresh, executable copy.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    client: Client,
    /// The request, taken when execution starts.
    request: Mutex<Option<Request>>,
    /// A reusable snapshot for `try_clone`; `None` when the body is a
    /// one-shot stream.
    original: Mutex<Option<Request>>,
    method: Method,
    uri: Uri,
    host_key: String,
    web_socket: bool,
    timeout: Option<Duration>,
    tags: Arc<TagMap>,
    listener: Arc<dyn EventListener>,
    executed: AtomicBool,
    canceled: AtomicBool,
    cancel: CancellationToken,
    /// The in-flight HTTP/2 stream, for cancellation.
    stream: Mutex<Option<proto::StreamRef>>,
    /// The connection claim between the connect stage and the exchange.
    lease: Mutex<Option<Lease>>,
}

impl Call {
    pub(crate) fn new(client: Client, request: Request) -> Call {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let host_key = host_key(&uri);
        let web_socket = request.is_web_socket();
        let timeout = request.timeout().or(client.call_timeout());
        let tags = Arc::new(request.tags_arc().snapshot());
        let listener = client.listener().clone();
        let original = request.try_clone();

        Call {
            inner: Arc::new(CallInner {
                client,
                request: Mutex::new(Some(request)),
                original: Mutex::new(original),
                method,
                uri,
                host_key,
                web_socket,
                timeout,
                tags,
                listener,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                stream: Mutex::new(None),
                lease: Mutex::new(None),
            }),
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// The typed tags of this call, seeded from the request.
    pub fn tags(&self) -> &TagMap {
        &self.inner.tags
    }

    /// Whether `execute` or `enqueue` has been invoked.
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// Whether the call has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_web_socket(&self) -> bool {
        self.inner.web_socket
    }

    pub(crate) fn host_key(&self) -> &str {
        &self.inner.host_key
    }

    /// Whether two handles refer to the same call.
    pub(crate) fn ptr_eq(&self, other: &Call) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    pub(crate) fn listener(&self) -> &Arc<dyn EventListener> {
        &self.inner.listener
    }

    /// Run the call and wait for its response.
    pub async fn execute(&self) -> Result<Response> {
        self.claim_execution()?;
        events::emit(&self.inner.listener, |l| l.call_start(self));

        self.inner.client.dispatcher().register_sync(self.clone());
        let result = self.run().await;
        self.inner
            .client
            .dispatcher()
            .finished_sync(self);
        result
    }

    /// Hand the call to the dispatcher; `callback` receives the outcome.
    pub fn enqueue<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        self.claim_execution()?;
        events::emit(&self.inner.listener, |l| l.call_start(self));
        self.inner
            .client
            .dispatcher()
            .enqueue(self.clone(), Box::new(callback));
        Ok(())
    }

    /// Cancel the call. Idempotent: suspended I/O is woken with a
    /// cancellation error and an in-flight HTTP/2 stream is reset with
    /// CANCEL. Calls whose exchange already finished are unaffected,
    /// since resetting a closed stream does nothing.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        trace!("canceling call to {}", self.inner.uri);
        self.inner.cancel.cancel();

        let stream = self.inner.stream.lock().expect("stream slot poisoned").take();
        if let Some(stream) = stream {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    stream.reset(proto::Reason::CANCEL).await;
                });
            }
        }
    }

    /// A fresh, executable call with the original request. The copy
    /// carries the request's tags but none computed since, and no
    /// per-call listeners beyond the client-wide one.
    ///
    /// `None` when the request body is a one-shot stream.
    pub fn try_clone(&self) -> Option<Call> {
        let request = self
            .inner
            .original
            .lock()
            .expect("original slot poisoned")
            .as_ref()?
            .try_clone()?;
        Some(Call::new(self.inner.client.clone(), request))
    }

    fn claim_execution(&self) -> Result<()> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::illegal_state("call already executed")
                .with_uri(self.inner.uri.clone()));
        }
        Ok(())
    }

    /// The execution core shared by the sync and dispatched paths.
    pub(crate) async fn run(&self) -> Result<Response> {
        let result = self.run_inner().await;

        // A claim left behind by an aborted attempt.
        drop(self.take_lease());

        match &result {
            Ok(_) => events::emit(&self.inner.listener, |l| l.call_end(self)),
            Err(err) => events::emit(&self.inner.listener, |l| l.call_failed(self, err)),
        }
        result
    }

    async fn run_inner(&self) -> Result<Response> {
        if self.is_canceled() {
            return Err(Error::canceled().with_uri(self.inner.uri.clone()));
        }

        let request = self
            .inner
            .request
            .lock()
            .expect("request slot poisoned")
            .take()
            .ok_or_else(|| Error::illegal_state("request already consumed"))?;
        request.validate()?;

        let deadline = self.inner.timeout.map(|timeout| Instant::now() + timeout);
        let chain = Chain::new(
            self.clone(),
            self.inner.client.interceptors().clone(),
            request,
            self.inner.client.read_timeout(),
            self.inner.client.write_timeout(),
            deadline,
        );

        let work = chain.run();
        tokio::pin!(work);

        let canceled = self.inner.cancel.clone();
        let result = tokio::select! {
            result = &mut work => result,
            _ = canceled.cancelled() => {
                Err(Error::canceled().with_uri(self.inner.uri.clone()))
            }
            _ = sleep_until_deadline(deadline) => {
                // The deadline spans connect, write, server wait, and
                // read; expiry cancels the call.
                self.cancel();
                Err(Error::timeout().with_uri(self.inner.uri.clone()))
            }
        };

        if result.is_err() {
            // No response owns the stream on the failure path; whatever
            // attempt was attached last gets torn down here.
            if let Some(stream) = self.detach_stream() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        stream.release().await;
                    });
                }
            }
        }
        result
    }

    pub(crate) fn attach_stream(&self, stream: proto::StreamRef) {
        if self.is_canceled() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let doomed = stream.clone();
                handle.spawn(async move {
                    doomed.reset(proto::Reason::CANCEL).await;
                });
            }
        }
        *self.inner.stream.lock().expect("stream slot poisoned") = Some(stream);
    }

    fn detach_stream(&self) -> Option<proto::StreamRef> {
        self.inner.stream.lock().expect("stream slot poisoned").take()
    }

    pub(crate) fn set_lease(&self, lease: Lease) {
        *self.inner.lease.lock().expect("lease slot poisoned") = Some(lease);
    }

    pub(crate) fn take_lease(&self) -> Option<Lease> {
        self.inner.lease.lock().expect("lease slot poisoned").take()
    }

    pub(crate) fn connection_address(&self) -> Option<Address> {
        self.inner
            .lease
            .lock()
            .expect("lease slot poisoned")
            .as_ref()
            .map(|lease| lease.connection().address().clone())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// The `host:port` key the dispatcher tallies per-host concurrency by.
fn host_key(uri: &Uri) -> String {
    use crate::ext::UriExt;
    format!(
        "{}:{}",
        uri.host().unwrap_or_default(),
        uri.port_or_default()
    )
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
