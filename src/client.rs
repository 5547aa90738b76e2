use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::call::Call;
use crate::connect::{CoalescingPolicy, Connector, NoCoalescing};
use crate::decoder::{Accepts, CompressionInterceptor};
use crate::dispatcher::Dispatcher;
use crate::dns::{GaiResolver, Resolve};
use crate::events::{EventListener, NoopListener};
use crate::interceptor::{
    CallServerInterceptor, ConnectInterceptor, Interceptor, RetryInterceptor,
};
use crate::into_uri::IntoUriSealed;
use crate::pool::{Pool, PoolConfig};
use crate::proto;
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::{IntoUri, Result};

/// The configuration snapshot a [`Client`] is built from. Plain data:
/// set the fields, hand it to [`Client::with_config`], done. The client
/// keeps an immutable copy.
pub struct ClientConfig {
    /// Cap on concurrently running asynchronous calls.
    pub max_requests: usize,
    /// Cap on concurrently running asynchronous calls per host.
    pub max_requests_per_host: usize,
    /// Idle connections kept beyond this count are evicted oldest-first.
    pub max_idle_connections: usize,
    /// How long an idle connection may linger before eviction.
    pub keep_alive: Duration,
    /// Limit on establishing a TCP connection.
    pub connect_timeout: Option<Duration>,
    /// Default deadline spanning a whole call; requests may override it.
    pub call_timeout: Option<Duration>,
    /// Limit on each blocked read from a stream.
    pub read_timeout: Option<Duration>,
    /// Limit on each blocked write to a stream.
    pub write_timeout: Option<Duration>,
    /// Keepalive PING cadence. `None` disables keepalive probing.
    pub ping_interval: Option<Duration>,
    /// Our per-stream receive window (SETTINGS_INITIAL_WINDOW_SIZE).
    pub initial_stream_window: Option<u32>,
    /// Our SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: Option<u32>,
    /// Content encodings to announce and transparently decode.
    pub accepts: Accepts,
    /// Host resolution.
    pub resolver: Arc<dyn Resolve>,
    /// Whether connections may be shared across authorities.
    pub coalescing: Arc<dyn CoalescingPolicy>,
    /// When consumed receive credit is returned to peers.
    pub window_update_strategy: Arc<dyn proto::WindowUpdateStrategy>,
    /// Application interceptors, run before any network work.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    /// Network interceptors, run with a connection bound to the call.
    pub network_interceptors: Vec<Arc<dyn Interceptor>>,
    /// Observer for call lifecycle events.
    pub event_listener: Arc<dyn EventListener>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_requests: 64,
            max_requests_per_host: 5,
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
            connect_timeout: Some(Duration::from_secs(10)),
            call_timeout: None,
            read_timeout: None,
            write_timeout: None,
            ping_interval: None,
            initial_stream_window: None,
            max_frame_size: None,
            accepts: Accepts::default(),
            resolver: Arc::new(GaiResolver),
            coalescing: Arc::new(NoCoalescing),
            window_update_strategy: Arc::new(proto::ThresholdWindowUpdates),
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            event_listener: Arc::new(NoopListener),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_requests", &self.max_requests)
            .field("max_requests_per_host", &self.max_requests_per_host)
            .field("max_idle_connections", &self.max_idle_connections)
            .field("keep_alive", &self.keep_alive)
            .field("call_timeout", &self.call_timeout)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

/// An HTTP/2 client with a shared connection pool and call dispatcher.
///
/// `Client` is cheap to clone and cloning is the recommended way to
/// share one: clones reuse the same pool and dispatcher.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    dispatcher: Dispatcher,
    pool: Pool,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    listener: Arc<dyn EventListener>,
    call_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Client {
    /// A client with the default configuration.
    pub fn new() -> Client {
        Client::with_config(ClientConfig::default())
    }

    /// A client from an explicit configuration snapshot.
    pub fn with_config(config: ClientConfig) -> Client {
        let mut settings = proto::frame::Settings::default();
        settings.set_enable_push(false);
        settings.set_initial_window_size(config.initial_stream_window);
        settings.set_max_frame_size(config.max_frame_size);

        let h2_config = proto::ConnectionConfig {
            settings,
            ping_interval: config.ping_interval,
            strategy: config.window_update_strategy.clone(),
        };
        let connector = Connector::new(
            config.resolver.clone(),
            config.connect_timeout,
            h2_config,
        );
        let pool = Pool::new(
            PoolConfig {
                max_idle_connections: config.max_idle_connections,
                keep_alive: config.keep_alive,
            },
            connector,
            config.coalescing.clone(),
        );

        // The fixed spine of every call's chain: application
        // interceptors, retries, the wire bridge, connect, network
        // interceptors, and the exchange itself.
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
        interceptors.extend(config.interceptors.iter().cloned());
        interceptors.push(Arc::new(RetryInterceptor::new()));
        interceptors.push(Arc::new(CompressionInterceptor::new(config.accepts.clone())));
        interceptors.push(Arc::new(ConnectInterceptor));
        interceptors.extend(config.network_interceptors.iter().cloned());
        interceptors.push(Arc::new(CallServerInterceptor));

        Client {
            inner: Arc::new(ClientRef {
                dispatcher: Dispatcher::new(config.max_requests, config.max_requests_per_host),
                pool,
                interceptors: interceptors.into(),
                listener: config.event_listener,
                call_timeout: config.call_timeout,
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
            }),
        }
    }

    /// Convenience method to make a `GET` request to a URI.
    pub fn get<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    /// Convenience method to make a `POST` request to a URI.
    pub fn post<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::POST, uri)
    }

    /// Convenience method to make a `PUT` request to a URI.
    pub fn put<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::PUT, uri)
    }

    /// Convenience method to make a `DELETE` request to a URI.
    pub fn delete<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::DELETE, uri)
    }

    /// Convenience method to make a `HEAD` request to a URI.
    pub fn head<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::HEAD, uri)
    }

    /// Start building a request with a method and URI.
    pub fn request<U: IntoUri>(&self, method: Method, uri: U) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, uri.into_uri())
    }

    /// Prepare a one-shot [`Call`] for the request.
    pub fn call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// Execute a request and await its response.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let uri = request.uri().clone();
        let mut response = self.call(request).execute().await?;
        response.set_uri(uri);
        Ok(response)
    }

    /// The dispatcher governing this client's asynchronous calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Number of connections currently pooled.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    /// Number of pooled connections with no exchange in flight.
    pub fn idle_connection_count(&self) -> usize {
        self.inner.pool.idle_connection_count()
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub(crate) fn interceptors(&self) -> &Arc<[Arc<dyn Interceptor>]> {
        &self.inner.interceptors
    }

    pub(crate) fn listener(&self) -> &Arc<dyn EventListener> {
        &self.inner.listener
    }

    pub(crate) fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.inner.read_timeout
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        self.inner.write_timeout
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("dispatcher", &self.inner.dispatcher)
            .field("pool", &self.inner.pool)
            .finish()
    }
}
