#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # creq
//!
//! A pooled, dispatched HTTP client speaking HTTP/2 natively: one
//! multiplexed connection per destination, a call dispatcher bounding
//! global and per-host concurrency, and flow-controlled streams.
//!
//! - One-shot [`Call`]s with cancellation, deadlines, and transparent
//!   retries of work the server never saw
//! - A connection [pool](Client::connection_count) with idle eviction
//!   and HTTP/2 coalescing hooks
//! - Composable [`Interceptor`]s with per-chain timeout overrides
//! - Transparent compression via `Accept-Encoding` negotiation
//!
//! ## Making a GET request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), creq::Error> {
//! let body = creq::Client::new()
//!     .get("http://httpbin.org/ip")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, it is best to
//! create a [`Client`] and reuse it, taking advantage of keep-alive
//! connection pooling.
//!
//! ## Dispatching
//!
//! Calls run either in place with [`Call::execute`], or through the
//! client's [`Dispatcher`] with [`Call::enqueue`], which promotes ready
//! calls FIFO while respecting the configured concurrency limits.
//!
//! ```rust,no_run
//! # fn run() -> Result<(), creq::Error> {
//! let client = creq::Client::new();
//! let request = creq::Request::new(http::Method::GET, "http://example.com/".parse().unwrap());
//! let call = client.call(request);
//! call.enqueue(|result| match result {
//!     Ok(response) => println!("status: {}", response.status()),
//!     Err(err) => eprintln!("failed: {err}"),
//! })?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod trace;

mod body;
mod call;
mod client;
mod connect;
mod decoder;
mod dispatcher;
mod dns;
mod error;
mod events;
mod ext;
mod interceptor;
mod into_uri;
mod pool;
mod proto;
mod request;
mod response;

pub use http::header;
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};

pub use self::body::Body;
pub use self::call::Call;
pub use self::client::{Client, ClientConfig};
pub use self::connect::{Address, CoalescingPolicy, NoCoalescing};
pub use self::decoder::Accepts;
pub use self::dispatcher::Dispatcher;
pub use self::dns::{GaiResolver, Resolve, Resolving};
pub use self::error::{BoxError, Error, Result};
pub use self::events::{EventListener, NoopListener};
pub use self::ext::TagMap;
pub use self::interceptor::{Chain, Interceptor};
pub use self::into_uri::IntoUri;
pub use self::proto::{
    EagerWindowUpdates, Reason, ThresholdWindowUpdates, WindowUpdateStrategy,
};
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;

/// Shortcut method to quickly make a `GET` request.
///
/// See also the methods on the [`Response`] for reading the body.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn run() -> Result<(), creq::Error> {
/// let body = creq::get("http://httpbin.org/ip").await?.text().await?;
/// # Ok(())
/// # }
/// ```
pub async fn get<U: IntoUri>(uri: U) -> Result<Response> {
    Client::new().get(uri).send().await
}
