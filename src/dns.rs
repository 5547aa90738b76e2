//! DNS resolution contract.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

/// A future resolving to the addresses for a host.
pub type Resolving = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send>>;

/// One-shot host resolution. Implementations may block internally; the
/// returned list is tried in order.
pub trait Resolve: Send + Sync + 'static {
    /// Resolve `host` to socket addresses carrying `port`.
    fn resolve(&self, host: &str, port: u16) -> Resolving;
}

/// The default resolver, backed by the operating system's getaddrinfo.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver;

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str, port: u16) -> Resolving {
        let target = (host.to_owned(), port);
        Box::pin(async move {
            let addrs = tokio::net::lookup_host(target).await?;
            Ok(addrs.collect())
        })
    }
}
