//! Destination addresses and the transport connector.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::uri::Scheme;
use http::Uri;
use tokio::net::TcpStream;

use crate::dns::Resolve;
use crate::ext::UriExt;
use crate::proto;
use crate::{Error, Result};

/// A connection destination: everything that determines whether two
/// requests may share a connection.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Address {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Address {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Address> {
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| Error::builder("URI is missing a scheme").with_uri(uri.clone()))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::builder("URI is missing a host").with_uri(uri.clone()))?;

        Ok(Address {
            scheme,
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port: uri.port_or_default(),
        })
    }

    /// The URI scheme this destination was reached through.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The destination host, without brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The destination port, explicit or the scheme default.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Decides whether an established connection to one authority may serve
/// requests aimed at another. Over TLS this requires certificate
/// coverage; the policy hook keeps that decision outside this crate.
pub trait CoalescingPolicy: Send + Sync + 'static {
    /// May a connection to `existing` carry traffic for `target`?
    fn permits(&self, existing: &Address, target: &Address) -> bool;
}

/// The default policy: never coalesce across authorities.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCoalescing;

impl CoalescingPolicy for NoCoalescing {
    fn permits(&self, _existing: &Address, _target: &Address) -> bool {
        false
    }
}

/// Establishes transports and performs the HTTP/2 handshake over them.
pub(crate) struct Connector {
    resolver: Arc<dyn Resolve>,
    connect_timeout: Option<Duration>,
    h2_config: proto::ConnectionConfig,
}

impl Connector {
    pub(crate) fn new(
        resolver: Arc<dyn Resolve>,
        connect_timeout: Option<Duration>,
        h2_config: proto::ConnectionConfig,
    ) -> Connector {
        Connector {
            resolver,
            connect_timeout,
            h2_config,
        }
    }

    /// Open a socket to the address and run the HTTP/2 handshake on it.
    pub(crate) async fn connect(&self, address: &Address) -> Result<proto::Connection> {
        if address.scheme() == &Scheme::HTTPS {
            // The TLS handshake, ALPN, and certificate handling live
            // outside this crate. Not retryable, so fail as a builder
            // error rather than a connect error.
            return Err(Error::builder(
                "https destinations require an external TLS transport",
            ));
        }

        let addrs = self
            .resolver
            .resolve(address.host(), address.port())
            .await
            .map_err(Error::connect)?;
        if addrs.is_empty() {
            return Err(Error::connect(format!(
                "dns lookup for {} returned no addresses",
                address.host()
            )));
        }

        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            trace!("connecting to {}", addr);
            let attempt = TcpStream::connect(addr);
            let result = match self.connect_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        crate::error::TimedOut,
                    )),
                },
                None => attempt.await,
            };

            match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!("connected to {}", addr);
                    return proto::Connection::handshake(
                        Box::new(stream),
                        self.h2_config.clone(),
                    )
                    .await
                    .map_err(|err| Error::connect(err));
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(Error::connect(
            last_error.expect("at least one connect attempt"),
        ))
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
