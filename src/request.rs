use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

use crate::body::Body;
use crate::client::Client;
use crate::ext::TagMap;
use crate::response::Response;
use crate::{Error, Result};

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Body>,
    tags: Arc<TagMap>,
    timeout: Option<Duration>,
    compress_body: bool,
    web_socket: bool,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
            tags: Arc::new(TagMap::new()),
            timeout: None,
            compress_body: false,
            web_socket: false,
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the URI.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get a mutable reference to the URI.
    #[inline]
    pub fn uri_mut(&mut self) -> &mut Uri {
        &mut self.uri
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the typed tags attached to this request.
    #[inline]
    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    pub(crate) fn tags_arc(&self) -> &Arc<TagMap> {
        &self.tags
    }

    /// Get the per-request timeout override.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Get a mutable reference to the per-request timeout override.
    #[inline]
    pub fn timeout_mut(&mut self) -> &mut Option<Duration> {
        &mut self.timeout
    }

    /// Whether the request body will be gzip-compressed on the wire.
    #[inline]
    pub fn gzip_body(&self) -> bool {
        self.compress_body
    }

    pub(crate) fn set_gzip_body(&mut self, enabled: bool) {
        self.compress_body = enabled;
    }

    /// Whether this request initiates a WebSocket upgrade. Such calls
    /// are exempt from the dispatcher's per-host limit.
    #[inline]
    pub fn is_web_socket(&self) -> bool {
        self.web_socket
    }

    /// Mark this request as a WebSocket upgrade, exempting its call from
    /// the dispatcher's per-host limit. The upgrade itself is performed
    /// by an external layer.
    pub fn set_web_socket(&mut self, enabled: bool) {
        self.web_socket = enabled;
    }

    pub(crate) fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Attempt to clone the request.
    ///
    /// `None` is returned if the request's body cannot be reused, i.e.
    /// if it is a one-shot stream.
    pub fn try_clone(&self) -> Option<Request> {
        let body = match self.body.as_ref() {
            Some(body) => Some(body.try_clone()?),
            None => None,
        };
        Some(Request {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body,
            tags: self.tags.clone(),
            timeout: self.timeout,
            compress_body: self.compress_body,
            web_socket: self.web_socket,
        })
    }

    /// Enforce method/body compatibility: GET and HEAD must not carry a
    /// body, POST/PUT/PATCH must carry one.
    pub(crate) fn validate(&self) -> Result<()> {
        let has_body = self.body.as_ref().map(|b| !b.is_empty()).unwrap_or(false);
        match self.method {
            Method::GET | Method::HEAD => {
                if has_body {
                    return Err(Error::builder(format!(
                        "method {} must not have a request body",
                        self.method
                    ))
                    .with_uri(self.uri.clone()));
                }
            }
            Method::POST | Method::PUT | Method::PATCH => {
                if self.body.is_none() {
                    return Err(Error::builder(format!(
                        "method {} requires a request body",
                        self.method
                    ))
                    .with_uri(self.uri.clone()));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, uri: Result<Uri>) -> RequestBuilder {
        RequestBuilder {
            client,
            request: uri.map(|uri| Request::new(method, uri)),
        }
    }

    /// Add a header to this request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        if let Ok(ref mut req) = self.request {
            let name = HeaderName::try_from(key).map_err(Into::into);
            let value = HeaderValue::try_from(value).map_err(Into::into);
            match (name, value) {
                (Ok(name), Ok(value)) => {
                    req.headers_mut().append(name, value);
                }
                (Err(err), _) | (_, Err(err)) => {
                    self.request = Err(Error::builder(err));
                }
            }
        }
        self
    }

    /// Add a set of headers to the existing ones on this request.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            for (key, value) in headers.iter() {
                req.headers_mut().append(key, value.clone());
            }
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Enables a total timeout for this request, overriding the
    /// client-wide one.
    ///
    /// The timeout is applied from when the request starts until the
    /// response headers are returned, spanning connect, write, and
    /// server wait.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.timeout_mut() = Some(timeout);
        }
        self
    }

    /// Gzip-compress the request body on the wire. Adds
    /// `Content-Encoding: gzip` and drops any `Content-Length`.
    #[cfg(feature = "gzip")]
    #[cfg_attr(docsrs, doc(cfg(feature = "gzip")))]
    pub fn gzip_body(mut self) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.set_gzip_body(true);
        }
        self
    }

    /// Attach a typed tag to the request.
    pub fn tag<T>(self, value: T) -> RequestBuilder
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Ok(ref req) = self.request {
            req.tags().insert_tag(value);
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed
    /// with `Client::execute()`.
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Constructs the `Request` and sends it to the target URI,
    /// returning a future `Response`.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending the
    /// request, or if the call was canceled or timed out.
    pub async fn send(self) -> Result<Response> {
        let request = self.request?;
        self.client.execute(request).await
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", req.method())
                .field("uri", req.uri())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}
