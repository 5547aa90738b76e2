use std::fmt;

use bytes::Bytes;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::BoxError;

/// A request body.
///
/// Reusable bodies survive a retry or a cloned call; streaming bodies
/// can be sent once.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(BoxStream<'static, Result<Bytes, BoxError>>),
}

// ===== impl Body =====

impl Body {
    /// Returns a reference to the internal data of the `Body`.
    ///
    /// `None` is returned, if the underlying data is a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming(..) => None,
        }
    }

    /// Wrap a futures `Stream` of byte chunks in a `Body`.
    ///
    /// # Example
    ///
    /// ```
    /// # use creq::Body;
    /// let chunks: Vec<Result<_, ::std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    /// let stream = futures_util::stream::iter(chunks);
    /// let body = Body::wrap_stream(stream);
    /// ```
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_util::stream::TryStream + Send + 'static,
        S::Error: Into<BoxError>,
        Bytes: From<S::Ok>,
    {
        use futures_util::TryStreamExt;

        let stream = stream.map_ok(Bytes::from).map_err(Into::into);
        Body {
            inner: Inner::Streaming(stream.boxed()),
        }
    }

    pub(crate) fn empty() -> Body {
        Body::reusable(Bytes::new())
    }

    pub(crate) fn reusable(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
        }
    }

    /// A clone of this body, when the underlying data is reusable.
    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(Body::reusable(chunk.clone())),
            Inner::Streaming { .. } => None,
        }
    }

    /// The exact byte length, when known up front.
    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(chunk.len() as u64),
            Inner::Streaming { .. } => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.content_length() == Some(0)
    }

    /// The body as a stream of chunks, however it was constructed.
    pub(crate) fn into_stream(self) -> BoxStream<'static, Result<Bytes, BoxError>> {
        match self.inner {
            Inner::Reusable(chunk) => {
                if chunk.is_empty() {
                    futures_util::stream::empty().boxed()
                } else {
                    futures_util::stream::once(async move { Ok(chunk) }).boxed()
                }
            }
            Inner::Streaming(stream) => stream,
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::reusable(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::reusable(vec.into())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::reusable(s.into())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::reusable(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Body {
        Body::reusable(Bytes::from_static(s))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner {
            Inner::Reusable(ref chunk) => f
                .debug_struct("Body")
                .field("len", &chunk.len())
                .finish(),
            Inner::Streaming(..) => f.debug_struct("Body").field("stream", &true).finish(),
        }
    }
}
