//! Transparent content decoding and request-body compression.

use std::fmt;

use bytes::Bytes;
use futures_core::stream::BoxStream;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, RANGE, USER_AGENT};
use http::HeaderValue;

use crate::body::Body;
use crate::error::BoxError;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;
use crate::Result;

/// The content encodings this client is willing to decode.
#[derive(Clone, Debug)]
pub struct Accepts {
    /// Accept `Content-Encoding: br`.
    #[cfg(feature = "brotli")]
    pub brotli: bool,
    /// Accept `Content-Encoding: zstd`.
    #[cfg(feature = "zstd")]
    pub zstd: bool,
    /// Accept `Content-Encoding: gzip`.
    #[cfg(feature = "gzip")]
    pub gzip: bool,
    /// Accept `Content-Encoding: deflate`.
    #[cfg(feature = "deflate")]
    pub deflate: bool,
}

impl Default for Accepts {
    fn default() -> Accepts {
        Accepts {
            #[cfg(feature = "brotli")]
            brotli: true,
            #[cfg(feature = "zstd")]
            zstd: true,
            #[cfg(feature = "gzip")]
            gzip: true,
            #[cfg(feature = "deflate")]
            deflate: true,
        }
    }
}

impl Accepts {
    /// An `Accepts` with every encoding disabled; responses arrive
    /// exactly as sent.
    pub fn none() -> Accepts {
        Accepts {
            #[cfg(feature = "brotli")]
            brotli: false,
            #[cfg(feature = "zstd")]
            zstd: false,
            #[cfg(feature = "gzip")]
            gzip: false,
            #[cfg(feature = "deflate")]
            deflate: false,
        }
    }

    /// The `Accept-Encoding` value announcing the enabled algorithms in
    /// preference order, weighted. `None` when nothing is enabled.
    pub(crate) fn as_accept_encoding(&self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        for encoding in self.enabled() {
            parts.push(encoding.as_str());
        }
        if parts.is_empty() {
            return None;
        }

        let mut value = String::new();
        let mut weight = 10u32;
        for part in parts {
            if !value.is_empty() {
                value.push_str(", ");
            }
            value.push_str(part);
            value.push_str(";q=");
            value.push_str(match weight {
                10 => "1.0",
                9 => "0.9",
                8 => "0.8",
                _ => "0.7",
            });
            weight = weight.saturating_sub(1);
        }
        Some(value)
    }

    fn enabled(&self) -> Vec<Encoding> {
        let mut list = Vec::new();
        #[cfg(feature = "brotli")]
        if self.brotli {
            list.push(Encoding::Brotli);
        }
        #[cfg(feature = "zstd")]
        if self.zstd {
            list.push(Encoding::Zstd);
        }
        #[cfg(feature = "gzip")]
        if self.gzip {
            list.push(Encoding::Gzip);
        }
        #[cfg(feature = "deflate")]
        if self.deflate {
            list.push(Encoding::Deflate);
        }
        list
    }

    /// The enabled encoding matching a `Content-Encoding` value,
    /// case-insensitively. `identity` and `*` never match.
    pub(crate) fn recognize(&self, content_encoding: &str) -> Option<Encoding> {
        self.enabled()
            .into_iter()
            .find(|encoding| content_encoding.eq_ignore_ascii_case(encoding.as_str()))
    }
}

/// A supported content coding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Encoding {
    #[cfg(feature = "brotli")]
    Brotli,
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "gzip")]
    Gzip,
    #[cfg(feature = "deflate")]
    Deflate,
}

impl Encoding {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            #[cfg(feature = "brotli")]
            Encoding::Brotli => "br",
            #[cfg(feature = "zstd")]
            Encoding::Zstd => "zstd",
            #[cfg(feature = "gzip")]
            Encoding::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            Encoding::Deflate => "deflate",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrap a raw body stream in the decoder for `encoding`. Decoding is
/// lazy: nothing is read until the caller polls.
pub(crate) fn decode_stream(
    stream: BoxStream<'static, std::io::Result<Bytes>>,
    encoding: Encoding,
) -> BoxStream<'static, std::io::Result<Bytes>> {
    use tokio_util::io::{ReaderStream, StreamReader};

    let reader = StreamReader::new(stream);

    match encoding {
        #[cfg(feature = "brotli")]
        Encoding::Brotli => {
            let decoder = async_compression::tokio::bufread::BrotliDecoder::new(reader);
            ReaderStream::new(decoder).boxed()
        }
        #[cfg(feature = "zstd")]
        Encoding::Zstd => {
            let mut decoder = async_compression::tokio::bufread::ZstdDecoder::new(reader);
            decoder.multiple_members(true);
            ReaderStream::new(decoder).boxed()
        }
        #[cfg(feature = "gzip")]
        Encoding::Gzip => {
            let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
            decoder.multiple_members(true);
            ReaderStream::new(decoder).boxed()
        }
        #[cfg(feature = "deflate")]
        Encoding::Deflate => {
            let decoder = async_compression::tokio::bufread::ZlibDecoder::new(reader);
            ReaderStream::new(decoder).boxed()
        }
    }
}

/// Wrap a request body in a streaming gzip encoder.
#[cfg(feature = "gzip")]
pub(crate) fn gzip_body(body: Body) -> Body {
    use tokio_util::io::{ReaderStream, StreamReader};

    let stream = body
        .into_stream()
        .map_err(std::io::Error::other);
    let encoder =
        async_compression::tokio::bufread::GzipEncoder::new(StreamReader::new(stream));
    Body::wrap_stream(ReaderStream::new(encoder).map_err(|err| Box::new(err) as BoxError))
}

/// The bridge between application intent and the wire: fills in
/// `Accept-Encoding` (and `User-Agent`/`Content-Length`) when absent,
/// compresses opted-in request bodies, and lazily decodes recognized
/// response encodings, stripping `Content-Encoding`/`Content-Length`.
pub(crate) struct CompressionInterceptor {
    accepts: Accepts,
}

impl CompressionInterceptor {
    pub(crate) fn new(accepts: Accepts) -> CompressionInterceptor {
        CompressionInterceptor { accepts }
    }
}

impl Interceptor for CompressionInterceptor {
    fn intercept(&self, mut chain: Chain) -> BoxFuture<'static, Result<Response>> {
        let accepts = self.accepts.clone();
        Box::pin(async move {
            let mut request = chain.take_request();

            if request.headers().get(USER_AGENT).is_none() {
                request.headers_mut().insert(
                    USER_AGENT,
                    HeaderValue::from_static(concat!(
                        env!("CARGO_PKG_NAME"),
                        "/",
                        env!("CARGO_PKG_VERSION")
                    )),
                );
            }

            // Only announce encodings when the caller expressed no
            // preference; then we also own decoding the response.
            let transparent = request.headers().get(ACCEPT_ENCODING).is_none()
                && request.headers().get(RANGE).is_none();
            if transparent {
                let value = accepts
                    .as_accept_encoding()
                    .unwrap_or_else(|| "identity".to_owned());
                request.headers_mut().insert(
                    ACCEPT_ENCODING,
                    HeaderValue::from_str(&value)
                        .expect("accept-encoding list is a valid header value"),
                );
            }

            #[cfg(feature = "gzip")]
            if request.gzip_body() && request.headers().get(CONTENT_ENCODING).is_none() {
                if let Some(body) = request.take_body() {
                    *request.body_mut() = Some(gzip_body(body));
                    request
                        .headers_mut()
                        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                    // Length is unknown after compression.
                    request.headers_mut().remove(CONTENT_LENGTH);
                }
            }

            // Advertise the length when it is knowable and unstated.
            if request.headers().get(CONTENT_LENGTH).is_none() {
                if let Some(length) = request.body().and_then(|body| body.content_length()) {
                    if length > 0 {
                        request
                            .headers_mut()
                            .insert(CONTENT_LENGTH, HeaderValue::from(length));
                    }
                }
            }

            let response = chain.proceed(request).await?;

            if !transparent {
                return Ok(response);
            }

            let encoding = response
                .headers()
                .get(CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| accepts.recognize(value));

            match encoding {
                Some(encoding) => {
                    debug!("decoding response body; encoding={}", encoding);
                    Ok(response.decoded(encoding))
                }
                None => Ok(response),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_encoding_is_weighted() {
        let accepts = Accepts::default();
        let value = accepts.as_accept_encoding().unwrap();
        // The first algorithm carries the top weight.
        assert!(value.contains(";q=1.0"));
        #[cfg(feature = "gzip")]
        assert!(value.contains("gzip"));
    }

    #[test]
    fn none_yields_no_header() {
        assert_eq!(Accepts::none().as_accept_encoding(), None);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn recognize_is_case_insensitive() {
        let accepts = Accepts::default();
        assert_eq!(accepts.recognize("GZIP"), Some(Encoding::Gzip));
        assert_eq!(accepts.recognize("identity"), None);
        assert_eq!(accepts.recognize("*"), None);
    }

    #[cfg(feature = "gzip")]
    #[tokio::test]
    async fn gzip_body_roundtrip() {
        let body = gzip_body(Body::from("hello gzip"));
        let mut compressed = Vec::new();
        let mut stream = body.into_stream();
        while let Some(chunk) = stream.next().await {
            compressed.extend_from_slice(&chunk.unwrap());
        }

        let mut decoder = libflate::gzip::Decoder::new(&compressed[..]).unwrap();
        let mut plain = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut plain).unwrap();
        assert_eq!(plain, b"hello gzip");
    }
}
