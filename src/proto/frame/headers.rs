use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use super::{Error, StreamId};

/// The pseudo-header fields defined by RFC 7540 Section 8.1.2.
///
/// Pseudo-header fields are not HTTP header fields: they carry the
/// request target and the response status, MUST appear before regular
/// fields, and MUST NOT appear in trailers.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Pseudo {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<StatusCode>,
}

impl Pseudo {
    pub fn request(method: Method, scheme: &str, authority: &str, path: &str) -> Pseudo {
        Pseudo {
            method: Some(method),
            scheme: Some(scheme.to_owned()),
            authority: Some(authority.to_owned()),
            path: Some(path.to_owned()),
            status: None,
        }
    }

    pub fn response(status: StatusCode) -> Pseudo {
        Pseudo {
            status: Some(status),
            ..Pseudo::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.scheme.is_none()
            && self.authority.is_none()
            && self.path.is_none()
            && self.status.is_none()
    }
}

/// A decoded HEADERS frame: a stream id, the pseudo-header fields, and
/// the regular fields, after CONTINUATION assembly and HPACK decoding.
///
/// The same type carries request headers, response headers, and
/// trailers; which one it is follows from the stream's state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Headers {
    stream_id: StreamId,
    pseudo: Pseudo,
    fields: HeaderMap,
    end_stream: bool,
}

impl Headers {
    pub fn new(stream_id: StreamId, pseudo: Pseudo, fields: HeaderMap) -> Headers {
        Headers {
            stream_id,
            pseudo,
            fields,
            end_stream: false,
        }
    }

    /// Assemble from a decoded field list, enforcing the pseudo-header
    /// rules: pseudo fields precede regular fields, duplicates and
    /// unknown pseudo fields are malformed, header names are lowercase.
    pub fn from_fields(
        stream_id: StreamId,
        raw: Vec<(Bytes, Bytes)>,
        end_stream: bool,
    ) -> Result<Headers, Error> {
        let mut pseudo = Pseudo::default();
        let mut fields = HeaderMap::with_capacity(raw.len());
        let mut saw_regular = false;

        for (name, value) in raw {
            if name.is_empty() {
                return Err(Error::MalformedHeaderBlock("empty header name"));
            }

            if name[0] == b':' {
                if saw_regular {
                    return Err(Error::MalformedHeaderBlock(
                        "pseudo-header after regular header",
                    ));
                }
                let value = std::str::from_utf8(&value)
                    .map_err(|_| Error::MalformedHeaderBlock("non-utf8 pseudo-header value"))?;
                match &name[..] {
                    b":method" => set_pseudo(
                        &mut pseudo.method,
                        value.parse().map_err(|_| {
                            Error::MalformedHeaderBlock("invalid :method value")
                        })?,
                    )?,
                    b":scheme" => set_pseudo(&mut pseudo.scheme, value.to_owned())?,
                    b":authority" => set_pseudo(&mut pseudo.authority, value.to_owned())?,
                    b":path" => set_pseudo(&mut pseudo.path, value.to_owned())?,
                    b":status" => set_pseudo(
                        &mut pseudo.status,
                        value.parse().map_err(|_| {
                            Error::MalformedHeaderBlock("invalid :status value")
                        })?,
                    )?,
                    _ => return Err(Error::MalformedHeaderBlock("unknown pseudo-header")),
                }
                continue;
            }

            saw_regular = true;

            // Field names transmitted over HTTP/2 MUST be lowercase.
            if name.iter().any(u8::is_ascii_uppercase) {
                return Err(Error::MalformedHeaderBlock("uppercase header name"));
            }

            let name = HeaderName::from_bytes(&name)
                .map_err(|_| Error::MalformedHeaderBlock("invalid header name"))?;
            let value = HeaderValue::from_bytes(&value)
                .map_err(|_| Error::MalformedHeaderBlock("invalid header value"))?;
            fields.append(name, value);
        }

        Ok(Headers {
            stream_id,
            pseudo,
            fields,
            end_stream,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    pub fn into_parts(self) -> (Pseudo, HeaderMap) {
        (self.pseudo, self.fields)
    }

    pub fn is_end_stream(&self) -> bool {
        self.end_stream
    }

    pub fn set_end_stream(&mut self, end: bool) {
        self.end_stream = end;
    }

    /// True when these are response headers in the 1xx range; more
    /// HEADERS will follow on the stream.
    pub fn is_informational(&self) -> bool {
        self.pseudo
            .status
            .map(|status| status.is_informational())
            .unwrap_or(false)
    }

    /// True for a header block carrying no pseudo-header fields, which on
    /// an open stream means trailers.
    pub fn is_trailers(&self) -> bool {
        self.pseudo.is_empty()
    }

    /// The ordered field list handed to the HPACK encoder: pseudo-header
    /// fields first, regular fields in insertion order.
    pub fn encode_fields(&self) -> Vec<(Bytes, Bytes)> {
        let mut out = Vec::with_capacity(self.fields.len() + 4);

        if let Some(ref method) = self.pseudo.method {
            out.push((
                Bytes::from_static(b":method"),
                Bytes::copy_from_slice(method.as_str().as_bytes()),
            ));
        }
        if let Some(ref scheme) = self.pseudo.scheme {
            out.push((
                Bytes::from_static(b":scheme"),
                Bytes::copy_from_slice(scheme.as_bytes()),
            ));
        }
        if let Some(ref authority) = self.pseudo.authority {
            out.push((
                Bytes::from_static(b":authority"),
                Bytes::copy_from_slice(authority.as_bytes()),
            ));
        }
        if let Some(ref path) = self.pseudo.path {
            out.push((
                Bytes::from_static(b":path"),
                Bytes::copy_from_slice(path.as_bytes()),
            ));
        }
        if let Some(status) = self.pseudo.status {
            out.push((
                Bytes::from_static(b":status"),
                Bytes::copy_from_slice(status.as_str().as_bytes()),
            ));
        }

        for (name, value) in self.fields.iter() {
            out.push((
                Bytes::copy_from_slice(name.as_str().as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            ));
        }

        out
    }
}

/// A decoded PUSH_PROMISE frame: the promised stream id plus the request
/// header block the server intends to answer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PushPromise {
    stream_id: StreamId,
    promised_id: StreamId,
    pseudo: Pseudo,
    fields: HeaderMap,
}

impl PushPromise {
    pub fn from_fields(
        stream_id: StreamId,
        promised_id: StreamId,
        raw: Vec<(Bytes, Bytes)>,
    ) -> Result<PushPromise, Error> {
        let headers = Headers::from_fields(stream_id, raw, false)?;
        if !headers.pseudo.is_request() {
            return Err(Error::MalformedHeaderBlock(
                "push promise without request pseudo-headers",
            ));
        }
        let (pseudo, fields) = headers.into_parts();
        Ok(PushPromise {
            stream_id,
            promised_id,
            pseudo,
            fields,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn promised_id(&self) -> StreamId {
        self.promised_id
    }

    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }
}

fn set_pseudo<T>(slot: &mut Option<T>, value: T) -> Result<(), Error> {
    if slot.is_some() {
        return Err(Error::MalformedHeaderBlock("duplicate pseudo-header"));
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: &[(&str, &str)]) -> Vec<(Bytes, Bytes)> {
        fields
            .iter()
            .map(|(n, v)| {
                (
                    Bytes::copy_from_slice(n.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn response_fields() {
        let headers = Headers::from_fields(
            StreamId::new(1),
            raw(&[(":status", "200"), ("server", "creq-test")]),
            false,
        )
        .unwrap();

        assert_eq!(headers.pseudo().status, Some(StatusCode::OK));
        assert_eq!(headers.fields()["server"], "creq-test");
        assert!(!headers.is_trailers());
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let err = Headers::from_fields(
            StreamId::new(1),
            raw(&[("server", "x"), (":status", "200")]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedHeaderBlock(_)));
    }

    #[test]
    fn duplicate_pseudo_is_malformed() {
        let err = Headers::from_fields(
            StreamId::new(1),
            raw(&[(":status", "200"), (":status", "500")]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedHeaderBlock(_)));
    }

    #[test]
    fn uppercase_name_is_malformed() {
        let err = Headers::from_fields(StreamId::new(1), raw(&[("Server", "x")]), false)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedHeaderBlock(_)));
    }

    #[test]
    fn trailers_detected() {
        let headers =
            Headers::from_fields(StreamId::new(1), raw(&[("grpc-status", "0")]), true).unwrap();
        assert!(headers.is_trailers());
    }

    #[test]
    fn informational() {
        let headers =
            Headers::from_fields(StreamId::new(1), raw(&[(":status", "100")]), false).unwrap();
        assert!(headers.is_informational());
    }

    #[test]
    fn encode_fields_order() {
        let pseudo = Pseudo::request(Method::GET, "https", "example.com", "/");
        let mut fields = HeaderMap::new();
        fields.insert("accept", HeaderValue::from_static("*/*"));
        let headers = Headers::new(StreamId::new(1), pseudo, fields);

        let encoded = headers.encode_fields();
        assert_eq!(encoded[0].0.as_ref(), b":method");
        assert_eq!(encoded[1].0.as_ref(), b":scheme");
        assert_eq!(encoded[2].0.as_ref(), b":authority");
        assert_eq!(encoded[3].0.as_ref(), b":path");
        assert_eq!(encoded[4].0.as_ref(), b"accept");
    }
}
