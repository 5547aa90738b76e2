//! A scripted HTTP/2 server for exercising the client over real
//! sockets. Tests drive the connection frame by frame, so they can
//! assert on exactly what the client emits and misbehave in precisely
//! controlled ways.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

// Frame type octets.
pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;

pub const SETTING_INITIAL_WINDOW_SIZE: u16 = 4;
pub const SETTING_MAX_CONCURRENT_STREAMS: u16 = 3;

pub const NO_ERROR: u32 = 0x0;
pub const PROTOCOL_ERROR: u32 = 0x1;
pub const REFUSED_STREAM: u32 = 0x7;
pub const CANCEL: u32 = 0x8;

/// One raw frame off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// A decoded request header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub stream_id: u32,
    pub fields: Vec<(String, String)>,
    pub end_stream: bool,
}

impl RequestHead {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> &str {
        self.field(":method").unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.field(":path").unwrap_or_default()
    }
}

type Handler =
    Arc<dyn Fn(ServerIo) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static>;

/// A listening test server. Every accepted connection runs the handler;
/// a panic in the handler fails the test through the panic hook.
pub struct H2Server {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl H2Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start a server whose every connection is driven by `handler`.
pub async fn spawn<F, Fut>(handler: F) -> H2Server
where
    F: Fn(ServerIo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let handler: Handler = Arc::new(move |io| Box::pin(handler(io)));

    let conn_counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            conn_counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(ServerIo::new(socket)).await;
            });
        }
    });

    H2Server { addr, connections }
}

/// The server's end of one connection.
pub struct ServerIo {
    io: BufStream<TcpStream>,
}

impl ServerIo {
    fn new(socket: TcpStream) -> ServerIo {
        socket.set_nodelay(true).expect("nodelay");
        ServerIo {
            io: BufStream::new(socket),
        }
    }

    /// Read the client preface and its SETTINGS, answer with our own
    /// SETTINGS (the given id/value pairs) and an ACK of theirs.
    pub async fn handshake(&mut self, settings: &[(u16, u32)]) {
        let mut preface = [0u8; 24];
        self.io.read_exact(&mut preface).await.expect("preface");
        assert_eq!(&preface[..], PREFACE, "client preface");

        let frame = self.read_frame().await.expect("client settings");
        assert_eq!(frame.kind, SETTINGS);
        assert_eq!(frame.flags & FLAG_ACK, 0);

        self.send_settings(settings).await;
        self.write_frame(SETTINGS, FLAG_ACK, 0, &[]).await;
    }

    pub async fn send_settings(&mut self, settings: &[(u16, u32)]) {
        let mut payload = Vec::new();
        for (id, value) in settings {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        self.write_frame(SETTINGS, 0, 0, &payload).await;
    }

    /// Read one frame; `None` at EOF.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        let mut head = [0u8; 9];
        let mut read = 0;
        while read < head.len() {
            match self.io.read(&mut head[read..]).await.expect("frame header") {
                0 if read == 0 => return None,
                0 => panic!("truncated frame header"),
                n => read += n,
            }
        }

        let len = ((head[0] as usize) << 16) | ((head[1] as usize) << 8) | head[2] as usize;
        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload).await.expect("frame payload");

        Some(Frame {
            kind: head[3],
            flags: head[4],
            stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & !(1 << 31),
            payload,
        })
    }

    /// Read frames until a complete request header block arrives,
    /// transparently answering PINGs and ignoring bookkeeping frames.
    pub async fn read_request(&mut self) -> RequestHead {
        loop {
            let frame = self.read_frame().await.expect("request headers");
            match frame.kind {
                HEADERS => {
                    let mut block = frame.payload.clone();
                    let mut end_headers = frame.flags & FLAG_END_HEADERS != 0;
                    while !end_headers {
                        let cont = self.read_frame().await.expect("continuation");
                        assert_eq!(cont.kind, CONTINUATION);
                        assert_eq!(cont.stream_id, frame.stream_id);
                        block.extend_from_slice(&cont.payload);
                        end_headers = cont.flags & FLAG_END_HEADERS != 0;
                    }
                    return RequestHead {
                        stream_id: frame.stream_id,
                        fields: hpack_decode(&block),
                        end_stream: frame.is_end_stream(),
                    };
                }
                PING if frame.flags & FLAG_ACK == 0 => {
                    let payload = frame.payload.clone();
                    self.write_frame(PING, FLAG_ACK, 0, &payload).await;
                }
                SETTINGS | WINDOW_UPDATE | PING => {}
                other => panic!("unexpected frame while awaiting request: 0x{other:x}"),
            }
        }
    }

    /// Collect DATA payloads for the stream until END_STREAM.
    pub async fn read_body(&mut self, stream_id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let frame = self.read_frame().await.expect("body frame");
            match frame.kind {
                DATA if frame.stream_id == stream_id => {
                    body.extend_from_slice(&frame.payload);
                    if frame.is_end_stream() {
                        return body;
                    }
                }
                PING if frame.flags & FLAG_ACK == 0 => {
                    let payload = frame.payload.clone();
                    self.write_frame(PING, FLAG_ACK, 0, &payload).await;
                }
                SETTINGS | WINDOW_UPDATE | PING => {}
                other => panic!("unexpected frame while reading body: 0x{other:x}"),
            }
        }
    }

    /// One DATA frame for the stream, answering bookkeeping frames on
    /// the way.
    pub async fn read_data_frame(&mut self, stream_id: u32) -> Frame {
        loop {
            let frame = self.read_frame().await.expect("data frame");
            match frame.kind {
                DATA if frame.stream_id == stream_id => return frame,
                PING if frame.flags & FLAG_ACK == 0 => {
                    let payload = frame.payload.clone();
                    self.write_frame(PING, FLAG_ACK, 0, &payload).await;
                }
                SETTINGS | WINDOW_UPDATE | PING => {}
                other => panic!("unexpected frame while reading data: 0x{other:x}"),
            }
        }
    }

    /// Wait for a RST_STREAM for the stream and return its error code.
    pub async fn expect_rst(&mut self, stream_id: u32) -> u32 {
        loop {
            let frame = self.read_frame().await.expect("rst frame");
            match frame.kind {
                RST_STREAM if frame.stream_id == stream_id => {
                    return u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
                }
                DATA | SETTINGS | WINDOW_UPDATE | PING => {}
                other => panic!("unexpected frame while awaiting rst: 0x{other:x}"),
            }
        }
    }

    pub async fn send_response(&mut self, stream_id: u32, status: u16, body: &[u8]) {
        self.send_response_headers(stream_id, status, &[], body.is_empty())
            .await;
        if !body.is_empty() {
            self.send_data(stream_id, body, true).await;
        }
    }

    pub async fn send_response_headers(
        &mut self,
        stream_id: u32,
        status: u16,
        extra: &[(&str, &str)],
        end_stream: bool,
    ) {
        let mut fields = vec![(":status".to_owned(), status.to_string())];
        for (name, value) in extra {
            fields.push(((*name).to_owned(), (*value).to_owned()));
        }
        let block = hpack_encode(&fields);

        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        self.write_frame(HEADERS, flags, stream_id, &block).await;
    }

    pub async fn send_trailers(&mut self, stream_id: u32, fields: &[(&str, &str)]) {
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
            .collect();
        let block = hpack_encode(&fields);
        self.write_frame(
            HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            stream_id,
            &block,
        )
        .await;
    }

    pub async fn send_data(&mut self, stream_id: u32, body: &[u8], end_stream: bool) {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.write_frame(DATA, flags, stream_id, body).await;
    }

    pub async fn send_rst(&mut self, stream_id: u32, code: u32) {
        self.write_frame(RST_STREAM, 0, stream_id, &code.to_be_bytes())
            .await;
    }

    pub async fn send_goaway(&mut self, last_stream_id: u32, code: u32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&last_stream_id.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        self.write_frame(GOAWAY, 0, 0, &payload).await;
    }

    pub async fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.write_frame(WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
            .await;
    }

    pub async fn send_ping(&mut self, payload: [u8; 8]) {
        self.write_frame(PING, 0, 0, &payload).await;
    }

    pub async fn write_frame(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        let mut head = [0u8; 9];
        head[0] = (payload.len() >> 16) as u8;
        head[1] = (payload.len() >> 8) as u8;
        head[2] = payload.len() as u8;
        head[3] = kind;
        head[4] = flags;
        head[5..9].copy_from_slice(&stream_id.to_be_bytes());
        self.io.write_all(&head).await.expect("frame header");
        self.io.write_all(payload).await.expect("frame payload");
        self.io.flush().await.expect("flush");
    }
}

// ===== HPACK, the slice of it this client emits =====

const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

fn decode_int(buf: &[u8], prefix: u8) -> (usize, usize) {
    let mask = (1usize << prefix) - 1;
    let mut value = (buf[0] as usize) & mask;
    let mut consumed = 1;
    if value < mask {
        return (value, consumed);
    }
    let mut shift = 0;
    loop {
        let octet = buf[consumed];
        consumed += 1;
        value += ((octet & 0x7f) as usize) << shift;
        if octet & 0x80 == 0 {
            return (value, consumed);
        }
        shift += 7;
    }
}

fn encode_int(value: usize, prefix: u8, pattern: u8, out: &mut Vec<u8>) {
    let mask = (1usize << prefix) - 1;
    if value < mask {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | mask as u8);
    let mut rest = value - mask;
    while rest >= 0x80 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

fn decode_string(buf: &[u8]) -> (String, usize) {
    assert_eq!(buf[0] & 0x80, 0, "huffman-coded literal in test traffic");
    let (len, consumed) = decode_int(buf, 7);
    let value = String::from_utf8(buf[consumed..consumed + len].to_vec()).expect("utf8 header");
    (value, consumed + len)
}

/// Decode a header block as produced by the client under test: indexed
/// static entries and non-indexed literals, never Huffman.
pub fn hpack_decode(block: &[u8]) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut at = 0;

    while at < block.len() {
        let octet = block[at];
        if octet & 0x80 != 0 {
            let (index, consumed) = decode_int(&block[at..], 7);
            at += consumed;
            let (name, value) = STATIC_TABLE[index - 1];
            fields.push((name.to_owned(), value.to_owned()));
        } else if octet & 0xe0 == 0x20 {
            let (_, consumed) = decode_int(&block[at..], 5);
            at += consumed;
        } else if octet & 0xc0 == 0x40 {
            panic!("client is not expected to grow the dynamic table");
        } else {
            let (name_index, consumed) = decode_int(&block[at..], 4);
            at += consumed;
            let name = if name_index == 0 {
                let (name, consumed) = decode_string(&block[at..]);
                at += consumed;
                name
            } else {
                STATIC_TABLE[name_index - 1].0.to_owned()
            };
            let (value, consumed) = decode_string(&block[at..]);
            at += consumed;
            fields.push((name, value));
        }
    }

    fields
}

/// Encode a header block the client's decoder understands: literal
/// never-indexed fields with raw strings.
pub fn hpack_encode(fields: &[(String, String)]) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in fields {
        block.push(0x10);
        encode_int(name.len(), 7, 0, &mut block);
        block.extend_from_slice(name.as_bytes());
        encode_int(value.len(), 7, 0, &mut block);
        block.extend_from_slice(value.as_bytes());
    }
    block
}
