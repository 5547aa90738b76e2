//! A single multiplexed HTTP/2 connection.
//!
//! One reader task pulls frames off the socket and dispatches them into
//! the stream table; every write goes through one async mutex, which
//! both serializes frame emission and orders stream-id allocation.
//! State shared between the reader, writers, and consumers lives under
//! the connection lock (`Shared`); operations that need both locks take
//! the writer lock first.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};

use super::codec::{FramedRead, FramedWrite};
use super::flow::{RecvWindow, SendWindow, WindowUpdateStrategy};
use super::frame::{
    self, Data, Frame, GoAway, Headers, Ping, Pseudo, PushPromise, Reason, Reset, Settings,
    StreamId, WindowUpdate,
};
use super::streams::{State, StreamSlot};
use super::Error;

/// Transport the connection runs over.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    /// The SETTINGS we announce after the preface.
    pub(crate) settings: Settings,
    /// Keepalive ping cadence; `None` disables the ticker.
    pub(crate) ping_interval: Option<Duration>,
    /// When consumed receive credit is returned to the peer.
    pub(crate) strategy: Arc<dyn WindowUpdateStrategy>,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        let mut settings = Settings::default();
        // We never accept server push; promised streams are refused on
        // intake.
        settings.set_enable_push(false);
        ConnectionConfig {
            settings,
            ping_interval: None,
            strategy: Arc::new(super::flow::ThresholdWindowUpdates),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("settings", &self.settings)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

/// Handle to a live HTTP/2 connection. Cheap to clone; the connection
/// dies when its socket fails, when it is closed, or when a fatal
/// protocol error is detected.
#[derive(Clone, Debug)]
pub(crate) struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    /// Socket writes and stream-id allocation, serialized.
    writer: AsyncMutex<Writer>,
    /// The connection lock: stream table, settings, windows, pings.
    shared: Mutex<Shared>,
    /// Signalled when the first peer SETTINGS lands, and on shutdown.
    settings_ready: Notify,
    strategy: Arc<dyn WindowUpdateStrategy>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

struct Writer {
    framed: FramedWrite<WriteHalf<Box<dyn Io>>>,
    next_stream_id: u32,
}

struct Shared {
    streams: HashMap<StreamId, StreamSlot>,
    local_settings: Settings,
    /// The peer's settings as merged from every SETTINGS received.
    peer_settings: Settings,
    settings_received: bool,
    send_window: SendWindow,
    recv_window: RecvWindow,
    goaway_received: Option<(StreamId, Reason)>,
    goaway_sent: bool,
    /// REFUSED_STREAM resets seen over this connection's lifetime. Two
    /// of them mark the connection unhealthy.
    refused_streams: u32,
    /// No new streams: GOAWAY in either direction, repeated refusals, or
    /// keepalive failure.
    degraded: bool,
    fatal: Option<Error>,
    /// Outstanding pings by payload, keepalive probes included.
    pings: HashMap<[u8; 8], oneshot::Sender<()>>,
    ping_seq: u64,
    /// Highest client stream id handed out.
    next_local_id: u32,
    /// Highest server-promised id we have processed.
    highest_remote_id: StreamId,
}

/// Writes the reader decided on while holding the connection lock,
/// performed after it is released.
enum Action {
    SettingsAck {
        header_table_size: Option<u32>,
        max_frame_size: Option<u32>,
    },
    Pong(Ping),
    Reset(Reset),
    WindowUpdate(WindowUpdate),
}

impl Connection {
    /// Client-side handshake: send the preface and our SETTINGS, then
    /// start the reader (and keepalive) tasks. Callers gate their first
    /// stream on [`Connection::await_settings`].
    pub(crate) async fn handshake(
        io: Box<dyn Io>,
        config: ConnectionConfig,
    ) -> Result<Connection, Error> {
        let (read_half, write_half) = tokio::io::split(io);

        let header_table_size = config
            .settings
            .header_table_size()
            .unwrap_or(frame::settings::DEFAULT_HEADER_TABLE_SIZE);
        let mut framed_read = FramedRead::new(read_half, header_table_size as usize);
        if let Some(size) = config.settings.max_frame_size() {
            framed_read.set_max_frame_size(size);
        }
        if let Some(size) = config.settings.max_header_list_size() {
            framed_read.set_max_header_block_size(size as usize);
        }

        let mut framed_write = FramedWrite::new(write_half);
        framed_write.write_preface().await?;
        framed_write.write_settings(&config.settings).await?;

        let inner = Arc::new(Inner {
            writer: AsyncMutex::new(Writer {
                framed: framed_write,
                next_stream_id: 1,
            }),
            shared: Mutex::new(Shared {
                streams: HashMap::new(),
                local_settings: config.settings,
                peer_settings: Settings::default(),
                settings_received: false,
                // The connection-scoped windows always start at the
                // protocol default; only WINDOW_UPDATE moves them.
                send_window: SendWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
                recv_window: RecvWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
                goaway_received: None,
                goaway_sent: false,
                refused_streams: 0,
                degraded: false,
                fatal: None,
                pings: HashMap::new(),
                ping_seq: 0,
                next_local_id: 0,
                highest_remote_id: StreamId::ZERO,
            }),
            settings_ready: Notify::new(),
            strategy: config.strategy,
        });

        tokio::spawn(run_reader(inner.clone(), framed_read));
        if let Some(interval) = config.ping_interval {
            tokio::spawn(run_keepalive(inner.clone(), interval));
        }

        Ok(Connection { inner })
    }

    /// Block until the peer's first SETTINGS has been applied and ACKed.
    pub(crate) async fn await_settings(&self) -> Result<(), Error> {
        loop {
            let notified = self.inner.settings_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let shared = self.inner.lock();
                if let Some(err) = &shared.fatal {
                    return Err(err.clone());
                }
                if shared.settings_received {
                    return Ok(());
                }
                if shared.degraded {
                    return Err(Error::Shutdown);
                }
            }

            notified.as_mut().await;
        }
    }

    /// Open a new locally initiated stream by writing its HEADERS.
    ///
    /// Ids are allocated in writer-lock order, so they are strictly
    /// increasing odd numbers in the order the requests hit the socket.
    pub(crate) async fn new_stream(
        &self,
        pseudo: Pseudo,
        fields: HeaderMap,
        end_stream: bool,
    ) -> Result<StreamRef, Error> {
        self.await_settings().await?;

        {
            let shared = self.inner.lock();
            shared.check_usable()?;

            if let Some(max) = shared.peer_settings.max_concurrent_streams() {
                let active = shared
                    .streams
                    .iter()
                    .filter(|(id, slot)| id.is_client_initiated() && !slot.state.is_closed())
                    .count();
                if active as u32 >= max {
                    // Fail fast with a retryable refusal; the caller may
                    // go to (or build) another connection.
                    return Err(Error::StreamReset {
                        reason: Reason::REFUSED_STREAM,
                        remote: false,
                    });
                }
            }
        }

        let mut writer = self.inner.writer.lock().await;

        if writer.next_stream_id > StreamId::MAX.value() {
            return Err(Error::Shutdown);
        }
        let id = StreamId::new(writer.next_stream_id);
        writer.next_stream_id += 2;

        {
            let mut shared = self.inner.lock();
            shared.check_usable()?;
            shared.next_local_id = id.value();

            let send_window = shared
                .peer_settings
                .initial_window_size()
                .unwrap_or(frame::DEFAULT_INITIAL_WINDOW_SIZE);
            let recv_window = shared
                .local_settings
                .initial_window_size()
                .unwrap_or(frame::DEFAULT_INITIAL_WINDOW_SIZE);
            shared.streams.insert(
                id,
                StreamSlot::new(State::opened(end_stream), send_window, recv_window),
            );
        }

        let mut headers = Headers::new(id, pseudo, fields);
        headers.set_end_stream(end_stream);

        if let Err(err) = writer.framed.write_headers(&headers).await {
            drop(writer);
            let err = Error::io(err);
            self.inner.fatal(err.clone()).await;
            return Err(err);
        }

        Ok(StreamRef {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Graceful local shutdown: GOAWAY with the last remote id we
    /// processed, fail streams the peer has not acknowledged, close the
    /// socket.
    pub(crate) async fn close(&self, reason: Reason) {
        let last_remote = {
            let mut shared = self.inner.lock();
            if shared.goaway_sent {
                return;
            }
            shared.goaway_sent = true;
            shared.degraded = true;

            for slot in shared.streams.values_mut() {
                if !slot.state.is_closed() && !slot.headers_received {
                    // Never acknowledged by the peer; safe to retry
                    // elsewhere.
                    slot.fail(Error::Shutdown);
                }
            }
            shared.highest_remote_id
        };
        self.inner.settings_ready.notify_waiters();

        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer
                .framed
                .write_go_away(&GoAway::new(last_remote, reason))
                .await;
            let _ = writer.framed.shutdown().await;
        }

        self.inner
            .fatal(Error::StreamReset {
                reason: Reason::CANCEL,
                remote: false,
            })
            .await;
    }

    /// Whether this connection can still host new exchanges.
    pub(crate) fn is_healthy(&self) -> bool {
        let shared = self.inner.lock();
        shared.fatal.is_none() && !shared.degraded
    }

    /// The fatal error that tore the connection down, if any.
    pub(crate) fn fatal_error(&self) -> Option<Error> {
        self.inner.fatal_error()
    }

    /// The peer's advertised SETTINGS_MAX_CONCURRENT_STREAMS, once its
    /// settings have arrived.
    pub(crate) fn max_concurrent_streams(&self) -> Option<u32> {
        self.inner.lock().peer_settings.max_concurrent_streams()
    }
}

// ===== impl Inner =====

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("connection state poisoned")
    }

    fn fatal_error(&self) -> Option<Error> {
        self.lock().fatal.clone()
    }

    /// Write a PING with a fresh payload and wait for its ACK.
    async fn ping(&self, timeout: Duration) -> Result<(), Error> {
        let (payload, rx) = {
            let mut shared = self.lock();
            if let Some(err) = &shared.fatal {
                return Err(err.clone());
            }
            shared.ping_seq += 1;
            let payload = shared.ping_seq.to_be_bytes();
            let (tx, rx) = oneshot::channel();
            shared.pings.insert(payload, tx);
            (payload, rx)
        };

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.framed.write_ping(&Ping::new(payload)).await {
                drop(writer);
                self.lock().pings.remove(&payload);
                let err = Error::io(err);
                self.fatal(err.clone()).await;
                return Err(err);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // The connection died before the ACK arrived.
            Ok(Err(_)) => Err(self.fatal_error().unwrap_or(Error::Shutdown)),
            Err(_) => {
                self.lock().pings.remove(&payload);
                Err(Error::PingTimeout)
            }
        }
    }

    /// Tear the connection down: record the error, fail every stream,
    /// wake every waiter, best-effort GOAWAY for errors we detected,
    /// close the socket.
    async fn fatal(&self, err: Error) {
        let goaway_reason = {
            let mut shared = self.lock();
            if shared.fatal.is_some() {
                return;
            }

            match &err {
                Error::Protocol { .. } | Error::FlowControl => {
                    error!("connection failed; err={}", err)
                }
                _ => debug!("connection failed; err={}", err),
            }
            shared.fatal = Some(err.clone());
            shared.degraded = true;

            let stream_error = match &err {
                // A missed keepalive surfaces on streams as a reset.
                Error::PingTimeout => Error::StreamReset {
                    reason: Reason::PROTOCOL_ERROR,
                    remote: false,
                },
                other => other.clone(),
            };
            for slot in shared.streams.values_mut() {
                if slot.error.is_none() && !slot.state.is_closed() {
                    slot.fail(stream_error.clone());
                } else {
                    slot.wake();
                }
            }

            shared.pings.clear();

            let reason = match &err {
                Error::Protocol { reason, .. } => Some(*reason),
                Error::FlowControl => Some(Reason::FLOW_CONTROL_ERROR),
                Error::PingTimeout => Some(Reason::PROTOCOL_ERROR),
                _ => None,
            };
            reason.filter(|_| !shared.goaway_sent)
        };
        self.settings_ready.notify_waiters();

        let mut writer = self.writer.lock().await;
        if let Some(reason) = goaway_reason {
            let _ = writer
                .framed
                .write_go_away(&GoAway::new(StreamId::ZERO, reason))
                .await;
        }
        let _ = writer.framed.shutdown().await;
    }

    async fn perform(&self, actions: Vec<Action>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        for action in actions {
            match action {
                Action::SettingsAck {
                    header_table_size,
                    max_frame_size,
                } => {
                    if let Some(size) = header_table_size {
                        writer.framed.hpack_mut().set_max_table_size(size);
                    }
                    if let Some(size) = max_frame_size {
                        writer.framed.set_max_frame_size(size);
                    }
                    writer.framed.write_settings(&Settings::ack()).await?;
                }
                Action::Pong(ping) => writer.framed.write_ping(&ping).await?,
                Action::Reset(reset) => writer.framed.write_reset(&reset).await?,
                Action::WindowUpdate(update) => {
                    writer.framed.write_window_update(&update).await?
                }
            }
        }
        Ok(())
    }

    async fn perform_or_fail(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        if let Err(err) = self.perform(actions).await {
            self.fatal(Error::io(err)).await;
        }
    }

    /// Dispatch one received frame. An `Err` is fatal to the connection.
    fn apply(&self, frame: Frame) -> Result<Vec<Action>, Error> {
        match frame {
            Frame::Data(frame) => self.recv_data(frame),
            Frame::Headers(frame) => self.recv_headers(frame),
            Frame::Priority(_) => Ok(Vec::new()),
            Frame::Reset(frame) => self.recv_reset(frame),
            Frame::Settings(frame) => self.recv_settings(frame),
            Frame::PushPromise(frame) => self.recv_push_promise(frame),
            Frame::Ping(frame) => self.recv_ping(frame),
            Frame::GoAway(frame) => self.recv_go_away(frame),
            Frame::WindowUpdate(frame) => self.recv_window_update(frame),
        }
    }

    fn recv_data(&self, frame: Data) -> Result<Vec<Action>, Error> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let strategy = &*self.strategy;
        let mut actions = Vec::new();

        // The whole payload counts against the connection window,
        // whatever happens to the stream below.
        if shared.recv_window.buffer(frame.flow_len()).is_err() {
            return Err(Error::FlowControl);
        }

        let id = frame.stream_id();

        let slot = match shared.streams.get_mut(&id) {
            Some(slot) => slot,
            None => {
                if id.is_client_initiated() && id.value() > shared.next_local_id
                    || id.is_server_initiated() && id > shared.highest_remote_id
                {
                    return Err(Error::protocol(
                        Reason::PROTOCOL_ERROR,
                        "DATA for an idle stream",
                    ));
                }
                // Late frames for a finished stream: discard, but return
                // the credit so the connection window is not leaked.
                push_update(
                    &mut actions,
                    StreamId::ZERO,
                    shared.recv_window.release(frame.flow_len(), strategy),
                );
                return Ok(actions);
            }
        };

        if slot.state.is_recv_closed() || slot.error.is_some() {
            if !slot.reset_sent && slot.error.is_none() {
                slot.reset_sent = true;
                slot.fail(Error::StreamReset {
                    reason: Reason::STREAM_CLOSED,
                    remote: false,
                });
                actions.push(Action::Reset(Reset::new(id, Reason::STREAM_CLOSED)));
            }
            push_update(
                &mut actions,
                StreamId::ZERO,
                shared.recv_window.release(frame.flow_len(), strategy),
            );
            return Ok(actions);
        }

        if slot.recv_window.buffer(frame.flow_len()).is_err() {
            // Stream-scoped overrun: tear down the stream, keep the
            // connection.
            slot.reset_sent = true;
            slot.fail(Error::StreamReset {
                reason: Reason::FLOW_CONTROL_ERROR,
                remote: false,
            });
            actions.push(Action::Reset(Reset::new(id, Reason::FLOW_CONTROL_ERROR)));
            push_update(
                &mut actions,
                StreamId::ZERO,
                shared.recv_window.release(frame.flow_len(), strategy),
            );
            return Ok(actions);
        }

        let end_stream = frame.is_end_stream();
        let flow_len = frame.flow_len();
        let payload = frame.into_payload();
        let padding = flow_len - payload.len() as u32;

        if !payload.is_empty() {
            slot.buffered += payload.len() as u32;
            slot.recv_buf.push_back(payload);
        }

        // Padding octets are consumed on arrival.
        let stream_credit = slot.recv_window.release(padding, strategy);
        if end_stream {
            slot.state.close_recv();
        }
        let stream_open = !slot.state.is_recv_closed();
        slot.readable.notify_waiters();

        push_update(&mut actions, id, stream_credit.filter(|_| stream_open));
        push_update(
            &mut actions,
            StreamId::ZERO,
            shared.recv_window.release(padding, strategy),
        );

        Ok(actions)
    }

    fn recv_headers(&self, frame: Headers) -> Result<Vec<Action>, Error> {
        let mut shared = self.lock();
        let id = frame.stream_id();

        let slot = match shared.streams.get_mut(&id) {
            Some(slot) => slot,
            None => {
                if shared.is_old_stream(id) {
                    return Ok(Vec::new());
                }
                return Err(Error::protocol(
                    Reason::PROTOCOL_ERROR,
                    "HEADERS for an idle stream",
                ));
            }
        };

        if slot.error.is_some() {
            return Ok(Vec::new());
        }
        if slot.state.is_recv_closed() {
            return Err(Error::protocol(
                Reason::STREAM_CLOSED,
                "HEADERS on a closed stream half",
            ));
        }

        let end_stream = frame.is_end_stream();

        if frame.is_trailers() {
            // A header block with no pseudo-header fields after the
            // response head: trailers. They must end the stream.
            if !slot.headers_received {
                return Err(Error::protocol(
                    Reason::PROTOCOL_ERROR,
                    "header block without :status",
                ));
            }
            if !end_stream {
                return Err(Error::protocol(
                    Reason::PROTOCOL_ERROR,
                    "trailers without END_STREAM",
                ));
            }
            slot.trailers = Some(frame.fields().clone());
        } else {
            if slot.headers_received {
                return Err(Error::protocol(
                    Reason::PROTOCOL_ERROR,
                    "second response header block",
                ));
            }
            if !frame.is_informational() {
                slot.headers_received = true;
            }
            slot.pending_headers.push_back(frame);
        }

        if end_stream {
            slot.state.close_recv();
        }
        slot.readable.notify_waiters();

        Ok(Vec::new())
    }

    fn recv_reset(&self, frame: Reset) -> Result<Vec<Action>, Error> {
        let mut shared = self.lock();
        let id = frame.stream_id();

        if frame.reason() == Reason::REFUSED_STREAM {
            shared.refused_streams += 1;
            if shared.refused_streams >= 2 {
                // Twice refused: stop trusting this connection with new
                // work.
                shared.degraded = true;
            }
        }

        match shared.streams.get_mut(&id) {
            Some(slot) => {
                // Buffered bytes are kept: the consumer drains them
                // first and only then observes the reset.
                if !slot.state.is_closed() {
                    slot.fail(Error::StreamReset {
                        reason: frame.reason(),
                        remote: true,
                    });
                }
            }
            None => {
                if !shared.is_old_stream(id) {
                    return Err(Error::protocol(
                        Reason::PROTOCOL_ERROR,
                        "RST_STREAM for an idle stream",
                    ));
                }
            }
        }

        Ok(Vec::new())
    }

    fn recv_settings(&self, frame: Settings) -> Result<Vec<Action>, Error> {
        if frame.is_ack() {
            // Our settings took effect; nothing to adjust on receipt.
            return Ok(Vec::new());
        }

        let mut shared = self.lock();

        if let Some(new_size) = frame.initial_window_size() {
            let old_size = shared
                .peer_settings
                .initial_window_size()
                .unwrap_or(frame::DEFAULT_INITIAL_WINDOW_SIZE);
            let delta = new_size as i64 - old_size as i64;
            if delta != 0 {
                for slot in shared.streams.values_mut() {
                    slot.send_window.apply_delta(delta);
                }
            }
        }

        shared.peer_settings.merge(&frame);
        shared.settings_received = true;
        shared.notify_all_writable();
        drop(shared);

        self.settings_ready.notify_waiters();

        // The ACK goes out immediately after applying; encoder and
        // writer segmentation adjustments happen under the writer lock
        // right before the ACK hits the wire.
        Ok(vec![Action::SettingsAck {
            header_table_size: frame.header_table_size(),
            max_frame_size: frame.max_frame_size(),
        }])
    }

    fn recv_ping(&self, frame: Ping) -> Result<Vec<Action>, Error> {
        if frame.is_ack() {
            if let Some(tx) = self.lock().pings.remove(frame.payload()) {
                let _ = tx.send(());
            }
            return Ok(Vec::new());
        }
        Ok(vec![Action::Pong(Ping::pong(frame.into_payload()))])
    }

    fn recv_go_away(&self, frame: GoAway) -> Result<Vec<Action>, Error> {
        let mut shared = self.lock();
        let last_good = frame.last_stream_id();

        debug!(
            "GOAWAY received; last_good={} reason={:?}",
            last_good,
            frame.reason()
        );

        shared.goaway_received = Some((last_good, frame.reason()));
        shared.degraded = true;

        // Streams above the threshold were never processed; they are
        // safely retryable on another connection. Streams at or below it
        // run to completion.
        for (id, slot) in shared.streams.iter_mut() {
            if id.is_client_initiated() && *id > last_good && !slot.state.is_closed() {
                slot.fail(Error::GoAway {
                    reason: frame.reason(),
                });
            }
        }
        drop(shared);

        self.settings_ready.notify_waiters();
        Ok(Vec::new())
    }

    fn recv_window_update(&self, frame: WindowUpdate) -> Result<Vec<Action>, Error> {
        let mut shared = self.lock();
        let id = frame.stream_id();

        if id.is_zero() {
            if frame.increment() == 0 {
                return Err(Error::protocol(
                    Reason::PROTOCOL_ERROR,
                    "connection WINDOW_UPDATE with zero increment",
                ));
            }
            if shared.send_window.grow(frame.increment()).is_err() {
                return Err(Error::FlowControl);
            }
            shared.notify_all_writable();
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        match shared.streams.get_mut(&id) {
            Some(slot) => {
                if frame.increment() == 0 {
                    // Stream-scoped zero increment is a stream error.
                    if !slot.reset_sent {
                        slot.reset_sent = true;
                        actions.push(Action::Reset(Reset::new(id, Reason::PROTOCOL_ERROR)));
                    }
                    slot.fail(Error::StreamReset {
                        reason: Reason::PROTOCOL_ERROR,
                        remote: false,
                    });
                } else if slot.send_window.grow(frame.increment()).is_err() {
                    if !slot.reset_sent {
                        slot.reset_sent = true;
                        actions.push(Action::Reset(Reset::new(
                            id,
                            Reason::FLOW_CONTROL_ERROR,
                        )));
                    }
                    slot.fail(Error::StreamReset {
                        reason: Reason::FLOW_CONTROL_ERROR,
                        remote: false,
                    });
                } else {
                    slot.writable.notify_waiters();
                }
            }
            None => {
                if !shared.is_old_stream(id) {
                    return Err(Error::protocol(
                        Reason::PROTOCOL_ERROR,
                        "WINDOW_UPDATE for an idle stream",
                    ));
                }
            }
        }

        Ok(actions)
    }

    fn recv_push_promise(&self, frame: PushPromise) -> Result<Vec<Action>, Error> {
        let mut shared = self.lock();

        if shared.local_settings.is_push_enabled() != Some(true) {
            return Err(Error::protocol(
                Reason::PROTOCOL_ERROR,
                "PUSH_PROMISE with push disabled",
            ));
        }

        let promised = frame.promised_id();
        if !promised.is_server_initiated() || promised <= shared.highest_remote_id {
            return Err(Error::protocol(
                Reason::PROTOCOL_ERROR,
                "invalid promised stream id",
            ));
        }
        if shared.streams.get(&frame.stream_id()).is_none()
            && !shared.is_old_stream(frame.stream_id())
        {
            return Err(Error::protocol(
                Reason::PROTOCOL_ERROR,
                "PUSH_PROMISE on an idle stream",
            ));
        }

        shared.highest_remote_id = promised;

        // Intake only: the promise is recorded, immediately refused, and
        // the reservation dropped. Accepting pushes would need a cache
        // to satisfy them from.
        trace!("refusing pushed stream; promised={}", promised);
        Ok(vec![Action::Reset(Reset::new(promised, Reason::CANCEL))])
    }
}

// ===== impl Shared =====

impl Shared {
    fn check_usable(&self) -> Result<(), Error> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }
        if self.degraded || self.goaway_received.is_some() || self.goaway_sent {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Whether frames for this id may be remnants of a stream that
    /// already came and went, as opposed to a stream that never existed.
    fn is_old_stream(&self, id: StreamId) -> bool {
        if id.is_client_initiated() {
            id.value() <= self.next_local_id
        } else {
            id <= self.highest_remote_id
        }
    }

    fn notify_all_writable(&self) {
        for slot in self.streams.values() {
            slot.writable.notify_waiters();
        }
    }
}

fn push_update(actions: &mut Vec<Action>, id: StreamId, credit: Option<u32>) {
    if let Some(credit) = credit {
        actions.push(Action::WindowUpdate(WindowUpdate::new(id, credit)));
    }
}

// ===== reader / keepalive tasks =====

async fn run_reader(inner: Arc<Inner>, mut framed: FramedRead<ReadHalf<Box<dyn Io>>>) {
    let error = loop {
        match framed.read_frame().await {
            Ok(Some(frame)) => match inner.apply(frame) {
                Ok(actions) => {
                    if !actions.is_empty() {
                        if let Err(err) = inner.perform(actions).await {
                            break Error::io(err);
                        }
                    }
                }
                Err(err) => break err,
            },
            Ok(None) => {
                // Clean EOF. Expected after GOAWAY; abrupt otherwise.
                let shutdown = inner.lock().goaway_received.is_some();
                break if shutdown {
                    Error::Shutdown
                } else {
                    Error::io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                };
            }
            Err(err) => break err.into(),
        }
    };

    inner.fatal(error).await;
}

async fn run_keepalive(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the cadence starts one
    // interval out.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if inner.lock().fatal.is_some() {
            return;
        }

        match inner.ping(interval * 2).await {
            Ok(()) => {}
            Err(Error::PingTimeout) => {
                // The keepalive went unanswered: the peer is gone or
                // wedged. Streams fail with a synthetic reset.
                inner.fatal(Error::PingTimeout).await;
                return;
            }
            // The connection already failed some other way.
            Err(_) => return,
        }
    }
}

// ===== impl StreamRef =====

/// Consumer handle to one stream on a connection.
#[derive(Clone, Debug)]
pub(crate) struct StreamRef {
    inner: Arc<Inner>,
    id: StreamId,
}

impl StreamRef {
    /// Wait for the response header block, skipping informational (1xx)
    /// ones.
    pub(crate) async fn response_headers(&self) -> Result<Headers, Error> {
        loop {
            let readable = {
                let mut shared = self.inner.lock();
                let slot = match shared.streams.get_mut(&self.id) {
                    Some(slot) => slot,
                    None => return Err(Error::Shutdown),
                };

                loop {
                    match slot.pending_headers.pop_front() {
                        Some(headers) if headers.is_informational() => {
                            trace!(
                                "discarding informational response; stream={} status={:?}",
                                self.id,
                                headers.pseudo().status
                            );
                        }
                        Some(headers) => return Ok(headers),
                        None => break,
                    }
                }

                if let Some(err) = &slot.error {
                    return Err(err.clone());
                }
                if slot.state.is_recv_closed() {
                    // The peer half-closed without a response.
                    return Err(Error::StreamReset {
                        reason: Reason::PROTOCOL_ERROR,
                        remote: false,
                    });
                }
                slot.readable.clone()
            };

            let notified = readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Recheck: the reader may have delivered between unlock and
            // registration.
            if self.read_ready() {
                continue;
            }
            notified.as_mut().await;
        }
    }

    /// Take the next chunk of response body. `None` means the body is
    /// complete. Buffered bytes are delivered before any stream error.
    pub(crate) async fn read_chunk(&self) -> Result<Option<Bytes>, Error> {
        loop {
            enum Step {
                Chunk(Bytes, Vec<Action>),
                Done,
                Failed(Error),
                Wait(Arc<Notify>),
            }

            let step = {
                let mut guard = self.inner.lock();
                let shared = &mut *guard;
                let strategy = &*self.inner.strategy;
                match shared.streams.get_mut(&self.id) {
                    None => Step::Done,
                    Some(slot) => {
                        if let Some(chunk) = slot.pop_chunk() {
                            let n = chunk.len() as u32;
                            let stream_open =
                                !slot.state.is_recv_closed() && slot.error.is_none();
                            let mut actions = Vec::new();
                            push_update(
                                &mut actions,
                                self.id,
                                slot.recv_window
                                    .release(n, strategy)
                                    .filter(|_| stream_open),
                            );
                            push_update(
                                &mut actions,
                                StreamId::ZERO,
                                shared.recv_window.release(n, strategy),
                            );
                            Step::Chunk(chunk, actions)
                        } else if let Some(err) = &slot.error {
                            Step::Failed(err.clone())
                        } else if slot.state.is_recv_closed() {
                            Step::Done
                        } else {
                            Step::Wait(slot.readable.clone())
                        }
                    }
                }
            };

            match step {
                Step::Chunk(chunk, actions) => {
                    self.inner.perform_or_fail(actions).await;
                    return Ok(Some(chunk));
                }
                Step::Done => return Ok(None),
                Step::Failed(err) => return Err(err),
                Step::Wait(readable) => {
                    let notified = readable.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.read_ready() {
                        continue;
                    }
                    notified.as_mut().await;
                }
            }
        }
    }

    fn read_ready(&self) -> bool {
        let shared = self.inner.lock();
        match shared.streams.get(&self.id) {
            Some(slot) => {
                !slot.recv_buf.is_empty()
                    || !slot.pending_headers.is_empty()
                    || slot.error.is_some()
                    || slot.state.is_recv_closed()
            }
            None => true,
        }
    }

    /// Wait until the peer finishes the stream, then hand over trailers
    /// if it sent any.
    pub(crate) async fn trailers(&self) -> Result<Option<HeaderMap>, Error> {
        loop {
            let readable = {
                let mut shared = self.inner.lock();
                let slot = match shared.streams.get_mut(&self.id) {
                    Some(slot) => slot,
                    None => return Ok(None),
                };

                if let Some(err) = &slot.error {
                    return Err(err.clone());
                }
                if slot.state.is_recv_closed() {
                    return Ok(slot.trailers.take());
                }
                slot.readable.clone()
            };

            let notified = readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.read_ready() {
                continue;
            }
            notified.as_mut().await;
        }
    }

    /// Send body bytes, suspending while both flow-control windows are
    /// empty. END_STREAM rides on the final chunk.
    pub(crate) async fn write_data(&self, mut data: Bytes, end_stream: bool) -> Result<(), Error> {
        if data.is_empty() {
            if !end_stream {
                return Ok(());
            }
            // An empty DATA frame with END_STREAM consumes no window.
            self.check_sendable()?;
            let mut writer = self.inner.writer.lock().await;
            writer
                .framed
                .write_data(&Data::new(self.id, Bytes::new(), true))
                .await
                .map_err(Error::io)?;
            drop(writer);
            self.close_send_half();
            return Ok(());
        }

        while !data.is_empty() {
            let allowance = self.claim_capacity(data.len() as u32).await?;

            let chunk = data.split_to(allowance as usize);
            let last = data.is_empty() && end_stream;

            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer
                .framed
                .write_data(&Data::new(self.id, chunk, last))
                .await
            {
                drop(writer);
                let err = Error::io(err);
                self.inner.fatal(err.clone()).await;
                return Err(err);
            }
            drop(writer);

            if last {
                self.close_send_half();
            }
        }

        Ok(())
    }

    /// Reserve up to `wanted` bytes against the stream and connection
    /// send windows, waiting for WINDOW_UPDATEs while both are empty.
    async fn claim_capacity(&self, wanted: u32) -> Result<u32, Error> {
        loop {
            let writable = {
                let mut guard = self.inner.lock();
                let shared = &mut *guard;

                if let Some(err) = &shared.fatal {
                    return Err(err.clone());
                }

                let max_frame = shared
                    .peer_settings
                    .max_frame_size()
                    .unwrap_or(frame::DEFAULT_MAX_FRAME_SIZE);
                let conn_available = shared.send_window.available();

                let slot = match shared.streams.get_mut(&self.id) {
                    Some(slot) => slot,
                    None => return Err(Error::Shutdown),
                };
                if let Some(err) = &slot.error {
                    return Err(err.clone());
                }
                if slot.state.is_send_closed() {
                    return Err(Error::StreamReset {
                        reason: Reason::STREAM_CLOSED,
                        remote: false,
                    });
                }

                let allowance = wanted
                    .min(slot.send_window.available())
                    .min(conn_available)
                    .min(max_frame);

                if allowance > 0 {
                    slot.send_window.consume(allowance);
                    shared.send_window.consume(allowance);
                    return Ok(allowance);
                }

                trace!(
                    "write blocked on flow control; stream={} wanted={}",
                    self.id,
                    wanted
                );
                slot.writable.clone()
            };

            let notified = writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.write_ready() {
                continue;
            }
            notified.as_mut().await;
        }
    }

    fn write_ready(&self) -> bool {
        let shared = self.inner.lock();
        if shared.fatal.is_some() {
            return true;
        }
        match shared.streams.get(&self.id) {
            Some(slot) => {
                slot.error.is_some()
                    || slot.state.is_send_closed()
                    || (slot.send_window.available() > 0 && shared.send_window.available() > 0)
            }
            None => true,
        }
    }

    fn check_sendable(&self) -> Result<(), Error> {
        let shared = self.inner.lock();
        if let Some(err) = &shared.fatal {
            return Err(err.clone());
        }
        match shared.streams.get(&self.id) {
            Some(slot) => {
                if let Some(err) = &slot.error {
                    return Err(err.clone());
                }
                if slot.state.is_send_closed() {
                    return Err(Error::StreamReset {
                        reason: Reason::STREAM_CLOSED,
                        remote: false,
                    });
                }
                Ok(())
            }
            None => Err(Error::Shutdown),
        }
    }

    fn close_send_half(&self) {
        let mut shared = self.inner.lock();
        if let Some(slot) = shared.streams.get_mut(&self.id) {
            slot.state.close_send();
        }
    }

    /// Tear the stream down with the given code. Idempotent; buffered
    /// receive bytes are returned to the connection window as credit.
    pub(crate) async fn reset(&self, reason: Reason) {
        let actions = {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            let strategy = &*self.inner.strategy;
            let slot = match shared.streams.get_mut(&self.id) {
                Some(slot) => slot,
                None => return,
            };

            let already_closed = slot.state.is_closed();
            if already_closed && slot.error.is_none() {
                // The stream already finished cleanly; there is nothing
                // left to tear down.
                return;
            }

            let mut actions = Vec::new();
            if !already_closed {
                if !slot.reset_sent {
                    slot.reset_sent = true;
                    actions.push(Action::Reset(Reset::new(self.id, reason)));
                }
                slot.fail(Error::StreamReset {
                    reason,
                    remote: false,
                });
            }

            let buffered = std::mem::take(&mut slot.buffered);
            slot.recv_buf.clear();
            push_update(
                &mut actions,
                StreamId::ZERO,
                shared.recv_window.release(buffered, strategy),
            );
            actions
        };

        self.inner.perform_or_fail(actions).await;
    }

    /// The consumer is done with the stream: drop the record, resetting
    /// the stream first if it is still live.
    pub(crate) async fn release(&self) {
        let actions = {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            let strategy = &*self.inner.strategy;
            let slot = match shared.streams.get_mut(&self.id) {
                Some(slot) => slot,
                None => return,
            };

            let mut actions = Vec::new();
            if !slot.state.is_closed() && !slot.reset_sent {
                slot.reset_sent = true;
                slot.fail(Error::StreamReset {
                    reason: Reason::CANCEL,
                    remote: false,
                });
                actions.push(Action::Reset(Reset::new(self.id, Reason::CANCEL)));
            }

            let buffered = std::mem::take(&mut slot.buffered);
            shared.streams.remove(&self.id);
            push_update(
                &mut actions,
                StreamId::ZERO,
                shared.recv_window.release(buffered, strategy),
            );
            actions
        };

        self.inner.perform_or_fail(actions).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::super::codec::{FramedRead, FramedWrite, PREFACE};
    use super::*;

    struct Peer {
        read: FramedRead<tokio::io::ReadHalf<DuplexStream>>,
        write: FramedWrite<tokio::io::WriteHalf<DuplexStream>>,
    }

    impl Peer {
        /// Read frames until one matches, answering nothing.
        async fn expect<F>(&mut self, mut matches: F) -> Frame
        where
            F: FnMut(&Frame) -> bool,
        {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(5), self.read.read_frame())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("peer read failed")
                    .expect("unexpected end of stream");
                if matches(&frame) {
                    return frame;
                }
            }
        }
    }

    /// Handshake a connection against an in-memory peer. When
    /// `server_settings` is `None` the peer stays silent, leaving the
    /// connection gated on its first SETTINGS.
    async fn connect(server_settings: Option<Settings>) -> (Connection, Peer) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);

        let conn = Connection::handshake(Box::new(client_io), ConnectionConfig::default())
            .await
            .expect("handshake");

        let (mut read_half, write_half) = tokio::io::split(server_io);
        let mut preface = [0u8; 24];
        read_half.read_exact(&mut preface).await.expect("preface");
        assert_eq!(&preface[..], PREFACE);

        let mut peer = Peer {
            read: FramedRead::new(read_half, 4_096),
            write: FramedWrite::new(write_half),
        };

        let first = peer
            .expect(|frame| matches!(frame, Frame::Settings(_)))
            .await;
        match first {
            Frame::Settings(settings) => assert!(!settings.is_ack()),
            _ => unreachable!(),
        }

        if let Some(settings) = server_settings {
            peer.write.write_settings(&settings).await.unwrap();
            peer.write.write_settings(&Settings::ack()).await.unwrap();
        }

        (conn, peer)
    }

    fn request_pseudo() -> Pseudo {
        Pseudo::request(Method::GET, "http", "example.com", "/")
    }

    #[tokio::test]
    async fn stream_ids_are_odd_and_increasing() {
        let (conn, mut peer) = connect(Some(Settings::default())).await;

        let first = conn
            .new_stream(request_pseudo(), HeaderMap::new(), true)
            .await
            .unwrap();
        let second = conn
            .new_stream(request_pseudo(), HeaderMap::new(), true)
            .await
            .unwrap();

        let frame = peer
            .expect(|frame| matches!(frame, Frame::Headers(_)))
            .await;
        match frame {
            Frame::Headers(headers) => {
                assert_eq!(headers.stream_id(), StreamId::new(1));
                assert_eq!(headers.pseudo().method, Some(Method::GET));
                assert!(headers.is_end_stream());
            }
            _ => unreachable!(),
        }
        let frame = peer
            .expect(|frame| matches!(frame, Frame::Headers(_)))
            .await;
        match frame {
            Frame::Headers(headers) => assert_eq!(headers.stream_id(), StreamId::new(3)),
            _ => unreachable!(),
        }

        first.release().await;
        second.release().await;
    }

    #[tokio::test]
    async fn new_streams_wait_for_the_first_settings() {
        let (conn, mut peer) = connect(None).await;

        // Gated: no SETTINGS has arrived yet.
        let gated =
            tokio::time::timeout(Duration::from_millis(100), conn.await_settings()).await;
        assert!(gated.is_err());

        peer.write.write_settings(&Settings::default()).await.unwrap();
        peer.write.write_settings(&Settings::ack()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), conn.await_settings())
            .await
            .expect("settings never applied")
            .unwrap();

        let stream = conn
            .new_stream(request_pseudo(), HeaderMap::new(), true)
            .await
            .unwrap();
        stream.release().await;
    }

    #[tokio::test]
    async fn goaway_fails_unacknowledged_streams_retryably() {
        let (conn, mut peer) = connect(Some(Settings::default())).await;

        let stream = conn
            .new_stream(request_pseudo(), HeaderMap::new(), true)
            .await
            .unwrap();
        peer.expect(|frame| matches!(frame, Frame::Headers(_))).await;

        peer.write
            .write_go_away(&GoAway::new(StreamId::ZERO, Reason::NO_ERROR))
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), stream.response_headers())
            .await
            .expect("stream never failed")
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, Error::GoAway { .. }));

        // No new streams after GOAWAY.
        assert!(!conn.is_healthy());
        let refused = conn
            .new_stream(request_pseudo(), HeaderMap::new(), true)
            .await;
        assert!(matches!(refused, Err(Error::Shutdown)));

        stream.release().await;
    }

    #[tokio::test]
    async fn connection_window_overrun_is_fatal() {
        let (conn, mut peer) = connect(Some(Settings::default())).await;

        let stream = conn
            .new_stream(request_pseudo(), HeaderMap::new(), true)
            .await
            .unwrap();
        peer.expect(|frame| matches!(frame, Frame::Headers(_))).await;

        let mut headers = Headers::new(
            StreamId::new(1),
            Pseudo::response(http::StatusCode::OK),
            HeaderMap::new(),
        );
        headers.set_end_stream(false);
        peer.write.write_headers(&headers).await.unwrap();

        // More than the whole connection window, never consumed by the
        // application.
        let payload = Bytes::from(vec![0u8; 70_000]);
        peer.write
            .write_data(&Data::new(StreamId::new(1), payload, false))
            .await
            .unwrap();

        for _ in 0..100 {
            if matches!(conn.fatal_error(), Some(Error::FlowControl)) {
                stream.release().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("flow-control overrun never tore the connection down");
    }

    #[tokio::test]
    async fn pings_are_answered_with_matching_payload() {
        let (_conn, mut peer) = connect(Some(Settings::default())).await;

        peer.write
            .write_ping(&Ping::new([7, 6, 5, 4, 3, 2, 1, 0]))
            .await
            .unwrap();

        let frame = peer.expect(|frame| matches!(frame, Frame::Ping(_))).await;
        match frame {
            Frame::Ping(pong) => {
                assert!(pong.is_ack());
                assert_eq!(pong.payload(), &[7, 6, 5, 4, 3, 2, 1, 0]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn initial_window_size_delta_applies_to_open_streams() {
        let mut settings = Settings::default();
        settings.set_initial_window_size(Some(4));
        let (conn, mut peer) = connect(Some(settings)).await;

        let stream = conn
            .new_stream(request_pseudo(), HeaderMap::new(), false)
            .await
            .unwrap();
        peer.expect(|frame| matches!(frame, Frame::Headers(_))).await;

        // Only four bytes fit the stream window.
        let write = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write_data(Bytes::from_static(b"123456"), true).await })
        };
        let frame = peer.expect(|frame| matches!(frame, Frame::Data(_))).await;
        match frame {
            Frame::Data(data) => assert_eq!(data.payload().as_ref(), b"1234"),
            _ => unreachable!(),
        }

        // Raising INITIAL_WINDOW_SIZE releases the remainder without any
        // WINDOW_UPDATE.
        let mut update = Settings::default();
        update.set_initial_window_size(Some(16));
        peer.write.write_settings(&update).await.unwrap();

        let frame = peer.expect(|frame| matches!(frame, Frame::Data(_))).await;
        match frame {
            Frame::Data(data) => {
                assert_eq!(data.payload().as_ref(), b"56");
                assert!(data.is_end_stream());
            }
            _ => unreachable!(),
        }

        write.await.unwrap().unwrap();
        stream.release().await;
    }
}
