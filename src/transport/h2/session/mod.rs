//! Session: one multiplexed connection and the tasks driving it.
//!
//! [`Session`] is a cheap cloneable handle. All shared state lives in
//! `SessionInner`; streams keep a `Weak` back-reference to it so they can
//! release credit, reset themselves, and leave the active table.

mod ping;
mod reader;
mod writer;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::header::{self, HeaderName};
use http::{HeaderMap, Method, Request, Response};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::settings::Http2Settings;
use crate::transport::h2::body::{Body, RecvStream, SendStream};
use crate::transport::h2::flow::{self, CreditReservation, FlowControlWindow, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::transport::h2::frame::{ErrorCode, FrameCodec, Http2FrameCodec, SettingsId};
use crate::transport::h2::hpack::{HeaderCodec, HeaderField, HpackCodec};
use crate::transport::h2::message::{self, ResponseHead};
use crate::transport::h2::push::{PushPromiseHeaders, PushPromiseRegistry};
use crate::transport::h2::queue::{Command, OutgoingDispatchQueue};
use crate::transport::h2::stream::{Stream, StreamState};
use crate::transport::{Transport, ALPN_H2};

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Active = 1,
    ShuttingDown = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Active,
            2 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A request opened by the peer, handed out by [`Session::accept`].
#[derive(Debug)]
pub struct IncomingRequest {
    pub stream_id: u32,
    pub request: Request<RecvStream>,
}

/// A reserved push stream awaiting its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushPromiseHandle {
    stream_id: u32,
    primary_stream_id: u32,
}

impl PushPromiseHandle {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Stream the PUSH_PROMISE was sent on.
    pub fn primary_stream_id(&self) -> u32 {
        self.primary_stream_id
    }
}

/// Produces trailers once the response body has been sent.
pub type TrailerProvider = Box<dyn FnOnce() -> HeaderMap + Send>;

/// Frame and header codecs for one session. The reader and writer each own
/// one of every kind.
pub struct Codecs {
    pub read_frames: Box<dyn FrameCodec>,
    pub write_frames: Box<dyn FrameCodec>,
    pub decoder: Box<dyn HeaderCodec>,
    pub encoder: Box<dyn HeaderCodec>,
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            read_frames: Box::new(Http2FrameCodec),
            write_frames: Box::new(Http2FrameCodec),
            decoder: Box::new(HpackCodec::new()),
            encoder: Box::new(HpackCodec::new()),
        }
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codecs").finish_non_exhaustive()
    }
}

struct Endpoint {
    role: Role,
    authority: String,
    scheme: String,
}

/// Local and remote SETTINGS.
#[derive(Debug, Default)]
struct SettingsState {
    /// Acknowledged by the peer.
    local: Http2Settings,
    /// Sent, waiting for ACK, oldest first.
    pending: VecDeque<Http2Settings>,
    remote: Http2Settings,
}

/// How activation should seed stream 1.
enum Bootstrap {
    Fresh,
    UpgradedClient,
    UpgradedServer(Http2Settings),
}

pub(crate) struct SessionInner {
    me: Weak<SessionInner>,
    config: SessionConfig,
    state: AtomicU8,
    endpoint: OnceLock<Endpoint>,
    io: Mutex<Option<(Box<dyn Transport>, Codecs)>>,

    streams: DashMap<u32, Arc<Stream>>,
    local_active: AtomicU32,
    peer_active: AtomicU32,
    /// Next locally initiated stream id; held while HEADERS are enqueued.
    open_lock: Mutex<u32>,
    highest_peer_stream: AtomicU32,
    recently_reset: Mutex<VecDeque<u32>>,

    queue: OutgoingDispatchQueue,
    conn_send_window: Arc<FlowControlWindow>,
    conn_recv_window: FlowControlWindow,
    settings: RwLock<SettingsState>,

    goaway_received: Mutex<Option<(u32, ErrorCode)>>,
    drain_scheduled: AtomicBool,
    pushes: PushPromiseRegistry,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingRequest>>,

    pings: Mutex<HashMap<[u8; 8], Instant>>,
    last_rtt: Mutex<Option<Duration>>,

    master: CancellationToken,
    settings_received: CancellationToken,
    goaway_sent: CancellationToken,
    closed: CancellationToken,
}

/// Outstanding keepalive pings remembered for RTT measurement.
const MAX_TRACKED_PINGS: usize = 16;

impl SessionInner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition_state(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            _ => Err(Error::SessionClosed),
        }
    }

    fn role(&self) -> Role {
        self.endpoint.get().map(|e| e.role).unwrap_or(Role::Client)
    }

    fn scheme(&self) -> &str {
        self.endpoint.get().map(|e| e.scheme.as_str()).unwrap_or("https")
    }

    fn authority(&self) -> &str {
        self.endpoint.get().map(|e| e.authority.as_str()).unwrap_or("")
    }

    /// Stream ids this side initiates: odd for clients, even for servers.
    fn is_local_id(&self, id: u32) -> bool {
        match self.role() {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }

    fn enqueue(&self, cmd: Command) -> Result<()> {
        self.queue.enqueue(cmd).map_err(|_| Error::SessionClosed)
    }

    fn stream(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.get(&id).map(|s| Arc::clone(s.value()))
    }

    fn stream_snapshot(&self) -> Vec<Arc<Stream>> {
        self.streams.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn remote_settings(&self) -> Http2Settings {
        self.settings.read().remote.clone()
    }

    fn local_settings(&self) -> Http2Settings {
        self.settings.read().local.clone()
    }

    /// Create a stream with windows from the current settings and add it to
    /// the active table.
    fn create_stream(&self, id: u32) -> Arc<Stream> {
        let settings = self.settings.read();
        let stream = Arc::new(Stream::new(
            id,
            settings.remote.initial_window_size,
            settings.local.initial_window_size,
            self.master.child_token(),
            self.me.clone(),
        ));
        self.streams.insert(id, Arc::clone(&stream));
        self.active_counter(id).fetch_add(1, Ordering::AcqRel);
        stream
    }

    fn active_counter(&self, id: u32) -> &AtomicU32 {
        if self.is_local_id(id) {
            &self.local_active
        } else {
            &self.peer_active
        }
    }

    /// Called when a stream reaches Closed.
    pub(crate) fn remove_stream(&self, id: u32) {
        if self.streams.remove(&id).is_none() {
            return;
        }
        self.active_counter(id).fetch_sub(1, Ordering::AcqRel);
        tracing::trace!("stream {} removed, {} active", id, self.streams.len());

        if self.goaway_received.lock().is_some() && self.streams.is_empty() {
            self.schedule_drain_shutdown();
        }
    }

    fn remember_reset(&self, id: u32) {
        let capacity = self.config.recently_reset_capacity;
        if capacity == 0 {
            return;
        }
        let mut recent = self.recently_reset.lock();
        if recent.contains(&id) {
            return;
        }
        recent.push_back(id);
        while recent.len() > capacity {
            recent.pop_front();
        }
    }

    fn was_recently_reset(&self, id: u32) -> bool {
        self.recently_reset.lock().contains(&id)
    }

    /// Reset a live stream from this side.
    pub(crate) fn reset_stream(&self, stream: &Stream, code: ErrorCode) {
        if stream.state() == StreamState::Closed || !stream.mark_reset() {
            return;
        }
        let id = stream.id();
        tracing::debug!("stream {}: reset ({:?})", id, code);
        if self
            .enqueue(Command::RstStream {
                stream_id: id,
                code,
            })
            .is_err()
        {
            tracing::trace!("stream {}: session closed before RST_STREAM", id);
        }
        self.remember_reset(id);
        self.pushes.remove_stream(id);

        let err = match code {
            ErrorCode::Cancel => Error::Cancelled,
            code => Error::stream(id, code, "stream reset locally"),
        };
        stream.fail(err);
        stream.force_close();
    }

    /// Reset by id; also covers streams that never made it into the table.
    fn reset_stream_id(&self, id: u32, code: ErrorCode) {
        match self.stream(id) {
            Some(stream) => self.reset_stream(&stream, code),
            None => {
                if self.was_recently_reset(id) {
                    return;
                }
                tracing::debug!("stream {}: reset unknown stream ({:?})", id, code);
                let _ = self.enqueue(Command::RstStream {
                    stream_id: id,
                    code,
                });
                self.remember_reset(id);
            }
        }
    }

    /// Peer sent RST_STREAM.
    fn peer_reset(&self, stream: &Stream, code: ErrorCode) {
        stream.mark_reset();
        self.pushes.remove_stream(stream.id());
        stream.fail(Error::StreamReset {
            stream_id: stream.id(),
            code,
        });
        stream.force_close();
    }

    /// The application read `len` bytes from `stream`.
    pub(crate) fn stream_consumed(&self, stream: &Stream, len: u32) {
        let target = self.settings.read().local.initial_window_size;
        if let Some(increment) = stream.consumed(len, target) {
            let _ = self.enqueue(Command::WindowUpdate {
                stream_id: stream.id(),
                increment,
            });
        }
    }

    /// Queue one DATA frame. Once queued, the frame's credit belongs to the
    /// writer, which returns it itself if the stream is reset first.
    fn queue_data(
        &self,
        stream: &Arc<Stream>,
        data: Bytes,
        end_stream: bool,
        credit: Option<CreditReservation>,
    ) -> Result<()> {
        let len = data.len() as u32;
        self.enqueue(Command::Data {
            stream: Arc::clone(stream),
            data,
            end_stream,
        })?;
        if let Some(mut credit) = credit {
            credit.commit(len);
        }
        if end_stream {
            stream.close_local()?;
        }
        Ok(())
    }

    /// Queue `data` as DATA frames, waiting for flow-control credit.
    pub(crate) async fn send_data(
        &self,
        stream: &Arc<Stream>,
        mut data: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        let id = stream.id();
        loop {
            if stream.is_reset() {
                return Err(Error::stream(id, ErrorCode::StreamClosed, "stream was reset"));
            }
            if !stream.state().can_send() {
                return Err(Error::stream(
                    id,
                    ErrorCode::StreamClosed,
                    "stream is closed for sending",
                ));
            }
            if data.is_empty() {
                if end_stream {
                    self.queue_data(stream, Bytes::new(), true, None)?;
                }
                return Ok(());
            }

            let max_frame_size = self.settings.read().remote.max_frame_size;
            let credit = flow::reserve(
                stream.send_window(),
                &self.conn_send_window,
                data.len(),
                max_frame_size,
                stream.cancel_token(),
            )
            .await?;

            let len = credit.len();
            let chunk = data.split_to(len as usize);
            let last = end_stream && data.is_empty();
            self.queue_data(stream, chunk, last, Some(credit))?;
            if last {
                return Ok(());
            }
        }
    }

    /// End the stream with an empty DATA frame (send half dropped).
    pub(crate) fn end_stream(&self, stream: &Arc<Stream>) {
        if !stream.state().can_send() {
            return;
        }
        if let Err(err) = self.queue_data(stream, Bytes::new(), true, None) {
            tracing::debug!("stream {}: could not end stream: {}", stream.id(), err);
        }
    }

    async fn send_body(&self, stream: &Arc<Stream>, body: Body, end_stream: bool) -> Result<()> {
        match body {
            Body::Empty => Ok(()),
            Body::Full(bytes) if bytes.is_empty() => Ok(()),
            Body::Full(bytes) => self.send_data(stream, bytes, end_stream).await,
            Body::Channel(mut rx) => {
                loop {
                    let chunk = tokio::select! {
                        chunk = rx.recv() => chunk,
                        _ = stream.cancel_token().cancelled() => return Err(Error::Cancelled),
                    };
                    match chunk {
                        Some(chunk) => self.send_data(stream, chunk, false).await?,
                        None => break,
                    }
                }
                if end_stream {
                    self.send_data(stream, Bytes::new(), true).await
                } else {
                    Ok(())
                }
            }
        }
    }

    fn spawn_body(&self, stream: Arc<Stream>, body: Body) {
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = inner.send_body(&stream, body, true).await {
                if err.is_cancelled() || stream.is_reset() {
                    tracing::trace!("stream {}: request body abandoned", stream.id());
                } else {
                    tracing::warn!("stream {}: request body failed: {}", stream.id(), err);
                    inner.reset_stream(&stream, ErrorCode::InternalError);
                }
            }
        });
    }

    fn send_headers(
        &self,
        stream: &Arc<Stream>,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<()> {
        let state = stream.state();
        if !(state.can_send() || state == StreamState::ReservedLocal) {
            return Err(Error::stream(
                stream.id(),
                ErrorCode::StreamClosed,
                format!("cannot send headers in state {:?}", state),
            ));
        }
        self.enqueue(Command::Headers {
            stream_id: stream.id(),
            fields,
            end_stream,
        })?;
        stream.send_headers(end_stream)
    }

    fn send_trailers(&self, stream: &Arc<Stream>, trailers: &HeaderMap) -> Result<()> {
        if !stream.state().can_send() {
            return Err(Error::stream(
                stream.id(),
                ErrorCode::StreamClosed,
                "cannot send trailers on a closed stream",
            ));
        }
        self.enqueue(Command::Trailers {
            stream: Arc::clone(stream),
            fields: message::trailer_fields(trailers),
        })?;
        stream.close_local()
    }

    /// Allocate a local stream id and queue its HEADERS under one lock so
    /// ids reach the wire in increasing order.
    fn open_stream(&self, fields: Vec<HeaderField>, end_stream: bool) -> Result<Arc<Stream>> {
        let mut next_id = self.open_lock.lock();
        self.ensure_active()?;
        if let Some((last_stream_id, code)) = *self.goaway_received.lock() {
            return Err(Error::GoAway {
                last_stream_id,
                code,
            });
        }

        let limit = self.settings.read().remote.max_concurrent_streams;
        if self.local_active.load(Ordering::Acquire) >= limit {
            return Err(Error::ConcurrencyLimit(limit));
        }
        let id = *next_id;
        if id > self.config.max_local_stream_id {
            return Err(Error::StreamIdsExhausted);
        }
        *next_id = id.saturating_add(2);

        let stream = self.create_stream(id);
        if let Err(err) = self.send_headers(&stream, fields, end_stream) {
            stream.force_close();
            return Err(err);
        }
        tracing::debug!("stream {}: opened", id);
        Ok(stream)
    }

    /// Reserve an even stream for a server push and queue the PUSH_PROMISE.
    fn reserve_push(&self, primary_stream_id: u32, fields: Vec<HeaderField>) -> Result<Arc<Stream>> {
        let mut next_id = self.open_lock.lock();
        self.ensure_active()?;
        let id = *next_id;
        if id > self.config.max_local_stream_id {
            return Err(Error::StreamIdsExhausted);
        }
        *next_id = id.saturating_add(2);

        let stream = self.create_stream(id);
        stream.transition(StreamState::ReservedLocal)?;
        if let Err(err) = self.enqueue(Command::PushPromise {
            stream_id: primary_stream_id,
            promised_id: id,
            fields,
        }) {
            stream.force_close();
            return Err(err);
        }
        tracing::debug!("stream {}: promised on stream {}", id, primary_stream_id);
        Ok(stream)
    }

    /// Wait for the final response head, resetting the stream if `cancel`
    /// fires first.
    async fn await_head(
        &self,
        stream: &Arc<Stream>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResponseHead> {
        let rx = stream.take_head_receiver().ok_or_else(|| {
            Error::stream(stream.id(), ErrorCode::InternalError, "response already taken")
        })?;
        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                outcome = rx => outcome,
                _ = token.cancelled() => {
                    self.reset_stream(stream, ErrorCode::Cancel);
                    return Err(Error::Cancelled);
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or(Err(Error::SessionClosed))
    }

    /// Reset the stream with CANCEL once `token` fires, unless it closed first.
    fn watch_cancel(&self, stream: &Arc<Stream>, token: &CancellationToken) {
        let stream = Arc::clone(stream);
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => stream.reset(ErrorCode::Cancel),
                _ = stream.cancel_token().cancelled() => {}
            }
        });
    }

    async fn request(
        &self,
        request: Request<Body>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response<RecvStream>> {
        self.ensure_active()?;
        if self.role() != Role::Client {
            return Err(Error::config("server sessions cannot initiate requests"));
        }
        let (parts, body) = request.into_parts();
        let head = Request::from_parts(parts, ());

        if let Some(promise) = self.pushes.take_match(&head) {
            return self.claim_push(promise, cancel).await;
        }

        let fields = message::request_fields(&head, self.scheme(), self.authority())?;
        let end_stream = body.is_end_stream();
        let stream = self.open_stream(fields, end_stream)?;
        if let Some(token) = cancel {
            self.watch_cancel(&stream, token);
        }
        if !end_stream {
            self.spawn_body(Arc::clone(&stream), body);
        }

        let head = self.await_head(&stream, cancel).await?;
        Ok(into_response(&stream, head))
    }

    async fn claim_push(
        &self,
        promise: PushPromiseHeaders,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response<RecvStream>> {
        let stream = promise.stream;
        tracing::debug!(
            "stream {}: {} {} served from push",
            stream.id(),
            promise.method,
            promise.path
        );
        if let Some(token) = cancel {
            self.watch_cancel(&stream, token);
        }
        let head = self.await_head(&stream, cancel).await?;
        Ok(into_response(&stream, head))
    }

    async fn respond(
        &self,
        stream: &Arc<Stream>,
        response: Response<Body>,
        trailer_names: Option<Vec<HeaderName>>,
        trailer_provider: Option<TrailerProvider>,
    ) -> Result<()> {
        self.ensure_active()?;
        let (parts, body) = response.into_parts();
        let head = Response::from_parts(parts, ());

        if head.status().is_informational() {
            let fields = message::response_fields(&head, None);
            return self.send_headers(stream, fields, false);
        }

        let trailer_names = trailer_names.filter(|names| !names.is_empty());
        let trailers = match (trailer_names, trailer_provider) {
            (Some(names), Some(provider)) => Some((names, provider)),
            _ => None,
        };

        let fields = message::response_fields(&head, trailers.as_ref().map(|(n, _)| &n[..]));
        let headers_end = body.is_end_stream() && trailers.is_none();
        self.send_headers(stream, fields, headers_end)?;
        if headers_end {
            return Ok(());
        }

        self.send_body(stream, body, trailers.is_none()).await?;

        if let Some((names, provider)) = trailers {
            let produced = provider();
            let mut declared = HeaderMap::new();
            for name in &names {
                for value in produced.get_all(name) {
                    declared.append(name.clone(), value.clone());
                }
            }
            self.send_trailers(stream, &declared)?;
        }
        Ok(())
    }

    /// Validate and store a non-ACK SETTINGS frame from the peer.
    fn apply_remote_settings(&self, entries: &[(u16, u32)]) -> Result<()> {
        let mut settings = self.settings.write();
        let mut next = settings.remote.clone();
        next.apply_entries(entries)?;

        let push_id = u16::from(SettingsId::EnablePush);
        if self.role() == Role::Client
            && entries.iter().any(|&(id, value)| id == push_id && value == 1)
        {
            let offered = settings.pending.back().unwrap_or(&settings.local).enable_push;
            if !offered {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    "peer enabled push on a client that disabled it",
                ));
            }
        }

        let delta = next.initial_window_size as i64 - settings.remote.initial_window_size as i64;
        settings.remote = next;
        // Still holding the lock: streams created meanwhile already see the new size
        if delta != 0 {
            for stream in self.stream_snapshot() {
                stream.send_window().adjust(delta).map_err(|_| {
                    Error::connection(
                        ErrorCode::FlowControlError,
                        format!("stream {} send window overflow", stream.id()),
                    )
                })?;
            }
        }
        drop(settings);

        self.enqueue(Command::SettingsAck)?;
        self.settings_received.cancel();
        Ok(())
    }

    /// Peer acknowledged our oldest outstanding SETTINGS.
    fn apply_settings_ack(&self) -> Result<Option<Http2Settings>> {
        let mut settings = self.settings.write();
        let Some(next) = settings.pending.pop_front() else {
            tracing::warn!("SETTINGS ACK without outstanding SETTINGS");
            return Ok(None);
        };
        let delta = next.initial_window_size as i64 - settings.local.initial_window_size as i64;
        settings.local = next.clone();
        if delta != 0 {
            for stream in self.stream_snapshot() {
                stream.recv_window().adjust(delta).map_err(|_| {
                    Error::connection(
                        ErrorCode::FlowControlError,
                        format!("stream {} receive window overflow", stream.id()),
                    )
                })?;
            }
        }
        tracing::debug!("local settings acknowledged");
        Ok(Some(next))
    }

    fn record_ping_sent(&self, data: [u8; 8]) {
        let mut pings = self.pings.lock();
        if pings.len() >= MAX_TRACKED_PINGS {
            pings.clear();
        }
        pings.insert(data, Instant::now());
    }

    fn record_ping_ack(&self, data: [u8; 8]) {
        if let Some(sent) = self.pings.lock().remove(&data) {
            let rtt = sent.elapsed();
            tracing::trace!("ping rtt {:?}", rtt);
            *self.last_rtt.lock() = Some(rtt);
        }
    }

    /// Peer sent GOAWAY: fail our streams it will not process.
    fn on_goaway(&self, last_stream_id: u32, code: ErrorCode) {
        {
            let mut goaway = self.goaway_received.lock();
            let last = match *goaway {
                Some((prev, _)) => prev.min(last_stream_id),
                None => last_stream_id,
            };
            *goaway = Some((last, code));
        }
        if code == ErrorCode::NoError {
            tracing::debug!("GOAWAY received, last stream {}", last_stream_id);
        } else {
            tracing::warn!("GOAWAY received ({:?}), last stream {}", code, last_stream_id);
        }

        for stream in self.stream_snapshot() {
            let id = stream.id();
            if self.is_local_id(id) && id > last_stream_id {
                stream.mark_reset();
                stream.fail(Error::GoAway {
                    last_stream_id,
                    code,
                });
                stream.force_close();
            }
        }
        if self.streams.is_empty() {
            self.schedule_drain_shutdown();
        }
    }

    /// Close once everything queued so far reached the writer.
    fn schedule_drain_shutdown(&self) {
        if self.drain_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            inner.queue.wait_drained().await;
            tracing::debug!("peer is going away and no streams remain, closing");
            inner.shutdown(ErrorCode::NoError, String::new(), None).await;
        });
    }

    /// A background task failed; shut the session down accordingly.
    async fn fail(&self, err: Error) {
        let (code, message) = match &err {
            Error::Cancelled => return,
            Error::Connection { code, message } => (*code, message.clone()),
            Error::SettingsTimeout(_) => (ErrorCode::SettingsTimeout, err.to_string()),
            e if e.is_transport_closed() => (ErrorCode::NoError, String::new()),
            other => (ErrorCode::InternalError, other.to_string()),
        };
        if err.is_transport_closed() {
            tracing::debug!("session transport closed: {}", err);
        } else {
            tracing::error!("session failed: {}", err);
        }
        self.shutdown(code, message, Some(err)).await;
    }

    async fn shutdown(&self, code: ErrorCode, debug: String, cause: Option<Error>) {
        loop {
            match self.state() {
                SessionState::Uninitialized => {
                    if self.transition_state(SessionState::Uninitialized, SessionState::Closed) {
                        self.close(cause.unwrap_or(Error::SessionClosed));
                        return;
                    }
                }
                SessionState::Active => {
                    if self.transition_state(SessionState::Active, SessionState::ShuttingDown) {
                        break;
                    }
                }
                SessionState::ShuttingDown | SessionState::Closed => {
                    self.closed.cancelled().await;
                    return;
                }
            }
        }

        let last_stream_id = self.highest_peer_stream.load(Ordering::Acquire);
        tracing::debug!(
            "session shutting down ({:?}), last peer stream {}",
            code,
            last_stream_id
        );
        let goaway = Command::GoAway {
            last_stream_id,
            code,
            debug: Bytes::from(debug),
        };
        if self.enqueue(goaway).is_ok() {
            let timeout = self.config.shutdown_timeout;
            if tokio::time::timeout(timeout, self.goaway_sent.cancelled())
                .await
                .is_err()
            {
                tracing::warn!("GOAWAY not flushed within {:?}", timeout);
            }
        }
        self.close(cause.unwrap_or(Error::Cancelled));
    }

    /// Cancel everything and fail every waiter with `err`.
    fn close(&self, err: Error) {
        self.master.cancel();
        let dropped = self.queue.dispose();
        if !dropped.is_empty() {
            tracing::trace!("dropped {} queued commands", dropped.len());
        }

        let streams = self.stream_snapshot();
        self.streams.clear();
        self.local_active.store(0, Ordering::Release);
        self.peer_active.store(0, Ordering::Release);
        for stream in streams {
            stream.fail(err.duplicate());
            stream.force_close();
        }
        for promise in self.pushes.drain() {
            promise.stream.fail(err.duplicate());
            promise.stream.force_close();
        }

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.closed.cancel();
        tracing::debug!("session closed");
    }

    fn activate(
        &self,
        role: Role,
        settings: Http2Settings,
        authority: &str,
        scheme: &str,
        bootstrap: Bootstrap,
    ) -> Result<Option<Arc<Stream>>> {
        settings.validate_local(role == Role::Server)?;

        let (io, codecs) = {
            let mut slot = self.io.lock();
            if let Some((io, _)) = slot.as_ref() {
                if let Some(protocol) = io.negotiated_protocol() {
                    if protocol != ALPN_H2 {
                        return Err(Error::config(format!(
                            "transport negotiated {} instead of h2",
                            String::from_utf8_lossy(protocol)
                        )));
                    }
                }
            }
            if !self.transition_state(SessionState::Uninitialized, SessionState::Active) {
                return Err(Error::AlreadyStarted);
            }
            slot.take().ok_or(Error::AlreadyStarted)?
        };
        let inner = self.me.upgrade().ok_or(Error::SessionClosed)?;

        let _ = self.endpoint.set(Endpoint {
            role,
            authority: authority.to_string(),
            scheme: scheme.to_string(),
        });
        *self.open_lock.lock() = match role {
            Role::Client => 1,
            Role::Server => 2,
        };

        {
            let mut state = self.settings.write();
            match &bootstrap {
                // HTTP2-Settings already told the server what we use
                Bootstrap::UpgradedClient => state.local = settings.clone(),
                Bootstrap::UpgradedServer(remote) => state.remote = remote.clone(),
                Bootstrap::Fresh => {}
            }
            state.pending.push_back(settings.clone());
            if role == Role::Client {
                self.enqueue(Command::Prefix)?;
            }
            self.enqueue(Command::Settings(settings))?;
        }
        let extra = self
            .config
            .connection_window_size
            .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
        if extra > 0 {
            self.enqueue(Command::WindowUpdate {
                stream_id: 0,
                increment: extra,
            })?;
        }

        let upgraded = match bootstrap {
            Bootstrap::Fresh => None,
            Bootstrap::UpgradedClient => {
                *self.open_lock.lock() = 3;
                let stream = self.create_stream(1);
                stream.transition(StreamState::Open)?;
                stream.close_local()?;
                Some(stream)
            }
            Bootstrap::UpgradedServer(_) => {
                let stream = self.create_stream(1);
                self.highest_peer_stream.store(1, Ordering::Release);
                stream.transition(StreamState::Open)?;
                stream.close_remote()?;
                Some(stream)
            }
        };

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(
            reader::Reader::new(Arc::clone(&inner), read_half, codecs.read_frames, codecs.decoder)
                .run(),
        );
        tokio::spawn(
            writer::Writer::new(Arc::clone(&inner), write_half, codecs.write_frames, codecs.encoder)
                .run(),
        );
        tokio::spawn(ping::run(inner));

        tracing::debug!("session active as {:?} for {}://{}", role, scheme, authority);
        Ok(upgraded)
    }
}

fn into_response(stream: &Arc<Stream>, head: ResponseHead) -> Response<RecvStream> {
    let mut response = Response::new(RecvStream::new(Arc::clone(stream), true));
    *response.status_mut() = head.status;
    *response.version_mut() = http::Version::HTTP_2;
    *response.headers_mut() = head.headers;
    response
}

/// Handle to one HTTP/2 session. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("role", &self.inner.endpoint.get().map(|e| e.role))
            .field("active_streams", &self.active_stream_count())
            .finish()
    }
}

impl Session {
    /// Wrap a connected transport. Nothing is sent until a `begin_*` call.
    pub fn new<T: Transport>(io: T, config: SessionConfig) -> Self {
        Self::with_codecs(io, config, Codecs::default())
    }

    pub fn with_codecs<T: Transport>(io: T, config: SessionConfig, codecs: Codecs) -> Self {
        let config = config.normalized();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_capacity);
        let transport: Box<dyn Transport> = Box::new(io);
        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            endpoint: OnceLock::new(),
            io: Mutex::new(Some((transport, codecs))),
            streams: DashMap::new(),
            local_active: AtomicU32::new(0),
            peer_active: AtomicU32::new(0),
            open_lock: Mutex::new(1),
            highest_peer_stream: AtomicU32::new(0),
            recently_reset: Mutex::new(VecDeque::new()),
            queue: OutgoingDispatchQueue::new(config.data_idle_threshold),
            conn_send_window: Arc::new(FlowControlWindow::new(DEFAULT_INITIAL_WINDOW_SIZE)),
            conn_recv_window: FlowControlWindow::new(config.connection_window_size),
            settings: RwLock::new(SettingsState::default()),
            goaway_received: Mutex::new(None),
            drain_scheduled: AtomicBool::new(false),
            pushes: PushPromiseRegistry::new(),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            pings: Mutex::new(HashMap::new()),
            last_rtt: Mutex::new(None),
            master: CancellationToken::new(),
            settings_received: CancellationToken::new(),
            goaway_sent: CancellationToken::new(),
            closed: CancellationToken::new(),
            config,
        });
        Self { inner }
    }

    /// Start as the client end: connection preface, then SETTINGS.
    pub async fn begin_client_session(
        &self,
        settings: Http2Settings,
        remote_authority: &str,
        scheme: &str,
    ) -> Result<()> {
        self.inner
            .activate(Role::Client, settings, remote_authority, scheme, Bootstrap::Fresh)
            .map(|_| ())
    }

    /// Start as the server end. The client preface is expected first.
    pub async fn begin_server_session(
        &self,
        settings: Http2Settings,
        local_authority: &str,
        scheme: &str,
    ) -> Result<()> {
        self.inner
            .activate(Role::Server, settings, local_authority, scheme, Bootstrap::Fresh)
            .map(|_| ())
    }

    /// Start as a client after an HTTP/1.1 `Upgrade: h2c` was accepted.
    ///
    /// `settings` must be the ones sent in `HTTP2-Settings`. Stream 1
    /// carries the upgraded request; its response is returned.
    pub async fn begin_upgraded_client_session(
        &self,
        settings: Http2Settings,
        remote_authority: &str,
        scheme: &str,
    ) -> Result<Response<RecvStream>> {
        let stream = self
            .inner
            .activate(
                Role::Client,
                settings,
                remote_authority,
                scheme,
                Bootstrap::UpgradedClient,
            )?
            .ok_or(Error::UnknownStream(1))?;
        let head = self.inner.await_head(&stream, None).await?;
        Ok(into_response(&stream, head))
    }

    /// Start as a server that answered `request` with 101 Switching Protocols.
    ///
    /// The request becomes stream 1, already half-closed by the client; its
    /// `HTTP2-Settings` header is taken as the client's settings.
    pub async fn begin_upgraded_server_session(
        &self,
        settings: Http2Settings,
        local_authority: &str,
        scheme: &str,
        request: Request<()>,
    ) -> Result<IncomingRequest> {
        let remote = crate::upgrade::settings_from_request(&request)?;
        let stream = self
            .inner
            .activate(
                Role::Server,
                settings,
                local_authority,
                scheme,
                Bootstrap::UpgradedServer(remote),
            )?
            .ok_or(Error::UnknownStream(1))?;

        let (mut parts, ()) = request.into_parts();
        parts.headers.remove(header::CONNECTION);
        parts.headers.remove(header::UPGRADE);
        parts.headers.remove(crate::upgrade::HTTP2_SETTINGS);
        parts.version = http::Version::HTTP_2;
        let body = RecvStream::new(Arc::clone(&stream), false);
        Ok(IncomingRequest {
            stream_id: stream.id(),
            request: Request::from_parts(parts, body),
        })
    }

    /// Send a request and wait for the final response head.
    ///
    /// A matching unclaimed server push is used instead of a new stream.
    pub async fn make_request(&self, request: Request<Body>) -> Result<Response<RecvStream>> {
        self.inner.request(request, None).await
    }

    /// Like [`make_request`](Self::make_request); cancelling `cancel` at any
    /// point resets only this stream.
    pub async fn make_request_with_cancel(
        &self,
        request: Request<Body>,
        cancel: &CancellationToken,
    ) -> Result<Response<RecvStream>> {
        self.inner.request(request, Some(cancel)).await
    }

    /// Next request opened by the peer. `None` once the session is closed.
    pub async fn accept(&self) -> Option<IncomingRequest> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        tokio::select! {
            biased;
            request = incoming.recv() => request,
            _ = self.inner.master.cancelled() => None,
        }
    }

    /// Answer the request on `stream_id`.
    ///
    /// Returns once the body has been queued. When both `trailer_names` and
    /// `trailer_provider` are given, the names are announced in a `trailer`
    /// header and the provider runs after the body; only declared names are
    /// sent.
    pub async fn write_response(
        &self,
        response: Response<Body>,
        stream_id: u32,
        trailer_names: Option<Vec<HeaderName>>,
        trailer_provider: Option<TrailerProvider>,
    ) -> Result<()> {
        let stream = self
            .inner
            .stream(stream_id)
            .ok_or(Error::UnknownStream(stream_id))?;
        self.inner
            .respond(&stream, response, trailer_names, trailer_provider)
            .await
    }

    /// Promise a response for `request` on the stream `primary_stream_id`.
    pub fn initialize_push_promise(
        &self,
        primary_stream_id: u32,
        request: Request<()>,
    ) -> Result<PushPromiseHandle> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if inner.role() != Role::Server {
            return Err(Error::config("only servers can push"));
        }
        if !inner.remote_settings().enable_push {
            return Err(Error::config("peer disabled server push"));
        }
        if !matches!(*request.method(), Method::GET | Method::HEAD) {
            return Err(Error::http_protocol(format!(
                "cannot push a {} request",
                request.method()
            )));
        }
        let primary = inner
            .stream(primary_stream_id)
            .ok_or(Error::UnknownStream(primary_stream_id))?;
        if !primary.state().can_send() {
            return Err(Error::stream(
                primary_stream_id,
                ErrorCode::StreamClosed,
                "cannot push on a stream closed for sending",
            ));
        }

        let fields = message::request_fields(&request, inner.scheme(), inner.authority())?;
        let stream = inner.reserve_push(primary_stream_id, fields)?;
        Ok(PushPromiseHandle {
            stream_id: stream.id(),
            primary_stream_id,
        })
    }

    /// Send the response for a promised stream.
    pub async fn write_promise_response(
        &self,
        handle: PushPromiseHandle,
        response: Response<Body>,
    ) -> Result<()> {
        let stream = self
            .inner
            .stream(handle.stream_id)
            .ok_or(Error::UnknownStream(handle.stream_id))?;
        self.inner.respond(&stream, response, None, None).await
    }

    /// Open a stream whose request body is written incrementally.
    ///
    /// Waits for the response head; the returned [`SendStream`] keeps
    /// writing the request side.
    pub async fn open_byte_stream(
        &self,
        request: Request<()>,
    ) -> Result<(Response<RecvStream>, SendStream)> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if inner.role() != Role::Client {
            return Err(Error::config("server sessions cannot initiate requests"));
        }
        let fields = message::request_fields(&request, inner.scheme(), inner.authority())?;
        let stream = inner.open_stream(fields, false)?;
        let send = SendStream::new(Arc::clone(&stream));
        let head = inner.await_head(&stream, None).await?;
        Ok((into_response(&stream, head), send))
    }

    /// Announce new local settings. They apply once the peer ACKs them.
    pub fn update_settings(&self, settings: Http2Settings) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_active()?;
        settings.validate_local(inner.role() == Role::Server)?;
        let mut state = inner.settings.write();
        state.pending.push_back(settings.clone());
        inner.enqueue(Command::UpdateLocalSettings(settings))
    }

    /// Send GOAWAY and close. Safe to call any number of times; later
    /// callers wait for the first to finish.
    pub async fn shutdown(&self, code: ErrorCode, debug_message: impl Into<String>) {
        self.inner.shutdown(code, debug_message.into(), None).await;
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.endpoint.get().map(|e| e.role)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Active, not told to go away, and able to open another stream.
    pub fn is_available(&self) -> bool {
        let inner = &self.inner;
        if !self.is_active() || inner.goaway_received.lock().is_some() {
            return false;
        }
        if *inner.open_lock.lock() > inner.config.max_local_stream_id {
            return false;
        }
        let limit = inner.settings.read().remote.max_concurrent_streams;
        inner.local_active.load(Ordering::Acquire) < limit
    }

    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.inner.stream(stream_id).map(|s| s.state())
    }

    pub fn active_stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn remote_settings(&self) -> Http2Settings {
        self.inner.remote_settings()
    }

    /// Settings the peer has acknowledged.
    pub fn local_settings(&self) -> Http2Settings {
        self.inner.local_settings()
    }

    /// Round-trip time of the last acknowledged keepalive.
    pub fn last_rtt(&self) -> Option<Duration> {
        *self.inner.last_rtt.lock()
    }

    /// Unclaimed server pushes.
    pub fn pending_push_count(&self) -> usize {
        self.inner.pushes.len()
    }
}
