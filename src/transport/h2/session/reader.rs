//! Reader task: decodes inbound frames and routes them to streams.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncReadExt, ReadHalf};

use super::{Role, SessionInner};
use crate::error::{Error, Result};
use crate::transport::h2::frame::{
    ContinuationFrame, DataFrame, ErrorCode, Frame, FrameCodec, GoAwayFrame, HeadersFrame,
    PingFrame, PushPromiseFrame, SettingsFrame, WindowUpdateFrame, CONNECTION_PREFACE,
    DEFAULT_MAX_FRAME_SIZE,
};
use crate::transport::h2::hpack::{HeaderCodec, HeaderField};
use crate::transport::h2::message;
use crate::transport::h2::push::PushPromiseHeaders;
use crate::transport::h2::stream::{Stream, StreamState};
use crate::transport::h2::queue::Command;
use crate::transport::h2::IncomingRequest;
use crate::transport::Transport;

/// Upper bound on an assembled header block.
const MAX_HEADER_BLOCK_SIZE: usize = 1024 * 1024;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Header block still waiting for CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    kind: BlockKind,
    fragment: BytesMut,
}

enum BlockKind {
    Headers { end_stream: bool },
    PushPromise { promised_id: u32 },
}

pub(super) struct Reader<T> {
    inner: Arc<SessionInner>,
    io: ReadHalf<T>,
    codec: Box<dyn FrameCodec>,
    decoder: Box<dyn HeaderCodec>,
    buf: BytesMut,
    max_frame_size: u32,
    pending: Option<PendingBlock>,
}

impl<T: Transport> Reader<T> {
    pub(super) fn new(
        inner: Arc<SessionInner>,
        io: ReadHalf<T>,
        codec: Box<dyn FrameCodec>,
        decoder: Box<dyn HeaderCodec>,
    ) -> Self {
        Self {
            inner,
            io,
            codec,
            decoder,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pending: None,
        }
    }

    pub(super) async fn run(mut self) {
        let inner = Arc::clone(&self.inner);
        let result = tokio::select! {
            result = self.read_loop() => result,
            _ = inner.master.cancelled() => Ok(()),
        };
        match result {
            Ok(()) => tracing::trace!("reader task finished"),
            Err(err) => inner.fail(err).await,
        }
    }

    async fn read_loop(&mut self) -> Result<()> {
        if self.inner.role() == Role::Server {
            self.read_preface().await?;
        }
        loop {
            let frame = self.next_frame().await?;
            match self.handle_frame(frame) {
                Ok(()) => {}
                Err(Error::Stream {
                    stream_id,
                    code,
                    message,
                }) => {
                    tracing::debug!("stream {}: {:?}: {}", stream_id, code, message);
                    self.inner.reset_stream_id(stream_id, code);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn read_preface(&mut self) -> Result<()> {
        while self.buf.len() < CONNECTION_PREFACE.len() {
            self.fill().await?;
        }
        let preface = self.buf.split_to(CONNECTION_PREFACE.len());
        if &preface[..] != CONNECTION_PREFACE {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "invalid connection preface",
            ));
        }
        tracing::trace!("client preface received");
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        self.buf.reserve(READ_BUFFER_SIZE);
        let n = self.io.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(Error::TransportClosed);
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            match self.codec.decode(&mut self.buf, self.max_frame_size) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => self.fill().await?,
                // Frame was consumed; only its stream is affected
                Err(Error::Stream {
                    stream_id,
                    code,
                    message,
                }) => {
                    tracing::debug!("stream {}: bad frame: {}", stream_id, message);
                    self.inner.reset_stream_id(stream_id, code);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        tracing::trace!(
            "recv {:?} on stream {}",
            frame.frame_type(),
            frame.stream_id()
        );

        if let Some(pending) = &self.pending {
            let expected = pending.stream_id;
            return match frame {
                Frame::Continuation(cont) if cont.stream_id == expected => {
                    self.on_continuation(cont)
                }
                _ => Err(Error::connection(
                    ErrorCode::ProtocolError,
                    format!("expected CONTINUATION for stream {}", expected),
                )),
            };
        }

        match frame {
            Frame::Settings(f) => self.on_settings(f),
            Frame::Ping(f) => self.on_ping(f),
            Frame::GoAway(f) => self.on_goaway(f),
            Frame::WindowUpdate(f) => self.on_window_update(f),
            Frame::RstStream(f) => {
                if let Some(stream) = self.inner.stream(f.stream_id) {
                    tracing::debug!("stream {}: reset by peer ({:?})", f.stream_id, f.error_code);
                    self.inner.peer_reset(&stream, f.error_code);
                }
                Ok(())
            }
            Frame::Headers(f) => self.on_headers(f),
            Frame::PushPromise(f) => self.on_push_promise(f),
            Frame::Data(f) => self.on_data(f),
            Frame::Continuation(f) => Err(Error::connection(
                ErrorCode::ProtocolError,
                format!("unexpected CONTINUATION on stream {}", f.stream_id),
            )),
            Frame::Priority(_) | Frame::Unknown(_) => Ok(()),
        }
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "SETTINGS frame must be on stream 0",
            ));
        }
        if frame.ack {
            if frame.payload_len != 0 {
                return Err(Error::connection(
                    ErrorCode::FrameSizeError,
                    "SETTINGS ACK with a payload",
                ));
            }
            if let Some(applied) = self.inner.apply_settings_ack()? {
                self.max_frame_size = applied.max_frame_size;
                self.decoder.set_max_table_size(applied.header_table_size);
            }
            return Ok(());
        }
        if frame.payload_len % SettingsFrame::ENTRY_SIZE != 0 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "SETTINGS payload is not a multiple of 6 bytes",
            ));
        }
        tracing::debug!("peer settings: {:?}", frame.settings);
        self.inner.apply_remote_settings(&frame.settings)
    }

    fn on_ping(&mut self, frame: PingFrame) -> Result<()> {
        if frame.ack {
            self.inner.record_ping_ack(frame.data);
            return Ok(());
        }
        self.inner.enqueue(Command::Ping {
            data: frame.data,
            ack: true,
            keepalive: false,
        })
    }

    fn on_goaway(&mut self, frame: GoAwayFrame) -> Result<()> {
        if !frame.debug_data.is_empty() {
            tracing::debug!(
                "GOAWAY debug data: {}",
                String::from_utf8_lossy(&frame.debug_data)
            );
        }
        self.inner.on_goaway(frame.last_stream_id, frame.error_code);
        Ok(())
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        let id = frame.stream_id;
        if id == 0 {
            if frame.increment == 0 {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    "connection WINDOW_UPDATE with zero increment",
                ));
            }
            return self
                .inner
                .conn_send_window
                .credit(frame.increment)
                .map(|_| ())
                .map_err(|_| {
                    Error::connection(
                        ErrorCode::FlowControlError,
                        "connection send window overflow",
                    )
                });
        }

        if frame.increment == 0 {
            return Err(Error::stream(
                id,
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE with zero increment",
            ));
        }
        let Some(stream) = self.inner.stream(id) else {
            return Ok(());
        };
        stream
            .send_window()
            .credit(frame.increment)
            .map(|_| ())
            .map_err(|_| Error::stream(id, ErrorCode::FlowControlError, "send window overflow"))
    }

    fn on_headers(&mut self, frame: HeadersFrame) -> Result<()> {
        let kind = BlockKind::Headers {
            end_stream: frame.end_stream,
        };
        self.begin_block(frame.stream_id, kind, frame.header_block, frame.end_headers)
    }

    fn on_push_promise(&mut self, frame: PushPromiseFrame) -> Result<()> {
        let kind = BlockKind::PushPromise {
            promised_id: frame.promised_stream_id,
        };
        self.begin_block(frame.stream_id, kind, frame.header_block, frame.end_headers)
    }

    fn begin_block(
        &mut self,
        stream_id: u32,
        kind: BlockKind,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<()> {
        if end_headers {
            return self.finish_block(stream_id, kind, &fragment);
        }
        self.pending = Some(PendingBlock {
            stream_id,
            kind,
            fragment: BytesMut::from(&fragment[..]),
        });
        self.check_block_size()
    }

    fn on_continuation(&mut self, frame: ContinuationFrame) -> Result<()> {
        if let Some(pending) = self.pending.as_mut() {
            pending.fragment.extend_from_slice(&frame.header_fragment);
        }
        self.check_block_size()?;
        if !frame.end_headers {
            return Ok(());
        }
        match self.pending.take() {
            Some(block) => self.finish_block(block.stream_id, block.kind, &block.fragment),
            None => Ok(()),
        }
    }

    fn check_block_size(&self) -> Result<()> {
        match &self.pending {
            Some(block) if block.fragment.len() > MAX_HEADER_BLOCK_SIZE => Err(Error::connection(
                ErrorCode::EnhanceYourCalm,
                "header block too large",
            )),
            _ => Ok(()),
        }
    }

    fn finish_block(&mut self, stream_id: u32, kind: BlockKind, block: &[u8]) -> Result<()> {
        // Always decode so the HPACK table stays in sync
        let fields = self.decoder.decode(block)?;
        match kind {
            BlockKind::Headers { end_stream } => self.on_header_block(stream_id, fields, end_stream),
            BlockKind::PushPromise { promised_id } => {
                self.on_promise_block(stream_id, promised_id, fields)
            }
        }
    }

    fn on_header_block(
        &mut self,
        stream_id: u32,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<()> {
        match self.inner.stream(stream_id) {
            Some(stream) => self.on_stream_headers(&stream, fields, end_stream),
            None => self.on_new_stream(stream_id, fields, end_stream),
        }
    }

    fn on_new_stream(
        &mut self,
        stream_id: u32,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.was_recently_reset(stream_id) {
            tracing::trace!("stream {}: HEADERS after reset ignored", stream_id);
            return Ok(());
        }

        let highest = inner.highest_peer_stream.load(Ordering::Acquire);
        let opens_new = inner.role() == Role::Server && stream_id % 2 == 1 && stream_id > highest;
        if !opens_new {
            return Err(Error::stream(
                stream_id,
                ErrorCode::RefusedStream,
                "HEADERS on an unknown stream",
            ));
        }
        inner.highest_peer_stream.store(stream_id, Ordering::Release);

        if inner.state() != super::SessionState::Active {
            tracing::trace!("stream {}: ignored while shutting down", stream_id);
            return Ok(());
        }
        let limit = inner.local_settings().max_concurrent_streams;
        if inner.peer_active.load(Ordering::Acquire) >= limit {
            return Err(Error::stream(
                stream_id,
                ErrorCode::RefusedStream,
                format!("concurrent stream limit {} reached", limit),
            ));
        }

        let head = message::parse_request_head(&fields)
            .map_err(|err| Error::stream(stream_id, ErrorCode::ProtocolError, err.to_string()))?;

        let stream = inner.create_stream(stream_id);
        stream.recv_headers(end_stream)?;
        stream.set_declared_trailers(message::declared_trailers(head.headers()));

        let (parts, ()) = head.into_parts();
        let body = crate::transport::h2::RecvStream::new(Arc::clone(&stream), false);
        let request = IncomingRequest {
            stream_id,
            request: http::Request::from_parts(parts, body),
        };
        if inner.incoming_tx.try_send(request).is_err() {
            tracing::warn!("stream {}: incoming queue full, refusing", stream_id);
            inner.reset_stream(&stream, ErrorCode::RefusedStream);
            return Ok(());
        }
        tracing::debug!("stream {}: request received", stream_id);
        Ok(())
    }

    fn on_stream_headers(
        &mut self,
        stream: &Arc<Stream>,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<()> {
        let id = stream.id();
        if self.inner.role() == Role::Client && stream.head_pending() {
            let head = message::parse_response_head(&fields)
                .map_err(|err| Error::stream(id, ErrorCode::ProtocolError, err.to_string()))?;
            if head.status.is_informational() {
                if end_stream {
                    return Err(Error::stream(
                        id,
                        ErrorCode::ProtocolError,
                        "informational response with END_STREAM",
                    ));
                }
                tracing::trace!("stream {}: skipped {} response", id, head.status);
                return Ok(());
            }

            let state = stream.state();
            if !(state.can_recv() || state == StreamState::ReservedRemote) {
                return Err(Error::stream(
                    id,
                    ErrorCode::StreamClosed,
                    "response on a stream closed for receiving",
                ));
            }
            stream.set_declared_trailers(message::declared_trailers(&head.headers));
            stream.deliver_head(head);
            return stream.recv_headers(end_stream);
        }

        // Anything after the head is a trailer block
        if !end_stream {
            return Err(Error::stream(
                id,
                ErrorCode::ProtocolError,
                "trailers without END_STREAM",
            ));
        }
        if !stream.state().can_recv() {
            return Err(Error::stream(
                id,
                ErrorCode::StreamClosed,
                "trailers on a stream closed for receiving",
            ));
        }
        let declared = stream.declared_trailers();
        let trailers = message::parse_trailers(&fields, declared.as_deref())
            .map_err(|err| Error::stream(id, ErrorCode::ProtocolError, err.to_string()))?;
        stream.push_trailers(trailers);
        stream.close_remote()
    }

    fn on_promise_block(
        &mut self,
        stream_id: u32,
        promised_id: u32,
        fields: Vec<HeaderField>,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.role() == Role::Server {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE sent to a server",
            ));
        }
        if !inner.local_settings().enable_push {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE while push is disabled",
            ));
        }
        let highest = inner.highest_peer_stream.load(Ordering::Acquire);
        if promised_id == 0 || promised_id % 2 == 1 || promised_id <= highest {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                format!("invalid promised stream id {}", promised_id),
            ));
        }
        inner.highest_peer_stream.store(promised_id, Ordering::Release);

        let associated = match inner.stream(stream_id) {
            Some(stream) if stream.state().can_recv() => stream,
            _ if inner.was_recently_reset(stream_id) => {
                inner.reset_stream_id(promised_id, ErrorCode::Cancel);
                return Ok(());
            }
            _ => {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    format!("PUSH_PROMISE on stream {} which cannot receive", stream_id),
                ))
            }
        };

        let request = match message::parse_request_head(&fields) {
            Ok(request) if matches!(*request.method(), Method::GET | Method::HEAD) => request,
            Ok(request) => {
                tracing::debug!("stream {}: refusing pushed {}", promised_id, request.method());
                inner.reset_stream_id(promised_id, ErrorCode::ProtocolError);
                return Ok(());
            }
            Err(err) => {
                tracing::debug!("stream {}: malformed promise: {}", promised_id, err);
                inner.reset_stream_id(promised_id, ErrorCode::ProtocolError);
                return Ok(());
            }
        };

        let stream = inner.create_stream(promised_id);
        stream.transition(StreamState::ReservedRemote)?;
        tracing::debug!(
            "stream {}: push promised on stream {} for {}",
            promised_id,
            associated.id(),
            request.uri().path()
        );
        inner.pushes.insert(PushPromiseHeaders::new(&request, stream));

        for pruned in inner.pushes.prune(
            tokio::time::Instant::now(),
            inner.config.push_max_age,
            inner.config.push_max_count,
        ) {
            inner.reset_stream(&pruned, ErrorCode::Cancel);
        }
        Ok(())
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let inner = &self.inner;
        let id = frame.stream_id;

        if inner.conn_recv_window.debit(frame.flow_len) < 0 {
            return Err(Error::connection(
                ErrorCode::FlowControlError,
                "connection receive window exceeded",
            ));
        }
        // Connection credit goes back right away; streams pace the peer
        if let Some(increment) = inner
            .conn_recv_window
            .replenish(inner.config.connection_window_size, 0)
        {
            inner.enqueue(Command::WindowUpdate {
                stream_id: 0,
                increment,
            })?;
        }

        let Some(stream) = inner.stream(id) else {
            if inner.was_recently_reset(id) {
                return Ok(());
            }
            return Err(Error::stream(
                id,
                ErrorCode::RefusedStream,
                "DATA on an unknown stream",
            ));
        };
        if !stream.state().can_recv() {
            return Err(Error::stream(
                id,
                ErrorCode::StreamClosed,
                "DATA on a stream closed for receiving",
            ));
        }
        if stream.recv_window().debit(frame.flow_len) < 0 {
            return Err(Error::stream(
                id,
                ErrorCode::FlowControlError,
                "stream receive window exceeded",
            ));
        }

        let padding = frame.flow_len - frame.data.len() as u32;
        let queued = stream.push_data(frame.data);
        if padding > 0 || !queued {
            // Padding and discarded bodies are never read by the application
            inner.stream_consumed(&stream, 0);
        }
        if frame.end_stream {
            stream.close_remote()?;
        }
        Ok(())
    }
}
