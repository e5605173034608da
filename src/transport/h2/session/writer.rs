//! Writer task: drains the dispatch queue onto the transport.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, WriteHalf};

use super::SessionInner;
use crate::error::Result;
use crate::transport::h2::frame::{
    ContinuationFrame, DataFrame, Frame, FrameCodec, GoAwayFrame, HeadersFrame, PingFrame,
    PushPromiseFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame, CONNECTION_PREFACE,
};
use crate::transport::h2::hpack::{chunk_header_block, HeaderCodec, HeaderField};
use crate::transport::h2::queue::Command;
use crate::transport::Transport;

/// Stop batching once this much is buffered.
const MAX_BATCH_BYTES: usize = 64 * 1024;
const MAX_BATCH_COMMANDS: usize = 64;

pub(super) struct Writer<T> {
    inner: Arc<SessionInner>,
    io: WriteHalf<T>,
    codec: Box<dyn FrameCodec>,
    encoder: Box<dyn HeaderCodec>,
    buf: BytesMut,
}

impl<T: Transport> Writer<T> {
    pub(super) fn new(
        inner: Arc<SessionInner>,
        io: WriteHalf<T>,
        codec: Box<dyn FrameCodec>,
        encoder: Box<dyn HeaderCodec>,
    ) -> Self {
        Self {
            inner,
            io,
            codec,
            encoder,
            buf: BytesMut::with_capacity(MAX_BATCH_BYTES),
        }
    }

    pub(super) async fn run(mut self) {
        let inner = Arc::clone(&self.inner);
        let result = tokio::select! {
            result = self.write_loop() => result,
            _ = inner.master.cancelled() => Ok(()),
        };
        // Nothing more will be written; do not hold up a pending shutdown
        inner.goaway_sent.cancel();

        let _ = self.io.shutdown().await;
        match result {
            Ok(()) => tracing::trace!("writer task finished"),
            Err(err) => inner.fail(err).await,
        }
    }

    async fn write_loop(&mut self) -> Result<()> {
        loop {
            let Some(first) = self.inner.queue.dequeue().await else {
                return Ok(());
            };
            let mut goaway = self.encode(first);
            let mut batched = 1;
            while self.buf.len() < MAX_BATCH_BYTES && batched < MAX_BATCH_COMMANDS {
                match self.inner.queue.try_dequeue() {
                    Some(cmd) => {
                        goaway |= self.encode(cmd);
                        batched += 1;
                    }
                    None => break,
                }
            }

            if !self.buf.is_empty() {
                self.io.write_all(&self.buf).await?;
                self.io.flush().await?;
                self.buf.clear();
            }
            if goaway {
                tracing::debug!("GOAWAY flushed");
                self.inner.goaway_sent.cancel();
            }
        }
    }

    fn frame(&mut self, frame: Frame) {
        tracing::trace!(
            "send {:?} on stream {}",
            frame.frame_type(),
            frame.stream_id()
        );
        self.codec.encode(&frame, &mut self.buf);
    }

    /// Serialize one command. Returns true for GOAWAY.
    fn encode(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Prefix => self.buf.extend_from_slice(CONNECTION_PREFACE),
            Command::Settings(settings) | Command::UpdateLocalSettings(settings) => {
                self.frame(Frame::Settings(settings.to_frame()))
            }
            Command::SettingsAck => self.frame(Frame::Settings(SettingsFrame::ack())),
            Command::Headers {
                stream_id,
                fields,
                end_stream,
            } => self.header_block(stream_id, None, &fields, end_stream),
            Command::PushPromise {
                stream_id,
                promised_id,
                fields,
            } => self.header_block(stream_id, Some(promised_id), &fields, false),
            Command::Trailers { stream, fields } => {
                if stream.is_reset() {
                    tracing::trace!("stream {}: trailers dropped after reset", stream.id());
                } else {
                    self.header_block(stream.id(), None, &fields, true);
                }
            }
            Command::Data {
                stream,
                data,
                end_stream,
            } => {
                if stream.is_reset() {
                    // Never sent, so the peer never counted it
                    self.inner.conn_send_window.release(data.len() as u32);
                } else {
                    let frame = DataFrame::new(stream.id(), data).end_stream(end_stream);
                    self.frame(Frame::Data(frame));
                }
            }
            Command::Ping {
                data,
                ack,
                keepalive,
            } => {
                if keepalive {
                    self.inner.record_ping_sent(data);
                }
                let frame = if ack {
                    PingFrame::ack(data)
                } else {
                    PingFrame::new(data)
                };
                self.frame(Frame::Ping(frame));
            }
            Command::RstStream { stream_id, code } => {
                self.frame(Frame::RstStream(RstStreamFrame::new(stream_id, code)))
            }
            Command::WindowUpdate {
                stream_id,
                increment,
            } => self.frame(Frame::WindowUpdate(WindowUpdateFrame::new(
                stream_id, increment,
            ))),
            Command::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                let frame = GoAwayFrame::new(last_stream_id, code).with_debug_data(debug);
                self.frame(Frame::GoAway(frame));
                return true;
            }
        }
        false
    }

    /// Encode a header block and split it across HEADERS (or PUSH_PROMISE)
    /// and CONTINUATION frames.
    fn header_block(
        &mut self,
        stream_id: u32,
        promised_id: Option<u32>,
        fields: &[HeaderField],
        end_stream: bool,
    ) {
        let (max_frame_size, table_size) = {
            let settings = self.inner.settings.read();
            (
                settings.remote.max_frame_size as usize,
                settings.remote.header_table_size,
            )
        };
        if self.encoder.max_table_size() != table_size {
            self.encoder.set_max_table_size(table_size);
        }

        let block = self.encoder.encode(fields);
        let limit = match promised_id {
            Some(_) => max_frame_size - 4,
            None => max_frame_size,
        };
        let chunks = chunk_header_block(block, limit);
        let count = chunks.len();

        for (i, chunk) in chunks.into_iter().enumerate() {
            let end_headers = i + 1 == count;
            let frame = match (i, promised_id) {
                (0, Some(promised_id)) => Frame::PushPromise(
                    PushPromiseFrame::new(stream_id, promised_id, chunk).end_headers(end_headers),
                ),
                (0, None) => Frame::Headers(
                    HeadersFrame::new(stream_id, chunk)
                        .end_stream(end_stream)
                        .end_headers(end_headers),
                ),
                _ => Frame::Continuation(ContinuationFrame::new(stream_id, chunk, end_headers)),
            };
            self.frame(frame);
        }
    }
}
