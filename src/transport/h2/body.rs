//! Message bodies: what the application hands to the session and what it
//! reads back.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::h2::frame::ErrorCode;
use crate::transport::h2::stream::{RecvEvent, Stream, StreamState};

/// Outgoing message body.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    /// Chunks are sent as they arrive; the body ends when the sender drops.
    Channel(mpsc::Receiver<Bytes>),
}

impl Body {
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Body with nothing to send: headers carry END_STREAM.
    pub fn is_end_stream(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(bytes) => bytes.is_empty(),
            Self::Channel(_) => false,
        }
    }

    /// Streaming body plus the sender feeding it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::Channel(rx))
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Full(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

/// Inbound body of one stream.
///
/// Reading releases flow-control credit back to the peer. Dropping a
/// response body before it finished resets the stream with CANCEL.
#[derive(Debug)]
pub struct RecvStream {
    stream: Arc<Stream>,
    rx: Option<mpsc::UnboundedReceiver<RecvEvent>>,
    trailers: Option<HeaderMap>,
    done: bool,
    reset_on_drop: bool,
}

impl RecvStream {
    pub(crate) fn new(stream: Arc<Stream>, reset_on_drop: bool) -> Self {
        let rx = stream.take_recv_receiver();
        let done = rx.is_none();
        Self {
            stream,
            rx,
            trailers: None,
            done,
            reset_on_drop,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream.id()
    }

    /// Next chunk of body data. `None` at end of stream.
    pub async fn data(&mut self) -> Option<Result<Bytes>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Some(RecvEvent::Data(bytes)) => {
                    if let Some(session) = self.stream.session() {
                        session.stream_consumed(&self.stream, bytes.len() as u32);
                    }
                    return Some(Ok(bytes));
                }
                Some(RecvEvent::Trailers(trailers)) => {
                    self.trailers = Some(trailers);
                }
                Some(RecvEvent::Error(err)) => {
                    self.done = true;
                    self.rx = None;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Read the rest of the body into one buffer.
    pub async fn collect(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.data().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Trailers, available once the body has been read to the end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Whole body has been consumed.
    pub fn is_end_stream(&self) -> bool {
        self.done
    }
}

impl Drop for RecvStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.reset_on_drop {
            if self.stream.state().can_recv() {
                tracing::debug!("stream {}: body dropped unread, cancelling", self.stream.id());
                self.stream.reset(ErrorCode::Cancel);
            }
            return;
        }
        // Unread request bytes are credited back from here on.
        self.rx = None;
        self.stream.discard_buffered();
        match self.stream.state() {
            StreamState::HalfClosedLocal => {
                tracing::debug!("stream {}: response done, request body unread", self.stream.id());
                self.stream.reset(ErrorCode::NoError);
            }
            state if state.can_recv() => {
                if let Some(session) = self.stream.session() {
                    session.stream_consumed(&self.stream, 0);
                }
            }
            _ => {}
        }
    }
}

/// Outbound half of a byte-stream view of one stream.
///
/// Dropping it without [`finish`](Self::finish) ends the stream gracefully.
#[derive(Debug)]
pub struct SendStream {
    stream: Arc<Stream>,
    finished: bool,
}

impl SendStream {
    pub(crate) fn new(stream: Arc<Stream>) -> Self {
        Self {
            stream,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream.id()
    }

    /// Send `data`, waiting for flow-control credit as needed.
    pub async fn send_data(&mut self, data: Bytes) -> Result<()> {
        if self.finished {
            return Err(Error::stream(
                self.stream.id(),
                ErrorCode::StreamClosed,
                "send after finish",
            ));
        }
        let session = self.stream.session().ok_or(Error::SessionClosed)?;
        session.send_data(&self.stream, data, false).await
    }

    /// Send END_STREAM.
    pub async fn finish(mut self) -> Result<()> {
        self.finished = true;
        let session = self.stream.session().ok_or(Error::SessionClosed)?;
        session.send_data(&self.stream, Bytes::new(), true).await
    }

    /// Abort the stream with RST_STREAM.
    pub fn reset(mut self, code: ErrorCode) {
        self.finished = true;
        self.stream.reset(code);
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if self.finished || !self.stream.state().can_send() {
            return;
        }
        if let Some(session) = self.stream.session() {
            session.end_stream(&self.stream);
        }
    }
}
