//! Per-stream state: lifecycle, windows, and the pipes between the reader
//! task and the application.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::header::HeaderName;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::h2::flow::FlowControlWindow;
use crate::transport::h2::frame::ErrorCode;
use crate::transport::h2::message::ResponseHead;
use crate::transport::h2::session::SessionInner;

/// Stream states (RFC 9113 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, ReservedLocal | ReservedRemote | Open)
                | (ReservedLocal, HalfClosedRemote | Closed)
                | (ReservedRemote, HalfClosedLocal | Closed)
                | (Open, HalfClosedRemote | HalfClosedLocal | Closed)
                | (HalfClosedRemote, Closed)
                | (HalfClosedLocal, Closed)
        )
    }

    /// Peer may still send DATA.
    pub fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// We may still send DATA.
    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }
}

/// Event delivered from the reader task to a stream's consumer.
#[derive(Debug)]
pub(crate) enum RecvEvent {
    Data(Bytes),
    Trailers(HeaderMap),
    Error(Error),
}

pub(crate) type HeadSender = oneshot::Sender<Result<ResponseHead>>;
pub(crate) type HeadReceiver = oneshot::Receiver<Result<ResponseHead>>;

/// One logical exchange on the session.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    state: Mutex<StreamState>,
    send_window: Arc<FlowControlWindow>,
    recv_window: FlowControlWindow,
    /// Bytes handed to the consumer pipe but not yet read.
    buffered: AtomicU32,
    recv_tx: Mutex<Option<mpsc::UnboundedSender<RecvEvent>>>,
    recv_rx: Mutex<Option<mpsc::UnboundedReceiver<RecvEvent>>>,
    head_tx: Mutex<Option<HeadSender>>,
    head_rx: Mutex<Option<HeadReceiver>>,
    declared_trailers: Mutex<Option<Vec<HeaderName>>>,
    cancel: CancellationToken,
    reset: AtomicBool,
    session: Weak<SessionInner>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        send_window: u32,
        recv_window: u32,
        cancel: CancellationToken,
        session: Weak<SessionInner>,
    ) -> Self {
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let (head_tx, head_rx) = oneshot::channel();
        Self {
            id,
            state: Mutex::new(StreamState::Idle),
            send_window: Arc::new(FlowControlWindow::new(send_window)),
            recv_window: FlowControlWindow::new(recv_window),
            buffered: AtomicU32::new(0),
            recv_tx: Mutex::new(Some(recv_tx)),
            recv_rx: Mutex::new(Some(recv_rx)),
            head_tx: Mutex::new(Some(head_tx)),
            head_rx: Mutex::new(Some(head_rx)),
            declared_trailers: Mutex::new(None),
            cancel,
            reset: AtomicBool::new(false),
            session,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Stream was reset by either side.
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    pub(crate) fn session(&self) -> Option<Arc<SessionInner>> {
        self.session.upgrade()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn send_window(&self) -> &Arc<FlowControlWindow> {
        &self.send_window
    }

    pub(crate) fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// Move along one edge of the lifecycle graph.
    pub fn transition(&self, to: StreamState) -> Result<StreamState> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition { from, to });
            }
            *state = to;
            from
        };
        tracing::trace!("stream {}: {:?} -> {:?}", self.id, from, to);
        if to == StreamState::Closed {
            self.on_closed();
        }
        Ok(from)
    }

    /// Apply the transitions for sending a header block.
    pub(crate) fn send_headers(&self, end_stream: bool) -> Result<()> {
        match self.state() {
            StreamState::Idle => {
                self.transition(StreamState::Open)?;
            }
            StreamState::ReservedLocal => {
                self.transition(StreamState::HalfClosedRemote)?;
            }
            state if state.can_send() => {}
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: StreamState::Open,
                })
            }
        }
        if end_stream {
            self.close_local()?;
        }
        Ok(())
    }

    /// Apply the transitions for receiving a header block.
    pub(crate) fn recv_headers(&self, end_stream: bool) -> Result<()> {
        match self.state() {
            StreamState::Idle => {
                self.transition(StreamState::Open)?;
            }
            StreamState::ReservedRemote => {
                self.transition(StreamState::HalfClosedLocal)?;
            }
            state if state.can_recv() => {}
            _ => {
                return Err(Error::stream(
                    self.id,
                    ErrorCode::StreamClosed,
                    "HEADERS on a stream closed for receiving",
                ))
            }
        }
        if end_stream {
            self.close_remote()?;
        }
        Ok(())
    }

    /// We sent END_STREAM.
    pub(crate) fn close_local(&self) -> Result<()> {
        let to = match self.state() {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: StreamState::HalfClosedLocal,
                })
            }
        };
        self.transition(to).map(|_| ())
    }

    /// Peer sent END_STREAM.
    pub(crate) fn close_remote(&self) -> Result<()> {
        let to = match self.state() {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: StreamState::HalfClosedRemote,
                })
            }
        };
        self.finish_recv();
        self.transition(to).map(|_| ())
    }

    /// Jump to Closed from any live state (reset, session failure).
    ///
    /// Returns false when the stream was already closed.
    pub(crate) fn force_close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == StreamState::Closed {
                return false;
            }
            *state = StreamState::Closed;
        }
        self.on_closed();
        true
    }

    pub(crate) fn mark_reset(&self) -> bool {
        !self.reset.swap(true, Ordering::AcqRel)
    }

    fn on_closed(&self) {
        self.cancel.cancel();
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(self.id);
        }
    }

    /// Reset from the application side: RST_STREAM unless already closed.
    pub fn reset(&self, code: ErrorCode) {
        match self.session.upgrade() {
            Some(session) => session.reset_stream(self, code),
            None => {
                self.mark_reset();
                self.force_close();
            }
        }
    }

    pub(crate) fn set_declared_trailers(&self, names: Option<Vec<HeaderName>>) {
        *self.declared_trailers.lock() = names;
    }

    pub(crate) fn declared_trailers(&self) -> Option<Vec<HeaderName>> {
        self.declared_trailers.lock().clone()
    }

    /// Hand the response head to whoever is waiting for it.
    pub(crate) fn deliver_head(&self, head: ResponseHead) -> bool {
        match self.head_tx.lock().take() {
            Some(tx) => tx.send(Ok(head)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn head_pending(&self) -> bool {
        self.head_tx.lock().is_some()
    }

    pub(crate) fn take_head_receiver(&self) -> Option<HeadReceiver> {
        self.head_rx.lock().take()
    }

    pub(crate) fn take_recv_receiver(&self) -> Option<mpsc::UnboundedReceiver<RecvEvent>> {
        self.recv_rx.lock().take()
    }

    /// Queue received body bytes for the consumer. Returns false when nobody
    /// is left to read them, so their credit is owed back at once.
    pub(crate) fn push_data(&self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        let len = data.len() as u32;
        if let Some(tx) = self.recv_tx.lock().as_ref() {
            if tx.send(RecvEvent::Data(data)).is_ok() {
                self.buffered.fetch_add(len, Ordering::AcqRel);
                return true;
            }
        }
        false
    }

    /// Forget bytes queued for a consumer that went away unread.
    pub(crate) fn discard_buffered(&self) {
        self.buffered.store(0, Ordering::Release);
    }

    pub(crate) fn push_trailers(&self, trailers: HeaderMap) {
        if let Some(tx) = self.recv_tx.lock().as_ref() {
            let _ = tx.send(RecvEvent::Trailers(trailers));
        }
    }

    /// No more inbound events: the consumer sees end of stream.
    pub(crate) fn finish_recv(&self) {
        self.recv_tx.lock().take();
    }

    /// Fail every waiter on this stream with `err`.
    pub(crate) fn fail(&self, err: Error) {
        if let Some(tx) = self.head_tx.lock().take() {
            let _ = tx.send(Err(err.duplicate()));
        }
        if let Some(tx) = self.recv_tx.lock().take() {
            let _ = tx.send(RecvEvent::Error(err));
        }
    }

    /// Consumer read `len` bytes; returns a WINDOW_UPDATE increment if the
    /// stream's inbound window should be replenished toward `target`.
    pub(crate) fn consumed(&self, len: u32, target: u32) -> Option<u32> {
        let prev = self.buffered.fetch_sub(len, Ordering::AcqRel);
        let held = prev.saturating_sub(len);
        if !self.state().can_recv() {
            return None;
        }
        self.recv_window.replenish(target, held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(id: u32) -> Stream {
        Stream::new(id, 65_535, 65_535, CancellationToken::new(), Weak::new())
    }

    #[test]
    fn test_transition_graph() {
        use StreamState::*;
        let all = [
            Idle,
            ReservedLocal,
            ReservedRemote,
            Open,
            HalfClosedLocal,
            HalfClosedRemote,
            Closed,
        ];
        let allowed = [
            (Idle, ReservedLocal),
            (Idle, ReservedRemote),
            (Idle, Open),
            (ReservedLocal, HalfClosedRemote),
            (ReservedLocal, Closed),
            (ReservedRemote, HalfClosedLocal),
            (ReservedRemote, Closed),
            (Open, HalfClosedRemote),
            (Open, HalfClosedLocal),
            (Open, Closed),
            (HalfClosedRemote, Closed),
            (HalfClosedLocal, Closed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let stream = detached(1);
        let err = stream.transition(StreamState::HalfClosedLocal).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: StreamState::Idle,
                to: StreamState::HalfClosedLocal
            }
        ));
        assert_eq!(stream.state(), StreamState::Idle);
    }

    #[test]
    fn test_request_response_lifecycle() {
        let stream = detached(1);
        stream.send_headers(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        stream.recv_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        stream.close_remote().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.cancel_token().is_cancelled());
    }

    #[test]
    fn test_push_lifecycle() {
        let pushed = detached(2);
        pushed.transition(StreamState::ReservedLocal).unwrap();
        pushed.send_headers(false).unwrap();
        assert_eq!(pushed.state(), StreamState::HalfClosedRemote);
        pushed.close_local().unwrap();
        assert_eq!(pushed.state(), StreamState::Closed);

        let promised = detached(4);
        promised.transition(StreamState::ReservedRemote).unwrap();
        promised.recv_headers(true).unwrap();
        assert_eq!(promised.state(), StreamState::Closed);
    }

    #[test]
    fn test_headers_after_remote_close_is_stream_closed() {
        let stream = detached(3);
        stream.recv_headers(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        let err = stream.recv_headers(false).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::StreamClosed));
    }

    #[test]
    fn test_force_close_once() {
        let stream = detached(5);
        stream.send_headers(false).unwrap();
        assert!(stream.force_close());
        assert!(!stream.force_close());
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_fail_reaches_head_and_body_waiters() {
        let stream = detached(7);
        let head = stream.take_head_receiver().unwrap();
        let mut body = stream.take_recv_receiver().unwrap();

        stream.fail(Error::StreamReset {
            stream_id: 7,
            code: ErrorCode::Cancel,
        });

        assert!(matches!(head.await.unwrap(), Err(Error::StreamReset { .. })));
        assert!(matches!(body.recv().await, Some(RecvEvent::Error(_))));
        assert!(body.recv().await.is_none());
    }

    #[test]
    fn test_consumed_replenishes_after_half_window() {
        let stream = detached(9);
        stream.send_headers(false).unwrap();
        let _rx = stream.take_recv_receiver().unwrap();

        stream.recv_window().debit(40_000);
        stream.push_data(Bytes::from(vec![0u8; 40_000]));
        assert_eq!(stream.consumed(10_000, 65_535), Some(65_535 - 25_535 - 30_000));
        assert_eq!(stream.consumed(30_000, 65_535), None);
    }
}
