//! Outgoing dispatch queue feeding the writer task.
//!
//! Commands land in one of six lanes served in strict precedence. DATA (and
//! trailers, which must follow their stream's DATA) go to per-stream
//! sub-queues; each dequeue starts the scan at a random sub-queue so no
//! stream can starve the others.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::settings::Http2Settings;
use crate::transport::h2::frame::ErrorCode;
use crate::transport::h2::hpack::HeaderField;
use crate::transport::h2::stream::Stream;

/// Default idle threshold before an empty data sub-queue is dropped.
pub const DEFAULT_DATA_IDLE_THRESHOLD: Duration = Duration::from_secs(120);

/// Priority lanes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    SessionControl,
    Headers,
    Ping,
    StreamControl,
    Data,
    Idle,
}

/// Unit of work for the writer.
#[derive(Debug)]
pub enum Command {
    /// Client connection preface.
    Prefix,
    /// Initial SETTINGS.
    Settings(Http2Settings),
    SettingsAck,
    /// SETTINGS sent after activation; applied locally once ACKed.
    UpdateLocalSettings(Http2Settings),
    Headers {
        stream_id: u32,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        fields: Vec<HeaderField>,
    },
    /// Trailer block; queued behind the stream's DATA.
    Trailers {
        stream: Arc<Stream>,
        fields: Vec<HeaderField>,
    },
    /// DATA frame whose credit was already debited from both windows.
    Data {
        stream: Arc<Stream>,
        data: Bytes,
        end_stream: bool,
    },
    Ping {
        data: [u8; 8],
        ack: bool,
        /// Scheduler-issued keepalive, served only when nothing else waits.
        keepalive: bool,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
}

impl Command {
    pub fn lane(&self) -> Lane {
        match self {
            Self::Prefix
            | Self::Settings(_)
            | Self::SettingsAck
            | Self::UpdateLocalSettings(_)
            | Self::GoAway { .. } => Lane::SessionControl,
            Self::Headers { .. } | Self::PushPromise { .. } => Lane::Headers,
            Self::Ping {
                keepalive: true, ..
            } => Lane::Idle,
            Self::Ping { .. } => Lane::Ping,
            Self::RstStream { .. } | Self::WindowUpdate { .. } => Lane::StreamControl,
            Self::Data { .. } | Self::Trailers { .. } => Lane::Data,
        }
    }

    /// Stream whose data sub-queue carries this command.
    fn data_stream_id(&self) -> Option<u32> {
        match self {
            Self::Data { stream, .. } | Self::Trailers { stream, .. } => Some(stream.id()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct DataSubQueue {
    frames: VecDeque<Command>,
    last_touched: Instant,
}

#[derive(Debug)]
struct QueueInner {
    /// FIFO lanes indexed by `fifo_index`.
    fifos: [VecDeque<Command>; 5],
    data: HashMap<u32, DataSubQueue>,
    /// Sub-queue ids in insertion order, for random selection.
    data_order: Vec<u32>,
    last_prune: Instant,
    disposed: bool,
}

const SESSION_CONTROL: usize = 0;
const HEADERS: usize = 1;
const PING: usize = 2;
const STREAM_CONTROL: usize = 3;
const IDLE: usize = 4;

/// FIFO slot for a lane; the data lane has none.
fn fifo_index(lane: Lane) -> Option<usize> {
    match lane {
        Lane::SessionControl => Some(SESSION_CONTROL),
        Lane::Headers => Some(HEADERS),
        Lane::Ping => Some(PING),
        Lane::StreamControl => Some(STREAM_CONTROL),
        Lane::Idle => Some(IDLE),
        Lane::Data => None,
    }
}

impl QueueInner {
    fn take(&mut self, idle_threshold: Duration) -> Option<Command> {
        for idx in [SESSION_CONTROL, HEADERS, PING, STREAM_CONTROL] {
            if let Some(cmd) = self.fifos[idx].pop_front() {
                return Some(cmd);
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_prune) >= idle_threshold / 4 {
            self.prune(now, idle_threshold);
        }

        if let Some(cmd) = self.take_data(now) {
            return Some(cmd);
        }

        self.fifos[IDLE].pop_front()
    }

    fn take_data(&mut self, now: Instant) -> Option<Command> {
        let count = self.data_order.len();
        if count == 0 {
            return None;
        }
        let start = rand::rng().random_range(0..count);
        for offset in 0..count {
            let id = self.data_order[(start + offset) % count];
            if let Some(sub) = self.data.get_mut(&id) {
                if let Some(cmd) = sub.frames.pop_front() {
                    sub.last_touched = now;
                    return Some(cmd);
                }
            }
        }
        None
    }

    fn prune(&mut self, now: Instant, idle_threshold: Duration) -> usize {
        let before = self.data.len();
        self.data.retain(|_, sub| {
            !(sub.frames.is_empty() && now.duration_since(sub.last_touched) > idle_threshold)
        });
        let data = &self.data;
        self.data_order.retain(|id| data.contains_key(id));
        self.last_prune = now;
        before - self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.fifos.iter().all(VecDeque::is_empty)
            && self.data.values().all(|sub| sub.frames.is_empty())
    }
}

/// Multi-lane priority queue drained by the single writer task.
#[derive(Debug)]
pub struct OutgoingDispatchQueue {
    inner: Mutex<QueueInner>,
    ready: Notify,
    drained: Notify,
    idle_threshold: Duration,
}

impl OutgoingDispatchQueue {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                fifos: Default::default(),
                data: HashMap::new(),
                data_order: Vec::new(),
                last_prune: Instant::now(),
                disposed: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
            idle_threshold,
        }
    }

    /// Add a command. Returns it back once the queue has been disposed.
    pub fn enqueue(&self, cmd: Command) -> std::result::Result<(), Command> {
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return Err(cmd);
            }
            match fifo_index(cmd.lane()) {
                Some(idx) => inner.fifos[idx].push_back(cmd),
                None => {
                    let id = cmd.data_stream_id().unwrap_or_default();
                    let now = Instant::now();
                    let inner = &mut *inner;
                    let sub = inner.data.entry(id).or_insert_with(|| {
                        inner.data_order.push(id);
                        DataSubQueue {
                            frames: VecDeque::new(),
                            last_touched: now,
                        }
                    });
                    sub.frames.push_back(cmd);
                    sub.last_touched = now;
                }
            }
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Highest-precedence command, if any, without waiting.
    pub fn try_dequeue(&self) -> Option<Command> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        let cmd = inner.take(self.idle_threshold);
        if inner.is_empty() {
            self.drained.notify_waiters();
        }
        cmd
    }

    /// Wait for the next command. `None` once the queue is disposed.
    pub async fn dequeue(&self) -> Option<Command> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.disposed {
                    return None;
                }
                if let Some(cmd) = inner.take(self.idle_threshold) {
                    if inner.is_empty() {
                        self.drained.notify_waiters();
                    }
                    return Some(cmd);
                }
            }
            notified.await;
        }
    }

    /// Wait until every queued command has been handed to the writer.
    pub async fn wait_drained(&self) {
        let notified = self.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let inner = self.inner.lock();
            if inner.disposed || inner.is_empty() {
                return;
            }
        }
        notified.await;
    }

    /// Drop data sub-queues that are empty and untouched for longer than the
    /// idle threshold. Returns how many were removed.
    pub fn prune_idle(&self, now: Instant) -> usize {
        self.inner.lock().prune(now, self.idle_threshold)
    }

    /// Number of per-stream data sub-queues currently tracked.
    pub fn data_queue_count(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Stop accepting work, wake the writer, and hand back what was queued.
    pub fn dispose(&self) -> Vec<Command> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.disposed = true;
            let mut drained: Vec<Command> = Vec::new();
            for fifo in inner.fifos.iter_mut() {
                drained.extend(fifo.drain(..));
            }
            for (_, mut sub) in inner.data.drain() {
                drained.extend(sub.frames.drain(..));
            }
            inner.data_order.clear();
            drained
        };
        self.ready.notify_waiters();
        self.ready.notify_one();
        self.drained.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use tokio_util::sync::CancellationToken;

    fn stream(id: u32) -> Arc<Stream> {
        Arc::new(Stream::new(
            id,
            65_535,
            65_535,
            CancellationToken::new(),
            Weak::new(),
        ))
    }

    fn data(stream: &Arc<Stream>, byte: u8) -> Command {
        Command::Data {
            stream: Arc::clone(stream),
            data: Bytes::from(vec![byte; 4]),
            end_stream: false,
        }
    }

    fn ping(keepalive: bool) -> Command {
        Command::Ping {
            data: [0; 8],
            ack: !keepalive,
            keepalive,
        }
    }

    #[test]
    fn test_lane_precedence() {
        let queue = OutgoingDispatchQueue::new(DEFAULT_DATA_IDLE_THRESHOLD);
        let s1 = stream(1);

        queue.enqueue(data(&s1, 1)).unwrap();
        queue.enqueue(ping(false)).unwrap();
        queue.enqueue(Command::SettingsAck).unwrap();
        queue
            .enqueue(Command::Headers {
                stream_id: 3,
                fields: Vec::new(),
                end_stream: true,
            })
            .unwrap();

        let lanes: Vec<Lane> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|cmd| cmd.lane())
            .collect();
        assert_eq!(
            lanes,
            vec![Lane::SessionControl, Lane::Headers, Lane::Ping, Lane::Data]
        );
    }

    #[test]
    fn test_keepalive_waits_for_everything_else() {
        let queue = OutgoingDispatchQueue::new(DEFAULT_DATA_IDLE_THRESHOLD);
        let s1 = stream(1);

        queue.enqueue(ping(true)).unwrap();
        queue.enqueue(data(&s1, 1)).unwrap();
        queue
            .enqueue(Command::WindowUpdate {
                stream_id: 0,
                increment: 10,
            })
            .unwrap();

        assert_eq!(queue.try_dequeue().unwrap().lane(), Lane::StreamControl);
        assert_eq!(queue.try_dequeue().unwrap().lane(), Lane::Data);
        assert_eq!(queue.try_dequeue().unwrap().lane(), Lane::Idle);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_per_stream_data_order_is_fifo() {
        let queue = OutgoingDispatchQueue::new(DEFAULT_DATA_IDLE_THRESHOLD);
        let s1 = stream(1);
        let s3 = stream(3);
        for byte in 0..5 {
            queue.enqueue(data(&s1, byte)).unwrap();
            queue.enqueue(data(&s3, 100 + byte)).unwrap();
        }

        let mut seen_s1 = Vec::new();
        let mut seen_s3 = Vec::new();
        while let Some(Command::Data { stream, data, .. }) = queue.try_dequeue() {
            if stream.id() == 1 {
                seen_s1.push(data[0]);
            } else {
                seen_s3.push(data[0]);
            }
        }
        assert_eq!(seen_s1, vec![0, 1, 2, 3, 4]);
        assert_eq!(seen_s3, vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn test_trailers_follow_data() {
        let queue = OutgoingDispatchQueue::new(DEFAULT_DATA_IDLE_THRESHOLD);
        let s1 = stream(1);
        queue.enqueue(data(&s1, 1)).unwrap();
        queue
            .enqueue(Command::Trailers {
                stream: Arc::clone(&s1),
                fields: vec![HeaderField::new("grpc-status", "0")],
            })
            .unwrap();

        assert!(matches!(queue.try_dequeue(), Some(Command::Data { .. })));
        assert!(matches!(queue.try_dequeue(), Some(Command::Trailers { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sub_queue_is_pruned() {
        let threshold = Duration::from_secs(120);
        let queue = OutgoingDispatchQueue::new(threshold);
        let idle = stream(1);
        let busy = stream(3);

        queue.enqueue(data(&idle, 1)).unwrap();
        assert!(queue.try_dequeue().is_some());

        tokio::time::advance(Duration::from_secs(100)).await;
        queue.enqueue(data(&busy, 2)).unwrap();
        queue.enqueue(data(&busy, 3)).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(queue.prune_idle(Instant::now()), 1);
        assert_eq!(queue.data_queue_count(), 1);

        // The busy stream keeps its frames
        assert!(matches!(
            queue.try_dequeue(),
            Some(Command::Data { ref stream, .. }) if stream.id() == 3
        ));
        assert!(queue.try_dequeue().is_some());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(OutgoingDispatchQueue::new(DEFAULT_DATA_IDLE_THRESHOLD));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(Command::Prefix).unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(cmd, Some(Command::Prefix)));
    }

    #[tokio::test]
    async fn test_dispose_releases_waiter() {
        let queue = Arc::new(OutgoingDispatchQueue::new(DEFAULT_DATA_IDLE_THRESHOLD));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        let drained = queue.dispose();
        assert!(drained.is_empty());

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(queue.enqueue(Command::SettingsAck).is_err());
    }
}
