//! Session configuration.
//!
//! Everything here is local policy; nothing is negotiated with the peer
//! (that is [`Http2Settings`](crate::settings::Http2Settings)).
//!
//! # Timers
//!
//! - **settings_timeout**: deadline for the peer's first SETTINGS frame.
//! - **shutdown_timeout**: how long `shutdown` waits for GOAWAY to be flushed.
//! - **ping_interval**: keepalive PING cadence. `None` disables keepalives.
//! - **data_idle_threshold**: an empty per-stream data sub-queue untouched for
//!   this long is dropped.
//! - **push_max_age**: unclaimed server pushes older than this are reset.

use std::time::Duration;

use crate::transport::h2::flow::DEFAULT_INITIAL_WINDOW_SIZE;
use crate::transport::h2::frame::{MAX_STREAM_ID, MAX_WINDOW_SIZE};
use crate::transport::h2::queue::DEFAULT_DATA_IDLE_THRESHOLD;

/// Local policy for one session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Keepalive PING interval.
    ///
    /// Default: 30s
    pub ping_interval: Option<Duration>,

    /// Deadline for the peer's initial SETTINGS frame.
    ///
    /// Default: 10s
    pub settings_timeout: Duration,

    /// Bound on waiting for the GOAWAY flush during shutdown.
    ///
    /// Default: 5s
    pub shutdown_timeout: Duration,

    /// Highest stream id this side will initiate. Once used up the session
    /// reports itself unavailable.
    ///
    /// Default: 2^31-1
    pub max_local_stream_id: u32,

    /// How many locally reset stream ids are remembered to absorb frames
    /// already in flight.
    ///
    /// Default: 10
    pub recently_reset_capacity: usize,

    /// Default: 2 minutes
    pub data_idle_threshold: Duration,

    /// Default: 30s
    pub push_max_age: Duration,

    /// Maximum unclaimed server pushes kept; the oldest are pruned first.
    ///
    /// Default: 32
    pub push_max_count: usize,

    /// Incoming requests buffered before new peer streams are refused.
    ///
    /// Default: 128
    pub incoming_capacity: usize,

    /// Connection-level receive window. Values above 65535 are announced
    /// with a WINDOW_UPDATE right after the initial SETTINGS. The window can
    /// not start below 65535, so smaller values are raised to it.
    ///
    /// Default: 65535
    pub connection_window_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Some(Duration::from_secs(30)),
            settings_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            max_local_stream_id: MAX_STREAM_ID,
            recently_reset_capacity: 10,
            data_idle_threshold: DEFAULT_DATA_IDLE_THRESHOLD,
            push_max_age: Duration::from_secs(30),
            push_max_count: 32,
            incoming_capacity: 128,
            connection_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
        }
    }
}

impl SessionConfig {
    /// Defaults tuned for bulk transfer: a 16MB connection window and
    /// slower keepalives.
    pub fn bulk_defaults() -> Self {
        Self {
            ping_interval: Some(Duration::from_secs(60)),
            connection_window_size: 16 * 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_settings_timeout(mut self, timeout: Duration) -> Self {
        self.settings_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_local_stream_id(mut self, id: u32) -> Self {
        self.max_local_stream_id = id.min(MAX_STREAM_ID);
        self
    }

    pub fn with_recently_reset_capacity(mut self, capacity: usize) -> Self {
        self.recently_reset_capacity = capacity;
        self
    }

    pub fn with_data_idle_threshold(mut self, threshold: Duration) -> Self {
        self.data_idle_threshold = threshold;
        self
    }

    pub fn with_push_max_age(mut self, age: Duration) -> Self {
        self.push_max_age = age;
        self
    }

    pub fn with_push_max_count(mut self, count: usize) -> Self {
        self.push_max_count = count;
        self
    }

    pub fn with_incoming_capacity(mut self, capacity: usize) -> Self {
        self.incoming_capacity = capacity.max(1);
        self
    }

    pub fn with_connection_window_size(mut self, size: u32) -> Self {
        self.connection_window_size = size;
        self.normalized()
    }

    /// Pull fields set directly on the struct back into their legal ranges.
    pub(crate) fn normalized(mut self) -> Self {
        self.connection_window_size = self
            .connection_window_size
            .clamp(DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE);
        self.max_local_stream_id = self.max_local_stream_id.min(MAX_STREAM_ID);
        self.incoming_capacity = self.incoming_capacity.max(1);
        self
    }
}
