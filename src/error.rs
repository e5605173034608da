//! Error types for the h2mux crate.

use std::io;
use std::time::Duration;

use crate::transport::h2::frame::ErrorCode;
use crate::transport::h2::stream::StreamState;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an HTTP/2 session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection-level protocol violation. Terminates the session with GOAWAY.
    #[error("connection error {code:?}: {message}")]
    Connection { code: ErrorCode, message: String },

    /// Stream-level protocol violation. Resets only the offending stream.
    #[error("stream {stream_id} error {code:?}: {message}")]
    Stream {
        stream_id: u32,
        code: ErrorCode,
        message: String,
    },

    /// Peer reset the stream with RST_STREAM.
    #[error("stream {stream_id} reset by peer: {code:?}")]
    StreamReset { stream_id: u32, code: ErrorCode },

    /// Peer sent GOAWAY and will not process this stream.
    #[error("GOAWAY received ({code:?}), last_stream_id={last_stream_id}")]
    GoAway { last_stream_id: u32, code: ErrorCode },

    /// Operation cancelled by the caller or by session shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Peer closed the transport.
    #[error("transport closed by peer")]
    TransportClosed,

    /// IO error on the transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP/2 SETTINGS_TIMEOUT error (RFC 9113 Section 7).
    #[error("SETTINGS_TIMEOUT (0x04): No SETTINGS frame received within {0:?}")]
    SettingsTimeout(Duration),

    /// `begin_*_session` called on a session that already started.
    #[error("session already started")]
    AlreadyStarted,

    /// Session is not active (never started, shutting down or closed).
    #[error("session is not active")]
    SessionClosed,

    /// Local configuration rejected before anything hit the wire.
    #[error("configuration error: {0}")]
    Config(String),

    /// Peer's MAX_CONCURRENT_STREAMS reached for locally initiated streams.
    #[error("concurrent stream limit reached ({0})")]
    ConcurrencyLimit(u32),

    /// Every pooled session for the destination is busy and the pool is full.
    #[error("no session available for {0}")]
    PoolExhausted(String),

    /// Locally initiated stream ids exhausted; open a new session.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// Stream state machine rejected a transition.
    #[error("invalid stream state transition {from:?} -> {to:?}")]
    InvalidTransition { from: StreamState, to: StreamState },

    /// Stream id is not in the active table.
    #[error("unknown stream {0}")]
    UnknownStream(u32),

    /// Malformed message at the HTTP semantic layer (pseudo-headers, status).
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// Error building an `http` request or response.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

impl Error {
    /// Create a connection-level error.
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Connection {
            code,
            message: message.into(),
        }
    }

    /// Create a stream-level error.
    pub fn stream(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Stream {
            stream_id,
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// HTTP/2 error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Connection { code, .. }
            | Self::Stream { code, .. }
            | Self::StreamReset { code, .. }
            | Self::GoAway { code, .. } => Some(*code),
            Self::SettingsTimeout(_) => Some(ErrorCode::SettingsTimeout),
            _ => None,
        }
    }

    /// True when the peer closing the connection caused this error.
    ///
    /// Logged at reduced severity: a peer hanging up is expected.
    pub fn is_transport_closed(&self) -> bool {
        match self {
            Self::TransportClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// True for cancellation, which is never treated as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Copy of this error suitable for fanning out to every waiter of a
    /// failed session. IO errors keep their kind but not their source.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Connection { code, message } => Self::connection(*code, message.clone()),
            Self::Stream {
                stream_id,
                code,
                message,
            } => Self::stream(*stream_id, *code, message.clone()),
            Self::StreamReset { stream_id, code } => Self::StreamReset {
                stream_id: *stream_id,
                code: *code,
            },
            Self::GoAway {
                last_stream_id,
                code,
            } => Self::GoAway {
                last_stream_id: *last_stream_id,
                code: *code,
            },
            Self::Cancelled => Self::Cancelled,
            Self::TransportClosed => Self::TransportClosed,
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::SettingsTimeout(d) => Self::SettingsTimeout(*d),
            Self::AlreadyStarted => Self::AlreadyStarted,
            Self::SessionClosed => Self::SessionClosed,
            Self::Config(m) => Self::Config(m.clone()),
            Self::ConcurrencyLimit(n) => Self::ConcurrencyLimit(*n),
            Self::PoolExhausted(key) => Self::PoolExhausted(key.clone()),
            Self::StreamIdsExhausted => Self::StreamIdsExhausted,
            Self::InvalidTransition { from, to } => Self::InvalidTransition {
                from: *from,
                to: *to,
            },
            Self::UnknownStream(id) => Self::UnknownStream(*id),
            Self::HttpProtocol(m) => Self::HttpProtocol(m.clone()),
            Self::Http(e) => Self::HttpProtocol(e.to_string()),
        }
    }
}
