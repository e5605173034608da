//! # h2mux
//!
//! Multiplexed HTTP/2 session engine.
//!
//! A [`Session`] runs many concurrent request/response exchanges over one
//! ordered byte stream: stream lifecycle, connection- and stream-level flow
//! control, prioritized frame dispatch, settings negotiation, and server
//! push. [`SessionManager`] pools sessions per destination and can bootstrap
//! one from an HTTP/1.1 `Upgrade: h2c` request.

pub mod config;
pub mod error;
pub mod pool;
pub mod settings;
pub mod transport;
pub mod upgrade;

// Re-exports
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use pool::{ManagerConfig, SessionKey, SessionManager};
pub use settings::Http2Settings;
pub use transport::h2::{
    Body, ErrorCode, IncomingRequest, PushPromiseHandle, RecvStream, Role, SendStream, Session,
    SessionState, StreamState, TrailerProvider,
};
pub use transport::{Negotiated, Transport};
