//! Session pooling.
//!
//! One HTTP/2 session serves many concurrent requests, so the pool keeps a
//! small number of live sessions per destination and hands out whichever
//! can still open a stream.

pub mod manager;

pub use manager::{ManagerConfig, ManagerStats, SessionKey, SessionManager};
