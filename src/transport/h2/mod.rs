//! HTTP/2 session engine.
//!
//! One [`Session`] multiplexes many concurrent request/response exchanges
//! over a single transport. Three background tasks drive it: the reader
//! decodes frames and routes them to streams, the writer drains the
//! [`OutgoingDispatchQueue`](queue::OutgoingDispatchQueue) onto the wire,
//! and the ping task runs keepalives and housekeeping.
//!
//! ## Usage
//!
//! ```no_run
//! use h2mux::{Body, Http2Settings, Session, SessionConfig};
//! use http::Request;
//!
//! # async fn example(io: tokio::net::TcpStream) -> h2mux::Result<()> {
//! let session = Session::new(io, SessionConfig::default());
//! session
//!     .begin_client_session(Http2Settings::client(), "example.com", "http")
//!     .await?;
//!
//! let request = Request::get("/").body(Body::empty())?;
//! let mut response = session.make_request(request).await?;
//! let body = response.body_mut().collect().await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod flow;
pub mod frame;
pub mod hpack;
pub mod message;
pub mod push;
pub mod queue;
pub mod session;
pub mod stream;

pub use body::{Body, RecvStream, SendStream};
pub use frame::{ErrorCode, Frame, FrameCodec, Http2FrameCodec};
pub use hpack::{HeaderCodec, HeaderField, HpackCodec};
pub use session::{
    Codecs, IncomingRequest, PushPromiseHandle, Role, Session, SessionState, TrailerProvider,
};
pub use stream::StreamState;
