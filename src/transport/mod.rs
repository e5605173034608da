//! Byte transports a session runs over.
//!
//! A session only needs an ordered, reliable, bidirectional byte stream.
//! TLS and ALPN negotiation happen before the transport is handed over;
//! [`Negotiated`] carries what was agreed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

pub mod h2;

/// ALPN identifier for HTTP/2 over TLS.
pub const ALPN_H2: &[u8] = b"h2";

/// A connected byte stream a session can drive.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Protocol agreed through ALPN, if the transport negotiated one.
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        None
    }

    fn is_secure(&self) -> bool {
        false
    }
}

impl Transport for TcpStream {}

impl Transport for DuplexStream {}

impl Transport for Box<dyn Transport> {
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        (**self).negotiated_protocol()
    }

    fn is_secure(&self) -> bool {
        (**self).is_secure()
    }
}

/// Transport wrapper recording the outcome of a TLS handshake done elsewhere.
#[derive(Debug)]
pub struct Negotiated<T> {
    io: T,
    alpn: Option<Vec<u8>>,
    secure: bool,
}

impl<T> Negotiated<T> {
    /// Secure transport that agreed on `alpn`.
    pub fn tls(io: T, alpn: Option<Vec<u8>>) -> Self {
        Self {
            io,
            alpn,
            secure: true,
        }
    }

    /// Cleartext transport (prior knowledge or h2c upgrade).
    pub fn plain(io: T) -> Self {
        Self {
            io,
            alpn: None,
            secure: false,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T> Transport for Negotiated<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Negotiated<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Negotiated<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiated_reports_alpn() {
        let (a, _b) = tokio::io::duplex(64);
        let tls = Negotiated::tls(a, Some(ALPN_H2.to_vec()));
        assert_eq!(tls.negotiated_protocol(), Some(ALPN_H2));
        assert!(tls.is_secure());

        let (a, _b) = tokio::io::duplex(64);
        let plain = Negotiated::plain(a);
        assert!(plain.negotiated_protocol().is_none());
        assert!(!plain.is_secure());
    }

    #[tokio::test]
    async fn test_boxed_transport_delegates() {
        let (a, _b) = tokio::io::duplex(64);
        let boxed: Box<dyn Transport> = Box::new(Negotiated::tls(a, Some(b"http/1.1".to_vec())));
        assert_eq!(boxed.negotiated_protocol(), Some(&b"http/1.1"[..]));
    }
}
