//! Cleartext HTTP/2 via HTTP/1.1 `Upgrade: h2c` (RFC 7540 Section 3.2).
//!
//! The header helpers work on `http` types; the handshake functions speak
//! just enough HTTP/1.1 over a [`Transport`] to switch protocols, using
//! httparse for the response and request heads. Bytes read past the head
//! are kept in [`Upgraded`] so the session sees them first.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::settings::Http2Settings;
use crate::transport::Transport;

/// Upgrade token for HTTP/2 over cleartext TCP.
pub const H2C: &str = "h2c";

pub const HTTP2_SETTINGS: HeaderName = HeaderName::from_static("http2-settings");

/// Maximum HTTP/1.1 head size (64KB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Add `Upgrade`, `Connection` and `HTTP2-Settings` to an HTTP/1.1 request.
pub fn prepare_upgrade_request<B>(request: &mut Request<B>, settings: &Http2Settings) -> Result<()> {
    let encoded = HeaderValue::from_str(&settings.to_header_value()).map_err(http::Error::from)?;
    let headers = request.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static(H2C));
    headers.insert(
        header::CONNECTION,
        HeaderValue::from_static("Upgrade, HTTP2-Settings"),
    );
    headers.insert(HTTP2_SETTINGS, encoded);
    *request.version_mut() = Version::HTTP_11;
    Ok(())
}

/// Request asks for h2c and carries exactly one `HTTP2-Settings` header.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    has_token(headers, &header::UPGRADE, H2C)
        && has_token(headers, &header::CONNECTION, "upgrade")
        && has_token(headers, &header::CONNECTION, "http2-settings")
        && headers.get_all(HTTP2_SETTINGS).iter().count() == 1
}

/// Decode the client's settings from `HTTP2-Settings`.
pub fn settings_from_request<B>(request: &Request<B>) -> Result<Http2Settings> {
    let mut values = request.headers().get_all(HTTP2_SETTINGS).iter();
    let (Some(value), None) = (values.next(), values.next()) else {
        return Err(Error::http_protocol(
            "upgrade request needs exactly one HTTP2-Settings header",
        ));
    };
    let value = value
        .to_str()
        .map_err(|_| Error::http_protocol("HTTP2-Settings is not ASCII"))?;
    Http2Settings::from_header_value(value)
}

/// `101 Switching Protocols` accepting h2c.
pub fn upgrade_response() -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.version_mut() = Version::HTTP_11;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static(H2C));
    response
}

pub fn is_upgrade_accepted<B>(response: &Response<B>) -> bool {
    response.status() == StatusCode::SWITCHING_PROTOCOLS
        && has_token(response.headers(), &header::UPGRADE, H2C)
}

/// Transport that replays bytes read past an HTTP/1.1 head before reading
/// from the socket again.
#[derive(Debug)]
pub struct Upgraded<T> {
    io: T,
    pre: Bytes,
}

impl<T> Upgraded<T> {
    pub fn new(io: T, pre: Bytes) -> Self {
        Self { io, pre }
    }

    /// Bytes received after the head and not read yet.
    pub fn buffered(&self) -> &[u8] {
        &self.pre
    }

    pub fn into_parts(self) -> (T, Bytes) {
        (self.io, self.pre)
    }
}

impl<T: Transport> Transport for Upgraded<T> {
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.io.negotiated_protocol()
    }

    fn is_secure(&self) -> bool {
        self.io.is_secure()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Upgraded<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pre.is_empty() {
            let n = this.pre.len().min(buf.remaining());
            buf.put_slice(&this.pre[..n]);
            this.pre.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Upgraded<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Serialize a bodiless HTTP/1.1 request head.
fn encode_request(request: &Request<()>) -> Vec<u8> {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(request.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    if !request.headers().contains_key(header::HOST) {
        if let Some(authority) = request.uri().authority() {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(authority.as_str().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    write_headers(&mut out, request.headers());
    out.extend_from_slice(b"\r\n");
    out
}

fn encode_response(response: &Response<()>) -> Vec<u8> {
    let status = response.status();
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
    write_headers(&mut out, response.headers());
    out.extend_from_slice(b"\r\n");
    out
}

fn parse_response(buf: &[u8]) -> Result<Option<(Response<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut parsed = httparse::Response::new(&mut headers);
    let len = match parsed
        .parse(buf)
        .map_err(|e| Error::http_protocol(format!("failed to parse response: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let status = parsed
        .code
        .ok_or_else(|| Error::http_protocol("missing status code"))?;

    let mut builder = Response::builder().status(status).version(Version::HTTP_11);
    for h in parsed.headers.iter().filter(|h| !h.name.is_empty()) {
        builder = builder.header(h.name, h.value);
    }
    Ok(Some((builder.body(())?, len)))
}

fn parse_request(buf: &[u8]) -> Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut parsed = httparse::Request::new(&mut headers);
    let len = match parsed
        .parse(buf)
        .map_err(|e| Error::http_protocol(format!("failed to parse request: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let method = parsed
        .method
        .ok_or_else(|| Error::http_protocol("missing method"))?;
    let path = parsed
        .path
        .ok_or_else(|| Error::http_protocol("missing request target"))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .version(Version::HTTP_11);
    for h in parsed.headers.iter().filter(|h| !h.name.is_empty()) {
        builder = builder.header(h.name, h.value);
    }
    Ok(Some((builder.body(())?, len)))
}

async fn fill<T: AsyncRead + Unpin>(io: &mut T, buf: &mut BytesMut) -> Result<()> {
    if buf.len() >= MAX_HEAD_SIZE {
        return Err(Error::http_protocol("HTTP/1.1 head too large"));
    }
    buf.reserve(8192);
    if io.read_buf(buf).await? == 0 {
        return Err(Error::TransportClosed);
    }
    Ok(())
}

/// Client side: send `request` with upgrade headers and read the reply.
///
/// Interim responses other than 101 are skipped. When the server declines
/// the upgrade, the returned transport is positioned at its response body.
pub async fn client_handshake<T: Transport>(
    mut io: T,
    request: Request<()>,
    settings: &Http2Settings,
) -> Result<(Response<()>, Upgraded<T>)> {
    let mut request = request;
    prepare_upgrade_request(&mut request, settings)?;
    io.write_all(&encode_request(&request)).await?;
    io.flush().await?;
    tracing::debug!("h2c upgrade requested for {}", request.uri());

    let mut buf = BytesMut::with_capacity(8192);
    loop {
        if let Some((response, len)) = parse_response(&buf)? {
            buf.advance(len);
            let status = response.status();
            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }
            tracing::debug!("h2c upgrade answered with {}", status);
            return Ok((response, Upgraded::new(io, buf.freeze())));
        }
        fill(&mut io, &mut buf).await?;
    }
}

/// Server side: read one HTTP/1.1 request head.
pub async fn read_request<T: Transport>(mut io: T) -> Result<(Request<()>, Upgraded<T>)> {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        if let Some((request, len)) = parse_request(&buf)? {
            buf.advance(len);
            return Ok((request, Upgraded::new(io, buf.freeze())));
        }
        fill(&mut io, &mut buf).await?;
    }
}

/// Server side: write `101 Switching Protocols`.
pub async fn accept_upgrade<T: AsyncWrite + Unpin>(io: &mut T) -> Result<()> {
    io.write_all(&encode_response(&upgrade_response())).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_request_is_recognized() {
        let settings = Http2Settings::client().with_initial_window_size(1 << 20);
        let mut request = Request::get("http://example.com/").body(()).unwrap();
        prepare_upgrade_request(&mut request, &settings).unwrap();

        assert!(is_upgrade_request(&request));
        assert_eq!(request.headers()[header::UPGRADE], "h2c");
        assert_eq!(settings_from_request(&request).unwrap(), settings);
    }

    #[test]
    fn test_duplicate_settings_header_is_rejected() {
        let mut request = Request::get("/").body(()).unwrap();
        prepare_upgrade_request(&mut request, &Http2Settings::client()).unwrap();
        let value = request.headers()[HTTP2_SETTINGS].clone();
        request.headers_mut().append(HTTP2_SETTINGS, value);

        assert!(!is_upgrade_request(&request));
        assert!(matches!(
            settings_from_request(&request),
            Err(Error::HttpProtocol(_))
        ));
    }

    #[test]
    fn test_connection_tokens_are_case_insensitive() {
        let request = Request::get("/")
            .header("upgrade", "H2C")
            .header("connection", "keep-alive, UPGRADE, Http2-Settings")
            .header("http2-settings", "")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&request));
    }

    #[test]
    fn test_upgrade_response() {
        let response = upgrade_response();
        assert!(is_upgrade_accepted(&response));
        let wire = encode_response(&response);
        assert!(wire.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[tokio::test]
    async fn test_handshake_keeps_bytes_after_head() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let settings = Http2Settings::client();

        let server = tokio::spawn(async move {
            let (request, mut io) = read_request(server_io).await.unwrap();
            assert!(is_upgrade_request(&request));
            assert_eq!(request.headers()[header::HOST], "example.com");
            accept_upgrade(&mut io).await.unwrap();
            io.write_all(b"frames").await.unwrap();
            io.flush().await.unwrap();
            io
        });

        let request = Request::get("http://example.com/index.html").body(()).unwrap();
        let (response, mut io) = client_handshake(client_io, request, &settings)
            .await
            .unwrap();
        assert!(is_upgrade_accepted(&response));

        let mut rest = [0u8; 6];
        io.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"frames");
        drop(server.await.unwrap());
    }
}
