//! Malformed Frame Tests
//!
//! Connection errors end the session with GOAWAY carrying the right code;
//! stream errors reset only the offending stream.

use std::time::Duration;

use h2mux::{Body, Http2Settings, Session, SessionConfig};
use http::{Request, Response};
use tokio::time::timeout;

mod helpers;
use helpers::mock_h2_server::{
    self, MockH2Connection, ACK, DATA, END_HEADERS, END_STREAM, GOAWAY, HEADERS, PING, RST_STREAM,
    SETTINGS, WINDOW_UPDATE,
};

const PROTOCOL_ERROR: u32 = 0x1;
const FLOW_CONTROL_ERROR: u32 = 0x3;
const FRAME_SIZE_ERROR: u32 = 0x6;
const REFUSED_STREAM: u32 = 0x7;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("h2mux=trace")
        .try_init();
}

fn quiet() -> SessionConfig {
    SessionConfig::default().with_ping_interval(None)
}

async fn started_client() -> (Session, MockH2Connection) {
    let (io, conn) = mock_h2_server::connect();
    let session = Session::new(io, quiet());
    session
        .begin_client_session(Http2Settings::client(), "example.com", "http")
        .await
        .unwrap();
    conn.handshake(&[]).await.unwrap();
    (session, conn)
}

async fn expect_goaway(conn: &MockH2Connection, session: &Session, expected: u32) {
    let (_, _, _, _, payload) = timeout(Duration::from_secs(5), conn.read_until(GOAWAY))
        .await
        .unwrap()
        .unwrap();
    let (_, code) = mock_h2_server::parse_goaway(&payload);
    assert_eq!(code, expected);
    timeout(Duration::from_secs(5), session.closed()).await.unwrap();
    assert!(!session.is_active());
}

fn error_code(payload: &[u8]) -> u32 {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}

#[tokio::test]
async fn test_settings_on_stream_is_protocol_error() {
    init_tracing();
    let (session, conn) = started_client().await;
    conn.send_frame(SETTINGS, 0, 1, &[]).await.unwrap();
    // Never processed: the connection is already broken
    conn.send_ping(*b"too late").await.unwrap();

    let mut goaway = None;
    while let Ok((_, frame_type, flags, _, payload)) =
        timeout(Duration::from_secs(5), conn.read_frame()).await.unwrap()
    {
        assert!(
            !(frame_type == PING && flags & ACK != 0),
            "PING answered after a connection error"
        );
        if frame_type == GOAWAY {
            goaway = Some(mock_h2_server::parse_goaway(&payload));
        }
    }
    assert_eq!(goaway.map(|(_, code)| code), Some(PROTOCOL_ERROR));
    timeout(Duration::from_secs(5), session.closed()).await.unwrap();
}

#[tokio::test]
async fn test_interleaved_frame_during_continuation() {
    init_tracing();
    let (session, conn) = started_client().await;
    let client = session.clone();
    let response = tokio::spawn(async move {
        let request = Request::get("/").body(Body::empty()).unwrap();
        client.make_request(request).await
    });
    conn.read_headers().await.unwrap();

    // HEADERS without END_HEADERS, then something other than CONTINUATION
    conn.send_frame(HEADERS, END_STREAM, 1, &[0x88]).await.unwrap();
    conn.send_ping(*b"12345678").await.unwrap();

    expect_goaway(&conn, &session, PROTOCOL_ERROR).await;
    let result = timeout(Duration::from_secs(5), response).await.unwrap().unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_connection_window_overflow() {
    init_tracing();
    let (session, conn) = started_client().await;
    conn.send_window_update(0, 0x7fff_ffff).await.unwrap();
    expect_goaway(&conn, &session, FLOW_CONTROL_ERROR).await;
}

#[tokio::test]
async fn test_oversized_frame() {
    init_tracing();
    let (session, conn) = started_client().await;
    conn.send_data(1, &vec![0u8; 20_000], false).await.unwrap();
    expect_goaway(&conn, &session, FRAME_SIZE_ERROR).await;
}

#[tokio::test]
async fn test_malformed_response_resets_stream() {
    init_tracing();
    let (session, conn) = started_client().await;
    let client = session.clone();
    let response = tokio::spawn(async move {
        let request = Request::get("/").body(Body::empty()).unwrap();
        client.make_request(request).await
    });
    conn.read_headers().await.unwrap();

    // Uppercase names are malformed in HTTP/2
    conn.send_headers(1, &[(":status", "200"), ("X-Upper", "1")], true)
        .await
        .unwrap();

    let (_, _, _, sid, payload) = conn.read_until(RST_STREAM).await.unwrap();
    assert_eq!(sid, 1);
    assert_eq!(
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        PROTOCOL_ERROR
    );
    let result = timeout(Duration::from_secs(5), response).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(session.is_active());
}

#[tokio::test]
async fn test_server_rejects_bad_preface() {
    init_tracing();
    let (io, conn) = mock_h2_server::connect();
    let session = Session::new(io, quiet());
    session
        .begin_server_session(Http2Settings::server(), "example.com", "http")
        .await
        .unwrap();

    conn.send_raw(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    expect_goaway(&conn, &session, PROTOCOL_ERROR).await;
}

#[tokio::test]
async fn test_server_answers_scripted_client() {
    init_tracing();
    let (io, conn) = mock_h2_server::connect();
    let session = Session::new(io, quiet());
    session
        .begin_server_session(Http2Settings::server(), "example.com", "http")
        .await
        .unwrap();

    conn.send_preface().await.unwrap();
    conn.send_settings(&[]).await.unwrap();
    conn.send_headers(
        1,
        &[
            (":method", "GET"),
            (":scheme", "http"),
            (":authority", "example.com"),
            (":path", "/hello"),
        ],
        true,
    )
    .await
    .unwrap();

    let incoming = timeout(Duration::from_secs(5), session.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incoming.stream_id, 1);
    assert_eq!(incoming.request.uri().path(), "/hello");
    session
        .write_response(Response::new(Body::from("hi")), 1, None, None)
        .await
        .unwrap();

    let (sid, flags, fields) = conn.read_headers().await.unwrap();
    assert_eq!(sid, 1);
    assert_eq!(flags & END_STREAM, 0);
    assert_eq!(mock_h2_server::header(&fields, ":status"), Some("200"));
    let (_, _, flags, _, payload) = conn.read_until(DATA).await.unwrap();
    assert_eq!(&payload[..], b"hi");
    assert_eq!(flags & END_STREAM, END_STREAM);
}

#[tokio::test]
async fn test_unknown_stream_is_refused_once() {
    init_tracing();
    let (session, conn) = started_client().await;

    // The client never opened streams 7 or 9
    conn.send_headers(7, &[(":status", "200")], false).await.unwrap();
    let (_, _, _, sid, payload) = conn.read_until(RST_STREAM).await.unwrap();
    assert_eq!(sid, 7);
    assert_eq!(error_code(&payload), REFUSED_STREAM);

    conn.send_data(9, b"stray", false).await.unwrap();
    let (_, _, _, sid, payload) = conn.read_until(RST_STREAM).await.unwrap();
    assert_eq!(sid, 9);
    assert_eq!(error_code(&payload), REFUSED_STREAM);

    // Frames already in flight for a refused stream are dropped quietly
    conn.send_data(7, b"more", true).await.unwrap();
    conn.send_frame(HEADERS, END_HEADERS | END_STREAM, 9, &[0x88])
        .await
        .unwrap();
    conn.send_ping(*b"barrier!").await.unwrap();
    loop {
        let (_, frame_type, flags, sid, _) = conn.read_frame().await.unwrap();
        assert_ne!(frame_type, RST_STREAM, "second reset for stream {}", sid);
        if frame_type == PING && flags & ACK != 0 {
            break;
        }
    }
    assert!(session.is_active());
}

#[tokio::test]
async fn test_zero_stream_window_update_resets_stream() {
    init_tracing();
    let (session, conn) = started_client().await;
    let client = session.clone();
    let response = tokio::spawn(async move {
        let request = Request::get("/").body(Body::empty()).unwrap();
        client.make_request(request).await
    });
    conn.read_headers().await.unwrap();

    conn.send_frame(WINDOW_UPDATE, 0, 1, &0u32.to_be_bytes())
        .await
        .unwrap();
    let (_, _, _, sid, payload) = conn.read_until(RST_STREAM).await.unwrap();
    assert_eq!(sid, 1);
    assert_eq!(error_code(&payload), PROTOCOL_ERROR);

    let result = timeout(Duration::from_secs(5), response).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(session.is_active());
}

#[tokio::test]
async fn test_trailers_without_end_stream_reset_stream() {
    init_tracing();
    let (session, conn) = started_client().await;
    let client = session.clone();
    let body = tokio::spawn(async move {
        let request = Request::get("/").body(Body::empty()).unwrap();
        let mut response = client.make_request(request).await?;
        response.body_mut().collect().await
    });
    conn.read_headers().await.unwrap();

    conn.send_headers(1, &[(":status", "200")], false).await.unwrap();
    conn.send_data(1, b"partial", false).await.unwrap();
    // A second header block must end the stream
    conn.send_headers(1, &[("grpc-status", "0")], false)
        .await
        .unwrap();

    let (_, _, _, sid, payload) = conn.read_until(RST_STREAM).await.unwrap();
    assert_eq!(sid, 1);
    assert_eq!(error_code(&payload), PROTOCOL_ERROR);

    let result = timeout(Duration::from_secs(5), body).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(session.is_active());
}
