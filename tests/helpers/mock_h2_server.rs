//! Scripted HTTP/2 peer for driving a real session frame by frame.
#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2mux::transport::h2::{HeaderCodec, HeaderField, HpackCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PUSH_PROMISE: u8 = 0x5;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// One received frame: (length, type, flags, stream id, payload).
pub type RawFrame = (usize, u8, u8, u32, Bytes);

/// Create an in-memory connection: the transport for the session under test
/// and a scripted peer on the other end.
pub fn connect() -> (DuplexStream, MockH2Connection) {
    let (local, remote) = tokio::io::duplex(1 << 20);
    (local, MockH2Connection::new(remote))
}

struct ReadSide {
    io: ReadHalf<DuplexStream>,
    buf: BytesMut,
    decoder: HpackCodec,
}

struct WriteSide {
    io: WriteHalf<DuplexStream>,
    encoder: HpackCodec,
}

/// A peer that sends and receives raw HTTP/2 frames.
/// Allows scripting specific frame sequences to test session robustness.
pub struct MockH2Connection {
    reader: Mutex<ReadSide>,
    writer: Mutex<WriteSide>,
}

impl MockH2Connection {
    pub fn new(io: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: Mutex::new(ReadSide {
                io: read,
                buf: BytesMut::new(),
                decoder: HpackCodec::new(),
            }),
            writer: Mutex::new(WriteSide {
                io: write,
                encoder: HpackCodec::new(),
            }),
        }
    }

    /// Read and verify the client connection preface.
    pub async fn read_preface(&self) -> std::io::Result<()> {
        let mut reader = self.reader.lock().await;
        while reader.buf.len() < PREFACE.len() {
            fill(&mut reader).await?;
        }
        let preface = reader.buf.split_to(PREFACE.len());
        assert_eq!(&preface[..], PREFACE, "invalid connection preface");
        Ok(())
    }

    /// Read one complete frame. Cancel safe: partial frames stay buffered.
    pub async fn read_frame(&self) -> std::io::Result<RawFrame> {
        let mut reader = self.reader.lock().await;
        loop {
            if reader.buf.len() >= 9 {
                let len = ((reader.buf[0] as usize) << 16)
                    | ((reader.buf[1] as usize) << 8)
                    | (reader.buf[2] as usize);
                if reader.buf.len() >= 9 + len {
                    let mut head = reader.buf.split_to(9);
                    head.advance(3);
                    let frame_type = head.get_u8();
                    let flags = head.get_u8();
                    let stream_id = head.get_u32() & 0x7fff_ffff;
                    let payload = reader.buf.split_to(len).freeze();
                    return Ok((len, frame_type, flags, stream_id, payload));
                }
            }
            fill(&mut reader).await?;
        }
    }

    /// Read a frame, or `None` if nothing complete arrives within `wait`.
    pub async fn try_read_frame(&self, wait: Duration) -> Option<RawFrame> {
        tokio::time::timeout(wait, self.read_frame()).await.ok()?.ok()
    }

    /// Skip frames until one of `frame_type` arrives. Header blocks passed
    /// over are still decoded so the HPACK state stays in sync.
    pub async fn read_until(&self, frame_type: u8) -> std::io::Result<RawFrame> {
        loop {
            let frame = self.read_frame().await?;
            if frame.1 == frame_type {
                return Ok(frame);
            }
            if frame.1 == HEADERS || frame.1 == PUSH_PROMISE {
                self.decode_block(frame.1, frame.2, &frame.4).await;
            }
        }
    }

    /// Next HEADERS frame: (stream id, flags, decoded fields).
    pub async fn read_headers(&self) -> std::io::Result<(u32, u8, Vec<(String, String)>)> {
        let (_, _, flags, stream_id, payload) = self.read_until(HEADERS).await?;
        let fields = self.decode_block(HEADERS, flags, &payload).await;
        Ok((stream_id, flags, fields))
    }

    /// Decode the header block carried in a HEADERS or PUSH_PROMISE payload.
    pub async fn decode_block(&self, frame_type: u8, flags: u8, payload: &[u8]) -> Vec<(String, String)> {
        let mut block = payload;
        if frame_type == HEADERS && flags & 0x20 != 0 {
            block = &block[5..];
        }
        if frame_type == PUSH_PROMISE {
            block = &block[4..];
        }
        let mut reader = self.reader.lock().await;
        reader
            .decoder
            .decode(block)
            .expect("peer could not decode header block")
            .into_iter()
            .map(|f| {
                (
                    String::from_utf8_lossy(&f.name).into_owned(),
                    String::from_utf8_lossy(&f.value).into_owned(),
                )
            })
            .collect()
    }

    /// Server side of the opening exchange: preface, the client's SETTINGS,
    /// our SETTINGS, and the ACKs in both directions.
    pub async fn handshake(&self, settings: &[(u16, u32)]) -> std::io::Result<()> {
        self.read_preface().await?;
        let (_, frame_type, flags, _, _) = self.read_frame().await?;
        assert_eq!(frame_type, SETTINGS);
        assert_eq!(flags & ACK, 0);

        // ACK first so the session's settings are final once it ACKs ours
        self.send_settings_ack().await?;
        self.send_settings(settings).await?;
        loop {
            let (_, _, flags, _, _) = self.read_until(SETTINGS).await?;
            if flags & ACK != 0 {
                return Ok(());
            }
        }
    }

    /// Send a raw frame.
    pub async fn send_frame(
        &self,
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(9 + payload.len());
        let len = payload.len();
        buf.put_u8((len >> 16) as u8);
        buf.put_u8((len >> 8) as u8);
        buf.put_u8(len as u8);
        buf.put_u8(frame_type);
        buf.put_u8(flags);
        buf.put_u32(stream_id & 0x7fff_ffff);
        buf.extend_from_slice(payload);

        let mut writer = self.writer.lock().await;
        writer.io.write_all(&buf).await?;
        writer.io.flush().await
    }

    /// Write bytes as-is, e.g. a client preface.
    pub async fn send_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.io.write_all(bytes).await?;
        writer.io.flush().await
    }

    pub async fn send_preface(&self) -> std::io::Result<()> {
        self.send_raw(PREFACE).await
    }

    pub async fn send_settings(&self, settings: &[(u16, u32)]) -> std::io::Result<()> {
        let mut payload = BytesMut::with_capacity(settings.len() * 6);
        for (id, val) in settings {
            payload.put_u16(*id);
            payload.put_u32(*val);
        }
        self.send_frame(SETTINGS, 0, 0, &payload).await
    }

    pub async fn send_settings_ack(&self) -> std::io::Result<()> {
        self.send_frame(SETTINGS, ACK, 0, &[]).await
    }

    pub async fn send_window_update(&self, stream_id: u32, increment: u32) -> std::io::Result<()> {
        self.send_frame(WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
            .await
    }

    pub async fn send_headers(
        &self,
        stream_id: u32,
        headers: &[(&str, &str)],
        end_stream: bool,
    ) -> std::io::Result<()> {
        let block = self.encode(headers).await;
        let mut flags = END_HEADERS;
        if end_stream {
            flags |= END_STREAM;
        }
        self.send_frame(HEADERS, flags, stream_id, &block).await
    }

    pub async fn send_data(&self, stream_id: u32, data: &[u8], end_stream: bool) -> std::io::Result<()> {
        let flags = if end_stream { END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, data).await
    }

    pub async fn send_rst_stream(&self, stream_id: u32, error_code: u32) -> std::io::Result<()> {
        self.send_frame(RST_STREAM, 0, stream_id, &error_code.to_be_bytes())
            .await
    }

    pub async fn send_ping(&self, data: [u8; 8]) -> std::io::Result<()> {
        self.send_frame(PING, 0, 0, &data).await
    }

    pub async fn send_goaway(&self, last_stream_id: u32, error_code: u32) -> std::io::Result<()> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_stream_id);
        payload.put_u32(error_code);
        self.send_frame(GOAWAY, 0, 0, &payload).await
    }

    pub async fn send_push_promise(
        &self,
        stream_id: u32,
        promised_stream_id: u32,
        headers: &[(&str, &str)],
    ) -> std::io::Result<()> {
        let block = self.encode(headers).await;
        let mut payload = BytesMut::with_capacity(4 + block.len());
        payload.put_u32(promised_stream_id);
        payload.extend_from_slice(&block);
        self.send_frame(PUSH_PROMISE, END_HEADERS, stream_id, &payload)
            .await
    }

    async fn encode(&self, headers: &[(&str, &str)]) -> Bytes {
        let fields: Vec<HeaderField> = headers
            .iter()
            .map(|(name, value)| {
                HeaderField::new(Bytes::copy_from_slice(name.as_bytes()), Bytes::copy_from_slice(value.as_bytes()))
            })
            .collect();
        self.writer.lock().await.encoder.encode(&fields)
    }
}

async fn fill(reader: &mut ReadSide) -> std::io::Result<()> {
    reader.buf.reserve(16 * 1024);
    let n = reader.io.read_buf(&mut reader.buf).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "session closed the connection",
        ));
    }
    Ok(())
}

/// Look up a decoded header by name.
pub fn header<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// GOAWAY payload: (last stream id, error code).
pub fn parse_goaway(payload: &[u8]) -> (u32, u32) {
    let mut payload = payload;
    let last = payload.get_u32() & 0x7fff_ffff;
    let code = payload.get_u32();
    (last, code)
}
