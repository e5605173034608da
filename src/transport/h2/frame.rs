//! HTTP/2 frame types and binary serialization.
//!
//! Implements the RFC 9113 frame layout. The session engine only talks to
//! frames through [`FrameCodec`], so the wire layout stays swappable.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 9113).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest legal MAX_FRAME_SIZE (2^24 - 1).
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest legal flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Largest stream identifier (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // Same value, different context (SETTINGS/PING)
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// SETTINGS frame parameter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingsId {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsId {
    /// Map a wire identifier. Unknown identifiers are ignored by receivers.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x1 => Some(Self::HeaderTableSize),
            0x2 => Some(Self::EnablePush),
            0x3 => Some(Self::MaxConcurrentStreams),
            0x4 => Some(Self::InitialWindowSize),
            0x5 => Some(Self::MaxFrameSize),
            0x6 => Some(Self::MaxHeaderListSize),
            _ => None,
        }
    }
}

impl From<SettingsId> for u16 {
    fn from(id: SettingsId) -> Self {
        id as u16
    }
}

/// HTTP/2 error codes per RFC 9113 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<u32> for ErrorCode {
    fn from(raw: u32) -> Self {
        match raw {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // Unknown codes carry no special meaning (RFC 9113 Section 7)
            _ => Self::InternalError,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header from bytes.
    ///
    /// The reserved bit of the stream identifier is ignored on receipt.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let frame_type = FrameType::from(buf[3]);
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5] & 0x7f, buf[6], buf[7], buf[8]]);

        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Serialize frame header to bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        // Length (24 bits)
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        // Stream ID (31 bits, high bit reserved and must be 0)
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

/// SETTINGS frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    /// Stream the frame arrived on. Always 0 for frames we build.
    pub stream_id: u32,
    /// (id, value) pairs in wire order. Unknown ids are preserved.
    pub settings: Vec<(u16, u32)>,
    pub ack: bool,
    /// Raw payload length as received, checked against the 6-byte entry size.
    pub payload_len: usize,
}

impl SettingsFrame {
    /// Size of one encoded setting.
    pub const ENTRY_SIZE: usize = 6;

    pub fn new() -> Self {
        Self {
            stream_id: 0,
            settings: Vec::new(),
            ack: false,
            payload_len: 0,
        }
    }

    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::new()
        }
    }

    /// Add a setting. Order of calls determines wire order.
    pub fn set<T: Into<u16>>(&mut self, id: T, value: u32) -> &mut Self {
        self.settings.push((id.into(), value));
        self.payload_len = self.settings.len() * Self::ENTRY_SIZE;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let payload_len = if self.ack {
            0
        } else {
            self.settings.len() * Self::ENTRY_SIZE
        };

        FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Settings,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: self.stream_id,
        }
        .encode(buf);

        if !self.ack {
            for (id, value) in &self.settings {
                buf.put_u16(*id);
                buf.put_u32(*value);
            }
        }
    }

    /// Parse a SETTINGS payload. Validation is left to the session so each
    /// violation maps to its own error code.
    pub fn parse(stream_id: u32, flags: u8, mut payload: Bytes) -> Self {
        let payload_len = payload.len();
        let ack = (flags & flags::ACK) != 0;
        let mut settings = Vec::with_capacity(payload_len / Self::ENTRY_SIZE);

        while payload.remaining() >= Self::ENTRY_SIZE {
            let id = payload.get_u16();
            let value = payload.get_u32();
            settings.push((id, value));
        }

        Self {
            stream_id,
            settings,
            ack,
            payload_len,
        }
    }
}

impl Default for SettingsFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    /// Zero is kept so the session can choose stream- or connection-level error.
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: self.stream_id,
        }
        .encode(buf);
        buf.put_u32(self.increment & 0x7fff_ffff);
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if payload.remaining() != 4 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "WINDOW_UPDATE payload must be 4 bytes",
            ));
        }
        let increment = payload.get_u32() & 0x7fff_ffff;
        Ok(Self {
            stream_id,
            increment,
        })
    }
}

/// Priority data (optional in HEADERS frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityData {
    pub exclusive: bool,
    pub stream_dependency: u32,
    pub weight: u8,
}

/// HEADERS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PriorityData>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            header_block,
            end_stream: false,
            end_headers: true,
            priority: None,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let payload_len = priority_len + self.header_block.len();

        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if self.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        FrameHeader {
            length: payload_len as u32,
            frame_type: FrameType::Headers,
            flags: frame_flags,
            stream_id: self.stream_id,
        }
        .encode(buf);

        if let Some(priority) = &self.priority {
            let dep = if priority.exclusive {
                priority.stream_dependency | 0x8000_0000
            } else {
                priority.stream_dependency
            };
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }

        buf.extend_from_slice(&self.header_block);
    }

    /// Parse a HEADERS frame from payload (with padding and priority handling).
    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "HEADERS frame must have non-zero stream ID",
            ));
        }

        let end_stream = (frame_flags & flags::END_STREAM) != 0;
        let end_headers = (frame_flags & flags::END_HEADERS) != 0;
        let pad_len = read_pad_len(frame_flags, &mut payload, "HEADERS")?;

        let priority = if (frame_flags & flags::PRIORITY) != 0 {
            if payload.remaining() < 5 + pad_len {
                return Err(Error::connection(
                    ErrorCode::FrameSizeError,
                    "HEADERS frame with PRIORITY flag missing priority data",
                ));
            }
            let dep_raw = payload.get_u32();
            Some(PriorityData {
                exclusive: (dep_raw & 0x8000_0000) != 0,
                stream_dependency: dep_raw & 0x7fff_ffff,
                weight: payload.get_u8(),
            })
        } else {
            None
        };

        let header_block = payload.split_to(payload.remaining() - pad_len);

        Ok(Self {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority,
        })
    }
}

/// CONTINUATION frame (RFC 9113 Section 6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_fragment: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, header_fragment: Bytes, end_headers: bool) -> Self {
        Self {
            stream_id,
            header_fragment,
            end_headers,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: self.header_fragment.len() as u32,
            frame_type: FrameType::Continuation,
            flags: if self.end_headers {
                flags::END_HEADERS
            } else {
                0
            },
            stream_id: self.stream_id,
        }
        .encode(buf);
        buf.extend_from_slice(&self.header_fragment);
    }

    pub fn parse(stream_id: u32, frame_flags: u8, payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "CONTINUATION frame must have non-zero stream ID",
            ));
        }

        Ok(Self {
            stream_id,
            header_fragment: payload,
            end_headers: (frame_flags & flags::END_HEADERS) != 0,
        })
    }
}

/// DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// Bytes counted against flow control: data plus any padding.
    pub flow_len: u32,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes) -> Self {
        let flow_len = data.len() as u32;
        Self {
            stream_id,
            data,
            end_stream: false,
            flow_len,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: self.data.len() as u32,
            frame_type: FrameType::Data,
            flags: if self.end_stream { flags::END_STREAM } else { 0 },
            stream_id: self.stream_id,
        }
        .encode(buf);
        buf.extend_from_slice(&self.data);
    }

    /// Parse a DATA frame from payload (with padding handling).
    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "DATA frame must have non-zero stream ID",
            ));
        }

        let flow_len = payload.len() as u32;
        let pad_len = read_pad_len(frame_flags, &mut payload, "DATA")?;
        let data = payload.split_to(payload.remaining() - pad_len);

        Ok(Self {
            stream_id,
            data,
            end_stream: (frame_flags & flags::END_STREAM) != 0,
            flow_len,
        })
    }
}

/// PING frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        Self { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        Self { ack: true, data }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: 8,
            frame_type: FrameType::Ping,
            flags: if self.ack { flags::ACK } else { 0 },
            stream_id: 0,
        }
        .encode(buf);
        buf.extend_from_slice(&self.data);
    }

    pub fn parse(stream_id: u32, frame_flags: u8, payload: &[u8]) -> Result<Self> {
        if stream_id != 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "PING frame must be on stream 0",
            ));
        }
        if payload.len() != 8 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "PING payload must be 8 bytes",
            ));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(payload);
        Ok(Self {
            ack: (frame_flags & flags::ACK) != 0,
            data,
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(mut self, debug_data: Bytes) -> Self {
        self.debug_data = debug_data;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: (8 + self.debug_data.len()) as u32,
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
        }
        .encode(buf);
        buf.put_u32(self.last_stream_id & 0x7fff_ffff);
        buf.put_u32(self.error_code as u32);
        buf.extend_from_slice(&self.debug_data);
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if stream_id != 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "GOAWAY frame must be on stream 0",
            ));
        }
        if payload.remaining() < 8 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "GOAWAY payload too short",
            ));
        }
        let last_stream_id = payload.get_u32() & 0x7fff_ffff;
        let error_code = ErrorCode::from(payload.get_u32());

        Ok(Self {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }
}

/// PRIORITY frame (RFC 9113 Section 6.3). Parsed and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PriorityData,
}

impl PriorityFrame {
    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: 5,
            frame_type: FrameType::Priority,
            flags: 0,
            stream_id: self.stream_id,
        }
        .encode(buf);
        let dep = if self.priority.exclusive {
            self.priority.stream_dependency | 0x8000_0000
        } else {
            self.priority.stream_dependency
        };
        buf.put_u32(dep);
        buf.put_u8(self.priority.weight);
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "PRIORITY frame must have non-zero stream ID",
            ));
        }
        if payload.remaining() != 5 {
            return Err(Error::stream(
                stream_id,
                ErrorCode::FrameSizeError,
                "PRIORITY payload must be 5 bytes",
            ));
        }

        let dep_raw = payload.get_u32();
        let priority = PriorityData {
            exclusive: (dep_raw & 0x8000_0000) != 0,
            stream_dependency: dep_raw & 0x7fff_ffff,
            weight: payload.get_u8(),
        };

        // RFC 9113 Section 5.3.1: a stream cannot depend on itself
        if priority.stream_dependency == stream_id {
            return Err(Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "PRIORITY frame stream cannot depend on itself",
            ));
        }

        Ok(Self {
            stream_id,
            priority,
        })
    }
}

/// PUSH_PROMISE frame (RFC 9113 Section 6.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

impl PushPromiseFrame {
    pub fn new(stream_id: u32, promised_stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers: true,
        }
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: (4 + self.header_block.len()) as u32,
            frame_type: FrameType::PushPromise,
            flags: if self.end_headers {
                flags::END_HEADERS
            } else {
                0
            },
            stream_id: self.stream_id,
        }
        .encode(buf);
        buf.put_u32(self.promised_stream_id & 0x7fff_ffff);
        buf.extend_from_slice(&self.header_block);
    }

    pub fn parse(stream_id: u32, frame_flags: u8, mut payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE frame must have non-zero stream ID",
            ));
        }

        let pad_len = read_pad_len(frame_flags, &mut payload, "PUSH_PROMISE")?;
        if payload.remaining() < 4 + pad_len {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "PUSH_PROMISE frame missing promised stream ID",
            ));
        }
        let promised_stream_id = payload.get_u32() & 0x7fff_ffff;
        let header_block = payload.split_to(payload.remaining() - pad_len);

        Ok(Self {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers: (frame_flags & flags::END_HEADERS) != 0,
        })
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader {
            length: 4,
            frame_type: FrameType::RstStream,
            flags: 0,
            stream_id: self.stream_id,
        }
        .encode(buf);
        buf.put_u32(self.error_code as u32);
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "RST_STREAM frame must have non-zero stream ID",
            ));
        }
        if payload.remaining() != 4 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "RST_STREAM payload must be 4 bytes",
            ));
        }

        Ok(Self {
            stream_id,
            error_code: ErrorCode::from(payload.get_u32()),
        })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Frames of unknown type are surfaced so the session can ignore them.
    Unknown(FrameHeader),
}

impl Frame {
    /// Stream the frame belongs to (0 for connection-scoped frames).
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Data(f) => f.stream_id,
            Self::Headers(f) => f.stream_id,
            Self::Priority(f) => f.stream_id,
            Self::RstStream(f) => f.stream_id,
            Self::Settings(f) => f.stream_id,
            Self::PushPromise(f) => f.stream_id,
            Self::WindowUpdate(f) => f.stream_id,
            Self::Continuation(f) => f.stream_id,
            Self::Unknown(h) => h.stream_id,
            Self::Ping(_) | Self::GoAway(_) => 0,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Data(_) => FrameType::Data,
            Self::Headers(_) => FrameType::Headers,
            Self::Priority(_) => FrameType::Priority,
            Self::RstStream(_) => FrameType::RstStream,
            Self::Settings(_) => FrameType::Settings,
            Self::PushPromise(_) => FrameType::PushPromise,
            Self::Ping(_) => FrameType::Ping,
            Self::GoAway(_) => FrameType::GoAway,
            Self::WindowUpdate(_) => FrameType::WindowUpdate,
            Self::Continuation(_) => FrameType::Continuation,
            Self::Unknown(h) => h.frame_type,
        }
    }

    /// Append the wire form of this frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Data(f) => f.encode(buf),
            Self::Headers(f) => f.encode(buf),
            Self::Priority(f) => f.encode(buf),
            Self::RstStream(f) => f.encode(buf),
            Self::Settings(f) => f.encode(buf),
            Self::PushPromise(f) => f.encode(buf),
            Self::Ping(f) => f.encode(buf),
            Self::GoAway(f) => f.encode(buf),
            Self::WindowUpdate(f) => f.encode(buf),
            Self::Continuation(f) => f.encode(buf),
            Self::Unknown(h) => FrameHeader { length: 0, ..h.clone() }.encode(buf),
        }
    }

    /// Wire form of this frame in a fresh buffer.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 64);
        self.encode(&mut buf);
        buf
    }
}

/// Frame-level wire codec consumed by the session.
pub trait FrameCodec: Send + 'static {
    /// Parse one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame.
    /// Frames longer than `max_frame_size` are a FRAME_SIZE_ERROR.
    fn decode(&mut self, src: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>>;

    /// Serialize `frame` onto the end of `dst`.
    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut);
}

/// RFC 9113 frame codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct Http2FrameCodec;

impl FrameCodec for Http2FrameCodec {
    fn decode(&mut self, src: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>> {
        let header = match FrameHeader::parse(src) {
            Some(header) => header,
            None => return Ok(None),
        };

        // RFC 9113 Section 4.2: Frame size validation
        if header.length > max_frame_size {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                format!(
                    "frame size {} exceeds MAX_FRAME_SIZE {}",
                    header.length, max_frame_size
                ),
            ));
        }

        let frame_len = FRAME_HEADER_SIZE + header.length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(header.length as usize).freeze();
        let sid = header.stream_id;
        let fl = header.flags;

        let frame = match header.frame_type {
            FrameType::Data => Frame::Data(DataFrame::parse(sid, fl, payload)?),
            FrameType::Headers => Frame::Headers(HeadersFrame::parse(sid, fl, payload)?),
            FrameType::Priority => Frame::Priority(PriorityFrame::parse(sid, payload)?),
            FrameType::RstStream => Frame::RstStream(RstStreamFrame::parse(sid, payload)?),
            FrameType::Settings => Frame::Settings(SettingsFrame::parse(sid, fl, payload)),
            FrameType::PushPromise => {
                Frame::PushPromise(PushPromiseFrame::parse(sid, fl, payload)?)
            }
            FrameType::Ping => Frame::Ping(PingFrame::parse(sid, fl, &payload)?),
            FrameType::GoAway => Frame::GoAway(GoAwayFrame::parse(sid, payload)?),
            FrameType::WindowUpdate => {
                Frame::WindowUpdate(WindowUpdateFrame::parse(sid, payload)?)
            }
            FrameType::Continuation => {
                Frame::Continuation(ContinuationFrame::parse(sid, fl, payload)?)
            }
            FrameType::Unknown(_) => Frame::Unknown(header),
        };

        Ok(Some(frame))
    }

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) {
        frame.encode(dst);
    }
}

/// Read the pad-length byte of a PADDED frame and check it fits.
fn read_pad_len(frame_flags: u8, payload: &mut Bytes, kind: &str) -> Result<usize> {
    if (frame_flags & flags::PADDED) == 0 {
        return Ok(0);
    }
    if payload.remaining() < 1 {
        return Err(Error::connection(
            ErrorCode::FrameSizeError,
            format!("PADDED {kind} frame missing padding length"),
        ));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.remaining() {
        return Err(Error::connection(
            ErrorCode::ProtocolError,
            format!("{kind} padding length exceeds payload size"),
        ));
    }
    Ok(pad_len)
}
