//! HTTP/2 SETTINGS parameters.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::transport::h2::frame::{
    ErrorCode, SettingsFrame, SettingsId, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE,
    MAX_WINDOW_SIZE,
};

/// The six SETTINGS parameters (RFC 9113 Section 6.5.2).
///
/// `Default` yields the protocol's initial values, which is also what each
/// side assumes about its peer until the first SETTINGS frame arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            // Unlimited until the peer says otherwise
            max_concurrent_streams: u32::MAX,
            initial_window_size: 65_535,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Http2Settings {
    /// Client preset: protocol defaults, push accepted.
    pub fn client() -> Self {
        Self::default()
    }

    /// Server preset: servers never advertise push.
    pub fn server() -> Self {
        Self {
            enable_push: false,
            ..Self::default()
        }
    }

    pub fn with_header_table_size(mut self, size: u32) -> Self {
        self.header_table_size = size;
        self
    }

    pub fn with_enable_push(mut self, enable: bool) -> Self {
        self.enable_push = enable;
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_header_list_size(mut self, size: u32) -> Self {
        self.max_header_list_size = size;
        self
    }

    /// Value of one parameter.
    pub fn get(&self, id: SettingsId) -> u32 {
        match id {
            SettingsId::HeaderTableSize => self.header_table_size,
            SettingsId::EnablePush => self.enable_push as u32,
            SettingsId::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingsId::InitialWindowSize => self.initial_window_size,
            SettingsId::MaxFrameSize => self.max_frame_size,
            SettingsId::MaxHeaderListSize => self.max_header_list_size,
        }
    }

    /// Parameters that differ from the protocol defaults, in identifier order.
    pub fn diff(&self) -> Vec<(SettingsId, u32)> {
        let defaults = Self::default();
        [
            SettingsId::HeaderTableSize,
            SettingsId::EnablePush,
            SettingsId::MaxConcurrentStreams,
            SettingsId::InitialWindowSize,
            SettingsId::MaxFrameSize,
            SettingsId::MaxHeaderListSize,
        ]
        .into_iter()
        .filter(|id| self.get(*id) != defaults.get(*id))
        .map(|id| (id, self.get(id)))
        .collect()
    }

    /// Minimal SETTINGS frame announcing these settings.
    pub fn to_frame(&self) -> SettingsFrame {
        let mut frame = SettingsFrame::new();
        for (id, value) in self.diff() {
            frame.set(id, value);
        }
        frame
    }

    /// Raw SETTINGS payload (6 bytes per entry).
    pub fn encode_payload(&self) -> BytesMut {
        let diff = self.diff();
        let mut buf = BytesMut::with_capacity(diff.len() * SettingsFrame::ENTRY_SIZE);
        for (id, value) in diff {
            buf.put_u16(id.into());
            buf.put_u32(value);
        }
        buf
    }

    /// `HTTP2-Settings` header value: base64url payload without padding.
    pub fn to_header_value(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encode_payload())
    }

    /// Parse an `HTTP2-Settings` header value on top of the defaults.
    pub fn from_header_value(value: &str) -> Result<Self> {
        let trimmed = value.trim().trim_end_matches('=');
        let payload = URL_SAFE_NO_PAD
            .decode(trimmed)
            .map_err(|e| Error::connection(ErrorCode::ProtocolError, format!("invalid HTTP2-Settings: {}", e)))?;
        Self::from_payload(&payload)
    }

    /// Parse a raw SETTINGS payload on top of the defaults.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() % SettingsFrame::ENTRY_SIZE != 0 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "SETTINGS payload is not a multiple of 6",
            ));
        }
        let mut buf = payload;
        let mut entries = Vec::with_capacity(payload.len() / SettingsFrame::ENTRY_SIZE);
        while buf.remaining() >= SettingsFrame::ENTRY_SIZE {
            entries.push((buf.get_u16(), buf.get_u32()));
        }
        let mut settings = Self::default();
        settings.apply_entries(&entries)?;
        Ok(settings)
    }

    /// Validate and apply received (id, value) pairs. Unknown ids are ignored.
    ///
    /// Nothing is applied when any value is out of range.
    pub fn apply_entries(&mut self, entries: &[(u16, u32)]) -> Result<()> {
        let mut next = self.clone();
        for &(raw_id, value) in entries {
            let Some(id) = SettingsId::from_u16(raw_id) else {
                tracing::trace!("ignoring unknown setting 0x{:x}", raw_id);
                continue;
            };
            match id {
                SettingsId::HeaderTableSize => next.header_table_size = value,
                SettingsId::EnablePush => {
                    if value > 1 {
                        return Err(Error::connection(
                            ErrorCode::ProtocolError,
                            format!("ENABLE_PUSH must be 0 or 1, got {}", value),
                        ));
                    }
                    next.enable_push = value == 1;
                }
                SettingsId::MaxConcurrentStreams => next.max_concurrent_streams = value,
                SettingsId::InitialWindowSize => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(Error::connection(
                            ErrorCode::FlowControlError,
                            format!("INITIAL_WINDOW_SIZE {} exceeds 2^31-1", value),
                        ));
                    }
                    next.initial_window_size = value;
                }
                SettingsId::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(Error::connection(
                            ErrorCode::ProtocolError,
                            format!("MAX_FRAME_SIZE {} out of range", value),
                        ));
                    }
                    next.max_frame_size = value;
                }
                SettingsId::MaxHeaderListSize => next.max_header_list_size = value,
            }
        }
        *self = next;
        Ok(())
    }

    /// Check settings we are about to advertise.
    pub fn validate_local(&self, is_server: bool) -> Result<()> {
        if is_server && self.enable_push {
            return Err(Error::config("a server must not advertise ENABLE_PUSH"));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(Error::config(format!(
                "max_frame_size {} outside [{}, {}]",
                self.max_frame_size, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE
            )));
        }
        if self.initial_window_size > MAX_WINDOW_SIZE {
            return Err(Error::config(format!(
                "initial_window_size {} exceeds 2^31-1",
                self.initial_window_size
            )));
        }
        Ok(())
    }
}
