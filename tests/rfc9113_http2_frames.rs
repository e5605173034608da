//! RFC 9113 HTTP/2 Frame Serialization Tests
//!
//! https://www.rfc-editor.org/rfc/rfc9113
//!
//! Checks wire layout of the frames a session writes and that the codec
//! reads them back.

use bytes::{Bytes, BytesMut};
use h2mux::transport::h2::frame::{
    DataFrame, ErrorCode, Frame, FrameCodec, FrameHeader, FrameType, GoAwayFrame,
    Http2FrameCodec, PingFrame, PushPromiseFrame, RstStreamFrame, SettingsFrame, SettingsId,
    WindowUpdateFrame, DEFAULT_MAX_FRAME_SIZE,
};
use h2mux::Error;

fn decode(bytes: &[u8]) -> Frame {
    let mut buf = BytesMut::from(bytes);
    let frame = Http2FrameCodec
        .decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
        .unwrap()
        .expect("complete frame");
    assert!(buf.is_empty(), "frame left {} bytes behind", buf.len());
    frame
}

#[test]
fn test_frame_header_serialization() {
    let header = FrameHeader {
        length: 100,
        frame_type: FrameType::Data,
        flags: 0x1, // END_STREAM
        stream_id: 5,
    };

    let mut buf = BytesMut::new();
    header.encode(&mut buf);

    // Length: 24 bits = 100 -> 00 00 64, type 0, flags 1, stream 5
    assert_eq!(&buf[..], &[0, 0, 0x64, 0, 1, 0, 0, 0, 5]);
    assert_eq!(FrameHeader::parse(&buf).unwrap(), header);
}

#[test]
fn test_reserved_bit_ignored_on_receipt() {
    let header = FrameHeader::parse(&[0, 0, 0, 0x8, 0, 0x80, 0, 0, 1]).unwrap();
    assert_eq!(header.stream_id, 1);
    assert_eq!(header.frame_type, FrameType::WindowUpdate);
}

#[test]
fn test_settings_frame_rfc9113_section_6_5() {
    let mut settings = SettingsFrame::new();
    settings.set(SettingsId::HeaderTableSize, 4096);
    settings.set(SettingsId::EnablePush, 0);

    let bytes = Frame::Settings(settings.clone()).serialize();
    // Header (9) + 2 parameters (6 bytes each) = 21 bytes
    assert_eq!(bytes.len(), 9 + 12);
    assert_eq!(&bytes[9..15], &[0x00, 0x01, 0x00, 0x00, 0x10, 0x00]);

    match decode(&bytes) {
        Frame::Settings(parsed) => {
            assert!(!parsed.ack);
            assert_eq!(parsed.settings, settings.settings);
        }
        other => panic!("expected SETTINGS, got {:?}", other),
    }

    let ack = Frame::Settings(SettingsFrame::ack()).serialize();
    assert_eq!(&ack[..], &[0, 0, 0, 0x4, 0x1, 0, 0, 0, 0]);
}

#[test]
fn test_data_frame_with_padding_counts_toward_flow_control() {
    // 5 bytes of data, 1 pad length byte, 4 bytes of padding
    let payload = [4u8, b'h', b'e', b'l', b'l', b'o', 0, 0, 0, 0];
    let mut bytes = BytesMut::new();
    FrameHeader {
        length: payload.len() as u32,
        frame_type: FrameType::Data,
        flags: 0x8 | 0x1,
        stream_id: 3,
    }
    .encode(&mut bytes);
    bytes.extend_from_slice(&payload);

    match decode(&bytes) {
        Frame::Data(data) => {
            assert_eq!(data.data, Bytes::from_static(b"hello"));
            assert!(data.end_stream);
            assert_eq!(data.flow_len, 10);
        }
        other => panic!("expected DATA, got {:?}", other),
    }
}

#[test]
fn test_data_frame_on_stream_zero_is_protocol_error() {
    let bytes = Frame::Data(DataFrame::new(0, Bytes::from_static(b"x"))).serialize();
    let mut buf = BytesMut::from(&bytes[..]);
    match Http2FrameCodec.decode(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
        Err(Error::Connection { code, .. }) => assert_eq!(code, ErrorCode::ProtocolError),
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[test]
fn test_ping_frame_rfc9113_section_6_7() {
    let bytes = Frame::Ping(PingFrame::ack(*b"abcdefgh")).serialize();
    assert_eq!(&bytes[..9], &[0, 0, 8, 0x6, 0x1, 0, 0, 0, 0]);
    assert_eq!(decode(&bytes), Frame::Ping(PingFrame::ack(*b"abcdefgh")));
}

#[test]
fn test_goaway_frame_rfc9113_section_6_8() {
    let goaway = GoAwayFrame::new(7, ErrorCode::EnhanceYourCalm)
        .with_debug_data(Bytes::from_static(b"slow down"));
    let bytes = Frame::GoAway(goaway.clone()).serialize();

    assert_eq!(bytes.len(), 9 + 8 + 9);
    assert_eq!(&bytes[9..17], &[0, 0, 0, 7, 0, 0, 0, 0xb]);
    assert_eq!(decode(&bytes), Frame::GoAway(goaway));
}

#[test]
fn test_rst_stream_and_window_update_layout() {
    let rst = Frame::RstStream(RstStreamFrame::new(9, ErrorCode::Cancel)).serialize();
    assert_eq!(&rst[..], &[0, 0, 4, 0x3, 0, 0, 0, 0, 9, 0, 0, 0, 0x8]);

    let update = Frame::WindowUpdate(WindowUpdateFrame::new(0, 65_535)).serialize();
    assert_eq!(&update[9..], &[0, 0, 0xff, 0xff]);
    assert_eq!(
        decode(&update),
        Frame::WindowUpdate(WindowUpdateFrame::new(0, 65_535))
    );
}

#[test]
fn test_push_promise_frame_rfc9113_section_6_6() {
    let promise = PushPromiseFrame::new(1, 2, Bytes::from_static(&[0x82, 0x87]));
    let bytes = Frame::PushPromise(promise.clone()).serialize();

    // END_HEADERS, promised stream id, then the block
    assert_eq!(bytes[4], 0x4);
    assert_eq!(&bytes[9..], &[0, 0, 0, 2, 0x82, 0x87]);
    assert_eq!(decode(&bytes), Frame::PushPromise(promise));
}

#[test]
fn test_partial_frame_waits_for_more_bytes() {
    let bytes = Frame::Ping(PingFrame::new([1; 8])).serialize();
    let mut buf = BytesMut::from(&bytes[..12]);
    assert!(Http2FrameCodec
        .decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
        .unwrap()
        .is_none());
    buf.extend_from_slice(&bytes[12..]);
    assert!(Http2FrameCodec
        .decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
        .unwrap()
        .is_some());
}

#[test]
fn test_unknown_frame_type_is_surfaced() {
    let bytes = [0, 0, 2, 0xfa, 0, 0, 0, 0, 1, 0xde, 0xad];
    match decode(&bytes) {
        Frame::Unknown(header) => {
            assert_eq!(header.frame_type, FrameType::Unknown(0xfa));
            assert_eq!(header.stream_id, 1);
        }
        other => panic!("expected unknown frame, got {:?}", other),
    }
}
