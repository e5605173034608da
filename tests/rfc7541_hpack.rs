//! RFC 7541 HPACK Tests
//!
//! Decodes the Appendix C examples through the session's header codec and
//! checks that encoded blocks survive a decoder with its own table.

use h2mux::transport::h2::{HeaderCodec, HeaderField, HpackCodec};

fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

fn pairs(fields: &[HeaderField]) -> Vec<(&[u8], &[u8])> {
    fields
        .iter()
        .map(|f| (&f.name[..], &f.value[..]))
        .collect()
}

#[test]
fn test_request_examples_with_huffman_rfc7541_appendix_c_4() {
    let mut decoder = HpackCodec::new();

    // C.4.1 First Request
    let first = decoder
        .decode(&hex("828684418cf1e3c2e5f23a6ba0ab90f4ff"))
        .unwrap();
    assert_eq!(
        pairs(&first),
        vec![
            (&b":method"[..], &b"GET"[..]),
            (b":scheme", b"http"),
            (b":path", b"/"),
            (b":authority", b"www.example.com"),
        ]
    );

    // C.4.2 Second Request: :authority now comes from the dynamic table
    let second = decoder.decode(&hex("828684be5886a8eb10649cbf")).unwrap();
    assert_eq!(
        pairs(&second),
        vec![
            (&b":method"[..], &b"GET"[..]),
            (b":scheme", b"http"),
            (b":path", b"/"),
            (b":authority", b"www.example.com"),
            (b"cache-control", b"no-cache"),
        ]
    );
}

#[test]
fn test_invalid_index_is_compression_error() {
    let mut decoder = HpackCodec::new();
    // Indexed field 126: nothing in the dynamic table yet
    let err = decoder.decode(&[0xfe]).unwrap_err();
    assert!(err.to_string().contains("CompressionError"), "{}", err);
}

#[test]
fn test_encoder_and_decoder_stay_in_sync() {
    let mut encoder = HpackCodec::new();
    let mut decoder = HpackCodec::new();

    let fields = vec![
        HeaderField::new(":status", "200"),
        HeaderField::new("content-type", "text/html"),
        HeaderField::new("x-request-id", "abc123"),
    ];
    for _ in 0..3 {
        let block = encoder.encode(&fields);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(pairs(&decoded), pairs(&fields));
    }
}
