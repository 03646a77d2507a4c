//! Edge-case tests for the framing codecs
//!
//! Boundary payload sizes, malformed prefixes, delimiter corner cases and the
//! receive-window contract, driven through the public codec API.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use framelink::core::{Decoded, DelimiterCodec, FrameCodec, PlainCodec, PrefixLengthCodec, PrefixWidth};
use framelink::error::ProtocolError;

fn encode(codec: &dyn FrameCodec, payload: &[u8]) -> BytesMut {
    let mut wire = BytesMut::new();
    codec.encode_frame(&[payload], &mut wire).expect("encode");
    wire
}

fn frames(decoded: Vec<Decoded>) -> Vec<Bytes> {
    decoded
        .into_iter()
        .filter_map(|d| match d {
            Decoded::Frame(b) => Some(b),
            _ => None,
        })
        .collect()
}

#[test]
fn test_single_byte_payload() {
    let codec = PrefixLengthCodec::new();
    let wire = encode(&codec, &[0x42]);
    assert_eq!(&wire[..], &[1, 0, 0x42]);
    let decoded = codec.box_clone().decode_all(&wire).expect("decode");
    assert_eq!(frames(decoded), vec![Bytes::from_static(&[0x42])]);
}

#[test]
fn test_max_standard_payload_roundtrip() {
    let codec = PrefixLengthCodec::new();
    let payload = vec![0xAB; 65_535];
    let wire = encode(&codec, &payload);
    assert_eq!(&wire[..2], &[0xFF, 0xFF]);

    let decoded = codec.box_clone().decode_all(&wire).expect("decode");
    assert_eq!(frames(decoded), vec![Bytes::from(payload)]);
}

#[test]
fn test_standard_prefix_rejects_65536() {
    let codec = PrefixLengthCodec::new();
    let mut wire = BytesMut::new();
    let result = codec.encode_frame(&[vec![0u8; 65_536].as_slice()], &mut wire);
    assert!(matches!(result, Err(ProtocolError::OversizedPacket(65_536))));
    assert!(wire.is_empty(), "a rejected send must not write anything");
}

#[test]
fn test_extended_prefix_carries_large_payload() {
    let codec = PrefixLengthCodec::extended();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let wire = encode(&codec, &payload);
    assert_eq!(&wire[..4], &(payload.len() as u32).to_le_bytes());

    let decoded = codec.box_clone().decode_all(&wire).expect("decode");
    assert_eq!(frames(decoded), vec![Bytes::from(payload)]);
}

#[test]
fn test_declared_length_above_max_is_rejected_before_allocation() {
    let mut codec = PrefixLengthCodec::with_max_payload(PrefixWidth::Standard, 1000);
    let declared = 5000u16.to_le_bytes();
    let result = codec.decode_all(&declared);
    assert!(matches!(result, Err(ProtocolError::OversizedPacket(5000))));
}

#[test]
fn test_zero_length_prefix_is_close_not_empty_message() {
    let mut codec = PrefixLengthCodec::new();
    let decoded = codec.decode_all(&[0x00, 0x00]).expect("decode");
    assert_eq!(decoded, vec![Decoded::Close]);
}

#[test]
fn test_bytes_after_close_are_ignored() {
    let mut codec = PrefixLengthCodec::new();
    let decoded = codec.decode_all(&[0x00, 0x00, 0x01, 0x00, 0x7A]).expect("decode");
    assert_eq!(decoded, vec![Decoded::Close]);
}

#[test]
fn test_several_frames_in_one_chunk() {
    let codec = PrefixLengthCodec::new();
    let mut wire = BytesMut::new();
    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        codec.encode_frame(&[payload], &mut wire).expect("encode");
    }

    let decoded = codec.box_clone().decode_all(&wire).expect("decode");
    assert_eq!(
        frames(decoded),
        vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]
    );
}

#[test]
fn test_body_window_advances_with_partial_reads() {
    let mut codec = PrefixLengthCodec::new();
    codec.decode_all(&[4, 0]).expect("header");
    assert!(!codec.is_awaiting_length());

    let window = codec.window();
    assert_eq!((window.size, window.offset, window.count), (4, 0, 4));

    codec.decode_all(b"ab").expect("partial body");
    let window = codec.window();
    assert_eq!((window.size, window.offset, window.count), (4, 2, 2));
    assert_eq!(codec.receive_buffer().len(), 2);

    let decoded = codec.decode_all(b"cd").expect("rest of body");
    assert_eq!(frames(decoded), vec![Bytes::from_static(b"abcd")]);
    assert!(codec.is_awaiting_length());
}

#[test]
fn test_multipart_send_is_concatenated() {
    let codec = PrefixLengthCodec::new();
    let mut wire = BytesMut::new();
    let len = codec
        .encode_frame(&[&b"head"[..], &b""[..], &b"-"[..], &b"tail"[..]], &mut wire)
        .expect("encode");
    assert_eq!(len, 9);
    assert_eq!(&wire[..], b"\x09\x00head-tail");
}

#[test]
fn test_delimiter_boundary() {
    let mut codec = DelimiterCodec::new(&b"|"[..]).expect("codec");
    let decoded = codec.decode_all(b"ab|").expect("decode");
    assert_eq!(frames(decoded), vec![Bytes::from_static(b"ab")]);
}

#[test]
fn test_multibyte_delimiter_split_across_chunks() {
    let mut codec = DelimiterCodec::new(&b"<END>"[..]).expect("codec");
    assert!(frames(codec.decode_all(b"hello<E").expect("first")).is_empty());
    assert!(frames(codec.decode_all(b"N").expect("second")).is_empty());
    let decoded = codec.decode_all(b"D>world<END>").expect("third");
    assert_eq!(
        frames(decoded),
        vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]
    );
}

#[test]
fn test_delimiter_only_frame_is_empty_payload() {
    let mut codec = DelimiterCodec::lines();
    let decoded = codec.decode_all(b"\r\n").expect("decode");
    assert_eq!(frames(decoded), vec![Bytes::new()]);
}

#[test]
fn test_overlapping_delimiter_prefix() {
    // "aab" must match at the tail even though "aa" started a false match.
    let mut codec = DelimiterCodec::new(&b"ab"[..]).expect("codec");
    let decoded = codec.decode_all(b"xaab").expect("decode");
    assert_eq!(frames(decoded), vec![Bytes::from_static(b"xa")]);
}

#[test]
fn test_plain_chunks_follow_buffer_size() {
    let mut codec = PlainCodec::with_buffer_size(3).expect("codec");
    let decoded = codec.decode_all(b"abcdefg").expect("decode");
    assert_eq!(
        frames(decoded),
        vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"def"),
            Bytes::from_static(b"g"),
        ]
    );
}

#[test]
fn test_overrun_is_reported() {
    let mut codec = PrefixLengthCodec::new();
    let result = codec.on_bytes_received(3);
    assert!(matches!(result, Err(ProtocolError::InvalidFrame(_))));
}

#[test]
fn test_clones_start_fresh() {
    let mut template = PrefixLengthCodec::new();
    template.decode_all(&[9, 0, 1, 2]).expect("partial");
    let clone = template.box_clone();
    assert_eq!(clone.window().size, 2);
    assert_eq!(clone.window().offset, 0);
}
