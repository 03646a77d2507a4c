//! Property-based tests using proptest
//!
//! These tests validate framing invariants across randomly generated payloads
//! and randomly chosen read boundaries.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use framelink::core::{Decoded, DelimiterCodec, FrameCodec, PrefixLengthCodec, PrefixWidth};
use proptest::prelude::*;

/// Feed `wire` through `codec` in chunks whose sizes cycle through `chunks`.
fn decode_chunked(codec: &mut dyn FrameCodec, wire: &[u8], chunks: &[usize]) -> Vec<Decoded> {
    let mut out = Vec::new();
    let mut rest = wire;
    let mut i = 0;
    while !rest.is_empty() {
        let n = chunks[i % chunks.len()].clamp(1, rest.len());
        out.extend(codec.decode_all(&rest[..n]).expect("decode"));
        rest = &rest[n..];
        i += 1;
    }
    out
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

// Property: any non-empty payload up to the maximum survives a prefix-length round trip
proptest! {
    #[test]
    fn prop_prefix_roundtrip(payload in prop::collection::vec(any::<u8>(), 1..4096)) {
        let codec = PrefixLengthCodec::new();
        let mut wire = BytesMut::new();
        let len = codec.encode_frame(&[payload.as_slice()], &mut wire).expect("encode");
        prop_assert_eq!(len, payload.len());

        let decoded = codec.box_clone().decode_all(&wire).expect("decode");
        prop_assert_eq!(frames(decoded), vec![Bytes::from(payload)]);
    }
}

// Property: the extended prefix round-trips the same way
proptest! {
    #[test]
    fn prop_extended_roundtrip(payload in prop::collection::vec(any::<u8>(), 1..70_000)) {
        let codec = PrefixLengthCodec::extended();
        let mut wire = BytesMut::new();
        codec.encode_frame(&[payload.as_slice()], &mut wire).expect("encode");

        let decoded = codec.box_clone().decode_all(&wire).expect("decode");
        prop_assert_eq!(frames(decoded), vec![Bytes::from(payload)]);
    }
}

// Property: chunk boundaries never change what a prefix-length stream decodes to
proptest! {
    #[test]
    fn prop_prefix_partial_reads(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..300), 1..8),
        chunks in prop::collection::vec(1usize..17, 1..6),
    ) {
        let template = PrefixLengthCodec::with_max_payload(PrefixWidth::Standard, 300);
        let mut wire = BytesMut::new();
        for payload in &payloads {
            template.encode_frame(&[payload.as_slice()], &mut wire).expect("encode");
        }

        let whole = template.box_clone().decode_all(&wire).expect("decode");
        let mut chunked_codec = template.box_clone();
        let chunked = decode_chunked(chunked_codec.as_mut(), &wire, &chunks);
        let byte_wise = decode_chunked(template.box_clone().as_mut(), &wire, &[1]);

        prop_assert_eq!(&chunked, &whole);
        prop_assert_eq!(&byte_wise, &whole);
        let expected: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
        prop_assert_eq!(frames(whole), expected);
    }
}

// Property: chunk boundaries never change what a delimiter stream decodes to
proptest! {
    #[test]
    fn prop_delimiter_partial_reads(
        payloads in prop::collection::vec("[a-z0-9 ]{0,40}", 1..8),
        chunks in prop::collection::vec(1usize..9, 1..6),
    ) {
        let template = DelimiterCodec::lines();
        let mut wire = BytesMut::new();
        for payload in &payloads {
            template.encode_frame(&[payload.as_bytes()], &mut wire).expect("encode");
        }

        let whole = template.box_clone().decode_all(&wire).expect("decode");
        let chunked = decode_chunked(template.box_clone().as_mut(), &wire, &chunks);

        prop_assert_eq!(&chunked, &whole);
        let expected: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
        prop_assert_eq!(frames(whole), expected);
    }
}

// Property: declared lengths above the configured maximum are always violations
proptest! {
    #[test]
    fn prop_oversized_declarations_rejected(max in 1usize..1000, excess in 1u16..1000) {
        let mut codec = PrefixLengthCodec::with_max_payload(PrefixWidth::Standard, max);
        let declared = (max as u16).saturating_add(excess);
        prop_assert!(codec.decode_all(&declared.to_le_bytes()).is_err());
    }
}

// Property: encoding reports the payload length regardless of how it is split
proptest! {
    #[test]
    fn prop_multipart_length(parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..6)) {
        let codec = DelimiterCodec::new(&b"\0\0"[..]).expect("codec");
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let mut wire = BytesMut::new();
        let len = codec.encode_frame(&slices, &mut wire).expect("encode");

        let total: usize = parts.iter().map(Vec::len).sum();
        prop_assert_eq!(len, total);
        prop_assert_eq!(wire.len(), total + 2);
    }
}
