#![no_main]

use framelink::core::{DelimiterCodec, FrameCodec, PlainCodec, PrefixLengthCodec, PrefixWidth};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary stream bytes must never panic a decoder or make it allocate past its limit
    let mut decoders: Vec<Box<dyn FrameCodec>> = vec![
        Box::new(PrefixLengthCodec::new()),
        Box::new(PrefixLengthCodec::with_max_payload(PrefixWidth::Extended, 1 << 16)),
        Box::new(DelimiterCodec::lines().max_frame(4096)),
        Box::new(PlainCodec::new()),
    ];

    for decoder in &mut decoders {
        let _ = decoder.decode_all(data);
    }

    // Same input split at the first byte's value
    if let Some((&split, rest)) = data.split_first() {
        let (head, tail) = rest.split_at((split as usize).min(rest.len()));
        let mut decoder = PrefixLengthCodec::new();
        if decoder.decode_all(head).is_ok() {
            let _ = decoder.decode_all(tail);
        }
    }
});
