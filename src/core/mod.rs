//! # Core Framing Components
//!
//! Messages and the framing codecs that turn a byte stream into them.
//!
//! ## Components
//! - **Message**: one reassembled payload plus metadata
//! - **Codec**: the reassembly/encoding contract shared by all variants
//! - **PrefixLength**: `[len u16/u32 LE][payload]`
//! - **Delimiter**: `[payload][delimiter]`
//! - **Plain**: raw reads, no framing
//!
//! ## Safety Limits
//! - Length prefixes above the configured maximum are rejected before allocation
//! - Delimiter accumulators are bounded by `max_frame`

pub mod codec;
pub mod delimiter;
pub mod message;
pub mod plain;
pub mod prefix;

pub use codec::{Decoded, FrameCodec, ReceiveWindow};
pub use delimiter::DelimiterCodec;
pub use message::Message;
pub use plain::PlainCodec;
pub use prefix::{PrefixLengthCodec, PrefixWidth};
