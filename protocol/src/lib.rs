//! Wire layer of the framed messaging stack.
//!
//! Everything in this crate is pure and reentrant: checksums, the 32-byte
//! frame header codec, TLV option records and endpoint identifiers. The
//! layers above (reliable delivery, shared-memory transport, the policy
//! pipeline) build exclusively on the types defined here.
//!
//! ## Frame format
//!
//! All multi-byte fields are little-endian on the wire. The header is 32
//! bytes, packed:
//!
//! ```ascii
//!  0: magic (u16) - constant 0xA55A
//!  2: version (u8) - constant 1
//!  3: flags (u8) - see [`frame::FrameFlags`]
//!  4: length (u32) - total frame length including the header
//!  8: src endpoint (u32)
//! 12: dst endpoint (u32)
//! 16: sequence (u32) - per-sender frame number; cumulative ack in ACK frames
//! 20: cmd type (u32) - application message type tag
//! 24: header crc (u32) - CRC-32 over bytes 0..28 with this field zeroed
//! 28: payload crc (u32) - CRC-32 over the payload, 0 if empty or disabled
//! ```
//!
//! A frame may be followed by TLV option records (see [`tlv`]); the embedded
//! decoder understands the single-byte length form only.

pub mod crc;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod limits;
pub mod tlv;

pub use error::CommError;
