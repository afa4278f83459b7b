//! Reliable delivery over any frame-dropping byte channel.
//!
//! The [`context::ReliableContext`] implements at-most-once-to-application,
//! at-least-once-on-wire semantics with a fixed sliding window: selective
//! acknowledgement through a receive mask, cumulative ACKs, and timer-driven
//! retransmission from a per-slot frame cache. It is window-oriented rather
//! than connection-oriented - there is no handshake and no teardown.
//!
//! The [`ringbuf::RingBuffer`] is the single-producer single-consumer byte
//! FIFO that link adapters use as their ingress/egress byte stream.
//!
//! Neither component ever suspends; the caller owns all scheduling.

pub mod context;
pub mod ringbuf;

pub use context::{ReliableContext, ReliableStats};
pub use ringbuf::RingBuffer;
