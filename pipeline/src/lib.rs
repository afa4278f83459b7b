//! Policy composition over the framed messaging core.
//!
//! Application data flows through four narrow, independently replaceable
//! capability layers:
//!
//! * [`link::Link`] - moves packets: memory loopback, byte-stream rings,
//!   shared memory.
//! * [`transport::Transport`] - wraps/unwraps packet envelopes: length
//!   prefixes, checksums, timestamps, or any right-nested composition.
//! * [`message::MessageCodec`] - turns application values into bytes and
//!   dispatches inbound payloads: raw bytes, type-tagged records, JSON
//!   documents, plus compression/encryption/batching decorators.
//! * [`service::Service`] - executes the delivered message: pass-through,
//!   routing, deferred execution, and statistics/filter/retry decorators.
//!
//! [`pipeline::Pipeline`] owns one policy of each kind by value and runs the
//! two directions:
//!
//! ```ascii
//! send:    Message::encode -> Transport::wrap   -> Link::write
//! receive: Link::read      -> Transport::unwrap -> Message::dispatch -> Service::handle
//! ```
//!
//! Policies are composed by value with static dispatch and no cyclic
//! references; the pipeline is the sole owner of its stack.

pub mod link;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod transport;

pub use self::pipeline::{Pipeline, PipelineControl};
