//! Inter-process broadcast transport over POSIX shared memory.
//!
//! One named segment holds a control block, a process-shared recursive mutex
//! per endpoint, and per endpoint a multi-reader ring buffer: a single
//! cache-line-aligned write position, an array of cache-line-aligned reader
//! slots, and a power-of-two byte region. Writers to an endpoint's ring are
//! serialised by that endpoint's mutex and bounded by the slowest registered
//! reader; each reader owns one slot and advances independently.
//!
//! The writer publishes `write_pos` with release semantics and readers load
//! it with acquire; each reader publishes its `read_pos` with release for
//! the writer's slowest-reader scan. Nothing in this crate ever blocks
//! without a timeout.

mod layout;
mod mutex;
mod ring;
mod segment;

pub use layout::{ShmConfig, RECORD_HEADER_SIZE};
pub use segment::{unlink, SegmentStats, SharedMemorySegment};

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init()
            .ok();
    }
}
