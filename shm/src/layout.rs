//! Memory layout of the shared segment.
//!
//! ```ascii
//! 0:                 ControlBlock (padded to a cache line)
//! mutex_offset(0):   pthread mutex for endpoint 0 (padded to a cache line)
//! ...                one mutex per endpoint
//! ring_offset(0):    RingHeader for endpoint 0    (one cache line)
//!                    ReaderSlot[max_readers]      (one cache line each)
//!                    data[buffer_size]
//! ...                one ring region per endpoint
//! ```
//!
//! Every sub-structure starts on a 64-byte boundary so the atomics in
//! `RingHeader` and each `ReaderSlot` sit on their own cache line.

use anyhow::{bail, Result};
use std::mem::size_of;
use std::sync::atomic::AtomicU32;

pub const SHM_MAGIC: u32 = 0x5348_4D32; // "SHM2"
pub const SHM_VERSION: u32 = 2;
pub const CACHE_LINE: usize = 64;

/// Size of the in-memory record header preceding every message.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Reader-slot id meaning "no reader".
pub const INVALID_READER_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmConfig {
    /// Byte region per endpoint; must be a power of two.
    pub buffer_size: u32,
    pub max_endpoints: u32,
    pub max_readers_per_endpoint: u32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        ShmConfig {
            buffer_size: 65536,
            max_endpoints: 16,
            max_readers_per_endpoint: 8,
        }
    }
}

impl ShmConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.buffer_size.is_power_of_two() || self.buffer_size < 256 {
            bail!(
                "buffer size must be a power of two of at least 256, was {}",
                self.buffer_size
            );
        }
        if self.max_endpoints == 0 || self.max_readers_per_endpoint == 0 {
            bail!("endpoint and reader counts must be positive");
        }
        Ok(())
    }
}

#[repr(C)]
pub struct ControlBlock {
    pub magic: u32,
    pub version: u32,
    pub buffer_size: u32,
    pub max_endpoints: u32,
    pub max_readers_per_endpoint: u32,
    pub ref_count: AtomicU32,
}

#[repr(C, align(64))]
pub struct RingHeader {
    pub write_pos: AtomicU32,
    pub capacity: u32,
    pub mask: u32,
    pub max_readers: u32,
}

/// One registered reader's state. All fields are atomics: `read_pos` is the
/// reader-to-writer publication channel, the others are mutated while peers
/// may be scanning the slot array.
#[repr(C, align(64))]
pub struct ReaderSlot {
    pub read_pos: AtomicU32,
    pub active: AtomicU32,
    pub reader_id: AtomicU32,
    pub last_access_time: AtomicU32,
}

fn align_up(value: usize) -> usize {
    (value + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

/// Offset calculator for one segment configuration.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLayout {
    cfg: ShmConfig,
}

impl SegmentLayout {
    pub fn new(cfg: ShmConfig) -> SegmentLayout {
        SegmentLayout { cfg }
    }

    pub fn config(&self) -> &ShmConfig {
        &self.cfg
    }

    pub fn mutex_stride(&self) -> usize {
        align_up(size_of::<libc::pthread_mutex_t>())
    }

    pub fn mutex_offset(&self, endpoint: u32) -> usize {
        debug_assert!(endpoint < self.cfg.max_endpoints);
        align_up(size_of::<ControlBlock>()) + endpoint as usize * self.mutex_stride()
    }

    fn rings_offset(&self) -> usize {
        self.mutex_offset(0) + self.cfg.max_endpoints as usize * self.mutex_stride()
    }

    pub fn endpoint_stride(&self) -> usize {
        align_up(size_of::<RingHeader>())
            + self.cfg.max_readers_per_endpoint as usize * size_of::<ReaderSlot>()
            + self.cfg.buffer_size as usize
    }

    pub fn ring_offset(&self, endpoint: u32) -> usize {
        debug_assert!(endpoint < self.cfg.max_endpoints);
        self.rings_offset() + endpoint as usize * self.endpoint_stride()
    }

    pub fn slots_offset(&self, endpoint: u32) -> usize {
        self.ring_offset(endpoint) + align_up(size_of::<RingHeader>())
    }

    pub fn data_offset(&self, endpoint: u32) -> usize {
        self.slots_offset(endpoint)
            + self.cfg.max_readers_per_endpoint as usize * size_of::<ReaderSlot>()
    }

    pub fn total_size(&self) -> usize {
        self.rings_offset() + self.cfg.max_endpoints as usize * self.endpoint_stride()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_struct_sizes_are_cache_line_bounded() {
        assert_eq!(size_of::<RingHeader>(), CACHE_LINE);
        assert_eq!(size_of::<ReaderSlot>(), CACHE_LINE);
        assert!(size_of::<ControlBlock>() <= CACHE_LINE);
    }

    #[test]
    fn test_offsets_are_cache_line_aligned() {
        let layout = SegmentLayout::new(ShmConfig::default());
        let cfg = *layout.config();

        for ep in 0..cfg.max_endpoints {
            assert_eq!(layout.mutex_offset(ep) % CACHE_LINE, 0);
            assert_eq!(layout.ring_offset(ep) % CACHE_LINE, 0);
            assert_eq!(layout.slots_offset(ep) % CACHE_LINE, 0);
            assert_eq!(layout.data_offset(ep) % CACHE_LINE, 0);
        }
        assert!(layout.total_size() > 0);
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let layout = SegmentLayout::new(ShmConfig {
            buffer_size: 1024,
            max_endpoints: 3,
            max_readers_per_endpoint: 2,
        });

        for ep in 0..3 {
            let data_end = layout.data_offset(ep) + 1024;
            if ep + 1 < 3 {
                assert!(data_end <= layout.ring_offset(ep + 1));
            } else {
                assert!(data_end <= layout.total_size());
            }
        }
        assert!(layout.mutex_offset(2) + layout.mutex_stride() <= layout.ring_offset(0));
    }

    #[rstest]
    #[case::not_power_of_two(ShmConfig { buffer_size: 1000, ..ShmConfig::default() })]
    #[case::too_small(ShmConfig { buffer_size: 128, ..ShmConfig::default() })]
    #[case::no_endpoints(ShmConfig { max_endpoints: 0, ..ShmConfig::default() })]
    #[case::no_readers(ShmConfig { max_readers_per_endpoint: 0, ..ShmConfig::default() })]
    fn test_config_validation_rejects(#[case] cfg: ShmConfig) {
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ShmConfig::default().validate().is_ok());
    }
}
