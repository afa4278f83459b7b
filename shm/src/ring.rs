//! The per-endpoint multi-reader ring.
//!
//! Positions (`write_pos`, `read_pos`) are monotonically increasing u32
//! values; the byte index is `pos & mask`. A record is a 24-byte header
//! followed by the payload, both of which may wrap across the region
//! boundary. The writer never overtakes the slowest active reader, so a
//! reader always observes either a complete record or nothing.

use crate::layout::{ReaderSlot, RingHeader, INVALID_READER_ID, RECORD_HEADER_SIZE};
use std::sync::atomic::Ordering;
use tracing::trace;

/// In-memory header preceding every message in the ring. `crc32` is
/// informational and currently always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub sender_id: u32,
    pub sequence: u32,
    pub timestamp: u32,
    pub crc32: u32,
    pub flags: u8,
}

impl RecordHeader {
    fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.sender_id.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[20] = self.flags;
        bytes
    }

    fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> RecordHeader {
        let field = |offset: usize| {
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4-byte slice"))
        };
        RecordHeader {
            length: field(0),
            sender_id: field(4),
            sequence: field(8),
            timestamp: field(12),
            crc32: field(16),
            flags: bytes[20],
        }
    }
}

/// View of one endpoint's ring inside the mapping. Copyable and cheap; the
/// backing memory is owned by the segment.
#[derive(Clone, Copy)]
pub struct MultiReaderRing {
    header: *mut RingHeader,
    slots: *mut ReaderSlot,
    slot_count: usize,
    data: *mut u8,
}

impl MultiReaderRing {
    /// # Safety
    /// The three regions must point into a live mapping laid out per
    /// [`crate::layout::SegmentLayout`]: `slots` spanning `slot_count`
    /// elements and `data` spanning `capacity` bytes, all valid for the
    /// lifetime of every call on the returned value.
    pub unsafe fn from_parts(
        header: *mut RingHeader,
        slots: *mut ReaderSlot,
        slot_count: usize,
        data: *mut u8,
    ) -> MultiReaderRing {
        MultiReaderRing {
            header,
            slots,
            slot_count,
            data,
        }
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    fn slots(&self) -> &[ReaderSlot] {
        unsafe { std::slice::from_raw_parts(self.slots, self.slot_count) }
    }

    /// Initialises a freshly zeroed ring region. Creating process only - at
    /// this point no peer can observe the segment.
    pub fn init(&self, capacity: u32, max_readers: u32) {
        debug_assert!(capacity.is_power_of_two());

        unsafe {
            (*self.header).capacity = capacity;
            (*self.header).mask = capacity - 1;
            (*self.header).max_readers = max_readers;
        }
        self.header().write_pos.store(0, Ordering::Relaxed);

        for slot in self.slots() {
            slot.read_pos.store(0, Ordering::Relaxed);
            slot.active.store(0, Ordering::Relaxed);
            slot.reader_id.store(INVALID_READER_ID, Ordering::Relaxed);
            slot.last_access_time.store(0, Ordering::Relaxed);
        }
    }

    /// Claims a free reader slot for `reader_id`, joining at the current
    /// head so historical data is skipped. `false` when every slot is taken.
    pub fn register_reader(&self, reader_id: u32, now: u32) -> bool {
        for slot in self.slots() {
            if slot
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.reader_id.store(reader_id, Ordering::Release);
                slot.read_pos.store(
                    self.header().write_pos.load(Ordering::Acquire),
                    Ordering::Release,
                );
                slot.last_access_time.store(now, Ordering::Release);
                return true;
            }
        }
        false
    }

    pub fn unregister_reader(&self, reader_id: u32) {
        for slot in self.slots() {
            if slot.reader_id.load(Ordering::Acquire) == reader_id
                && slot.active.load(Ordering::Acquire) != 0
            {
                slot.active.store(0, Ordering::Release);
                slot.reader_id.store(INVALID_READER_ID, Ordering::Release);
            }
        }
    }

    pub fn active_readers(&self) -> u32 {
        self.slots()
            .iter()
            .filter(|slot| slot.active.load(Ordering::Acquire) != 0)
            .count() as u32
    }

    /// The smallest position any active reader still needs; the write
    /// position itself when no reader is registered.
    pub fn slowest_reader_pos(&self) -> u32 {
        let write_pos = self.header().write_pos.load(Ordering::Acquire);
        let mut slowest = write_pos;
        for slot in self.slots() {
            if slot.active.load(Ordering::Acquire) != 0 {
                let read_pos = slot.read_pos.load(Ordering::Acquire);
                // the candidate lagging furthest behind the head wins
                if write_pos.wrapping_sub(read_pos) > write_pos.wrapping_sub(slowest) {
                    slowest = read_pos;
                }
            }
        }
        slowest
    }

    pub fn available_write(&self) -> u32 {
        let write_pos = self.header().write_pos.load(Ordering::Acquire);
        self.header().capacity - write_pos.wrapping_sub(self.slowest_reader_pos())
    }

    pub fn available_read(&self, reader_id: u32) -> u32 {
        match self.find_slot(reader_id) {
            Some(slot) => {
                let write_pos = self.header().write_pos.load(Ordering::Acquire);
                write_pos.wrapping_sub(slot.read_pos.load(Ordering::Acquire))
            }
            None => 0,
        }
    }

    /// Appends one record visible to every registered reader. The caller
    /// must hold the endpoint's mutex - the ring itself only orders the
    /// publication of `write_pos`.
    pub fn write(&self, src: &[u8], sender_id: u32, now: u32) -> bool {
        if src.len() > (u32::MAX as usize) - RECORD_HEADER_SIZE {
            return false;
        }
        let total_len = (RECORD_HEADER_SIZE + src.len()) as u32;
        if self.available_write() < total_len {
            return false;
        }

        let write_pos = self.header().write_pos.load(Ordering::Relaxed);
        let record = RecordHeader {
            length: src.len() as u32,
            sender_id,
            sequence: write_pos,
            timestamp: now,
            crc32: 0,
            flags: 0,
        };

        self.copy_in(write_pos, &record.to_bytes());
        self.copy_in(write_pos.wrapping_add(RECORD_HEADER_SIZE as u32), src);

        self.header()
            .write_pos
            .store(write_pos.wrapping_add(total_len), Ordering::Release);
        trace!("published {} bytes from sender {}", src.len(), sender_id);
        true
    }

    /// Takes the next record for `reader_id`. `None` when the reader is not
    /// registered or no complete record is buffered; an incomplete record
    /// leaves the read position untouched.
    pub fn read(&self, reader_id: u32, now: u32) -> Option<Vec<u8>> {
        let slot = self.find_slot(reader_id)?;

        let read_pos = slot.read_pos.load(Ordering::Relaxed);
        let write_pos = self.header().write_pos.load(Ordering::Acquire);

        if write_pos.wrapping_sub(read_pos) < RECORD_HEADER_SIZE as u32 {
            return None;
        }

        let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
        self.copy_out(read_pos, &mut header_bytes);
        let record = RecordHeader::from_bytes(&header_bytes);

        let payload_pos = read_pos.wrapping_add(RECORD_HEADER_SIZE as u32);
        if write_pos.wrapping_sub(payload_pos) < record.length {
            return None;
        }

        let mut payload = vec![0u8; record.length as usize];
        self.copy_out(payload_pos, &mut payload);

        slot.read_pos
            .store(payload_pos.wrapping_add(record.length), Ordering::Release);
        slot.last_access_time.store(now, Ordering::Release);
        Some(payload)
    }

    fn find_slot(&self, reader_id: u32) -> Option<&ReaderSlot> {
        self.slots().iter().find(|slot| {
            slot.reader_id.load(Ordering::Acquire) == reader_id
                && slot.active.load(Ordering::Acquire) != 0
        })
    }

    fn copy_in(&self, pos: u32, bytes: &[u8]) {
        let capacity = self.header().capacity as usize;
        let index = (pos & self.header().mask) as usize;
        let first_part = bytes.len().min(capacity - index);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(index), first_part);
            if first_part < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first_part),
                    self.data,
                    bytes.len() - first_part,
                );
            }
        }
    }

    fn copy_out(&self, pos: u32, bytes: &mut [u8]) {
        let capacity = self.header().capacity as usize;
        let index = (pos & self.header().mask) as usize;
        let first_part = bytes.len().min(capacity - index);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(index), bytes.as_mut_ptr(), first_part);
            if first_part < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    self.data,
                    bytes.as_mut_ptr().add(first_part),
                    bytes.len() - first_part,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// A self-contained ring over plain heap memory, bypassing the segment.
    struct TestRing {
        header: *mut RingHeader,
        slots: *mut ReaderSlot,
        slot_count: usize,
        data: *mut u8,
        capacity: usize,
    }

    impl TestRing {
        fn new(capacity: u32, max_readers: u32) -> TestRing {
            let header = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<RingHeader>() }));
            let slots_vec: Vec<ReaderSlot> = (0..max_readers)
                .map(|_| unsafe { std::mem::zeroed::<ReaderSlot>() })
                .collect();
            let slots_box: Box<[ReaderSlot]> = slots_vec.into_boxed_slice();
            let slot_count = slots_box.len();
            let slots = Box::into_raw(slots_box) as *mut ReaderSlot;
            let data =
                Box::into_raw(vec![0u8; capacity as usize].into_boxed_slice()) as *mut u8;

            let test = TestRing {
                header,
                slots,
                slot_count,
                data,
                capacity: capacity as usize,
            };
            test.ring().init(capacity, max_readers);
            test
        }

        fn ring(&self) -> MultiReaderRing {
            unsafe { MultiReaderRing::from_parts(self.header, self.slots, self.slot_count, self.data) }
        }
    }

    impl Drop for TestRing {
        fn drop(&mut self) {
            unsafe {
                drop(Box::from_raw(self.header));
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.slots,
                    self.slot_count,
                )));
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.data,
                    self.capacity,
                )));
            }
        }
    }

    #[test]
    fn test_write_then_read() {
        let test = TestRing::new(1024, 4);
        let ring = test.ring();

        assert!(ring.register_reader(7, 100));
        assert!(ring.write(b"hello shared world", 3, 200));

        assert_eq!(ring.read(7, 201).unwrap(), b"hello shared world");
        assert_eq!(ring.read(7, 202), None);
    }

    #[test]
    fn test_unregistered_reader_sees_nothing() {
        let test = TestRing::new(1024, 4);
        let ring = test.ring();

        assert!(ring.write(b"nobody listens", 1, 0));
        assert_eq!(ring.read(42, 0), None);
        assert_eq!(ring.available_read(42), 0);
    }

    #[test]
    fn test_reader_joins_at_current_head() {
        let test = TestRing::new(1024, 4);
        let ring = test.ring();

        assert!(ring.write(b"history", 1, 0));
        assert!(ring.register_reader(9, 0));

        // the pre-registration record is not replayed
        assert_eq!(ring.read(9, 0), None);

        assert!(ring.write(b"fresh", 1, 0));
        assert_eq!(ring.read(9, 0).unwrap(), b"fresh");
    }

    #[test]
    fn test_each_reader_gets_every_record() {
        let test = TestRing::new(1024, 4);
        let ring = test.ring();

        assert!(ring.register_reader(1, 0));
        assert!(ring.register_reader(2, 0));

        assert!(ring.write(b"first", 0, 0));
        assert!(ring.write(b"second", 0, 0));

        assert_eq!(ring.read(1, 0).unwrap(), b"first");
        assert_eq!(ring.read(2, 0).unwrap(), b"first");
        assert_eq!(ring.read(1, 0).unwrap(), b"second");
        assert_eq!(ring.read(2, 0).unwrap(), b"second");
    }

    #[test]
    fn test_slot_exhaustion() {
        let test = TestRing::new(1024, 2);
        let ring = test.ring();

        assert!(ring.register_reader(1, 0));
        assert!(ring.register_reader(2, 0));
        assert!(!ring.register_reader(3, 0));

        ring.unregister_reader(1);
        assert!(ring.register_reader(3, 0));
        assert_eq!(ring.active_readers(), 2);
    }

    #[test]
    fn test_slowest_reader_bounds_the_writer() {
        let test = TestRing::new(256, 2);
        let ring = test.ring();

        assert!(ring.register_reader(1, 0));
        assert!(ring.register_reader(2, 0));

        // fill the ring; writes fail once the slowest reader is the bound
        let mut written = 0;
        while ring.write(&[0xAB; 40], 0, 0) {
            written += 1;
        }
        assert_eq!(written, 4); // 4 * (24 + 40) = 256

        // one reader draining fully does not unblock the writer
        while ring.read(1, 0).is_some() {}
        assert!(!ring.write(&[0xCD; 40], 0, 0));

        // the slow reader consuming one record frees exactly its footprint
        assert!(ring.read(2, 0).is_some());
        assert!(ring.write(&[0xCD; 40], 0, 0));
    }

    #[test]
    fn test_inactive_reader_does_not_constrain_the_writer() {
        let test = TestRing::new(256, 2);
        let ring = test.ring();

        assert!(ring.register_reader(1, 0));
        while ring.write(&[1; 40], 0, 0) {}

        ring.unregister_reader(1);
        assert_eq!(ring.available_write(), 256);
        assert!(ring.write(&[2; 40], 0, 0));
    }

    #[rstest]
    #[case::payload_wraps(200)]
    #[case::header_wraps(220)]
    fn test_records_wrap_across_the_boundary(#[case] first_len: usize) {
        let test = TestRing::new(256, 1);
        let ring = test.ring();
        assert!(ring.register_reader(1, 0));

        // position the head so the second record straddles the boundary
        let first: Vec<u8> = (0..first_len).map(|i| i as u8).collect();
        assert!(ring.write(&first, 0, 0));
        assert_eq!(ring.read(1, 0).unwrap(), first);

        let second: Vec<u8> = (0..100u8).rev().collect();
        assert!(ring.write(&second, 0, 0));
        assert_eq!(ring.read(1, 0).unwrap(), second);
    }

    #[test]
    fn test_long_run_of_messages() {
        let test = TestRing::new(512, 1);
        let ring = test.ring();
        assert!(ring.register_reader(1, 0));

        for round in 0..1000u32 {
            let message = round.to_le_bytes();
            assert!(ring.write(&message, 9, round), "write failed in round {round}");
            let got = ring.read(1, round).expect("a record must be available");
            assert_eq!(got, message);
        }
    }

    #[test]
    fn test_read_accounting_includes_the_record_header() {
        let test = TestRing::new(1024, 1);
        let ring = test.ring();
        assert!(ring.register_reader(1, 0));
        assert!(ring.write(b"x", 77, 123));

        assert_eq!(ring.available_read(1) as usize, RECORD_HEADER_SIZE + 1);
        assert_eq!(ring.read(1, 124).unwrap(), b"x");
        assert_eq!(ring.available_read(1), 0);
    }
}
