//! Per-peer sliding-window send/receive state.
//!
//! The window is at most 32 frames wide: pending and received frames are
//! tracked in 32-bit masks indexed by the offset of a sequence number from
//! the respective window base. Sequence numbers are 32 bits on the wire;
//! all comparisons are performed on base-anchored offsets with wrapping
//! arithmetic, so the engine is well defined across the 2^32 boundary.

use protocol::error::CommError;
use protocol::frame::{self, FrameFlags, FrameHeader, HEADER_SIZE};
use protocol::limits::Limits;
use tracing::{debug, trace};

const DEFAULT_RTO_MS: u64 = 1000;

struct TxSlot {
    /// Encoded wire bytes of the outbound frame, kept for retransmission.
    /// These are the exact bytes handed to the caller by `on_send`, so a
    /// retransmission is byte-identical to the original send.
    frame: Vec<u8>,
    sent_at_ms: u64,
}

/// Named statistics counters. `tx_frames` / `rx_frames` are the sequence
/// totals; the remaining fields count individual events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReliableStats {
    pub tx_frames: u32,
    pub rx_frames: u32,
    pub retransmits: u32,
    pub duplicates: u32,
    pub out_of_order: u32,
}

pub struct ReliableContext {
    window_size: u8,
    max_frame_size: usize,

    next_tx_seq: u32,
    tx_window_base: u32,
    tx_pending_mask: u32,
    tx_slots: Vec<TxSlot>,

    next_rx_seq: u32,
    rx_window_base: u32,
    rx_received_mask: u32,

    rto_ms: u64,

    stat_retransmits: u32,
    stat_duplicates: u32,
    stat_out_of_order: u32,
}

impl ReliableContext {
    /// A context with the standard limits. `window_size` is clamped to
    /// `[1, min(max_window_size, 32)]`.
    pub fn new(window_size: u8) -> ReliableContext {
        ReliableContext::with_limits(window_size, &Limits::STANDARD)
    }

    pub fn with_limits(window_size: u8, limits: &Limits) -> ReliableContext {
        let window_size = window_size.clamp(1, limits.max_window_size.min(32));

        ReliableContext {
            window_size,
            max_frame_size: limits.max_frame_size,
            next_tx_seq: 0,
            tx_window_base: 0,
            tx_pending_mask: 0,
            tx_slots: (0..window_size)
                .map(|_| TxSlot {
                    frame: Vec::with_capacity(limits.max_frame_size),
                    sent_at_ms: 0,
                })
                .collect(),
            next_rx_seq: 0,
            rx_window_base: 0,
            rx_received_mask: 0,
            rto_ms: DEFAULT_RTO_MS,
            stat_retransmits: 0,
            stat_duplicates: 0,
            stat_out_of_order: 0,
        }
    }

    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    pub fn can_send(&self) -> bool {
        self.next_tx_seq.wrapping_sub(self.tx_window_base) < self.window_size as u32
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn set_rto_ms(&mut self, rto_ms: u64) {
        self.rto_ms = rto_ms;
    }

    /// Registers an outbound payload: assigns the next sequence number to
    /// `header`, encodes the frame into the retransmission cache and returns
    /// the wire bytes to put on the channel.
    ///
    /// Fails with `Overflow` when the send window is full, and with `NoMem`
    /// when the frame would exceed the maximum frame size.
    pub fn on_send(
        &mut self,
        payload: &[u8],
        header: &mut FrameHeader,
        now_ms: u64,
    ) -> Result<&[u8], CommError> {
        if !self.can_send() {
            return Err(CommError::Overflow);
        }
        if HEADER_SIZE + payload.len() > self.max_frame_size {
            return Err(CommError::NoMem);
        }

        header.sequence = self.next_tx_seq;

        let slot_index = (self.next_tx_seq % self.window_size as u32) as usize;
        let slot = &mut self.tx_slots[slot_index];
        slot.frame.resize(HEADER_SIZE + payload.len(), 0);
        let written = frame::encode(&mut slot.frame, payload, header)?;
        slot.frame.truncate(written);
        slot.sent_at_ms = now_ms;

        let offset = self.next_tx_seq.wrapping_sub(self.tx_window_base);
        if offset < 32 {
            self.tx_pending_mask |= 1 << offset;
        }

        trace!("registered outbound frame seq {}", self.next_tx_seq);
        self.next_tx_seq = self.next_tx_seq.wrapping_add(1);

        Ok(&self.tx_slots[slot_index].frame)
    }

    /// Processes the header of a received data frame and produces the
    /// cumulative ACK to send back.
    ///
    /// In-order frames advance `next_rx_seq` through any contiguously
    /// buffered successors; frames ahead of the delivery cursor are recorded
    /// in the receive mask; frames behind it count as duplicates. All three
    /// are successes. A frame outside the receive window is `Invalid`.
    /// Before the first in-order frame of a session has been accepted an
    /// out-of-order arrival is still buffered, but the call reports
    /// `Invalid` and produces no ACK - there is nothing to cumulatively
    /// acknowledge yet.
    pub fn on_receive(&mut self, header: &FrameHeader) -> Result<FrameHeader, CommError> {
        let recv_seq = header.sequence;
        let offset = recv_seq.wrapping_sub(self.rx_window_base);
        let expected = self.next_rx_seq.wrapping_sub(self.rx_window_base);

        if offset == expected {
            self.next_rx_seq = self.next_rx_seq.wrapping_add(1);

            // deliver everything that became contiguous
            loop {
                let next_offset = self.next_rx_seq.wrapping_sub(self.rx_window_base);
                if next_offset < 32 && self.rx_received_mask & (1 << next_offset) != 0 {
                    self.rx_received_mask &= !(1 << next_offset);
                    self.next_rx_seq = self.next_rx_seq.wrapping_add(1);
                } else {
                    break;
                }
            }

            while self.next_rx_seq.wrapping_sub(self.rx_window_base) >= self.window_size as u32 {
                self.rx_window_base = self.rx_window_base.wrapping_add(1);
                self.rx_received_mask >>= 1;
            }
        } else if offset > expected {
            if offset >= self.window_size as u32 || offset >= 32 {
                return Err(CommError::Invalid);
            }
            if self.rx_received_mask & (1 << offset) != 0 {
                self.stat_duplicates += 1;
            } else {
                self.stat_out_of_order += 1;
                self.rx_received_mask |= 1 << offset;
            }
            if self.next_rx_seq == 0 {
                // the frame is buffered, but nothing has been delivered yet
                // so there is no cumulative ack to give
                debug!("frame seq {} buffered before any in-order delivery", recv_seq);
                return Err(CommError::Invalid);
            }
        } else {
            // behind the delivery cursor
            self.stat_duplicates += 1;
        }

        Ok(ack_build(header, self.next_rx_seq.wrapping_sub(1)))
    }

    /// Processes a cumulative ACK: clears the acknowledged bits and advances
    /// the send window base. A stale ACK (behind the window base) is a
    /// successful no-op.
    pub fn on_ack(&mut self, ack: &FrameHeader) -> Result<(), CommError> {
        if !ack.flags.contains(FrameFlags::ACK) {
            return Err(CommError::Invalid);
        }

        let offset = ack.sequence.wrapping_sub(self.tx_window_base);
        if offset > u32::MAX / 2 {
            trace!("stale ack for seq {}", ack.sequence);
            return Ok(());
        }

        let shift = (offset as u64 + 1).min(32) as u32;
        self.tx_pending_mask = if shift >= 32 {
            0
        } else {
            self.tx_pending_mask >> shift
        };
        self.tx_window_base = self.tx_window_base.wrapping_add(shift);
        trace!(
            "ack for seq {} - window base now {}",
            ack.sequence,
            self.tx_window_base
        );
        Ok(())
    }

    /// Invokes `retransmit` for every pending frame whose last send is older
    /// than the retransmission timeout, refreshing its timestamp.
    pub fn poll<F: FnMut(&[u8])>(&mut self, now_ms: u64, mut retransmit: F) {
        for i in 0..(self.window_size as u32).min(32) {
            if self.tx_pending_mask & (1 << i) == 0 {
                continue;
            }
            let seq = self.tx_window_base.wrapping_add(i);
            let slot_index = (seq % self.window_size as u32) as usize;
            let slot = &mut self.tx_slots[slot_index];
            if now_ms.saturating_sub(slot.sent_at_ms) > self.rto_ms {
                slot.sent_at_ms = now_ms;
                self.stat_retransmits += 1;
                debug!("retransmitting frame seq {}", seq);
                retransmit(&slot.frame);
            }
        }
    }

    pub fn stats(&self) -> ReliableStats {
        ReliableStats {
            tx_frames: self.next_tx_seq,
            rx_frames: self.next_rx_seq,
            retransmits: self.stat_retransmits,
            duplicates: self.stat_duplicates,
            out_of_order: self.stat_out_of_order,
        }
    }

    /// Resets the full session state: windows, masks and counters. The
    /// window size and timeout configuration survive.
    pub fn reset(&mut self) {
        self.next_tx_seq = 0;
        self.tx_window_base = 0;
        self.tx_pending_mask = 0;
        self.next_rx_seq = 0;
        self.rx_window_base = 0;
        self.rx_received_mask = 0;
        self.stat_retransmits = 0;
        self.stat_duplicates = 0;
        self.stat_out_of_order = 0;
        for slot in &mut self.tx_slots {
            slot.frame.clear();
            slot.sent_at_ms = 0;
        }
    }

    // window internals, exposed for tests and diagnostics

    pub fn next_tx_seq(&self) -> u32 {
        self.next_tx_seq
    }

    pub fn tx_window_base(&self) -> u32 {
        self.tx_window_base
    }

    pub fn tx_pending_mask(&self) -> u32 {
        self.tx_pending_mask
    }

    pub fn next_rx_seq(&self) -> u32 {
        self.next_rx_seq
    }

    pub fn rx_window_base(&self) -> u32 {
        self.rx_window_base
    }
}

/// Builds the cumulative ACK header answering `peer_header`: ACK flag set,
/// header-only length, endpoints swapped, `sequence` carrying the highest
/// contiguously delivered sequence. The CRC fields materialise when the
/// header is encoded.
pub fn ack_build(peer_header: &FrameHeader, ack_seq: u32) -> FrameHeader {
    FrameHeader {
        magic: frame::MAGIC,
        version: frame::VERSION,
        flags: FrameFlags::ACK,
        length: HEADER_SIZE as u32,
        src_endpoint: peer_header.dst_endpoint,
        dst_endpoint: peer_header.src_endpoint,
        sequence: ack_seq,
        cmd_type: 0,
        header_crc: 0,
        payload_crc: 0,
    }
}
