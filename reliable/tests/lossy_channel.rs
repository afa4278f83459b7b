//! End-to-end session over a deterministic lossy channel: every frame is
//! framed with the wire codec, some first transmissions are dropped, and
//! the retransmission timer recovers them. The application must see every
//! payload exactly once, in order.

use protocol::frame::{self, FrameFlags, FrameHeader};
use reliable::ReliableContext;
use std::collections::HashSet;

const MESSAGES: u32 = 20;
const WINDOW: u8 = 4;

/// Drops the first transmission of every third sequence number.
struct LossyChannel {
    in_flight: Vec<Vec<u8>>,
    dropped_once: HashSet<u32>,
}

impl LossyChannel {
    fn new() -> LossyChannel {
        LossyChannel {
            in_flight: Vec::new(),
            dropped_once: HashSet::new(),
        }
    }

    fn transmit(&mut self, wire: &[u8]) {
        let (header, _) = frame::decode_to_vec(wire).expect("sender emits valid frames");
        if header.sequence % 3 == 0 && self.dropped_once.insert(header.sequence) {
            return; // lost on the wire
        }
        self.in_flight.push(wire.to_vec());
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.in_flight)
    }
}

#[test]
fn test_all_messages_arrive_in_order_despite_losses() {
    let mut sender = ReliableContext::new(WINDOW);
    let mut receiver = ReliableContext::new(WINDOW);
    let mut channel = LossyChannel::new();

    let mut delivered: Vec<u32> = Vec::new();
    let mut next_to_submit: u32 = 0;
    let mut now_ms: u64 = 0;

    // drive both sides until everything is delivered; the bound only guards
    // against a livelocked implementation
    for _round in 0..200 {
        now_ms += 400;

        // submit new messages while the window allows
        while next_to_submit < MESSAGES && sender.can_send() {
            let payload = next_to_submit.to_le_bytes();
            let mut header = FrameHeader::new(1, 2, 0);
            let wire = sender
                .on_send(&payload, &mut header, now_ms)
                .expect("window was checked")
                .to_vec();
            channel.transmit(&wire);
            next_to_submit += 1;
        }

        // retransmit anything that timed out
        let mut retransmissions = Vec::new();
        sender.poll(now_ms, |wire| retransmissions.push(wire.to_vec()));
        for wire in &retransmissions {
            channel.transmit(wire);
        }

        // receiver side: decode, deliver, ack
        for wire in channel.drain() {
            let (header, payload) = frame::decode_to_vec(&wire).unwrap();
            let expected_next = receiver.next_rx_seq();

            let Ok(ack) = receiver.on_receive(&header) else {
                continue; // outside the window; a later retransmission wins
            };
            assert!(ack.flags.contains(FrameFlags::ACK));

            // payloads carry their own sequence number, so everything the
            // cursor just walked past is deliverable by value
            if header.sequence == expected_next {
                assert_eq!(u32::from_le_bytes(payload[..4].try_into().unwrap()), header.sequence);
                for seq in expected_next..receiver.next_rx_seq() {
                    delivered.push(seq);
                }
            }

            // acks travel back losslessly
            sender.on_ack(&ack).unwrap();
        }

        if delivered.len() == MESSAGES as usize {
            break;
        }
    }

    let expected: Vec<u32> = (0..MESSAGES).collect();
    assert_eq!(delivered, expected, "payloads lost, duplicated or reordered");

    let stats = sender.stats();
    assert_eq!(stats.tx_frames, MESSAGES);
    assert!(stats.retransmits > 0, "the lossy channel must force retransmissions");

    let receiver_stats = receiver.stats();
    assert_eq!(receiver_stats.rx_frames, MESSAGES);
}
