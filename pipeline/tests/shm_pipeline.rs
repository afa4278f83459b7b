//! Two pipelines talking across a shared-memory segment in one process -
//! the smallest end-to-end deployment of the full stack.

use pipeline::link::ShmLink;
use pipeline::message::RawBytes;
use pipeline::service::NoneService;
use pipeline::transport::CrcTransport;
use pipeline::Pipeline;
use protocol::endpoint::EndpointId;
use shm::{SharedMemorySegment, ShmConfig};

fn test_config() -> ShmConfig {
    ShmConfig {
        buffer_size: 4096,
        max_endpoints: 4,
        max_readers_per_endpoint: 4,
    }
}

fn segment_name(tag: &str) -> String {
    let name = format!("/framed-pipe-{}-{}", std::process::id(), tag);
    shm::unlink(&name);
    name
}

struct Cleanup(String);
impl Drop for Cleanup {
    fn drop(&mut self) {
        shm::unlink(&self.0);
    }
}

#[test]
fn test_shared_memory_round_trip() {
    let name = segment_name("roundtrip");
    let _cleanup = Cleanup(name.clone());

    let sender_segment = SharedMemorySegment::open(&name, 0, test_config()).unwrap();
    let receiver_segment = SharedMemorySegment::open(&name, 2, test_config()).unwrap();

    let mut sender = Pipeline::new(
        ShmLink::new(sender_segment),
        CrcTransport,
        RawBytes::new(),
        NoneService,
    );
    let mut receiver = Pipeline::new(
        ShmLink::new(receiver_segment),
        CrcTransport,
        RawBytes::new(),
        NoneService,
    );

    // endpoint 2 reads ring 1, where endpoint 0 publishes
    assert!(sender.send(&EndpointId::new(1, 0, 0), &b"across processes".to_vec()));

    let mut received = Vec::new();
    assert!(receiver.process_one(&mut |msg| received.push(msg)));
    assert_eq!(received, vec![b"across processes".to_vec()]);

    assert!(!receiver.process_one(&mut |_| {}));
}

#[test]
fn test_shared_memory_ordering_per_ring() {
    let name = segment_name("ordering");
    let _cleanup = Cleanup(name.clone());

    let sender_segment = SharedMemorySegment::open(&name, 0, test_config()).unwrap();
    let receiver_segment = SharedMemorySegment::open(&name, 2, test_config()).unwrap();

    let mut sender = Pipeline::new(
        ShmLink::new(sender_segment),
        CrcTransport,
        RawBytes::new(),
        NoneService,
    );
    let mut receiver = Pipeline::new(
        ShmLink::new(receiver_segment),
        CrcTransport,
        RawBytes::new(),
        NoneService,
    );

    let dst = EndpointId::new(1, 0, 0);
    for i in 0..10u8 {
        assert!(sender.send(&dst, &vec![i; 8]));
    }

    let mut received = Vec::new();
    while receiver.process_one(&mut |msg| received.push(msg)) {}

    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 8]).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_link_reports_segment_state() {
    let name = segment_name("state");
    let _cleanup = Cleanup(name.clone());

    let segment = SharedMemorySegment::open(&name, 0, test_config()).unwrap();
    let mtu = segment.mtu();

    let mut pipeline = Pipeline::new(
        ShmLink::new(segment),
        CrcTransport,
        RawBytes::new(),
        NoneService,
    );
    assert!(pipeline.is_connected());
    assert_eq!(pipeline.mtu(), mtu);

    pipeline.close();
    assert!(!pipeline.is_connected());
}
