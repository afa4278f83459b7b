//! The transport policy: pure packet envelopes between message codec and
//! link.

use protocol::crc::crc32;
use protocol::error::CommError;
use protocol::limits::Limits;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wraps outbound packets into an envelope and unwraps inbound ones.
/// Implementations are pure apart from length/checksum bookkeeping.
pub trait Transport {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError>;
    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError>;
}

/// The identity envelope.
pub struct PassThrough;

impl Transport for PassThrough {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        Ok(data.to_vec())
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        Ok(data.to_vec())
    }
}

/// Prepends a 4-byte little-endian length. Unwrap rejects lengths beyond
/// the configured maximum frame size before trusting them.
pub struct LengthPrefixed {
    max_len: usize,
}

impl LengthPrefixed {
    pub fn new() -> LengthPrefixed {
        LengthPrefixed {
            max_len: Limits::STANDARD.max_frame_size,
        }
    }

    pub fn with_max_len(max_len: usize) -> LengthPrefixed {
        LengthPrefixed { max_len }
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        LengthPrefixed::new()
    }
}

impl Transport for LengthPrefixed {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        let mut result = Vec::with_capacity(4 + data.len());
        result.extend_from_slice(&(data.len() as u32).to_le_bytes());
        result.extend_from_slice(data);
        Ok(result)
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        if data.len() < 4 {
            return Err(CommError::Invalid);
        }
        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length > self.max_len {
            return Err(CommError::Invalid);
        }
        if data.len() < 4 + length {
            return Err(CommError::Invalid);
        }
        Ok(data[4..4 + length].to_vec())
    }
}

/// Appends a little-endian CRC-32 over the payload; unwrap verifies it.
pub struct CrcTransport;

impl Transport for CrcTransport {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        let mut result = Vec::with_capacity(data.len() + 4);
        result.extend_from_slice(data);
        result.extend_from_slice(&crc32(data).to_le_bytes());
        Ok(result)
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        if data.len() < 4 {
            return Err(CommError::Invalid);
        }
        let payload_len = data.len() - 4;
        let received = u32::from_le_bytes(
            data[payload_len..].try_into().expect("4-byte slice"),
        );
        if crc32(&data[..payload_len]) != received {
            return Err(CommError::Crc);
        }
        Ok(data[..payload_len].to_vec())
    }
}

/// Prepends an 8-byte little-endian millisecond timestamp and records the
/// last one observed on unwrap.
pub struct Timestamped {
    last_received_ms: u64,
}

impl Timestamped {
    pub fn new() -> Timestamped {
        Timestamped {
            last_received_ms: 0,
        }
    }

    pub fn last_timestamp_ms(&self) -> u64 {
        self.last_received_ms
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for Timestamped {
    fn default() -> Self {
        Timestamped::new()
    }
}

impl Transport for Timestamped {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        let mut result = Vec::with_capacity(8 + data.len());
        result.extend_from_slice(&Self::now_ms().to_le_bytes());
        result.extend_from_slice(data);
        Ok(result)
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        if data.len() < 8 {
            return Err(CommError::Invalid);
        }
        self.last_received_ms = u64::from_le_bytes(data[..8].try_into().expect("8-byte slice"));
        Ok(data[8..].to_vec())
    }
}

/// Right-nested composition of two transports: `wrap` applies `first` then
/// `second`, `unwrap` peels `second` then `first`. Nest `Composite`s for
/// deeper stacks.
pub struct Composite<A, B> {
    first: A,
    second: B,
}

impl<A: Transport, B: Transport> Composite<A, B> {
    pub fn new(first: A, second: B) -> Composite<A, B> {
        Composite { first, second }
    }

    pub fn first(&self) -> &A {
        &self.first
    }

    pub fn second(&self) -> &B {
        &self.second
    }
}

impl<A: Transport, B: Transport> Transport for Composite<A, B> {
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        let inner = self.first.wrap(data)?;
        self.second.wrap(&inner)
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Vec<u8>, CommError> {
        let outer = self.second.unwrap(data)?;
        self.first.unwrap(&outer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn round_trip<T: Transport>(transport: &mut T, payload: &[u8]) -> Vec<u8> {
        let wrapped = transport.wrap(payload).unwrap();
        transport.unwrap(&wrapped).unwrap()
    }

    #[rstest]
    #[case::empty(b"" as &[u8])]
    #[case::short(b"payload")]
    #[case::binary(&[0u8, 255, 1, 254])]
    fn test_pass_through(#[case] payload: &[u8]) {
        assert_eq!(round_trip(&mut PassThrough, payload), payload);
    }

    #[rstest]
    #[case::empty(b"" as &[u8])]
    #[case::short(b"payload")]
    fn test_length_prefixed_round_trip(#[case] payload: &[u8]) {
        let mut transport = LengthPrefixed::new();
        let wrapped = transport.wrap(payload).unwrap();
        assert_eq!(wrapped.len(), 4 + payload.len());
        assert_eq!(&wrapped[..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(transport.unwrap(&wrapped).unwrap(), payload);
    }

    #[test]
    fn test_length_prefixed_ignores_trailing_bytes() {
        let mut transport = LengthPrefixed::new();
        let mut wrapped = transport.wrap(b"exact").unwrap();
        wrapped.extend_from_slice(b"trailing");
        assert_eq!(transport.unwrap(&wrapped).unwrap(), b"exact");
    }

    #[rstest]
    #[case::too_short(vec![1, 0, 0])]
    #[case::length_exceeds_data(vec![10, 0, 0, 0, 1, 2])]
    #[case::length_exceeds_max(vec![0xFF, 0xFF, 0xFF, 0xFF])]
    fn test_length_prefixed_rejects(#[case] data: Vec<u8>) {
        assert_eq!(
            LengthPrefixed::new().unwrap(&data),
            Err(CommError::Invalid)
        );
    }

    #[test]
    fn test_crc_transport_round_trip() {
        assert_eq!(round_trip(&mut CrcTransport, b"checked"), b"checked");
    }

    #[test]
    fn test_crc_transport_detects_corruption() {
        let mut transport = CrcTransport;
        let mut wrapped = transport.wrap(b"checked").unwrap();
        wrapped[0] ^= 0x01;
        assert_eq!(transport.unwrap(&wrapped), Err(CommError::Crc));
    }

    #[test]
    fn test_crc_transport_rejects_short_input() {
        assert_eq!(CrcTransport.unwrap(&[1, 2, 3]), Err(CommError::Invalid));
    }

    #[test]
    fn test_timestamped_records_last_seen() {
        let mut transport = Timestamped::new();
        assert_eq!(transport.last_timestamp_ms(), 0);

        let wrapped = transport.wrap(b"timed").unwrap();
        assert_eq!(wrapped.len(), 8 + 5);
        assert_eq!(transport.unwrap(&wrapped).unwrap(), b"timed");
        assert!(transport.last_timestamp_ms() > 0);
    }

    #[test]
    fn test_composite_nests_right() {
        let mut composite = Composite::new(LengthPrefixed::new(), CrcTransport);
        let wrapped = composite.wrap(b"nested").unwrap();

        // outermost layer is the CRC: strip it manually and find the length
        // prefix inside
        let mut crc_only = CrcTransport;
        let inner = crc_only.unwrap(&wrapped).unwrap();
        assert_eq!(&inner[..4], &6u32.to_le_bytes());

        assert_eq!(composite.unwrap(&wrapped).unwrap(), b"nested");
    }

    #[test]
    fn test_composite_of_three() {
        let mut stack = Composite::new(
            Composite::new(LengthPrefixed::new(), Timestamped::new()),
            CrcTransport,
        );
        assert_eq!(round_trip(&mut stack, b"deep"), b"deep");
    }

    #[test]
    fn test_composite_propagates_inner_failure() {
        let mut composite = Composite::new(LengthPrefixed::new(), CrcTransport);
        let mut wrapped = composite.wrap(b"nested").unwrap();
        // corrupt the length prefix but fix up the outer checksum, so only
        // the inner unwrap can notice
        wrapped[0] = 0xFF;
        wrapped[1] = 0xFF;
        let len = wrapped.len() - 4;
        let fixed = crc32(&wrapped[..len]).to_le_bytes();
        wrapped[len..].copy_from_slice(&fixed);

        assert_eq!(composite.unwrap(&wrapped), Err(CommError::Invalid));
    }
}
