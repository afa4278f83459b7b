//! The 32-byte frame header and its codec.
//!
//! `encode` and `decode` are exact inverses over the little-endian wire
//! image. The header CRC is always computed over the first 28 wire bytes
//! with the CRC field itself zeroed - never over the native representation,
//! so big-endian hosts interoperate.

use crate::error::CommError;
use crate::limits::Limits;
use bitflags::bitflags;
use bytes::{Buf, BufMut};

pub const MAGIC: u16 = 0xA55A;
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 32;

/// Offset of the `header_crc` field in the wire image; the checksum covers
/// everything before it plus the zeroed field itself.
const HEADER_CRC_OFFSET: usize = 24;
const HEADER_CRC_END: usize = 28;

bitflags! {
    /// Frame flag bits. The numeric values are part of the external ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        const COMPRESSED      = 1 << 0;
        const ENCRYPTED       = 1 << 1;
        const ZERO_COPY       = 1 << 2;
        const FRAGMENTED      = 1 << 3;
        const ACK             = 1 << 4;
        const NACK            = 1 << 5;
        const HEARTBEAT       = 1 << 6;
        const EXTENDED_HEADER = 1 << 7;
    }
}

/// Native-endian view of the wire header described in the crate docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub magic: u16,
    pub version: u8,
    pub flags: FrameFlags,
    pub length: u32,
    pub src_endpoint: u32,
    pub dst_endpoint: u32,
    pub sequence: u32,
    pub cmd_type: u32,
    pub header_crc: u32,
    pub payload_crc: u32,
}

impl FrameHeader {
    /// A data header addressed from `src_endpoint` to `dst_endpoint`.
    /// `length` and the CRC fields are filled in by [`encode`].
    pub fn new(src_endpoint: u32, dst_endpoint: u32, cmd_type: u32) -> FrameHeader {
        FrameHeader {
            magic: MAGIC,
            version: VERSION,
            src_endpoint,
            dst_endpoint,
            cmd_type,
            ..FrameHeader::default()
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.src_endpoint);
        buf.put_u32_le(self.dst_endpoint);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.cmd_type);
        buf.put_u32_le(self.header_crc);
        buf.put_u32_le(self.payload_crc);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader, CommError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(CommError::Invalid);
        }
        Ok(FrameHeader {
            magic: buf.get_u16_le(),
            version: buf.get_u8(),
            flags: FrameFlags::from_bits_retain(buf.get_u8()),
            length: buf.get_u32_le(),
            src_endpoint: buf.get_u32_le(),
            dst_endpoint: buf.get_u32_le(),
            sequence: buf.get_u32_le(),
            cmd_type: buf.get_u32_le(),
            header_crc: buf.get_u32_le(),
            payload_crc: buf.get_u32_le(),
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Header-only sanity check used by stream framers to detect a frame
/// boundary without decoding the payload. `received_len` must equal the
/// header's `length` field exactly.
pub fn validate(header: &FrameHeader, received_len: usize) -> Result<(), CommError> {
    validate_with(header, received_len, &Limits::STANDARD)
}

pub fn validate_with(
    header: &FrameHeader,
    received_len: usize,
    limits: &Limits,
) -> Result<(), CommError> {
    if header.magic != MAGIC || header.version != VERSION {
        return Err(CommError::Invalid);
    }
    let length = header.length as usize;
    if length < HEADER_SIZE || length > limits.max_frame_size {
        return Err(CommError::Invalid);
    }
    if received_len != length {
        return Err(CommError::Invalid);
    }
    Ok(())
}

/// Encodes `header` and `payload` into `dst`, returning the number of bytes
/// written. The `length`, `payload_crc` and `header_crc` fields of the given
/// header are recomputed; everything else is written as passed in.
pub fn encode(dst: &mut [u8], payload: &[u8], header: &FrameHeader) -> Result<usize, CommError> {
    let total = HEADER_SIZE + payload.len();
    if dst.len() < total {
        return Err(CommError::NoMem);
    }

    let mut hdr = *header;
    hdr.length = total as u32;
    hdr.payload_crc = payload_checksum(payload);
    hdr.header_crc = 0;

    let mut cursor = &mut dst[..HEADER_SIZE];
    hdr.ser(&mut cursor);

    let checksum = header_checksum(&dst[..HEADER_SIZE]);
    dst[HEADER_CRC_OFFSET..HEADER_CRC_END].copy_from_slice(&checksum.to_le_bytes());

    dst[HEADER_SIZE..total].copy_from_slice(payload);
    Ok(total)
}

/// [`encode`] into a freshly allocated buffer of exactly the right size.
pub fn encode_to_vec(payload: &[u8], header: &FrameHeader) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
    let written = encode(&mut buf, payload, header)
        .expect("buffer is sized for the frame");
    debug_assert_eq!(written, buf.len());
    buf
}

/// Decodes one complete frame from `src` (which must hold exactly the frame)
/// into `payload`, returning the native-endian header and the payload length.
pub fn decode(src: &[u8], payload: &mut [u8]) -> Result<(FrameHeader, usize), CommError> {
    decode_with(src, payload, &Limits::STANDARD)
}

pub fn decode_with(
    src: &[u8],
    payload: &mut [u8],
    limits: &Limits,
) -> Result<(FrameHeader, usize), CommError> {
    if src.len() < HEADER_SIZE {
        return Err(CommError::Invalid);
    }

    let mut cursor = src;
    let header = FrameHeader::deser(&mut cursor)?;
    validate_with(&header, src.len(), limits)?;

    verify_header_checksum(src, header.header_crc)?;

    let payload_len = header.payload_len();
    if payload_len > 0 {
        if payload.len() < payload_len {
            return Err(CommError::NoMem);
        }
        payload[..payload_len].copy_from_slice(&src[HEADER_SIZE..HEADER_SIZE + payload_len]);
        verify_payload_checksum(&payload[..payload_len], header.payload_crc)?;
    }

    Ok((header, payload_len))
}

/// [`decode`] into a freshly allocated payload buffer.
pub fn decode_to_vec(src: &[u8]) -> Result<(FrameHeader, Vec<u8>), CommError> {
    decode_to_vec_with(src, &Limits::STANDARD)
}

pub fn decode_to_vec_with(
    src: &[u8],
    limits: &Limits,
) -> Result<(FrameHeader, Vec<u8>), CommError> {
    let mut payload = vec![0u8; src.len().saturating_sub(HEADER_SIZE)];
    let (header, payload_len) = decode_with(src, &mut payload, limits)?;
    payload.truncate(payload_len);
    Ok((header, payload))
}

/// Result of [`try_decode_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDecode {
    /// A complete frame was decoded; the caller drops `consumed` bytes from
    /// the front of its stream buffer.
    Frame {
        header: FrameHeader,
        payload: Vec<u8>,
        consumed: usize,
    },
    /// The buffered bytes do not yet hold a complete frame.
    Pending,
}

/// Attempts to decode one frame from the front of a byte-stream buffer.
///
/// Reads the length field at offset 4 and reports [`StreamDecode::Pending`]
/// until the full frame is buffered. A length field outside
/// `[32, max_frame_size]` is rejected immediately so a corrupted stream
/// cannot stall the framer forever.
pub fn try_decode_stream(buffer: &[u8]) -> Result<StreamDecode, CommError> {
    try_decode_stream_with(buffer, &Limits::STANDARD)
}

pub fn try_decode_stream_with(
    buffer: &[u8],
    limits: &Limits,
) -> Result<StreamDecode, CommError> {
    if buffer.len() < 8 {
        return Ok(StreamDecode::Pending);
    }

    let mut cursor = &buffer[4..];
    let length = cursor.get_u32_le() as usize;
    if length < HEADER_SIZE || length > limits.max_frame_size {
        return Err(CommError::Invalid);
    }
    if buffer.len() < length {
        return Ok(StreamDecode::Pending);
    }

    let (header, payload) = decode_to_vec_with(&buffer[..length], limits)?;
    Ok(StreamDecode::Frame {
        header,
        payload,
        consumed: length,
    })
}

fn payload_checksum(payload: &[u8]) -> u32 {
    #[cfg(feature = "crc32")]
    {
        if payload.is_empty() {
            0
        } else {
            crate::crc::crc32(payload)
        }
    }
    #[cfg(not(feature = "crc32"))]
    {
        let _ = payload;
        0
    }
}

#[cfg(feature = "crc32")]
fn header_checksum(header_bytes: &[u8]) -> u32 {
    let mut image = [0u8; HEADER_CRC_END];
    image.copy_from_slice(&header_bytes[..HEADER_CRC_END]);
    image[HEADER_CRC_OFFSET..HEADER_CRC_END].fill(0);
    crate::crc::crc32(&image)
}

#[cfg(not(feature = "crc32"))]
fn header_checksum(_header_bytes: &[u8]) -> u32 {
    0
}

fn verify_header_checksum(src: &[u8], received: u32) -> Result<(), CommError> {
    #[cfg(feature = "crc32")]
    {
        if header_checksum(&src[..HEADER_SIZE]) != received {
            return Err(CommError::Crc);
        }
    }
    #[cfg(not(feature = "crc32"))]
    {
        let _ = (src, received);
    }
    Ok(())
}

fn verify_payload_checksum(payload: &[u8], received: u32) -> Result<(), CommError> {
    #[cfg(feature = "crc32")]
    {
        if crate::crc::crc32(payload) != received {
            return Err(CommError::Crc);
        }
    }
    #[cfg(not(feature = "crc32"))]
    {
        let _ = (payload, received);
    }
    Ok(())
}
