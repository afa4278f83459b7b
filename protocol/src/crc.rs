//! Checksums used by the frame codec and the CRC transport policy.
//!
//! CRC-32 is the IEEE polynomial (reflected, initial `0xFFFFFFFF`, final
//! invert). CRC-16 is CCITT-FALSE (polynomial `0x1021`, initial `0xFFFF`,
//! MSB-first, no final XOR). Reference vectors over the ASCII bytes
//! `"123456789"` are `0xCBF43926` and `0x29B1` respectively.

#[cfg(feature = "crc16")]
use crc::CRC_16_IBM_3740;
#[cfg(feature = "crc32")]
use crc::CRC_32_ISO_HDLC;
#[cfg(any(feature = "crc16", feature = "crc32"))]
use crc::Crc;

#[cfg(feature = "crc32")]
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[cfg(feature = "crc16")]
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[cfg(feature = "crc32")]
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(feature = "crc16")]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
