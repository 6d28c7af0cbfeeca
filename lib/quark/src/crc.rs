use crc::{Crc, CRC_16_ARC, CRC_32_ISO_HDLC, CRC_64_XZ, CRC_8_SMBUS};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// CRC-8 (SMBus polynomial) over the supplied bytes.
#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// CRC-16 (ARC polynomial) over the supplied bytes.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-32/IEEE over the supplied bytes. This is the packet checksum
/// algorithm used on the wire.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC-64 (XZ polynomial) over the supplied bytes.
#[inline]
pub fn crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}
