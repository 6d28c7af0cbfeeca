//! The wire unit: a 24-byte typed header followed by an opaque payload,
//! carried inside a length-prefixed frame.

pub mod control;
pub mod handshake;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quark::{clock, crc};
use std::fmt;
use std::io::Cursor;
use std::ops::BitOr;

/// Size of the frame length prefix.
pub const FRAME_LEN_SIZE: usize = 2;
/// Fixed packet header following the frame length prefix.
pub const HEADER_SIZE: usize = 24;
/// Total frame size is bounded by the 16-bit length prefix.
pub const MAX_FRAME_SIZE: usize = 65_535;
/// Upper bound on the payload carried by a single packet.
pub const MAX_PAYLOAD_SIZE: usize = 65_503;

/// Packet flag bit set.
#[derive(Copy, Clone, Eq, PartialEq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const ENCRYPTED: PacketFlags = PacketFlags(0x01);
    pub const COMPRESSED: PacketFlags = PacketFlags(0x02);
    pub const SIGNED: PacketFlags = PacketFlags(0x04);
    pub const ACK_REQUIRED: PacketFlags = PacketFlags(0x08);
    pub const IS_ACKNOWLEDGED: PacketFlags = PacketFlags(0x10);
    pub const RELIABLE: PacketFlags = PacketFlags(0x20);
    pub const FRAGMENTED: PacketFlags = PacketFlags(0x40);
    pub const STREAM: PacketFlags = PacketFlags(0x80);

    #[inline]
    pub fn empty() -> PacketFlags {
        PacketFlags(0)
    }

    #[inline]
    pub fn from_bits(bits: u8) -> PacketFlags {
        PacketFlags(bits)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    #[inline]
    fn bitor(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | other.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PacketFlags({:#04x})", self.0)
    }
}

/// Delivery priority. Carried on the wire, interpreted by schedulers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Priority> {
        match value {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Fixed packet fields preceding the payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub magic: u32,
    pub opcode: u16,
    pub flags: PacketFlags,
    pub priority: Priority,
    pub sequence_id: u32,
    pub timestamp: u64,
    pub checksum: u32,
}

#[derive(Debug, PartialEq)]
pub enum PacketError {
    /// Fewer bytes than the fixed header requires.
    Truncated { got: usize },
    /// Priority byte outside the known range.
    BadPriority(u8),
    /// Payload above the framing limit.
    PayloadTooLarge(usize),
    /// The checksum field contradicts the payload. The parsed header is
    /// preserved so the rejection can still be addressed to the sender.
    ChecksumMismatch { header: PacketHeader, actual: u32 },
    /// A typed packet body failed to parse.
    Malformed(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Truncated { got } => write!(f, "packet truncated at {} bytes", got),
            PacketError::BadPriority(value) => write!(f, "unknown priority {}", value),
            PacketError::PayloadTooLarge(len) => write!(f, "payload of {} bytes exceeds limit", len),
            PacketError::ChecksumMismatch { header, actual } => write!(
                f,
                "checksum mismatch: field {:#010x}, computed {:#010x}",
                header.checksum, actual
            ),
            PacketError::Malformed(what) => write!(f, "malformed packet: {}", what),
        }
    }
}

impl std::error::Error for PacketError {}

/// A complete packet: header plus opaque payload bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct RawPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl RawPacket {
    /// Builds a packet stamped with the current application-epoch time.
    /// The checksum is computed over the payload at encode time.
    pub fn new(magic: u32, opcode: u16, payload: Vec<u8>) -> RawPacket {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

        RawPacket {
            header: PacketHeader {
                magic,
                opcode,
                flags: PacketFlags::empty(),
                priority: Priority::Normal,
                sequence_id: 0,
                timestamp: clock::app_micros(),
                checksum: 0,
            },
            payload,
        }
    }

    #[inline]
    pub fn with_sequence(mut self, sequence_id: u32) -> RawPacket {
        self.header.sequence_id = sequence_id;
        self
    }

    #[inline]
    pub fn with_priority(mut self, priority: Priority) -> RawPacket {
        self.header.priority = priority;
        self
    }

    #[inline]
    pub fn has_flag(&self, flag: PacketFlags) -> bool {
        self.header.flags.contains(flag)
    }

    /// Bytes this packet occupies inside a frame, excluding the length
    /// prefix.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Parses a frame payload. The checksum invariant is enforced here:
    /// a packet whose checksum field disagrees with its payload never
    /// reaches a handler.
    pub fn decode(bytes: &[u8]) -> Result<RawPacket, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Truncated { got: bytes.len() });
        }

        let mut cursor = Cursor::new(bytes);

        let magic = cursor.read_u32::<LittleEndian>().expect("Header read cannot fail");
        let opcode = cursor.read_u16::<LittleEndian>().expect("Header read cannot fail");
        let flags = PacketFlags::from_bits(cursor.read_u8().expect("Header read cannot fail"));
        let priority_raw = cursor.read_u8().expect("Header read cannot fail");
        let sequence_id = cursor.read_u32::<LittleEndian>().expect("Header read cannot fail");
        let timestamp = cursor.read_u64::<LittleEndian>().expect("Header read cannot fail");
        let checksum = cursor.read_u32::<LittleEndian>().expect("Header read cannot fail");

        let priority = Priority::from_u8(priority_raw).ok_or(PacketError::BadPriority(priority_raw))?;

        let payload = bytes[HEADER_SIZE..].to_vec();

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }

        let header = PacketHeader {
            magic,
            opcode,
            flags,
            priority,
            sequence_id,
            timestamp,
            checksum,
        };

        let actual = crc::crc32(&payload);
        if actual != checksum {
            return Err(PacketError::ChecksumMismatch { header, actual });
        }

        Ok(RawPacket { header, payload })
    }

    /// Serializes the packet into `out`. The checksum field is always the
    /// CRC-32 of the payload as written, regardless of the stored value.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }

        out.reserve(self.encoded_len());

        out.write_u32::<LittleEndian>(self.header.magic).expect("Vec write cannot fail");
        out.write_u16::<LittleEndian>(self.header.opcode).expect("Vec write cannot fail");
        out.write_u8(self.header.flags.bits()).expect("Vec write cannot fail");
        out.write_u8(self.header.priority as u8).expect("Vec write cannot fail");
        out.write_u32::<LittleEndian>(self.header.sequence_id)
            .expect("Vec write cannot fail");
        out.write_u64::<LittleEndian>(self.header.timestamp)
            .expect("Vec write cannot fail");
        out.write_u32::<LittleEndian>(crc::crc32(&self.payload))
            .expect("Vec write cannot fail");
        out.extend_from_slice(&self.payload);

        Ok(())
    }

    /// Serializes into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}
