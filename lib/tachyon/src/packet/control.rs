//! Server-initiated status signaling. Control packets use a reserved magic
//! and opcode range and a fixed 20-byte payload.

use crate::packet::{PacketError, PacketHeader, Priority, RawPacket};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Magic reserved for control packets.
pub const CONTROL_MAGIC: u32 = 0x4354_524c;
/// Opcodes at and above this value are reserved for the runtime.
pub const RESERVED_OPCODE_BASE: u16 = 0xff00;
/// Opcode of the control packet itself.
pub const CONTROL_OPCODE: u16 = 0xff00;

/// Encoded size of the control payload:
/// `type(1) || reason(2) || action(1) || sequence(4) || args(3 * 4)`.
pub const CONTROL_PAYLOAD_SIZE: usize = 20;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ControlType {
    Ping = 0,
    Pong = 1,
    Ack = 2,
    Nack = 3,
    Handshake = 4,
    Heartbeat = 5,
    Resume = 6,
    Disconnect = 7,
    Shutdown = 8,
    Error = 9,
    Throttle = 10,
    Fail = 11,
}

impl ControlType {
    pub fn from_u8(value: u8) -> Option<ControlType> {
        Some(match value {
            0 => ControlType::Ping,
            1 => ControlType::Pong,
            2 => ControlType::Ack,
            3 => ControlType::Nack,
            4 => ControlType::Handshake,
            5 => ControlType::Heartbeat,
            6 => ControlType::Resume,
            7 => ControlType::Disconnect,
            8 => ControlType::Shutdown,
            9 => ControlType::Error,
            10 => ControlType::Throttle,
            11 => ControlType::Fail,
            _ => return None,
        })
    }
}

/// Rejection and status reasons, grouped by numeric range: protocol
/// 150-199, auth 200-259, crypto 260-299, service 300-349, flow control
/// 400-449, resource 450-499, session 550-599.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ReasonCode {
    None = 0,
    BadFrame = 150,
    ChecksumMismatch = 151,
    UnknownMagic = 152,
    UnsupportedOpcode = 153,
    MalformedPacket = 154,
    Unauthorized = 200,
    HandshakeRequired = 201,
    DecryptFailed = 260,
    SignatureInvalid = 261,
    CryptoUnsupported = 262,
    CompressionUnsupported = 300,
    TransformFailed = 301,
    Timeout = 302,
    RateLimited = 400,
    ConnectionLimit = 450,
    BufferExhausted = 451,
    ShuttingDown = 550,
}

impl ReasonCode {
    pub fn from_u16(value: u16) -> Option<ReasonCode> {
        Some(match value {
            0 => ReasonCode::None,
            150 => ReasonCode::BadFrame,
            151 => ReasonCode::ChecksumMismatch,
            152 => ReasonCode::UnknownMagic,
            153 => ReasonCode::UnsupportedOpcode,
            154 => ReasonCode::MalformedPacket,
            200 => ReasonCode::Unauthorized,
            201 => ReasonCode::HandshakeRequired,
            260 => ReasonCode::DecryptFailed,
            261 => ReasonCode::SignatureInvalid,
            262 => ReasonCode::CryptoUnsupported,
            300 => ReasonCode::CompressionUnsupported,
            301 => ReasonCode::TransformFailed,
            302 => ReasonCode::Timeout,
            400 => ReasonCode::RateLimited,
            450 => ReasonCode::ConnectionLimit,
            451 => ReasonCode::BufferExhausted,
            550 => ReasonCode::ShuttingDown,
            _ => return None,
        })
    }
}

/// What the client should do about the condition being signaled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SuggestedAction {
    None = 0,
    Retry = 1,
    Backoff = 2,
    Reconnect = 3,
    Authenticate = 4,
    Disconnect = 5,
}

impl SuggestedAction {
    pub fn from_u8(value: u8) -> Option<SuggestedAction> {
        Some(match value {
            0 => SuggestedAction::None,
            1 => SuggestedAction::Retry,
            2 => SuggestedAction::Backoff,
            3 => SuggestedAction::Reconnect,
            4 => SuggestedAction::Authenticate,
            5 => SuggestedAction::Disconnect,
            _ => return None,
        })
    }
}

/// A decoded control payload. `sequence_id` echoes the packet that caused
/// the signal; `args[1]` and `args[2]` carry the triggering opcode and
/// flags on rejections, `args[0]` is reason-specific.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControlPacket {
    pub control_type: ControlType,
    pub reason: ReasonCode,
    pub action: SuggestedAction,
    pub sequence_id: u32,
    pub args: [u32; 3],
}

impl ControlPacket {
    pub fn new(control_type: ControlType, reason: ReasonCode, action: SuggestedAction) -> ControlPacket {
        ControlPacket {
            control_type,
            reason,
            action,
            sequence_id: 0,
            args: [0; 3],
        }
    }

    /// A `Fail` rejection addressed at the request described by `header`.
    pub fn fail(reason: ReasonCode, header: &PacketHeader) -> ControlPacket {
        let action = match reason {
            ReasonCode::Unauthorized | ReasonCode::HandshakeRequired => SuggestedAction::Authenticate,
            ReasonCode::Timeout => SuggestedAction::Retry,
            ReasonCode::ConnectionLimit | ReasonCode::ShuttingDown => SuggestedAction::Disconnect,
            _ => SuggestedAction::None,
        };

        ControlPacket {
            control_type: ControlType::Fail,
            reason,
            action,
            sequence_id: header.sequence_id,
            args: [0, u32::from(header.opcode), u32::from(header.flags.bits())],
        }
    }

    /// A `Throttle` rejection. `arg0` carries the suggested retry delay in
    /// 100 ms steps, always at least one step.
    pub fn throttle(retry_after_ms: u64, header: &PacketHeader) -> ControlPacket {
        let steps = (retry_after_ms + 99) / 100;

        ControlPacket {
            control_type: ControlType::Throttle,
            reason: ReasonCode::RateLimited,
            action: SuggestedAction::Backoff,
            sequence_id: header.sequence_id,
            args: [
                steps.max(1) as u32,
                u32::from(header.opcode),
                u32::from(header.flags.bits()),
            ],
        }
    }

    /// Idle-connection heartbeat.
    pub fn heartbeat() -> ControlPacket {
        ControlPacket::new(ControlType::Heartbeat, ReasonCode::None, SuggestedAction::None)
    }

    /// Server-initiated disconnect notice.
    pub fn disconnect(reason: ReasonCode) -> ControlPacket {
        ControlPacket::new(ControlType::Disconnect, reason, SuggestedAction::Disconnect)
    }

    /// Server shutdown notice.
    pub fn shutdown() -> ControlPacket {
        ControlPacket::new(
            ControlType::Shutdown,
            ReasonCode::ShuttingDown,
            SuggestedAction::Reconnect,
        )
    }

    #[inline]
    pub fn with_arg0(mut self, arg0: u32) -> ControlPacket {
        self.args[0] = arg0;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONTROL_PAYLOAD_SIZE);

        out.write_u8(self.control_type as u8).expect("Vec write cannot fail");
        out.write_u16::<LittleEndian>(self.reason as u16)
            .expect("Vec write cannot fail");
        out.write_u8(self.action as u8).expect("Vec write cannot fail");
        out.write_u32::<LittleEndian>(self.sequence_id)
            .expect("Vec write cannot fail");

        for &arg in &self.args {
            out.write_u32::<LittleEndian>(arg).expect("Vec write cannot fail");
        }

        out
    }

    pub fn decode(payload: &[u8]) -> Result<ControlPacket, PacketError> {
        if payload.len() < CONTROL_PAYLOAD_SIZE {
            return Err(PacketError::Truncated { got: payload.len() });
        }

        let mut cursor = Cursor::new(payload);

        let control_type = ControlType::from_u8(cursor.read_u8().expect("Control read cannot fail"))
            .ok_or(PacketError::Malformed("control type"))?;
        let reason = ReasonCode::from_u16(
            cursor.read_u16::<LittleEndian>().expect("Control read cannot fail"),
        )
        .ok_or(PacketError::Malformed("reason code"))?;
        let action = SuggestedAction::from_u8(cursor.read_u8().expect("Control read cannot fail"))
            .ok_or(PacketError::Malformed("suggested action"))?;
        let sequence_id = cursor.read_u32::<LittleEndian>().expect("Control read cannot fail");

        let mut args = [0u32; 3];
        for arg in args.iter_mut() {
            *arg = cursor.read_u32::<LittleEndian>().expect("Control read cannot fail");
        }

        Ok(ControlPacket {
            control_type,
            reason,
            action,
            sequence_id,
            args,
        })
    }

    /// Wraps the control payload into its reserved packet type. Rejections
    /// ride at critical priority so they are never starved by data.
    pub fn into_raw(self) -> RawPacket {
        RawPacket::new(CONTROL_MAGIC, CONTROL_OPCODE, self.encode())
            .with_sequence(self.sequence_id)
            .with_priority(Priority::Critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFlags;

    fn request_header() -> PacketHeader {
        PacketHeader {
            magic: 0x1111_2222,
            opcode: 0x0042,
            flags: PacketFlags::RELIABLE,
            priority: Priority::Normal,
            sequence_id: 900,
            timestamp: 0,
            checksum: 0,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let control = ControlPacket::fail(ReasonCode::Unauthorized, &request_header());

        let decoded = ControlPacket::decode(&control.encode()).unwrap();

        assert_eq!(decoded, control);
        assert_eq!(decoded.sequence_id, 900);
        assert_eq!(decoded.args[1], 0x0042);
        assert_eq!(decoded.args[2], u32::from(PacketFlags::RELIABLE.bits()));
    }

    #[test]
    fn test_throttle_steps() {
        let header = request_header();

        assert_eq!(ControlPacket::throttle(1000, &header).args[0], 10);
        assert_eq!(ControlPacket::throttle(950, &header).args[0], 10);
        assert_eq!(ControlPacket::throttle(101, &header).args[0], 2);
        assert_eq!(ControlPacket::throttle(100, &header).args[0], 1);
        // Zero remaining delay still advises a minimum one-step backoff
        assert_eq!(ControlPacket::throttle(0, &header).args[0], 1);
    }

    #[test]
    fn test_fail_actions() {
        let header = request_header();

        assert_eq!(
            ControlPacket::fail(ReasonCode::Unauthorized, &header).action,
            SuggestedAction::Authenticate
        );
        assert_eq!(
            ControlPacket::fail(ReasonCode::Timeout, &header).action,
            SuggestedAction::Retry
        );
        assert_eq!(
            ControlPacket::fail(ReasonCode::ConnectionLimit, &header).action,
            SuggestedAction::Disconnect
        );
    }

    #[test]
    fn test_into_raw_reserved_addressing() {
        let raw = ControlPacket::fail(ReasonCode::Timeout, &request_header()).into_raw();

        assert_eq!(raw.header.magic, CONTROL_MAGIC);
        assert_eq!(raw.header.opcode, CONTROL_OPCODE);
        assert!(raw.header.opcode >= RESERVED_OPCODE_BASE);
        assert_eq!(raw.header.sequence_id, 900);
        assert_eq!(raw.header.priority, Priority::Critical);
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let mut payload = ControlPacket::heartbeat().encode();
        payload[0] = 200;
        assert!(ControlPacket::decode(&payload).is_err());

        let mut payload = ControlPacket::heartbeat().encode();
        payload[1] = 0xff;
        payload[2] = 0xff;
        assert!(ControlPacket::decode(&payload).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let payload = ControlPacket::heartbeat().encode();
        assert!(ControlPacket::decode(&payload[..CONTROL_PAYLOAD_SIZE - 1]).is_err());
    }
}
