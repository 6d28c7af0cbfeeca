//! The reference application surface: a 256-byte UTF-8 text packet and the
//! handlers operating on it.

use std::any::Any;
use tachyon::catalog::{BoxedBody, PacketBody};
use tachyon::connection::Authority;
use tachyon::dispatch::router::{HandlerContext, HandlerError, HandlerResult};
use tachyon::packet::control::ReasonCode;
use tachyon::packet::{PacketError, RawPacket};
use tachyon::runtime::{BuildError, RuntimeBuilder};

pub const TEXT_MAGIC: u32 = 0x5454_5800;
pub const MAX_TEXT_SIZE: usize = 256;

pub const OP_PING: u16 = 0x0001;
pub const OP_TIME: u16 = 0x0002;

/// Short UTF-8 text payload, the gateway's only packet kind.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Text256 {
    pub text: String,
}

impl Text256 {
    pub fn new<S: Into<String>>(text: S) -> Text256 {
        let text = text.into();
        debug_assert!(text.len() <= MAX_TEXT_SIZE);
        Text256 { text }
    }

    pub fn into_packet(self, opcode: u16) -> RawPacket {
        RawPacket::new(TEXT_MAGIC, opcode, self.text.into_bytes())
    }
}

impl PacketBody for Text256 {
    fn magic(&self) -> u32 {
        TEXT_MAGIC
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn deserialize_text(packet: &RawPacket) -> Result<BoxedBody, PacketError> {
    if packet.payload.len() > MAX_TEXT_SIZE {
        return Err(PacketError::Malformed("text over 256 bytes"));
    }

    let text = std::str::from_utf8(&packet.payload)
        .map_err(|_| PacketError::Malformed("text is not valid utf-8"))?;

    Ok(Box::new(Text256::new(text)))
}

/// Registers the text packet and every gateway handler.
pub fn install(builder: &mut RuntimeBuilder) -> Result<(), BuildError> {
    builder.register_packet(TEXT_MAGIC, deserialize_text)?;

    builder.register_handler(OP_PING, "ping", Authority::None, None, ping)?;
    builder.register_handler(OP_TIME, "server_time", Authority::None, None, server_time)?;

    Ok(())
}

fn text_body<'a>(ctx: &'a HandlerContext) -> Result<&'a Text256, HandlerError> {
    ctx.body
        .and_then(|body| body.as_any().downcast_ref::<Text256>())
        .ok_or_else(|| HandlerError::new(ReasonCode::MalformedPacket, "expected a text packet"))
}

/// `ping` answers `pong`; anything else echoes back unchanged.
fn ping(ctx: &mut HandlerContext) -> HandlerResult {
    let request = text_body(ctx)?;

    let reply = if request.text == "ping" {
        Text256::new("pong")
    } else {
        request.clone()
    };

    Ok(Some(reply.into_packet(OP_PING)))
}

/// Reports the server clock as microseconds since the application epoch.
fn server_time(_ctx: &mut HandlerContext) -> HandlerResult {
    let now = quark::clock::app_micros();

    Ok(Some(Text256::new(now.to_string()).into_packet(OP_TIME)))
}
