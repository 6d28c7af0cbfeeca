//! The packet catalog binds each packet kind, keyed by its 4-byte magic, to
//! a deserializer and an optional set of payload transformers. The catalog
//! is assembled once at startup through an explicit registration API and is
//! immutable afterwards, so lookups take no locks.

use crate::compress;
use crate::packet::control::{ControlPacket, CONTROL_MAGIC};
use crate::packet::handshake::{HandshakePacket, HANDSHAKE_MAGIC};
use crate::packet::{PacketError, PacketFlags, RawPacket, MAX_PAYLOAD_SIZE};
use hashbrown::HashMap;
use quark::crypto::{self, EncryptionMode};
use std::any::Any;
use std::fmt;

/// A decoded, typed packet body. Handlers downcast through `as_any`.
pub trait PacketBody: fmt::Debug + Send + 'static {
    fn magic(&self) -> u32;
    fn as_any(&self) -> &dyn Any;
}

pub type BoxedBody = Box<dyn PacketBody>;

/// Parses a raw packet into its typed body.
pub type DeserializeFn = fn(&RawPacket) -> Result<BoxedBody, PacketError>;

/// Connection material handed to the payload transformers.
pub struct TransformContext<'a> {
    pub key: &'a [u8; crypto::KEY_SIZE],
    pub mode: EncryptionMode,
}

#[derive(Debug, Eq, PartialEq)]
pub enum TransformError {
    Crypto,
    Compression,
    PayloadTooLarge,
}

/// Rewrites a packet payload in place, toggling the matching flag.
pub type TransformFn = fn(&mut RawPacket, &TransformContext) -> Result<(), TransformError>;

/// Per-type transformer record. Absent entries mean the type opted out of
/// that operation; consumers requiring one must treat absence as an error.
#[derive(Default, Copy, Clone, Debug)]
pub struct TransformerSet {
    pub compress: Option<TransformFn>,
    pub decompress: Option<TransformFn>,
    pub encrypt: Option<TransformFn>,
    pub decrypt: Option<TransformFn>,
}

impl TransformerSet {
    /// The full standard set: LZ4 block compression and the connection's
    /// AES cipher mode.
    pub fn standard() -> TransformerSet {
        TransformerSet {
            compress: Some(lz4_compress),
            decompress: Some(lz4_decompress),
            encrypt: Some(aes_encrypt),
            decrypt: Some(aes_decrypt),
        }
    }
}

/// Standard compress transformer: LZ4 block with the 8-byte length header.
pub fn lz4_compress(packet: &mut RawPacket, _ctx: &TransformContext) -> Result<(), TransformError> {
    let compressed =
        compress::compress(&packet.payload).map_err(|_| TransformError::PayloadTooLarge)?;

    if compressed.len() > MAX_PAYLOAD_SIZE {
        return Err(TransformError::PayloadTooLarge);
    }

    packet.payload = compressed;
    packet.header.flags.insert(PacketFlags::COMPRESSED);
    Ok(())
}

/// Standard decompress transformer.
pub fn lz4_decompress(packet: &mut RawPacket, _ctx: &TransformContext) -> Result<(), TransformError> {
    let plain = compress::decompress(&packet.payload).map_err(|_| TransformError::Compression)?;

    if plain.len() > MAX_PAYLOAD_SIZE {
        return Err(TransformError::Compression);
    }

    packet.payload = plain;
    packet.header.flags.remove(PacketFlags::COMPRESSED);
    Ok(())
}

/// Standard encrypt transformer: seals the payload under the connection's
/// cipher mode and key.
pub fn aes_encrypt(packet: &mut RawPacket, ctx: &TransformContext) -> Result<(), TransformError> {
    let sealed = crypto::seal(ctx.mode, ctx.key, &packet.payload).map_err(|_| TransformError::Crypto)?;

    if sealed.len() > MAX_PAYLOAD_SIZE {
        return Err(TransformError::PayloadTooLarge);
    }

    packet.payload = sealed;
    packet.header.flags.insert(PacketFlags::ENCRYPTED);
    Ok(())
}

/// Standard decrypt transformer.
pub fn aes_decrypt(packet: &mut RawPacket, ctx: &TransformContext) -> Result<(), TransformError> {
    let plain = crypto::open(ctx.mode, ctx.key, &packet.payload).map_err(|_| TransformError::Crypto)?;

    packet.payload = plain;
    packet.header.flags.remove(PacketFlags::ENCRYPTED);
    Ok(())
}

#[derive(Debug, Eq, PartialEq)]
pub enum CatalogError {
    /// Two packet types declared the same magic. Startup-fatal.
    DuplicateMagic(u32),
    /// Transformers bound to a magic with no registered deserializer.
    UnknownMagic(u32),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CatalogError::DuplicateMagic(magic) => {
                write!(f, "duplicate packet magic {:#010x}", magic)
            }
            CatalogError::UnknownMagic(magic) => {
                write!(f, "no deserializer registered for magic {:#010x}", magic)
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Mutable catalog under construction. The runtime's reserved packet types
/// (control, handshake) are pre-registered.
#[derive(Debug)]
pub struct CatalogBuilder {
    deserializers: HashMap<u32, DeserializeFn>,
    transformers: HashMap<u32, TransformerSet>,
}

impl CatalogBuilder {
    pub fn new() -> CatalogBuilder {
        let mut builder = CatalogBuilder {
            deserializers: HashMap::new(),
            transformers: HashMap::new(),
        };

        builder
            .register(CONTROL_MAGIC, control_deserializer)
            .expect("Reserved magic cannot collide in an empty catalog");
        builder
            .register(HANDSHAKE_MAGIC, handshake_deserializer)
            .expect("Reserved magic cannot collide in an empty catalog");

        builder
    }

    /// Registers a packet type. Duplicate magic numbers are a fatal
    /// configuration error.
    pub fn register(
        &mut self,
        magic: u32,
        deserializer: DeserializeFn,
    ) -> Result<&mut CatalogBuilder, CatalogError> {
        if self.deserializers.contains_key(&magic) {
            return Err(CatalogError::DuplicateMagic(magic));
        }

        self.deserializers.insert(magic, deserializer);
        Ok(self)
    }

    /// Binds a transformer record to an already registered packet type.
    pub fn with_transformers(
        &mut self,
        magic: u32,
        set: TransformerSet,
    ) -> Result<&mut CatalogBuilder, CatalogError> {
        if !self.deserializers.contains_key(&magic) {
            return Err(CatalogError::UnknownMagic(magic));
        }

        self.transformers.insert(magic, set);
        Ok(self)
    }

    /// Binds the standard LZ4 + AES transformer set.
    pub fn with_standard_transformers(&mut self, magic: u32) -> Result<&mut CatalogBuilder, CatalogError> {
        self.with_transformers(magic, TransformerSet::standard())
    }

    /// Freezes the catalog.
    pub fn build(self) -> PacketCatalog {
        PacketCatalog {
            deserializers: self.deserializers,
            transformers: self.transformers,
        }
    }
}

/// Immutable magic-keyed lookup tables shared by all connections.
pub struct PacketCatalog {
    deserializers: HashMap<u32, DeserializeFn>,
    transformers: HashMap<u32, TransformerSet>,
}

impl PacketCatalog {
    #[inline]
    pub fn contains(&self, magic: u32) -> bool {
        self.deserializers.contains_key(&magic)
    }

    #[inline]
    pub fn deserializer(&self, magic: u32) -> Option<DeserializeFn> {
        self.deserializers.get(&magic).copied()
    }

    #[inline]
    pub fn transformers(&self, magic: u32) -> Option<&TransformerSet> {
        self.transformers.get(&magic)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.deserializers.len()
    }
}

impl PacketBody for ControlPacket {
    fn magic(&self) -> u32 {
        CONTROL_MAGIC
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn control_deserializer(packet: &RawPacket) -> Result<BoxedBody, PacketError> {
    Ok(Box::new(ControlPacket::decode(&packet.payload)?))
}

impl PacketBody for HandshakePacket {
    fn magic(&self) -> u32 {
        HANDSHAKE_MAGIC
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn handshake_deserializer(packet: &RawPacket) -> Result<BoxedBody, PacketError> {
    let signed = packet.has_flag(PacketFlags::SIGNED);
    Ok(Box::new(HandshakePacket::decode(&packet.payload, signed)?))
}
