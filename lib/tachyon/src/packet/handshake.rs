//! Key-exchange packet. The client opens with its ephemeral X25519 public
//! key, the server answers in kind, and both sides derive the session key.
//! Either side may additionally sign its exchange key with a long-term
//! Ed25519 identity, indicated by the `Signed` packet flag.

use crate::packet::{PacketError, PacketFlags, RawPacket};
use quark::crypto::{self, SigningIdentity};

/// Magic reserved for the handshake packet type.
pub const HANDSHAKE_MAGIC: u32 = 0x4853_4b31;
/// Handshake opcode, inside the reserved range.
pub const HANDSHAKE_OPCODE: u16 = 0xff01;

const PLAIN_SIZE: usize = crypto::EXCHANGE_KEY_SIZE;
const SIGNED_SIZE: usize = PLAIN_SIZE + crypto::SIGN_KEY_SIZE + crypto::SIGNATURE_SIZE;

/// Long-term identity attestation over the exchange key.
#[derive(Clone, Debug)]
pub struct HandshakeIdentity {
    pub signer: [u8; crypto::SIGN_KEY_SIZE],
    pub signature: [u8; crypto::SIGNATURE_SIZE],
}

#[derive(Clone, Debug)]
pub struct HandshakePacket {
    pub exchange_key: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub identity: Option<HandshakeIdentity>,
}

impl HandshakePacket {
    /// An unsigned handshake carrying only the exchange key.
    pub fn plain(exchange_key: [u8; crypto::EXCHANGE_KEY_SIZE]) -> HandshakePacket {
        HandshakePacket {
            exchange_key,
            identity: None,
        }
    }

    /// A handshake whose exchange key is signed by the given identity.
    pub fn signed(
        exchange_key: [u8; crypto::EXCHANGE_KEY_SIZE],
        identity: &SigningIdentity,
    ) -> HandshakePacket {
        HandshakePacket {
            exchange_key,
            identity: Some(HandshakeIdentity {
                signer: identity.public_bytes(),
                signature: identity.sign(&exchange_key),
            }),
        }
    }

    /// Checks the attestation, if present. Unsigned handshakes verify
    /// trivially.
    pub fn verify(&self) -> bool {
        match &self.identity {
            Some(identity) => {
                crypto::verify_signature(&identity.signer, &self.exchange_key, &identity.signature)
            }
            None => true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(if self.identity.is_some() {
            SIGNED_SIZE
        } else {
            PLAIN_SIZE
        });

        out.extend_from_slice(&self.exchange_key);

        if let Some(identity) = &self.identity {
            out.extend_from_slice(&identity.signer);
            out.extend_from_slice(&identity.signature);
        }

        out
    }

    /// Parses a handshake payload. The expected layout is selected by the
    /// packet's `Signed` flag.
    pub fn decode(payload: &[u8], signed: bool) -> Result<HandshakePacket, PacketError> {
        let expected = if signed { SIGNED_SIZE } else { PLAIN_SIZE };

        if payload.len() != expected {
            return Err(PacketError::Malformed("handshake size"));
        }

        let mut exchange_key = [0u8; crypto::EXCHANGE_KEY_SIZE];
        exchange_key.copy_from_slice(&payload[..PLAIN_SIZE]);

        let identity = if signed {
            let mut signer = [0u8; crypto::SIGN_KEY_SIZE];
            signer.copy_from_slice(&payload[PLAIN_SIZE..PLAIN_SIZE + crypto::SIGN_KEY_SIZE]);

            let mut signature = [0u8; crypto::SIGNATURE_SIZE];
            signature.copy_from_slice(&payload[PLAIN_SIZE + crypto::SIGN_KEY_SIZE..]);

            Some(HandshakeIdentity { signer, signature })
        } else {
            None
        };

        Ok(HandshakePacket {
            exchange_key,
            identity,
        })
    }

    /// Wraps the handshake into its packet type, echoing the sequence id of
    /// the packet it answers.
    pub fn into_raw(self, sequence_id: u32) -> RawPacket {
        let signed = self.identity.is_some();

        let mut raw = RawPacket::new(HANDSHAKE_MAGIC, HANDSHAKE_OPCODE, self.encode())
            .with_sequence(sequence_id);

        if signed {
            raw.header.flags.insert(PacketFlags::SIGNED);
        }

        raw
    }
}
