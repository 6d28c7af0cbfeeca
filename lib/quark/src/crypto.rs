use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Session key size shared by every cipher mode.
pub const KEY_SIZE: usize = 32;
/// GCM nonce, prepended to the ciphertext.
pub const GCM_IV_SIZE: usize = 12;
/// GCM authentication tag, appended to the ciphertext.
pub const GCM_TAG_SIZE: usize = 16;
/// CTR/CFB initialization vector, prepended to the ciphertext.
pub const STREAM_IV_SIZE: usize = 16;
/// X25519 public key size.
pub const EXCHANGE_KEY_SIZE: usize = 32;
/// Ed25519 public key size.
pub const SIGN_KEY_SIZE: usize = 32;
/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

const AES_BLOCK_SIZE: usize = 16;
const SESSION_KEY_INFO: &[u8] = b"session-key-v1";

/// Payload cipher selected per connection during the handshake.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    Gcm,
    Ctr,
    Cfb,
}

impl Default for EncryptionMode {
    fn default() -> EncryptionMode {
        EncryptionMode::None
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CryptoError {
    /// Encryption requested on a connection without an active cipher mode.
    Disabled,
    /// The ciphertext is shorter than the mode's framing requires.
    Truncated,
    /// Authentication or decryption failure.
    Open,
    /// Encryption failure.
    Seal,
    /// Key material with an incorrect length or format.
    BadKey,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            CryptoError::Disabled => "no cipher mode active",
            CryptoError::Truncated => "ciphertext too short",
            CryptoError::Open => "decryption failed",
            CryptoError::Seal => "encryption failed",
            CryptoError::BadKey => "malformed key material",
        };
        write!(f, "{}", reason)
    }
}

impl std::error::Error for CryptoError {}

/// Encrypts `plain` under the given mode and key, producing the payload in
/// its wire layout: GCM is `iv(12) || ciphertext || tag(16)`, CTR and CFB
/// are `iv(16) || ciphertext`. A fresh random IV is drawn per call.
pub fn seal(mode: EncryptionMode, key: &[u8; KEY_SIZE], plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match mode {
        EncryptionMode::None => Err(CryptoError::Disabled),
        EncryptionMode::Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKey)?;

            let mut iv = [0u8; GCM_IV_SIZE];
            random_bytes(&mut iv);

            let sealed = cipher
                .encrypt(Nonce::from_slice(&iv), plain)
                .map_err(|_| CryptoError::Seal)?;

            let mut out = Vec::with_capacity(GCM_IV_SIZE + sealed.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&sealed);
            Ok(out)
        }
        EncryptionMode::Ctr => {
            let mut iv = [0u8; STREAM_IV_SIZE];
            random_bytes(&mut iv);

            let mut out = Vec::with_capacity(STREAM_IV_SIZE + plain.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(plain);
            ctr_process(key, &iv, &mut out[STREAM_IV_SIZE..]);
            Ok(out)
        }
        EncryptionMode::Cfb => {
            let mut iv = [0u8; STREAM_IV_SIZE];
            random_bytes(&mut iv);

            let mut out = Vec::with_capacity(STREAM_IV_SIZE + plain.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(plain);
            cfb_encrypt(key, &iv, &mut out[STREAM_IV_SIZE..]);
            Ok(out)
        }
    }
}

/// Decrypts a payload in the wire layout produced by `seal`.
pub fn open(mode: EncryptionMode, key: &[u8; KEY_SIZE], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match mode {
        EncryptionMode::None => Err(CryptoError::Disabled),
        EncryptionMode::Gcm => {
            if sealed.len() < GCM_IV_SIZE + GCM_TAG_SIZE {
                return Err(CryptoError::Truncated);
            }

            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKey)?;

            cipher
                .decrypt(Nonce::from_slice(&sealed[..GCM_IV_SIZE]), &sealed[GCM_IV_SIZE..])
                .map_err(|_| CryptoError::Open)
        }
        EncryptionMode::Ctr => {
            if sealed.len() < STREAM_IV_SIZE {
                return Err(CryptoError::Truncated);
            }

            let mut iv = [0u8; STREAM_IV_SIZE];
            iv.copy_from_slice(&sealed[..STREAM_IV_SIZE]);

            let mut plain = sealed[STREAM_IV_SIZE..].to_vec();
            ctr_process(key, &iv, &mut plain);
            Ok(plain)
        }
        EncryptionMode::Cfb => {
            if sealed.len() < STREAM_IV_SIZE {
                return Err(CryptoError::Truncated);
            }

            let mut iv = [0u8; STREAM_IV_SIZE];
            iv.copy_from_slice(&sealed[..STREAM_IV_SIZE]);

            let mut plain = sealed[STREAM_IV_SIZE..].to_vec();
            cfb_decrypt(key, &iv, &mut plain);
            Ok(plain)
        }
    }
}

/// AES-256-CTR keystream application. Symmetric, so it both encrypts and
/// decrypts. The counter block is the IV, incremented big-endian per block.
fn ctr_process(key: &[u8; KEY_SIZE], iv: &[u8; STREAM_IV_SIZE], data: &mut [u8]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut counter = *iv;

    for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
        let mut keystream = GenericArray::clone_from_slice(&counter);
        cipher.encrypt_block(&mut keystream);

        for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= ks;
        }

        increment_counter(&mut counter);
    }
}

/// AES-256-CFB128 encryption in place.
fn cfb_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; STREAM_IV_SIZE], data: &mut [u8]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut feedback = *iv;

    for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
        let mut keystream = GenericArray::clone_from_slice(&feedback);
        cipher.encrypt_block(&mut keystream);

        for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= ks;
        }

        // The next keystream block feeds back the ciphertext just produced
        feedback[..chunk.len()].copy_from_slice(chunk);
    }
}

/// AES-256-CFB128 decryption in place.
fn cfb_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; STREAM_IV_SIZE], data: &mut [u8]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut feedback = *iv;

    for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
        let mut keystream = GenericArray::clone_from_slice(&feedback);
        cipher.encrypt_block(&mut keystream);

        // Feedback is the incoming ciphertext, captured before the xor
        let mut next = feedback;
        next[..chunk.len()].copy_from_slice(chunk);

        for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= ks;
        }

        feedback = next;
    }
}

#[inline]
fn increment_counter(counter: &mut [u8; STREAM_IV_SIZE]) {
    for byte in counter.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

/// One half of an ephemeral X25519 key exchange. Consumed by `derive` so a
/// secret can never be reused across handshakes.
pub struct KeyExchange {
    secret: x25519_dalek::EphemeralSecret,
    public: x25519_dalek::PublicKey,
}

impl KeyExchange {
    /// Generates a fresh ephemeral keypair.
    pub fn generate() -> KeyExchange {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);

        KeyExchange { secret, public }
    }

    /// The public half, as sent on the wire.
    #[inline]
    pub fn public_bytes(&self) -> [u8; EXCHANGE_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Computes the shared secret against the peer's public key and expands
    /// it into a session key with HKDF-SHA256.
    pub fn derive(self, peer_public: &[u8; EXCHANGE_KEY_SIZE]) -> [u8; KEY_SIZE] {
        let peer = x25519_dalek::PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);

        derive_session_key(shared.as_bytes())
    }
}

/// Expands raw shared-secret material into a uniformly distributed session
/// key with HKDF-SHA256.
pub fn derive_session_key(material: &[u8]) -> [u8; KEY_SIZE] {
    let kdf = Hkdf::<Sha256>::new(None, material);

    let mut key = [0u8; KEY_SIZE];
    kdf.expand(SESSION_KEY_INFO, &mut key)
        .expect("Session key size exceeds HKDF output limit");
    key
}

/// Long-term Ed25519 signing identity of a server process.
pub struct SigningIdentity {
    key: ed25519_dalek::SigningKey,
}

impl SigningIdentity {
    /// Generates a fresh identity.
    pub fn generate() -> SigningIdentity {
        SigningIdentity {
            key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores an identity from its 32-byte secret seed.
    pub fn from_bytes(seed: &[u8; SIGN_KEY_SIZE]) -> SigningIdentity {
        SigningIdentity {
            key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The secret seed. Only ever written to the key file.
    #[inline]
    pub fn secret_bytes(&self) -> [u8; SIGN_KEY_SIZE] {
        self.key.to_bytes()
    }

    /// The public verification key, as sent on the wire.
    #[inline]
    pub fn public_bytes(&self) -> [u8; SIGN_KEY_SIZE] {
        self.key.verifying_key().to_bytes()
    }

    /// Signs the supplied message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        use ed25519_dalek::Signer;

        self.key.sign(message).to_bytes()
    }
}

/// Verifies an Ed25519 signature against a public key.
pub fn verify_signature(
    public: &[u8; SIGN_KEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> bool {
    use ed25519_dalek::Verifier;

    let key = match ed25519_dalek::VerifyingKey::from_bytes(public) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let signature = ed25519_dalek::Signature::from_bytes(signature);

    key.verify(message, &signature).is_ok()
}

/// SHA-256 digest of the supplied bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(input: &str) -> Vec<u8> {
        (0..input.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&input[i..i + 2], 16).unwrap())
            .collect()
    }

    const NIST_KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
    const NIST_PLAIN: &str = "6bc1bee22e409f96e93d7e117393172a";

    fn nist_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&hex(NIST_KEY));
        key
    }

    #[test]
    fn test_ctr_nist_vector() {
        let mut iv = [0u8; STREAM_IV_SIZE];
        iv.copy_from_slice(&hex("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff"));

        let mut data = hex(NIST_PLAIN);
        ctr_process(&nist_key(), &iv, &mut data);

        assert_eq!(data, hex("601ec313775789a5b7a7f504bbf3d228"));
    }

    #[test]
    fn test_cfb_nist_vector() {
        let mut iv = [0u8; STREAM_IV_SIZE];
        iv.copy_from_slice(&hex("000102030405060708090a0b0c0d0e0f"));

        let mut data = hex(NIST_PLAIN);
        cfb_encrypt(&nist_key(), &iv, &mut data);

        assert_eq!(data, hex("dc7e84bfda79164b7ecd8486985d3860"));
    }

    #[test]
    fn test_counter_increment_carries() {
        let mut counter = [0xffu8; STREAM_IV_SIZE];
        increment_counter(&mut counter);
        assert_eq!(counter, [0u8; STREAM_IV_SIZE]);

        let mut counter = [0u8; STREAM_IV_SIZE];
        counter[15] = 0xff;
        increment_counter(&mut counter);
        assert_eq!(counter[15], 0);
        assert_eq!(counter[14], 1);
    }

    #[test]
    fn test_seal_open_roundtrip_all_modes() {
        let key = nist_key();
        let plain = b"a reasonably sized message that spans multiple aes blocks";

        for &mode in &[EncryptionMode::Gcm, EncryptionMode::Ctr, EncryptionMode::Cfb] {
            let sealed = seal(mode, &key, plain).unwrap();
            assert_ne!(&sealed[..], &plain[..]);

            let opened = open(mode, &key, &sealed).unwrap();
            assert_eq!(&opened[..], &plain[..]);
        }
    }

    #[test]
    fn test_seal_open_partial_block() {
        let key = nist_key();
        let plain = b"short";

        for &mode in &[EncryptionMode::Ctr, EncryptionMode::Cfb] {
            let sealed = seal(mode, &key, plain).unwrap();
            assert_eq!(sealed.len(), STREAM_IV_SIZE + plain.len());

            let opened = open(mode, &key, &sealed).unwrap();
            assert_eq!(&opened[..], &plain[..]);
        }
    }

    #[test]
    fn test_gcm_layout() {
        let key = nist_key();
        let plain = b"payload";

        let sealed = seal(EncryptionMode::Gcm, &key, plain).unwrap();

        assert_eq!(sealed.len(), GCM_IV_SIZE + plain.len() + GCM_TAG_SIZE);
    }

    #[test]
    fn test_gcm_tamper_detected() {
        let key = nist_key();

        let mut sealed = seal(EncryptionMode::Gcm, &key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert_eq!(open(EncryptionMode::Gcm, &key, &sealed), Err(CryptoError::Open));
    }

    #[test]
    fn test_gcm_wrong_key_fails() {
        let key = nist_key();
        let mut other = key;
        other[0] ^= 0xff;

        let sealed = seal(EncryptionMode::Gcm, &key, b"payload").unwrap();

        assert_eq!(open(EncryptionMode::Gcm, &other, &sealed), Err(CryptoError::Open));
    }

    #[test]
    fn test_open_truncated() {
        let key = nist_key();

        assert_eq!(
            open(EncryptionMode::Gcm, &key, &[0u8; GCM_IV_SIZE]),
            Err(CryptoError::Truncated)
        );
        assert_eq!(
            open(EncryptionMode::Ctr, &key, &[0u8; STREAM_IV_SIZE - 1]),
            Err(CryptoError::Truncated)
        );
    }

    #[test]
    fn test_mode_none_disabled() {
        let key = nist_key();

        assert_eq!(seal(EncryptionMode::None, &key, b"x"), Err(CryptoError::Disabled));
        assert_eq!(open(EncryptionMode::None, &key, b"x"), Err(CryptoError::Disabled));
    }

    #[test]
    fn test_key_exchange_agreement() {
        let client = KeyExchange::generate();
        let server = KeyExchange::generate();

        let client_public = client.public_bytes();
        let server_public = server.public_bytes();

        let client_key = client.derive(&server_public);
        let server_key = server.derive(&client_public);

        assert_eq!(client_key, server_key);
    }

    #[test]
    fn test_key_exchange_distinct_sessions() {
        let server_public = KeyExchange::generate().public_bytes();

        let first = KeyExchange::generate().derive(&server_public);
        let second = KeyExchange::generate().derive(&server_public);

        assert_ne!(first, second);
    }

    #[test]
    fn test_sign_verify() {
        let identity = SigningIdentity::generate();
        let message = b"handshake transcript";

        let signature = identity.sign(message);

        assert!(verify_signature(&identity.public_bytes(), message, &signature));
        assert!(!verify_signature(&identity.public_bytes(), b"other", &signature));
    }

    #[test]
    fn test_identity_restore() {
        let identity = SigningIdentity::generate();
        let restored = SigningIdentity::from_bytes(&identity.secret_bytes());

        assert_eq!(identity.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_sha256_known_digest() {
        let digest = sha256(b"abc");

        assert_eq!(
            &digest[..],
            &hex("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")[..]
        );
    }
}
