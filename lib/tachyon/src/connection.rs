use crate::net::channel::FramedChannel;
use quark::crypto::{self, EncryptionMode};
use std::net::SocketAddr;
use std::time::Instant;

/// Access level attached to a connection. Only ever upgraded, never
/// downgraded; handlers declare the minimum level they require.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Authority {
    None = 0,
    Guest = 1,
    User = 2,
    Admin = 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Handshaked,
    Closed,
}

/// Server-side state of one accepted TCP client. Exclusively owns its
/// framed channel.
pub struct Connection {
    pub id: u64,
    pub remote: SocketAddr,
    pub authority: Authority,
    pub key: [u8; crypto::KEY_SIZE],
    pub mode: EncryptionMode,
    pub handshake: HandshakeState,
    /// Verdict of the per-IP admission check taken at accept time. Denied
    /// connections are answered and closed on their first frame.
    pub admitted: bool,
    pub opened_at: Instant,
    pub channel: FramedChannel,
}

impl Connection {
    pub fn new(
        id: u64,
        remote: SocketAddr,
        channel: FramedChannel,
        admitted: bool,
        now: Instant,
    ) -> Connection {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        Connection {
            id,
            remote,
            authority: Authority::None,
            key,
            mode: EncryptionMode::None,
            handshake: HandshakeState::NotStarted,
            admitted,
            opened_at: now,
            channel,
        }
    }

    /// Raises the connection authority. Downgrade attempts are ignored.
    #[inline]
    pub fn upgrade_authority(&mut self, to: Authority) {
        if to > self.authority {
            self.authority = to;
        }
    }

    /// Installs the session key derived from a completed key exchange and
    /// activates the cipher mode.
    #[inline]
    pub fn install_key(&mut self, key: [u8; crypto::KEY_SIZE], mode: EncryptionMode) {
        self.key = key;
        self.mode = mode;
        self.handshake = HandshakeState::Handshaked;
    }

    /// Immutable snapshot shipped with each frame into the dispatch
    /// pipeline. `slot` and `generation` route the response back and guard
    /// against the slot having been reused for a newer connection.
    pub fn view(&self, slot: usize, generation: u32) -> ConnectionView {
        ConnectionView {
            id: self.id,
            slot,
            generation,
            remote: self.remote,
            authority: self.authority,
            key: self.key,
            mode: self.mode,
            handshake: self.handshake,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionView {
    pub id: u64,
    pub slot: usize,
    pub generation: u32,
    pub remote: SocketAddr,
    pub authority: Authority,
    pub key: [u8; crypto::KEY_SIZE],
    pub mode: EncryptionMode,
    pub handshake: HandshakeState,
}
