//! The network endpoint: owns the listener, the mio poll and every live
//! connection. All socket I/O happens on the thread driving `sync`; frames
//! are handed off to the dispatcher and completions are applied back here,
//! so connection state stays single-writer.

use crate::admission::{AdmissionControl, CLEANUP_INTERVAL_MS};
use crate::connection::{Connection, ConnectionView, HandshakeState};
use crate::dispatch::{Completion, Verdict};
use crate::net::channel::FramedChannel;
use crate::net::{ErrorKind, NetResult, NetworkError};
use crate::packet::control::{ControlPacket, ControlType, ReasonCode, CONTROL_MAGIC};
use crate::packet::handshake::{HandshakePacket, HANDSHAKE_MAGIC};
use crate::packet::{PacketError, PacketFlags, PacketHeader, Priority, RawPacket};
use crate::pool::buffer::BufferPool;
use crate::pool::object::ObjectPool;
use indexmap::IndexSet;
use mio::net::TcpListener;
use quark::crypto::{EncryptionMode, KeyExchange, SigningIdentity};
use quark::logging::{self, Logger};
use quark::snowflake::{IdGenerator, ShortId};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const TOKEN_OFFSET: usize = 1;
const EVENT_CAPACITY: usize = 8192;
const ID_KIND_CONNECTION: u8 = 1;

/// Consumes decoded application frames off the network thread.
pub trait FrameDispatcher {
    fn dispatch(&self, view: ConnectionView, packet: RawPacket);
}

/// Connectivity changes accumulated during `sync`, drained by the owner.
#[derive(Debug, Copy, Clone)]
pub enum ConnectionChange {
    Connected(u64),
    Disconnected(u64),
}

#[derive(Clone, Debug)]
pub struct EndpointSettings {
    pub encryption_mode: EncryptionMode,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ingress_timeout: Duration,
    pub machine: u16,
}

impl Default for EndpointSettings {
    fn default() -> EndpointSettings {
        EndpointSettings {
            encryption_mode: EncryptionMode::None,
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(3),
            ingress_timeout: Duration::from_secs(30),
            machine: 0,
        }
    }
}

struct Slot {
    conn: Option<Connection>,
    generation: u32,
    /// Channel kept across connections so its buffers are reused.
    spare: Option<FramedChannel>,
    /// Encoded frames awaiting egress-buffer space.
    outbox: VecDeque<Vec<u8>>,
}

/// Handles all connection management and network transmission.
pub struct Endpoint {
    listener: TcpListener,
    local_addr: SocketAddr,

    poll: mio::Poll,
    events: mio::Events,

    slots: Vec<Slot>,
    free: Vec<usize>,
    live: IndexSet<usize>,

    pool: BufferPool,
    encode_pool: ObjectPool<Vec<u8>>,
    admission: Arc<AdmissionControl>,
    id_gen: IdGenerator,
    identity: Option<Arc<SigningIdentity>>,
    settings: EndpointSettings,

    changes: Vec<ConnectionChange>,

    housekeeping_time: Instant,
    cleanup_time: Instant,

    log: Logger,
}

impl Endpoint {
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

    /// Binds the listener and prepares the poll. The machine number feeds
    /// the connection id generator.
    pub fn bind(
        addr: SocketAddr,
        pool: BufferPool,
        admission: Arc<AdmissionControl>,
        identity: Option<Arc<SigningIdentity>>,
        settings: EndpointSettings,
        log: Logger,
    ) -> io::Result<Endpoint> {
        let listener = TcpListener::bind(&addr)?;
        let local_addr = listener.local_addr()?;

        let poll = mio::Poll::new()?;
        poll.register(
            &listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let now = Instant::now();

        logging::info!(log, "endpoint bound";
                       "context" => "bind",
                       "address" => %local_addr);

        Ok(Endpoint {
            listener,
            local_addr,
            poll,
            events: mio::Events::with_capacity(EVENT_CAPACITY),
            slots: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            pool,
            encode_pool: ObjectPool::new(64, Vec::new),
            admission,
            id_gen: IdGenerator::new(ID_KIND_CONNECTION, settings.machine),
            identity,
            settings,
            changes: Vec::new(),
            housekeeping_time: now,
            cleanup_time: now,
            log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// Drains all the changes accumulated since the last `sync`.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// One turn of the event loop: poll readiness, accept, receive and
    /// pump frames to the dispatcher, flush egress, run housekeeping.
    pub fn sync(&mut self, now: Instant, dispatcher: &dyn FrameDispatcher, poll_timeout: Duration) {
        if now.duration_since(self.housekeeping_time) >= Self::HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }

        // Force send on every channel with buffered egress; edge readiness
        // alone will not re-fire for a socket that stayed writable
        let pending: Vec<usize> = self
            .live
            .iter()
            .filter(|&&idx| {
                let slot = &self.slots[idx];
                !slot.outbox.is_empty()
                    || slot
                        .conn
                        .as_ref()
                        .map(|conn| conn.channel.has_egress())
                        .unwrap_or(false)
            })
            .cloned()
            .collect();

        for idx in pending {
            self.flush(idx, now);
        }

        self.poll
            .poll(&mut self.events, Some(poll_timeout))
            .expect("Endpoint poll failed");

        let mut accept = false;
        let mut work: Vec<(usize, bool, bool)> = Vec::new();

        for event in &self.events {
            if event.token() == LISTENER_TOKEN {
                accept = true;
                continue;
            }

            let idx = usize::from(event.token()) - TOKEN_OFFSET;
            let readiness = event.readiness();
            work.push((idx, readiness.is_readable(), readiness.is_writable()));
        }

        if accept {
            self.accept_all(now);
        }

        for (idx, readable, writable) in work {
            if self.slot_dead(idx) {
                continue;
            }

            if readable {
                self.ingest(idx, now, dispatcher);
            }

            if writable && !self.slot_dead(idx) {
                self.flush(idx, now);
            }
        }
    }

    fn slot_dead(&self, idx: usize) -> bool {
        idx >= self.slots.len() || self.slots[idx].conn.is_none()
    }

    /// Accepts every pending connection, running each through admission.
    fn accept_all(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote)) => self.open_connection(stream, remote, now),
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        logging::error!(self.log, "accept failed";
                                        "context" => "accept",
                                        "error" => %err);
                    }
                    return;
                }
            }
        }
    }

    fn open_connection(&mut self, stream: mio::net::TcpStream, remote: SocketAddr, now: Instant) {
        let id = match self.id_gen.next() {
            Ok(id) => id,
            Err(err) => {
                logging::error!(self.log, "connection id generation failed";
                                "context" => "accept",
                                "error" => %err);
                return;
            }
        };

        let admitted = self.admission.is_connection_allowed(remote.ip());

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    conn: None,
                    generation: 0,
                    spare: None,
                    outbox: VecDeque::new(),
                });
                self.slots.len() - 1
            }
        };

        let log = &self.log;

        let slot = &mut self.slots[idx];
        slot.generation = slot.generation.wrapping_add(1);
        slot.outbox.clear();

        let mut channel = slot.spare.take().unwrap_or_else(|| FramedChannel::new(log));
        channel.open(stream, now);

        if channel.register(idx + TOKEN_OFFSET, &self.poll).has_failed_log(&self.log) {
            channel.close();
            slot.spare = Some(channel);
            self.free.push(idx);
            if admitted {
                self.admission.connection_closed(remote.ip());
            }
            return;
        }

        let conn = Connection::new(id, remote, channel, admitted, now);

        logging::debug!(self.log, "connection opened";
                        "context" => "accept",
                        "connection" => %ShortId::derive(id),
                        "remote" => %remote,
                        "admitted" => admitted);

        slot.conn = Some(conn);
        self.live.insert(idx);
        self.changes.push(ConnectionChange::Connected(id));
    }

    /// Receives from the socket and pumps every complete frame through
    /// decode and on to its consumer.
    fn ingest(&mut self, idx: usize, now: Instant, dispatcher: &dyn FrameDispatcher) {
        let receive = {
            let conn = self.slots[idx].conn.as_mut().expect("Live slot must hold a connection");
            conn.channel.receive(now)
        };

        match receive {
            Ok(_) | Err(NetworkError::Wait) => (),
            Err(NetworkError::Fatal(kind)) => {
                self.close_slot(idx, None, kind);
                return;
            }
        }

        loop {
            // Frame handling may have closed the slot mid-loop
            if self.slot_dead(idx) {
                return;
            }

            let extracted = {
                let conn = self.slots[idx].conn.as_mut().expect("Live slot must hold a connection");
                conn.channel.extract(&self.pool)
            };

            match extracted {
                Ok(lease) => {
                    if !self.handle_frame(idx, &lease, dispatcher) {
                        return;
                    }
                }
                Err(NetworkError::Wait) => return,
                Err(NetworkError::Fatal(kind)) => {
                    self.close_slot(idx, None, kind);
                    return;
                }
            }
        }
    }

    /// Decodes one frame and routes it. Returns false when the connection
    /// was closed.
    fn handle_frame(
        &mut self,
        idx: usize,
        frame: &[u8],
        dispatcher: &dyn FrameDispatcher,
    ) -> bool {
        let decoded = RawPacket::decode(frame);

        // Connections past the per-IP cap get one deterministic answer and
        // a server-initiated close, whatever their first frame was
        if !self.slots[idx].conn.as_ref().expect("Live slot must hold a connection").admitted {
            let header = match &decoded {
                Ok(packet) => packet.header.clone(),
                Err(PacketError::ChecksumMismatch { header, .. }) => header.clone(),
                Err(_) => placeholder_header(),
            };

            self.send_control(idx, ControlPacket::fail(ReasonCode::ConnectionLimit, &header));
            self.close_slot(idx, None, ErrorKind::PeerClosed);
            return false;
        }

        let packet = match decoded {
            Ok(packet) => packet,
            Err(PacketError::ChecksumMismatch { header, actual }) => {
                logging::debug!(self.log, "frame rejected: checksum mismatch";
                                "context" => "ingest",
                                "connection_id" => self.connection_id(idx),
                                "opcode" => header.opcode,
                                "expected" => header.checksum,
                                "actual" => actual);

                self.send_control(idx, ControlPacket::fail(ReasonCode::ChecksumMismatch, &header));
                return true;
            }
            Err(err) => {
                logging::debug!(self.log, "frame rejected: malformed";
                                "context" => "ingest",
                                "connection_id" => self.connection_id(idx),
                                "error" => %err);

                let reason = match err {
                    PacketError::Truncated { .. } => ReasonCode::BadFrame,
                    _ => ReasonCode::MalformedPacket,
                };

                self.send_control(idx, ControlPacket::fail(reason, &placeholder_header()));
                return true;
            }
        };

        match packet.header.magic {
            HANDSHAKE_MAGIC => {
                self.handle_handshake(idx, packet);
                true
            }
            CONTROL_MAGIC => self.handle_control(idx, packet),
            _ => {
                let (view, id) = {
                    let slot = &self.slots[idx];
                    let conn = slot.conn.as_ref().expect("Live slot must hold a connection");
                    (conn.view(idx, slot.generation), conn.id)
                };

                logging::trace!(self.log, "frame dispatched to pipeline";
                                "context" => "ingest",
                                "connection" => %ShortId::derive(id),
                                "opcode" => packet.header.opcode);

                dispatcher.dispatch(view, packet);
                true
            }
        }
    }

    /// Runs the key exchange: derive the session key, activate the cipher
    /// mode and answer with the server's ephemeral public key.
    fn handle_handshake(&mut self, idx: usize, packet: RawPacket) {
        let signed = packet.has_flag(PacketFlags::SIGNED);

        let hello = match HandshakePacket::decode(&packet.payload, signed) {
            Ok(hello) => hello,
            Err(_) => {
                self.send_control(idx, ControlPacket::fail(ReasonCode::MalformedPacket, &packet.header));
                return;
            }
        };

        if !hello.verify() {
            self.send_control(idx, ControlPacket::fail(ReasonCode::SignatureInvalid, &packet.header));
            return;
        }

        let exchange = KeyExchange::generate();
        let server_public = exchange.public_bytes();
        let session_key = exchange.derive(&hello.exchange_key);

        let mode = self.settings.encryption_mode;

        {
            let conn = self.slots[idx].conn.as_mut().expect("Live slot must hold a connection");
            conn.install_key(session_key, mode);

            logging::debug!(self.log, "handshake completed";
                            "context" => "handshake",
                            "connection" => %ShortId::derive(conn.id),
                            "remote" => %conn.remote,
                            "mode" => ?mode,
                            "signed" => signed);
        }

        let reply = match &self.identity {
            Some(identity) => HandshakePacket::signed(server_public, identity),
            None => HandshakePacket::plain(server_public),
        };

        self.send_packet(idx, &reply.into_raw(packet.header.sequence_id));
    }

    /// Inbound control traffic. Returns false when the connection closed.
    fn handle_control(&mut self, idx: usize, packet: RawPacket) -> bool {
        let control = match ControlPacket::decode(&packet.payload) {
            Ok(control) => control,
            Err(_) => {
                self.send_control(idx, ControlPacket::fail(ReasonCode::MalformedPacket, &packet.header));
                return true;
            }
        };

        match control.control_type {
            ControlType::Ping => {
                let mut pong =
                    ControlPacket::new(ControlType::Pong, ReasonCode::None, crate::packet::control::SuggestedAction::None);
                pong.sequence_id = control.sequence_id;
                pong.args = control.args;

                self.send_control(idx, pong);
                true
            }
            // Ingress timestamps were already refreshed by the receive path
            ControlType::Heartbeat | ControlType::Pong => true,
            ControlType::Disconnect => {
                self.close_slot(idx, None, ErrorKind::PeerClosed);
                false
            }
            other => {
                logging::trace!(self.log, "ignoring control frame";
                                "context" => "ingest",
                                "connection_id" => self.connection_id(idx),
                                "control_type" => ?other);
                true
            }
        }
    }

    /// Applies a pipeline completion: generation-checked routing, handler
    /// effects, then the verdict packet.
    pub fn apply(&mut self, completion: Completion) {
        let idx = completion.route.slot;

        if idx >= self.slots.len()
            || self.slots[idx].generation != completion.route.generation
            || self.slots[idx].conn.is_none()
        {
            logging::trace!(self.log, "stale completion dropped";
                            "context" => "apply",
                            "connection_id" => completion.route.connection_id);
            return;
        }

        if let Some(authority) = completion.effects.upgrade_authority {
            let conn = self.slots[idx].conn.as_mut().expect("Live slot must hold a connection");
            conn.upgrade_authority(authority);
        }

        match completion.verdict {
            Verdict::Respond(packet) => self.send_packet(idx, &packet),
            Verdict::Control(control) => self.send_control(idx, control),
            Verdict::None => (),
        }

        if completion.effects.close && !self.slot_dead(idx) {
            self.close_slot(
                idx,
                Some(ControlPacket::disconnect(ReasonCode::None)),
                ErrorKind::Cancelled,
            );
        }
    }

    fn send_control(&mut self, idx: usize, control: ControlPacket) {
        self.send_packet(idx, &control.into_raw());
    }

    /// Encodes and enqueues one packet, spilling to the slot outbox under
    /// backpressure. Fatal write errors close the connection.
    fn send_packet(&mut self, idx: usize, packet: &RawPacket) {
        if self.slot_dead(idx) {
            return;
        }

        let mut scratch = self.encode_pool.take();

        if let Err(err) = packet.encode_into(&mut *scratch) {
            logging::error!(self.log, "response packet unencodable";
                            "context" => "send",
                            "connection_id" => self.connection_id(idx),
                            "error" => %err);
            return;
        }

        let outcome = {
            let slot = &mut self.slots[idx];
            let conn = slot.conn.as_mut().expect("Live slot must hold a connection");

            if slot.outbox.is_empty() {
                conn.channel.write_frame(&[scratch.as_slice()])
            } else {
                // Keep wire order behind frames already waiting
                Err(NetworkError::Wait)
            }
        };

        match outcome {
            Ok(()) => self.flush(idx, Instant::now()),
            Err(NetworkError::Wait) => {
                self.slots[idx].outbox.push_back(scratch.as_slice().to_vec());
            }
            Err(NetworkError::Fatal(kind)) => {
                self.close_slot(idx, None, kind);
            }
        }
    }

    /// Moves outbox frames into the egress buffer and flushes the socket.
    fn flush(&mut self, idx: usize, now: Instant) {
        let result = {
            let slot = &mut self.slots[idx];
            let conn = slot.conn.as_mut().expect("Live slot must hold a connection");

            let mut fatal = None;

            while let Some(frame) = slot.outbox.front() {
                match conn.channel.write_frame(&[frame]) {
                    Ok(()) => {
                        slot.outbox.pop_front();
                    }
                    Err(NetworkError::Wait) => break,
                    Err(err) => {
                        slot.outbox.clear();
                        fatal = Some(err);
                        break;
                    }
                }
            }

            match fatal {
                Some(err) => Err(err),
                None => conn.channel.send(now),
            }
        };

        match result {
            Ok(_) | Err(NetworkError::Wait) => (),
            Err(NetworkError::Fatal(kind)) => self.close_slot(idx, None, kind),
        }
    }

    /// Closes a connection exactly once: optional notify control, socket
    /// shutdown, admission release, slot recycling.
    fn close_slot(&mut self, idx: usize, notify: Option<ControlPacket>, kind: ErrorKind) {
        if self.slot_dead(idx) {
            return;
        }

        if let Some(control) = notify {
            let raw = control.into_raw();
            let mut scratch = self.encode_pool.take();

            if raw.encode_into(&mut *scratch).is_ok() {
                let conn = self.slots[idx].conn.as_mut().expect("Live slot must hold a connection");
                // Best effort: enqueue and flush, ignore failures
                drop(conn.channel.write_frame(&[scratch.as_slice()]));
                drop(conn.channel.send(Instant::now()));
            }
        }

        let slot = &mut self.slots[idx];
        let mut conn = slot.conn.take().expect("Live slot must hold a connection");

        if kind.is_benign() {
            logging::debug!(self.log, "connection closed";
                            "context" => "close",
                            "connection" => %ShortId::derive(conn.id),
                            "remote" => %conn.remote,
                            "kind" => ?kind);
        } else {
            logging::error!(self.log, "connection closed on error";
                            "context" => "close",
                            "connection" => %ShortId::derive(conn.id),
                            "remote" => %conn.remote,
                            "kind" => ?kind);
        }

        drop(conn.channel.deregister(&self.poll));
        conn.channel.close();

        if conn.admitted {
            self.admission.connection_closed(conn.remote.ip());
        }

        let id = conn.id;

        slot.spare = Some(conn.channel);
        slot.outbox.clear();

        self.live.remove(&idx);
        self.free.push(idx);
        self.changes.push(ConnectionChange::Disconnected(id));
    }

    /// Periodic per-connection upkeep: handshake and ingress timeouts,
    /// heartbeats, admission table cleanup.
    fn housekeeping(&mut self, now: Instant) {
        let stale: Vec<(usize, ErrorKind)> = self
            .live
            .iter()
            .filter_map(|&idx| {
                let conn = self.slots[idx].conn.as_ref()?;

                if conn.channel.last_ingress_elapsed(now) >= self.settings.ingress_timeout {
                    return Some((idx, ErrorKind::PeerClosed));
                }

                // Handshakes only gate connections on encrypted servers
                if self.settings.encryption_mode != EncryptionMode::None
                    && conn.handshake != HandshakeState::Handshaked
                    && now.duration_since(conn.opened_at) >= self.settings.handshake_timeout
                {
                    return Some((idx, ErrorKind::Cancelled));
                }

                None
            })
            .collect();

        for (idx, kind) in stale {
            self.close_slot(idx, None, kind);
        }

        let heartbeats: Vec<usize> = self
            .live
            .iter()
            .filter(|&&idx| {
                self.slots[idx]
                    .conn
                    .as_ref()
                    .map(|conn| conn.channel.last_egress_elapsed(now) >= self.settings.heartbeat_interval)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for idx in heartbeats {
            self.send_control(idx, ControlPacket::heartbeat());
        }

        if now.duration_since(self.cleanup_time) >= Duration::from_millis(CLEANUP_INTERVAL_MS) {
            self.admission.cleanup(quark::clock::unix_millis());
            self.cleanup_time = now;
        }
    }

    /// Notifies every client of the shutdown and closes all connections.
    pub fn shutdown_all(&mut self) {
        let live: Vec<usize> = self.live.iter().cloned().collect();

        for idx in live {
            self.close_slot(idx, Some(ControlPacket::shutdown()), ErrorKind::Cancelled);
        }
    }

    fn connection_id(&self, idx: usize) -> u64 {
        self.slots[idx].conn.as_ref().map(|conn| conn.id).unwrap_or(0)
    }
}

/// Header stand-in for frames too mangled to parse.
fn placeholder_header() -> PacketHeader {
    PacketHeader {
        magic: 0,
        opcode: 0,
        flags: PacketFlags::empty(),
        priority: Priority::Normal,
        sequence_id: 0,
        timestamp: 0,
        checksum: 0,
    }
}

trait RegisterLog {
    fn has_failed_log(&self, log: &Logger) -> bool;
}

impl RegisterLog for NetResult<()> {
    fn has_failed_log(&self, log: &Logger) -> bool {
        if let Err(NetworkError::Fatal(kind)) = self {
            logging::error!(log, "channel registration failed";
                            "context" => "accept",
                            "kind" => ?kind);
            return true;
        }

        false
    }
}
