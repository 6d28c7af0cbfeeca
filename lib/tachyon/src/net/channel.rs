use crate::net::buffer::Buffer;
use crate::net::{ErrorKind, NetResult, NetworkError};
use crate::packet::{FRAME_LEN_SIZE, MAX_FRAME_SIZE};
use crate::pool::buffer::{BufferLease, BufferPool};
use byteorder::{ByteOrder, LittleEndian};
use mio::net::TcpStream;
use quark::logging::{self, Logger};
use std::net::Shutdown;
use std::time::{Duration, Instant};

// The ingress buffer must hold at least one maximum-size frame
const READ_BUF_SIZE: usize = 65_536;
const WRITE_BUF_SIZE: usize = 8 * 65_536;

pub type ChannelId = usize;

/// Per-connection framed transport. Frames are `LEN(u16 LE) || PAYLOAD`
/// where `LEN` counts the header itself, so `LEN >= 2`. The channel buffers
/// non-blocking socket I/O in both directions and hands complete frame
/// payloads out as pool-owned leases.
pub struct FramedChannel {
    stream: Option<TcpStream>,

    read_buffer: Buffer,
    write_buffer: Buffer,

    last_ingress: Instant,
    last_egress: Instant,

    log: Logger,
}

impl FramedChannel {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> FramedChannel {
        let now = Instant::now();

        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        FramedChannel {
            stream: None,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            last_ingress: now,
            last_egress: now,
            log: channel_log,
        }
    }

    /// Attaches a freshly accepted stream. The channel must be closed for
    /// this operation to succeed; opening twice is a programmer error.
    pub fn open(&mut self, stream: TcpStream, now: Instant) {
        if self.stream.is_some() {
            panic!("Attempted to open an already open channel");
        }

        self.stream = Some(stream);
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.last_ingress = now;
        self.last_egress = now;

        logging::trace!(self.log, "channel opened"; "context" => "open");
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Registers this channel on the supplied poll.
    pub fn register(&self, id: ChannelId, poll: &mio::Poll) -> NetResult<()> {
        poll.register(
            self.stream.as_ref().expect("Can't register a closed channel"),
            id.into(),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Deregisters this channel from the supplied poll.
    pub fn deregister(&self, poll: &mio::Poll) -> NetResult<()> {
        poll.deregister(self.stream.as_ref().expect("Can't deregister a closed channel"))
            .map_err(Into::into)
    }

    /// Returns the time elapsed since the last ingress.
    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    /// Returns the time elapsed since the last egress.
    #[inline]
    pub fn last_egress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_egress)
    }

    /// True if there is buffered outgoing data.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Reads all available data off the socket, updating the ingress
    /// timestamp when bytes arrive.
    pub fn receive(&mut self, now: Instant) -> NetResult<usize> {
        let stream = self.stream.as_mut().expect("Channel must have a valid stream");

        match self.read_buffer.ingress(stream) {
            Ok(received) => {
                if received > 0 {
                    self.last_ingress = now;
                }
                Ok(received)
            }
            Err(err) => {
                // WouldBlock carries whatever was read before the socket
                // drained; that still counts as ingress
                let folded: NetworkError = err.into();

                if folded == NetworkError::Wait && !self.read_buffer.is_empty() {
                    self.last_ingress = now;
                }

                Err(folded)
            }
        }
    }

    /// Parses one complete frame out of the ingress buffer and transfers
    /// its payload into a pool lease. Returns `Wait` until a full frame is
    /// available, so callers loop until then.
    pub fn extract(&mut self, pool: &BufferPool) -> NetResult<BufferLease> {
        let available = self.read_buffer.read_slice();

        if available.len() < FRAME_LEN_SIZE {
            return Err(NetworkError::Wait);
        }

        let frame_len = LittleEndian::read_u16(available) as usize;

        if frame_len < FRAME_LEN_SIZE {
            logging::trace!(self.log, "malformed frame length";
                            "context" => "extract",
                            "frame_len" => frame_len);
            return Err(NetworkError::Fatal(ErrorKind::BadFrameLength));
        }

        if available.len() < frame_len {
            return Err(NetworkError::Wait);
        }

        let payload_len = frame_len - FRAME_LEN_SIZE;

        let mut lease = pool.rent(payload_len);
        lease.fill_from(&available[FRAME_LEN_SIZE..frame_len]);

        self.read_buffer.move_head(frame_len);

        logging::trace!(self.log, "frame extracted";
                        "context" => "extract",
                        "payload_len" => payload_len);

        Ok(lease)
    }

    /// Length-prefixes the concatenation of `parts` and appends it to the
    /// egress buffer. `Wait` signals backpressure: the frame was not
    /// enqueued and the caller should retry after a flush.
    pub fn write_frame(&mut self, parts: &[&[u8]]) -> NetResult<()> {
        let payload_len: usize = parts.iter().map(|part| part.len()).sum();
        let frame_len = payload_len + FRAME_LEN_SIZE;

        if frame_len > MAX_FRAME_SIZE {
            return Err(NetworkError::Fatal(ErrorKind::FrameTooLarge));
        }

        if self.write_buffer.free_capacity() < frame_len {
            return Err(NetworkError::Wait);
        }

        let stream = self.write_buffer.write_slice();

        LittleEndian::write_u16(stream, frame_len as u16);

        let mut offset = FRAME_LEN_SIZE;
        for part in parts {
            stream[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }

        self.write_buffer.move_tail(frame_len);

        logging::trace!(self.log, "frame enqueued";
                        "context" => "write_frame",
                        "frame_len" => frame_len);

        Ok(())
    }

    /// Flushes buffered egress to the socket, updating the egress timestamp
    /// when bytes leave. A zero-byte socket write folds to `PeerClosed`.
    pub fn send(&mut self, now: Instant) -> NetResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().expect("Channel must have a valid stream");

        let before = self.write_buffer.len();

        let result = self.write_buffer.egress(stream);
        let sent = before - self.write_buffer.len();

        if sent > 0 {
            self.last_egress = now;
        }

        match result {
            Ok(_) => Ok(sent),
            Err(err) => Err(err.into()),
        }
    }

    /// Closes the channel exactly once: shuts the socket down in both
    /// directions, drops it and clears both buffers. Safe to call on an
    /// already closed channel.
    pub fn close(&mut self) {
        logging::trace!(self.log, "closing channel";
                        "context" => "close",
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len());

        self.read_buffer.clear();
        self.write_buffer.clear();

        if let Some(stream) = self.stream.take() {
            // The peer may already be gone, in which case shutdown is moot
            drop(stream.shutdown(Shutdown::Both));
        }
    }
}
