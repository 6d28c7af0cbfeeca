//! Networking layer: the compacting I/O buffer, the framed channel and the
//! mio-driven endpoint.

pub mod buffer;
pub mod channel;
pub mod endpoint;

use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetworkError>;

/// The two-level error model used throughout the non-blocking paths: `Wait`
/// means the operation cannot make progress yet and should be retried on
/// the next readiness event, `Fatal` terminates the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Frame length below the 2-byte minimum.
    BadFrameLength,
    /// Attempted to write a frame above the 16-bit length limit.
    FrameTooLarge,
    /// The peer closed the connection.
    PeerClosed,
    /// The connection was cancelled by shutdown.
    Cancelled,
    /// The ingress buffer filled without containing a complete frame.
    BufferOverrun,
    AddrParse,
    Io(io::ErrorKind),
}

impl ErrorKind {
    /// Benign failures are ordinary disconnect causes and are logged at
    /// trace level; everything else is logged as an error.
    pub fn is_benign(&self) -> bool {
        match self {
            ErrorKind::PeerClosed | ErrorKind::Cancelled => true,
            ErrorKind::Io(kind) => matches!(
                kind,
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            io::ErrorKind::WriteZero => NetworkError::Fatal(ErrorKind::PeerClosed),
            kind => NetworkError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorKind::AddrParse)
    }
}

pub trait ErrorUtils {
    /// True when the result is a fatal failure; `Wait` does not count.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}
