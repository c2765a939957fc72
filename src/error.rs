use crate::socket_id::SocketId;
use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, MuxError>`.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Error types for the vsmux library.
///
/// `MuxError` covers everything from wire corruption on a shared connection
/// to local misuse of a connection group. Errors that describe the state of a
/// whole group (corruption, failed write side) are broadcast to every virtual
/// stream registered on that group.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid protocol version: {0}")]
    InvalidProtocol(u8),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown control message tag: {0}")]
    UnknownControlMessage(u8),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection group shut down")]
    GroupShutdown,

    #[error("Virtual socket already registered: {0}")]
    SocketAlreadyRegistered(SocketId),

    #[error("Virtual socket not registered: {0}")]
    SocketNotRegistered(SocketId),

    #[error("Acceptor already registered on this group")]
    AcceptorAlreadyRegistered,

    #[error("No acceptor registered on this group")]
    NoAcceptor,

    #[error("Connection refused by peer for socket {0}")]
    ConnectRefused(SocketId),

    #[error("Peer refused the request")]
    Refused,

    #[error("Write side failed: {0:?}")]
    WriteFailed(io::ErrorKind),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Virtual socket id space exhausted")]
    IdSpaceExhausted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out")]
    Timeout,
}

impl MuxError {
    /// Transient conditions a caller may retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MuxError::Io(e) => is_transient(e.kind()),
            MuxError::Timeout | MuxError::IdSpaceExhausted | MuxError::Refused => true,
            MuxError::InvalidProtocol(_)
            | MuxError::FrameTooLarge { .. }
            | MuxError::UnknownControlMessage(_)
            | MuxError::ProtocolViolation(_)
            | MuxError::GroupShutdown
            | MuxError::SocketAlreadyRegistered(_)
            | MuxError::SocketNotRegistered(_)
            | MuxError::AcceptorAlreadyRegistered
            | MuxError::NoAcceptor
            | MuxError::ConnectRefused(_)
            | MuxError::WriteFailed(_)
            | MuxError::Disconnected
            | MuxError::Config(_) => false,
        }
    }

    /// Corruption of the shared byte stream. Fatal to the owning group.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MuxError::InvalidProtocol(_)
                | MuxError::FrameTooLarge { .. }
                | MuxError::UnknownControlMessage(_)
                | MuxError::ProtocolViolation(_)
        )
    }
}

/// I/O error kinds that count toward an error budget instead of failing
/// the connection outright.
pub(crate) fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// I/O error kinds meaning the real connection is gone.
pub(crate) fn is_connection_lost(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

impl MuxError {
    /// The `io::ErrorKind` this error surfaces as on a virtual stream.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            MuxError::Io(e) => e.kind(),
            MuxError::InvalidProtocol(_)
            | MuxError::FrameTooLarge { .. }
            | MuxError::UnknownControlMessage(_)
            | MuxError::ProtocolViolation(_) => io::ErrorKind::InvalidData,
            MuxError::GroupShutdown | MuxError::Disconnected => io::ErrorKind::NotConnected,
            MuxError::WriteFailed(kind) => *kind,
            MuxError::ConnectRefused(_) | MuxError::Refused => io::ErrorKind::ConnectionRefused,
            MuxError::Timeout => io::ErrorKind::TimedOut,
            MuxError::SocketAlreadyRegistered(_) | MuxError::AcceptorAlreadyRegistered => {
                io::ErrorKind::AddrInUse
            }
            MuxError::SocketNotRegistered(_) | MuxError::NoAcceptor => io::ErrorKind::NotFound,
            MuxError::IdSpaceExhausted => io::ErrorKind::OutOfMemory,
            MuxError::Config(_) => io::ErrorKind::InvalidInput,
        }
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = err.io_kind();
        match err {
            MuxError::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let err = MuxError::InvalidProtocol(2);
        assert_eq!(err.to_string(), "Invalid protocol version: 2");

        let err = MuxError::FrameTooLarge {
            size: 70000,
            max: 4096,
        };
        assert_eq!(err.to_string(), "Frame too large: 70000 bytes (max: 4096)");

        let err = MuxError::SocketNotRegistered(SocketId::new(7));
        assert_eq!(err.to_string(), "Virtual socket not registered: 7");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::UnexpectedEof, "Connection lost");
        let mux_err: MuxError = io_err.into();

        match mux_err {
            MuxError::Io(_) => (),
            _ => panic!("Expected MuxError::Io"),
        }
    }

    #[test]
    fn test_into_io_error_kind() {
        let err: IoError = MuxError::InvalidProtocol(1).into();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err: IoError = MuxError::Timeout.into();
        assert_eq!(err.kind(), ErrorKind::TimedOut);

        let err: IoError = MuxError::WriteFailed(ErrorKind::BrokenPipe).into();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);

        let err: IoError = MuxError::Io(IoError::new(ErrorKind::AddrInUse, "busy")).into();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(MuxError::Io(IoError::new(ErrorKind::WouldBlock, "")).is_recoverable());
        assert!(MuxError::Io(IoError::new(ErrorKind::Interrupted, "")).is_recoverable());
        assert!(MuxError::Timeout.is_recoverable());
        assert!(MuxError::IdSpaceExhausted.is_recoverable());

        assert!(!MuxError::GroupShutdown.is_recoverable());
        assert!(!MuxError::InvalidProtocol(1).is_recoverable());
        assert!(!MuxError::Config("bad".to_string()).is_recoverable());
        assert!(!MuxError::Io(IoError::new(ErrorKind::ConnectionReset, "")).is_recoverable());
    }

    #[test]
    fn test_is_fatal() {
        assert!(MuxError::InvalidProtocol(3).is_fatal());
        assert!(MuxError::FrameTooLarge { size: 10, max: 5 }.is_fatal());
        assert!(MuxError::UnknownControlMessage(200).is_fatal());
        assert!(!MuxError::Disconnected.is_fatal());
        assert!(!MuxError::Timeout.is_fatal());
    }

    #[test]
    fn test_error_kind_classification() {
        assert!(is_connection_lost(ErrorKind::ConnectionReset));
        assert!(is_connection_lost(ErrorKind::BrokenPipe));
        assert!(!is_connection_lost(ErrorKind::Interrupted));
        assert!(is_transient(ErrorKind::TimedOut));
        assert!(!is_transient(ErrorKind::ConnectionReset));
    }
}
