//! Crate-level error types.

use std::io;

/// Everything that can go wrong while streaming to a DAC.
///
/// The enum is `Clone` + `PartialEq` so the worker can park the last failure
/// for the owner to inspect after `stop()` returns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // --- transport ---
    /// The DAC actively refused the TCP connection.
    #[error("connection refused by the DAC")]
    ConnectRefused,

    /// A transport operation exceeded its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The DAC closed the connection mid-stream.
    #[error("connection closed by the DAC")]
    ConnectionClosed,

    /// Any other socket-level failure.
    #[error("i/o error: {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },

    /// An in-flight operation was cancelled from another thread.
    #[error("operation cancelled")]
    Cancelled,

    /// No endpoint in a `connect_many` sequence could be reached.
    #[error("no endpoint could be reached")]
    HostNotFound,

    // --- protocol ---
    /// The DAC replied with something other than an ACK.
    #[error("DAC replied {response:#04x} instead of ACK for command '{command}'")]
    BadAckResponse { response: u8, command: char },

    /// The ACK echoed a different command than the one in flight.
    #[error("ACK echoed command '{received}' while '{expected}' was in flight")]
    CommandMismatch { expected: char, received: char },

    /// A reply frame was shorter than the wire format requires.
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },

    /// A status field carried a discriminant outside its defined range.
    #[error("unknown {field} value {value:#04x} in status frame")]
    UnknownEnum { field: &'static str, value: u8 },

    // --- contract ---
    /// The point generator appended fewer points than the request minimum.
    #[error("callback appended {provided} points where {required} were required")]
    CallbackUnderfill { required: usize, provided: usize },

    /// A point frame serialized to zero bytes.
    #[error("point frame serialized to zero bytes")]
    SerializationEmpty,

    // --- lifecycle ---
    /// The operation needs an established connection.
    #[error("device is not connected")]
    NotConnected,

    /// The operation was abandoned because the device is stopping.
    #[error("operation canceled: device is stopping")]
    OperationCanceled,
}

impl Error {
    /// Map a raw socket error onto the transport taxonomy.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::TimedOut,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Error::ConnectionClosed,
            kind => Error::Io {
                kind,
                message: err.to_string(),
            },
        }
    }

    /// Whether this error is a transport deadline expiry.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_onto_the_taxonomy() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Error::from_io(refused), Error::ConnectRefused);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert!(Error::from_io(timed_out).is_timed_out());

        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "deadline");
        assert!(Error::from_io(would_block).is_timed_out());

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::from_io(reset), Error::ConnectionClosed);

        match Error::from_io(io::Error::new(io::ErrorKind::Other, "weird")) {
            Error::Io { kind, .. } => assert_eq!(kind, io::ErrorKind::Other),
            other => panic!("expected Io, got {other:?}"),
        }
    }
}
