//! Error plumbing shared by every module: the error taxonomy, the
//! `NetResult` alias and the send-status report.

use std::fmt;
use std::io;
use std::net;

pub type NetResult<T> = Result<T, Error>;

/// Classifies every failure the runtime can produce.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Failure reported by the operating system.
    Io(io::ErrorKind),
    /// Peer violated the wire protocol.
    Protocol,
    InvalidArgument,
    OutOfBounds,
    /// Operation is not legal in the entity's current state.
    InvalidState,
    /// A bounded memory accountant refused an allocation.
    MemoryLimitExceeded,
    AllocationFailed,
    /// A packet read ran past the used size.
    EndOfPacket,
    Timeout,
    /// UDP association failed validation.
    AuthenticationFailed,
    /// Cipher input length is not usable.
    InvalidLength,
    NotInitialized,
}

/// An error annotated with the operation that produced it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    operation: &'static str,
}

impl Error {
    #[inline]
    pub fn new(kind: ErrorKind, operation: &'static str) -> Error {
        Error { kind, operation }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable description of the operation that failed.
    #[inline]
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// True for errors that should tear down the owning connection rather
    /// than be retried.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        match self.kind {
            ErrorKind::Io(io::ErrorKind::WouldBlock) => false,
            ErrorKind::Timeout => false,
            _ => true,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "error {:?} while {}", self.kind, self.operation)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::new(ErrorKind::Io(io_error.kind()), "performing socket i/o")
    }
}

impl From<net::AddrParseError> for Error {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        Error::new(ErrorKind::InvalidArgument, "parsing a network address")
    }
}

/// Shorthand used at every call site that raises a runtime error.
#[inline]
pub fn raise<T>(kind: ErrorKind, operation: &'static str) -> NetResult<T> {
    Err(Error::new(kind, operation))
}

/// Outcome of a send operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendStatus {
    /// Data is fully on the wire (or in the kernel buffer).
    Completed,
    /// Asynchronous send queued; completion is tracked by the send tracker.
    InProgress,
    /// The send failed; the socket remains usable.
    Failed,
    /// The send failed in a way that requires tearing down the owner.
    FailedKill,
}

impl SendStatus {
    #[inline]
    pub fn has_failed(self) -> bool {
        match self {
            SendStatus::Completed | SendStatus::InProgress => false,
            SendStatus::Failed | SendStatus::FailedKill => true,
        }
    }
}
