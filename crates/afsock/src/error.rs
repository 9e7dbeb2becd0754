//! Error types for socket operations.

use std::io;

use crate::addr::{AddressFamily, SocketKind};
use crate::capability::Capability;
use crate::handle::SocketState;

/// Result type for socket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during socket operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The logical address cannot be encoded for its family.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Raw address bytes are inconsistent with the family they claim.
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    /// The running kernel does not support this socket kind for the family.
    #[error("{kind} sockets are not supported for {family}")]
    UnsupportedKind {
        /// The address family.
        family: AddressFamily,
        /// The requested socket kind.
        kind: SocketKind,
    },

    /// The option does not exist for this family, or the kernel rejected it.
    #[error("option {option} is not supported for {family}")]
    UnsupportedOption {
        /// Option name.
        option: &'static str,
        /// The socket's address family.
        family: AddressFamily,
    },

    /// A required optional capability is absent.
    #[error("capability not available: {0}")]
    Unsupported(Capability),

    /// The address is already bound by another socket.
    #[error("address already in use")]
    AddressInUse,

    /// Nobody is listening at the destination.
    #[error("connection refused")]
    ConnectionRefused,

    /// A blocking connect did not complete in time.
    #[error("connect timed out")]
    ConnectTimeout,

    /// A blocking operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// Non-blocking operation cannot make progress right now.
    #[error("operation would block")]
    WouldBlock,

    /// The peer closed its end of the connection.
    #[error("broken pipe")]
    BrokenPipe,

    /// The socket has been closed locally.
    #[error("socket closed")]
    Closed,

    /// The selector has been closed.
    #[error("selector closed")]
    SelectorClosed,

    /// The operation is not valid in the socket's current state.
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        /// The operation attempted.
        operation: &'static str,
        /// The state the socket was in.
        state: SocketState,
    },

    /// Any other native error, with the raw errno.
    #[error("{operation}: {message} (errno {errno})")]
    Native {
        /// The operation that failed.
        operation: &'static str,
        /// The errno value.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },
}

impl Error {
    /// Classify a native errno.
    ///
    /// `EAGAIN` becomes [`Error::WouldBlock`], `EBADF` becomes
    /// [`Error::Closed`], `EPIPE` becomes [`Error::BrokenPipe`]; the
    /// remaining well-known kinds get their own variants and everything else
    /// is kept verbatim as [`Error::Native`].
    pub fn from_errno(operation: &'static str, errno: i32) -> Self {
        match errno {
            libc::EAGAIN => Self::WouldBlock,
            libc::EBADF => Self::Closed,
            libc::EPIPE => Self::BrokenPipe,
            libc::EADDRINUSE => Self::AddressInUse,
            libc::ECONNREFUSED => Self::ConnectionRefused,
            libc::ETIMEDOUT => Self::Timeout,
            _ => Self::Native {
                operation,
                errno,
                message: io::Error::from_raw_os_error(errno).to_string(),
            },
        }
    }

    /// Classify an I/O error returned by a system call wrapper.
    pub fn from_io(operation: &'static str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(operation, errno),
            None => Self::Native {
                operation,
                errno: 0,
                message: err.to_string(),
            },
        }
    }

    /// Check if this is a non-blocking "try again" signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Check if the socket (or selector) was closed locally.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::SelectorClosed)
    }

    /// Check if the peer closed the connection while we were writing.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::BrokenPipe)
    }

    /// Check if this is any kind of timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectTimeout)
    }

    /// Check if this is a capability gap rather than a runtime failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::Unsupported(_) | Self::UnsupportedKind { .. } | Self::UnsupportedOption { .. }
        )
    }

    /// Check if the peer reset the connection (ECONNRESET).
    pub fn is_connection_reset(&self) -> bool {
        self.errno() == Some(libc::ECONNRESET)
    }

    /// Get the errno value if this is a native error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Native { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// Recovers an [`Error`] that was carried through `std::io` unchanged.
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Self::from_errno("io", errno);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::Native {
                operation: "io",
                errno: 0,
                message: other.to_string(),
            },
            None => Self::Native {
                operation: "io",
                errno: 0,
                message: kind.to_string(),
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Native { errno, .. } if *errno != 0 => {
                return io::Error::from_raw_os_error(*errno);
            }
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::Timeout | Error::ConnectTimeout => io::ErrorKind::TimedOut,
            Error::BrokenPipe => io::ErrorKind::BrokenPipe,
            Error::Closed | Error::SelectorClosed => io::ErrorKind::NotConnected,
            Error::AddressInUse => io::ErrorKind::AddrInUse,
            Error::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Error::InvalidAddress(_) | Error::MalformedAddress(_) => io::ErrorKind::InvalidInput,
            Error::Unsupported(_)
            | Error::UnsupportedKind { .. }
            | Error::UnsupportedOption { .. } => io::ErrorKind::Unsupported,
            Error::InvalidState { .. } | Error::Native { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
