//! Adapters for layering a TLS engine over an [`AfStream`].
//!
//! A TLS library sees a plain byte stream. Two pieces are provided for it:
//!
//! - [`ResetTolerant`] forwards reads and writes unchanged and only
//!   overrides close. A peer that vanished first (reset, broken pipe, not
//!   connected) does not turn a graceful close into an error.
//! - [`HandshakeObserver`] carries the handshake outcome from the thread
//!   driving the handshake to whoever needs it afterwards. It completes once.
//!
//! # Example
//!
//! ```ignore
//! use afsock::{AfStream, HandshakeObserver, ResetTolerant};
//!
//! let (a, _b) = AfStream::pair()?;
//! let conn = ResetTolerant::new(a);
//! let session: HandshakeObserver<String> = HandshakeObserver::new();
//!
//! // ... handshake runs over `conn` ...
//! session.complete("TLSv1.3".to_string())?;
//! assert_eq!(session.get()?, "TLSv1.3");
//! conn.close()?;
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, OnceLock};

use crate::datagram::AfDatagram;
use crate::error::{Error, Result};
use crate::stream::AfStream;

/// A connection that can be shut down for writing and then closed.
pub trait Closable {
    /// Signal end-of-stream to the peer.
    fn shutdown_output(&self) -> Result<()>;

    /// Release the descriptor.
    fn close(&self) -> Result<()>;
}

impl Closable for AfStream {
    fn shutdown_output(&self) -> Result<()> {
        AfStream::shutdown_output(self)
    }

    fn close(&self) -> Result<()> {
        AfStream::close(self)
    }
}

impl Closable for AfDatagram {
    fn shutdown_output(&self) -> Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn close(&self) -> Result<()> {
        AfDatagram::close(self)
    }
}

/// Errors a peer can cause by disappearing before we close.
fn is_benign_close_error(err: &Error) -> bool {
    err.is_broken_pipe()
        || err.is_connection_reset()
        || err.errno() == Some(libc::ENOTCONN)
}

/// Wraps one connection and tolerates peer resets on close.
pub struct ResetTolerant<S> {
    inner: S,
}

impl<S: Closable> ResetTolerant<S> {
    /// Take ownership of `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The wrapped connection, mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Shut down the write side and close.
    ///
    /// The descriptor is released even when the shutdown fails. A reset,
    /// broken pipe or not-connected error from either step is dropped.
    pub fn close(&self) -> Result<()> {
        let shutdown = self.inner.shutdown_output();
        let closed = self.inner.close();
        match shutdown.and(closed) {
            Err(err) if is_benign_close_error(&err) => {
                tracing::debug!(error = %err, "ignoring peer reset during close");
                Ok(())
            }
            // Closing twice is already a no-op at the handle level.
            Err(Error::Closed) => Ok(()),
            other => other,
        }
    }
}

impl<S: Read> Read for ResetTolerant<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Write> Write for ResetTolerant<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: AsRawFd> AsRawFd for ResetTolerant<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl<S: fmt::Debug> fmt::Debug for ResetTolerant<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResetTolerant").field(&self.inner).finish()
    }
}

/// Misuse of a [`HandshakeObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The handshake has not completed yet.
    #[error("handshake has not completed")]
    Pending,
    /// The observer was already completed.
    #[error("handshake already completed")]
    AlreadyCompleted,
}

/// One-shot handshake result shared between clones.
pub struct HandshakeObserver<T> {
    slot: Arc<OnceLock<T>>,
}

impl<T> HandshakeObserver<T> {
    /// A pending observer.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// Record the outcome. Fails if already recorded.
    pub fn complete(&self, value: T) -> std::result::Result<(), HandshakeError> {
        self.slot
            .set(value)
            .map_err(|_| HandshakeError::AlreadyCompleted)
    }

    /// The recorded outcome.
    pub fn get(&self) -> std::result::Result<&T, HandshakeError> {
        self.slot.get().ok_or(HandshakeError::Pending)
    }

    /// Whether the handshake has completed, as seen by any clone.
    pub fn is_complete(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<T> Default for HandshakeObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for HandshakeObserver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for HandshakeObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.get() {
            Some(value) => f.debug_tuple("HandshakeObserver").field(value).finish(),
            None => f.write_str("HandshakeObserver(<pending>)"),
        }
    }
}
