//! Connection-oriented endpoints: byte streams and accepting listeners.
//!
//! [`AfStream`] is a connected stream socket implementing [`Read`] and
//! [`Write`]. [`AfListener`] accepts connections and is typed by what it
//! produces: `AfListener<AfStream>` for stream sockets and
//! `AfListener<AfDatagram>` for sequential-packet sockets.
//!
//! # Example
//!
//! ```ignore
//! use afsock::{AfListener, AfStream, SocketAddress};
//! use std::io::{Read, Write};
//!
//! let addr = SocketAddress::path("/run/demo.sock");
//! let listener: AfListener = AfListener::builder(addr.clone())
//!     .remove_existing(true)
//!     .unlink_on_close(true)
//!     .bind::<AfStream>()?;
//!
//! let mut client = AfStream::connect(&addr)?;
//! let (mut server, _peer) = listener.accept()?;
//! client.write_all(b"hello")?;
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::addr::{SocketAddress, SocketKind};
use crate::ancillary::PeerCredentials;
use crate::error::{Error, Result};
use crate::handle::SocketHandle;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 50;

/// A connected stream socket.
pub struct AfStream {
    handle: SocketHandle,
}

impl AfStream {
    /// Connect to `addr`, blocking until connected.
    pub fn connect(addr: &SocketAddress) -> Result<Self> {
        Self::connect_timeout(addr, None)
    }

    /// Connect to `addr`, giving up after `timeout`.
    pub fn connect_timeout(addr: &SocketAddress, timeout: Option<Duration>) -> Result<Self> {
        let handle = SocketHandle::new(addr.family(), SocketKind::Stream)?;
        handle.connect(addr, timeout)?;
        Ok(Self { handle })
    }

    /// A connected pair of Unix stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = SocketHandle::pair(SocketKind::Stream)?;
        Ok((Self { handle: a }, Self { handle: b }))
    }

    /// Wrap a connected stream handle.
    pub fn from_handle(handle: SocketHandle) -> Result<Self> {
        if handle.kind() != SocketKind::Stream {
            return Err(Error::UnsupportedKind {
                family: handle.family(),
                kind: handle.kind(),
            });
        }
        Ok(Self { handle })
    }

    /// The underlying handle.
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    /// Unwrap into the underlying handle.
    pub fn into_handle(self) -> SocketHandle {
        self.handle
    }

    /// The local address.
    pub fn local_address(&self) -> Result<SocketAddress> {
        self.handle.local_address()
    }

    /// The peer's address.
    pub fn peer_address(&self) -> Result<SocketAddress> {
        self.handle.peer_address()
    }

    /// Credentials of the peer process (Unix only).
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        self.handle.peer_credentials()
    }

    /// Half-close: the peer reads end-of-stream, we can still read.
    pub fn shutdown_output(&self) -> Result<()> {
        self.handle.shutdown(Shutdown::Write)
    }

    /// Stop reading; further reads return end-of-stream.
    pub fn shutdown_input(&self) -> Result<()> {
        self.handle.shutdown(Shutdown::Read)
    }

    /// Send bytes along with descriptors.
    pub fn send_fds(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> Result<usize> {
        self.handle.send_with_fds(buf, fds)
    }

    /// Receive bytes and any descriptors sent with them.
    pub fn recv_fds(&self, buf: &mut [u8], max_fds: usize) -> Result<(usize, Vec<OwnedFd>)> {
        let info = self.handle.recv_with_ancillary(buf, max_fds)?;
        if info.ancillary.truncated {
            tracing::warn!(id = %self.handle.id(), "control data truncated; descriptors lost");
        }
        Ok((info.len, info.ancillary.fds))
    }

    /// Switch between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.handle.set_nonblocking(nonblocking)
    }

    /// Bound blocking reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.handle.set_read_timeout(timeout)
    }

    /// Bound blocking writes.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.handle.set_write_timeout(timeout)
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }
}

impl Read for &AfStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.handle.recv(buf)?)
    }
}

impl Write for &AfStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.handle.send(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for AfStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }
}

impl Write for AfStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for AfStream {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl fmt::Debug for AfStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfStream").field("handle", &self.handle).finish()
    }
}

/// Something an [`AfListener`] can produce from an accepted handle.
pub trait Accept: Sized {
    /// The socket kind the listener is created with.
    const KIND: SocketKind;

    /// Wrap a freshly accepted, connected handle.
    fn from_accepted(handle: SocketHandle) -> Self;
}

impl Accept for AfStream {
    const KIND: SocketKind = SocketKind::Stream;

    fn from_accepted(handle: SocketHandle) -> Self {
        Self { handle }
    }
}

/// A listening socket producing `S` per accepted connection.
pub struct AfListener<S: Accept = AfStream> {
    handle: SocketHandle,
    unlink_on_close: Mutex<Option<PathBuf>>,
    _marker: PhantomData<fn() -> S>,
}

impl AfListener {
    /// Start configuring a stream listener.
    ///
    /// Use [`ListenerBuilder::new`] for other kinds.
    pub fn builder(addr: SocketAddress) -> ListenerBuilder {
        ListenerBuilder::new(addr)
    }
}

impl<S: Accept> AfListener<S> {
    /// Bind and listen on `addr` with default settings.
    pub fn bind(addr: &SocketAddress) -> Result<Self> {
        ListenerBuilder::new(addr.clone()).bind()
    }

    /// Accept one connection.
    pub fn accept(&self) -> Result<(S, SocketAddress)> {
        let (handle, peer) = self.handle.accept()?;
        Ok((S::from_accepted(handle), peer))
    }

    /// Iterate over accepted connections.
    pub fn incoming(&self) -> Incoming<'_, S> {
        Incoming { listener: self }
    }

    /// The bound address.
    pub fn local_address(&self) -> Result<SocketAddress> {
        self.handle.local_address()
    }

    /// The underlying handle.
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    /// Switch between blocking and non-blocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.handle.set_nonblocking(nonblocking)
    }

    /// Bound blocking accepts.
    pub fn set_accept_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.handle.set_read_timeout(timeout)
    }

    /// Close the listener, removing its socket file if so configured.
    pub fn close(&self) -> Result<()> {
        self.handle.close()?;
        let path = self
            .unlink_on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(path) = path {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot remove socket file")
                }
            }
        }
        Ok(())
    }
}

impl<S: Accept> Drop for AfListener<S> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<S: Accept> AsRawFd for AfListener<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl<S: Accept> fmt::Debug for AfListener<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfListener")
            .field("handle", &self.handle)
            .field("kind", &S::KIND)
            .finish()
    }
}

/// Iterator returned by [`AfListener::incoming`].
#[derive(Debug)]
pub struct Incoming<'a, S: Accept> {
    listener: &'a AfListener<S>,
}

impl<S: Accept> Iterator for Incoming<'_, S> {
    type Item = Result<S>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept().map(|(s, _)| s))
    }
}

/// Builder for [`AfListener`].
#[derive(Debug, Clone)]
pub struct ListenerBuilder {
    address: SocketAddress,
    backlog: u32,
    remove_existing: bool,
    unlink_on_close: bool,
    nonblocking: bool,
}

impl ListenerBuilder {
    /// Create a new builder for `address`.
    pub fn new(address: SocketAddress) -> Self {
        Self {
            address,
            backlog: DEFAULT_BACKLOG,
            remove_existing: false,
            unlink_on_close: false,
            nonblocking: false,
        }
    }

    /// Set the listen backlog (clamped to at least 1).
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Remove a stale socket file at the path before binding.
    ///
    /// Only socket files are removed; anything else makes the bind fail.
    pub fn remove_existing(mut self, remove: bool) -> Self {
        self.remove_existing = remove;
        self
    }

    /// Remove the socket file when the listener is closed or dropped.
    pub fn unlink_on_close(mut self, unlink: bool) -> Self {
        self.unlink_on_close = unlink;
        self
    }

    /// Start in non-blocking mode.
    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    fn remove_stale(&self) {
        let Some(path) = self.address.as_path() else {
            return;
        };
        if let Ok(meta) = std::fs::symlink_metadata(path)
            && meta.file_type().is_socket()
        {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket file"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot remove stale socket file")
                }
            }
        }
    }

    /// Create the socket, bind and listen.
    pub fn bind<S: Accept>(self) -> Result<AfListener<S>> {
        if self.remove_existing {
            self.remove_stale();
        }
        let handle = SocketHandle::new(self.address.family(), S::KIND)?;
        handle.bind(&self.address)?;
        handle.listen(self.backlog)?;
        handle.set_nonblocking(self.nonblocking)?;
        let unlink = if self.unlink_on_close {
            self.address.as_path().map(|p| p.to_path_buf())
        } else {
            None
        };
        Ok(AfListener {
            handle,
            unlink_on_close: Mutex::new(unlink),
            _marker: PhantomData,
        })
    }
}
