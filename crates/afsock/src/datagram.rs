//! Message-oriented endpoints: datagram and sequential-packet sockets.
//!
//! Every receive returns exactly one message. When the buffer is smaller
//! than the message, the excess is discarded and the returned [`Datagram`]
//! says so; TIPC messages bounced back by the fabric are reported through
//! [`Datagram::rejected`].

use std::fmt;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use crate::addr::{AddressFamily, SocketAddress, SocketKind};
use crate::ancillary::{AncillaryMessage, TipcErrorInfo};
use crate::error::{Error, Result};
use crate::handle::{Received, RecvInfo, SocketHandle};
use crate::stream::Accept;

/// Outcome of one message receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Bytes copied into the caller's buffer.
    pub len: usize,
    /// The message was longer than the buffer; the rest was discarded.
    pub truncated: bool,
    /// Sender, when known.
    pub peer: Option<SocketAddress>,
    /// Set when TIPC returned this message as undeliverable.
    pub rejected: Option<TipcErrorInfo>,
}

impl Datagram {
    fn from_info(info: &RecvInfo) -> Self {
        Self {
            len: info.len,
            truncated: info.truncated,
            peer: info.peer.clone(),
            rejected: info.ancillary.tipc_error,
        }
    }
}

/// A datagram or sequential-packet socket.
pub struct AfDatagram {
    handle: SocketHandle,
}

impl AfDatagram {
    /// Create an unbound socket of a message `kind`.
    pub fn new(family: AddressFamily, kind: SocketKind) -> Result<Self> {
        if !kind.preserves_boundaries() {
            return Err(Error::UnsupportedKind { family, kind });
        }
        Ok(Self {
            handle: SocketHandle::new(family, kind)?,
        })
    }

    /// Create a datagram socket bound to `addr`.
    pub fn bind(addr: &SocketAddress) -> Result<Self> {
        let sock = Self::new(addr.family(), SocketKind::Datagram)?;
        sock.handle.bind(addr)?;
        Ok(sock)
    }

    /// Connect a new sequential-packet socket to `addr`.
    pub fn connect_seqpacket(addr: &SocketAddress) -> Result<Self> {
        let sock = Self::new(addr.family(), SocketKind::SequentialPacket)?;
        sock.handle.connect(addr, None)?;
        Ok(sock)
    }

    /// A connected pair of Unix message sockets.
    pub fn pair(kind: SocketKind) -> Result<(Self, Self)> {
        if !kind.preserves_boundaries() {
            return Err(Error::UnsupportedKind {
                family: AddressFamily::Unix,
                kind,
            });
        }
        let (a, b) = SocketHandle::pair(kind)?;
        Ok((Self { handle: a }, Self { handle: b }))
    }

    /// Set the default destination (datagram) or connect (seqpacket).
    pub fn connect(&self, addr: &SocketAddress) -> Result<()> {
        self.handle.connect(addr, None)?;
        Ok(())
    }

    /// Send one message to the connected peer.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.handle.send(buf)
    }

    /// Send one message to `addr`.
    pub fn send_to(&self, buf: &[u8], addr: &SocketAddress) -> Result<usize> {
        self.handle.send_to(buf, addr)
    }

    /// Send one message carrying descriptors (Unix only).
    pub fn send_fds(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> Result<usize> {
        self.handle.send_with_fds(buf, fds)
    }

    /// Receive one message.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Datagram> {
        self.recv_from(buf)
    }

    /// Receive one message along with its sender.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Datagram> {
        let info = self.handle.recv_from(buf)?;
        let datagram = Datagram::from_info(&info);
        if let Some(rejected) = datagram.rejected {
            tracing::debug!(
                id = %self.handle.id(),
                code = rejected.code,
                "TIPC message returned undelivered"
            );
        }
        Ok(datagram)
    }

    /// Receive one message with its control data.
    pub fn recv_with_ancillary(
        &self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> Result<(Datagram, AncillaryMessage)> {
        let info = self.handle.recv_with_ancillary(buf, max_fds)?;
        let datagram = Datagram::from_info(&info);
        Ok((datagram, info.ancillary))
    }

    /// Receive one message into a new buffer of `capacity` bytes.
    pub fn receive(&self, capacity: usize) -> Result<Received> {
        self.handle.receive(capacity)
    }

    /// Size of the next message without consuming it.
    pub fn peek_len(&self) -> Result<usize> {
        self.handle.peek_len()
    }

    /// The local address.
    pub fn local_address(&self) -> Result<SocketAddress> {
        self.handle.local_address()
    }

    /// The connected peer's address.
    pub fn peer_address(&self) -> Result<SocketAddress> {
        self.handle.peer_address()
    }

    /// Shut down one or both directions.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.handle.shutdown(how)
    }

    /// Switch between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.handle.set_nonblocking(nonblocking)
    }

    /// Bound blocking receives.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.handle.set_read_timeout(timeout)
    }

    /// Bound blocking sends.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.handle.set_write_timeout(timeout)
    }

    /// The underlying handle.
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    /// Unwrap into the underlying handle.
    pub fn into_handle(self) -> SocketHandle {
        self.handle
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }
}

impl Accept for AfDatagram {
    const KIND: SocketKind = SocketKind::SequentialPacket;

    fn from_accepted(handle: SocketHandle) -> Self {
        Self { handle }
    }
}

impl AsRawFd for AfDatagram {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl fmt::Debug for AfDatagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfDatagram")
            .field("handle", &self.handle)
            .finish()
    }
}
