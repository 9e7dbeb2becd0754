//! Tokio adapters.
//!
//! Each adapter switches its handle to non-blocking mode and registers the
//! descriptor with the tokio reactor through [`AsyncFd`]. Operations wait
//! for readiness, try the non-blocking call and clear readiness on
//! [`Error::WouldBlock`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};

use crate::addr::{SocketAddress, SocketKind};
use crate::datagram::{AfDatagram, Datagram};
use crate::error::{Error, Result};
use crate::handle::{ConnectStatus, SocketHandle};
use crate::stream::{Accept, AfListener, AfStream};

fn register<T: std::os::fd::AsRawFd>(inner: T) -> Result<AsyncFd<T>> {
    AsyncFd::new(inner).map_err(|e| Error::from_io("register", e))
}

/// Wait for `interest`, then run `op` until it stops returning `WouldBlock`.
async fn drive<T, R>(
    fd: &AsyncFd<T>,
    interest: Interest,
    mut op: impl FnMut(&T) -> Result<R>,
) -> Result<R>
where
    T: std::os::fd::AsRawFd,
{
    loop {
        let mut guard = fd
            .ready(interest)
            .await
            .map_err(|e| Error::from_io("poll", e))?;
        match op(fd.get_ref()) {
            Err(Error::WouldBlock) => guard.clear_ready(),
            other => return other,
        }
    }
}

/// Async stream socket.
#[derive(Debug)]
pub struct AsyncAfStream {
    inner: AsyncFd<AfStream>,
}

impl AsyncAfStream {
    /// Wrap a connected stream.
    pub fn new(stream: AfStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: register(stream)?,
        })
    }

    /// Connect to `addr`.
    pub async fn connect(addr: &SocketAddress) -> Result<Self> {
        let handle = SocketHandle::new(addr.family(), SocketKind::Stream)?;
        handle.set_nonblocking(true)?;
        let status = handle.connect(addr, None)?;
        let inner = register(AfStream::from_handle(handle)?)?;
        if status == ConnectStatus::InProgress {
            drive(&inner, Interest::WRITABLE, |s| match s.handle().finish_connect()? {
                ConnectStatus::Connected => Ok(()),
                ConnectStatus::InProgress => Err(Error::WouldBlock),
            })
            .await?;
        }
        Ok(Self { inner })
    }

    /// A connected pair of Unix stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = AfStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &AfStream {
        self.inner.get_ref()
    }

    /// Unwrap into a (still non-blocking) stream.
    pub fn into_inner(self) -> AfStream {
        self.inner.into_inner()
    }

    /// The peer's address.
    pub fn peer_address(&self) -> Result<SocketAddress> {
        self.get_ref().peer_address()
    }
}

impl AsyncRead for AsyncAfStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match self.inner.get_ref().handle().recv(unfilled) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(Error::WouldBlock) => guard.clear_ready(),
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}

impl AsyncWrite for AsyncAfStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match self.inner.get_ref().handle().send(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(Error::WouldBlock) => guard.clear_ready(),
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown_output().map_err(Into::into))
    }
}

/// Async listener.
#[derive(Debug)]
pub struct AsyncAfListener<S: Accept = AfStream> {
    inner: AsyncFd<AfListener<S>>,
}

impl<S: Accept> AsyncAfListener<S> {
    /// Wrap a bound, listening listener.
    pub fn new(listener: AfListener<S>) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: register(listener)?,
        })
    }

    /// Bind and listen on `addr`.
    pub fn bind(addr: &SocketAddress) -> Result<Self> {
        Self::new(AfListener::bind(addr)?)
    }

    /// The wrapped listener.
    pub fn get_ref(&self) -> &AfListener<S> {
        self.inner.get_ref()
    }
}

impl AsyncAfListener<AfStream> {
    /// Accept one connection.
    pub async fn accept(&self) -> Result<(AsyncAfStream, SocketAddress)> {
        let (stream, peer) = drive(&self.inner, Interest::READABLE, |l| l.accept()).await?;
        Ok((AsyncAfStream::new(stream)?, peer))
    }
}

impl AsyncAfListener<AfDatagram> {
    /// Accept one sequential-packet connection.
    pub async fn accept(&self) -> Result<(AsyncAfDatagram, SocketAddress)> {
        let (sock, peer) = drive(&self.inner, Interest::READABLE, |l| l.accept()).await?;
        Ok((AsyncAfDatagram::new(sock)?, peer))
    }
}

/// Async datagram or sequential-packet socket.
#[derive(Debug)]
pub struct AsyncAfDatagram {
    inner: AsyncFd<AfDatagram>,
}

impl AsyncAfDatagram {
    /// Wrap a message socket.
    pub fn new(sock: AfDatagram) -> Result<Self> {
        sock.set_nonblocking(true)?;
        Ok(Self {
            inner: register(sock)?,
        })
    }

    /// Bind a datagram socket to `addr`.
    pub fn bind(addr: &SocketAddress) -> Result<Self> {
        Self::new(AfDatagram::bind(addr)?)
    }

    /// A connected pair of Unix message sockets.
    pub fn pair(kind: SocketKind) -> Result<(Self, Self)> {
        let (a, b) = AfDatagram::pair(kind)?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    /// The wrapped socket.
    pub fn get_ref(&self) -> &AfDatagram {
        self.inner.get_ref()
    }

    /// Send one message to the connected peer.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        drive(&self.inner, Interest::WRITABLE, |s| s.send(buf)).await
    }

    /// Send one message to `addr`.
    pub async fn send_to(&self, buf: &[u8], addr: &SocketAddress) -> Result<usize> {
        drive(&self.inner, Interest::WRITABLE, |s| s.send_to(buf, addr)).await
    }

    /// Receive one message.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Datagram> {
        drive(&self.inner, Interest::READABLE, |s| s.recv(buf)).await
    }

    /// Receive one message along with its sender.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<Datagram> {
        drive(&self.inner, Interest::READABLE, |s| s.recv_from(buf)).await
    }
}
