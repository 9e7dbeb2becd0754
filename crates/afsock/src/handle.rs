//! The socket handle: one native descriptor and its lifecycle.
//!
//! Descriptors are always kernel-non-blocking. Blocking mode is emulated by
//! parking in `poll(2)` on the socket together with a per-descriptor close
//! signal; [`SocketHandle::close`] raises that signal so any thread blocked
//! on the handle returns [`Error::Closed`] promptly. Where the kernel gives
//! no readiness to wait for (a full Unix listen queue), retries back off
//! exponentially up to the caller's deadline.
//!
//! The descriptor is reference counted between the handle and in-flight
//! operations. Closing detaches it from the handle immediately, but the
//! kernel descriptor is only released once the last operation using it has
//! returned, so its number is never recycled under a running system call.

use std::fmt;
use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::addr::{AddressFamily, NativeAddress, SocketAddress, SocketKind};
use crate::ancillary::{self, AncillaryMessage, ControlBuffer, PeerCredentials};
use crate::capability::{Capability, capabilities};
use crate::error::{Error, Result};
use crate::selector::SelectorShared;
use crate::sys::{self, Backoff, CloseSignal, WaitOutcome};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique socket identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a [`SocketHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketState {
    /// Freshly created.
    Created = 0,
    /// Bound to a local address.
    Bound = 1,
    /// Accepting connections.
    Listening = 2,
    /// Non-blocking connect in progress.
    Connecting = 3,
    /// Connected to a peer.
    Connected = 4,
    /// Closed; every operation fails.
    Closed = 5,
}

impl SocketState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Bound,
            2 => Self::Listening,
            3 => Self::Connecting,
            4 => Self::Connected,
            _ => Self::Closed,
        }
    }

    /// Get the state name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of [`SocketHandle::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// The connection is established.
    Connected,
    /// Non-blocking connect started; finish it with
    /// [`SocketHandle::finish_connect`] once the socket is connectable.
    InProgress,
}

/// Metadata of one receive into a caller-supplied buffer.
#[derive(Debug, Default)]
pub struct RecvInfo {
    /// Bytes written into the buffer.
    pub len: usize,
    /// The message was larger than the buffer; the excess was discarded.
    pub truncated: bool,
    /// Sender address, for connectionless receives.
    pub peer: Option<SocketAddress>,
    /// Control data received with the message.
    pub ancillary: AncillaryMessage,
}

/// An owned receive, see [`SocketHandle::receive`].
#[derive(Debug, Clone)]
pub struct Received {
    /// The payload.
    pub data: Bytes,
    /// The message was larger than the requested capacity.
    pub truncated: bool,
    /// Sender address, for connectionless receives.
    pub peer: Option<SocketAddress>,
}

/// Shared core of a socket: the descriptor plus its close signal.
pub(crate) struct Descriptor {
    pub(crate) id: SocketId,
    pub(crate) family: AddressFamily,
    pub(crate) kind: SocketKind,
    fd: OwnedFd,
    state: AtomicU8,
    closed: AtomicBool,
    signal: CloseSignal,
    selectors: Mutex<Vec<Weak<SelectorShared>>>,
}

impl Descriptor {
    fn new(
        fd: OwnedFd,
        family: AddressFamily,
        kind: SocketKind,
        state: SocketState,
    ) -> Result<Self> {
        Ok(Self {
            id: SocketId::next(),
            family,
            kind,
            fd,
            state: AtomicU8::new(state as u8),
            closed: AtomicBool::new(false),
            signal: CloseSignal::new().map_err(|e| Error::from_io("poller", e))?,
            selectors: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub(crate) fn state(&self) -> SocketState {
        if self.is_closed() {
            SocketState::Closed
        } else {
            SocketState::from_u8(self.state.load(Ordering::Acquire))
        }
    }

    fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn attach_selector(&self, selector: Weak<SelectorShared>) {
        let mut list = self.selectors.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|s| s.strong_count() > 0);
        if !list.iter().any(|s| s.ptr_eq(&selector)) {
            list.push(selector);
        }
    }

    pub(crate) fn detach_selector(&self, selector: &Weak<SelectorShared>) {
        let mut list = self.selectors.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|s| !s.ptr_eq(selector) && s.strong_count() > 0);
    }

    /// Mark closed, wake blocked threads and drop selector registrations.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(SocketState::Closed);
        self.signal.raise();
        let selectors = mem::take(&mut *self.selectors.lock().unwrap_or_else(PoisonError::into_inner));
        for selector in selectors.iter().filter_map(Weak::upgrade) {
            selector.cancel(self.id, self.fd());
        }
        true
    }

    /// Run `op` until it succeeds, parking on `events` while it would block.
    ///
    /// The deadline is checked before every wait. Readiness that does not
    /// include `events` (a hang-up on an unconnected socket) is not trusted
    /// again: later retries are paced by a backoff instead.
    fn drive<T>(
        &self,
        operation: &'static str,
        events: i16,
        blocking: bool,
        timeout: Option<Duration>,
        mut op: impl FnMut(RawFd) -> io::Result<T>,
    ) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff: Option<Backoff> = None;
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            match op(self.raw()) {
                Ok(value) => return Ok(value),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) if blocking && e.raw_os_error() == Some(libc::EAGAIN) => {
                    if sys::expired(deadline) {
                        return Err(Error::Timeout);
                    }
                    let outcome = match backoff.as_mut() {
                        Some(backoff) => sys::pause(&self.signal, backoff.until(deadline)),
                        None => sys::wait_fd(self.raw(), events, &self.signal, deadline),
                    }
                    .map_err(|e| Error::from_io(operation, e))?;
                    match outcome {
                        WaitOutcome::Ready(revents) if revents & events == 0 => {
                            tracing::trace!(id = %self.id, revents, "readiness without requested events");
                            backoff.get_or_insert_with(Backoff::new);
                        }
                        WaitOutcome::Ready(_) | WaitOutcome::TimedOut => {}
                        WaitOutcome::Woken => return Err(Error::Closed),
                    }
                }
                Err(e) => return Err(Error::from_io(operation, e)),
            }
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("fd", &self.raw())
            .field("family", &self.family)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Decode the sender of a received message. An undecodable name is logged
/// and reported as unknown rather than failing the receive.
fn sender_address(
    id: SocketId,
    family: AddressFamily,
    storage: &libc::sockaddr_storage,
    namelen: libc::socklen_t,
) -> Option<SocketAddress> {
    match NativeAddress::from_storage(family, storage, namelen).and_then(|n| n.decode()) {
        Ok(peer) => Some(peer),
        Err(e) => {
            tracing::debug!(%id, namelen, error = %e, "cannot decode sender address");
            None
        }
    }
}

/// A socket of any supported family and kind.
///
/// All methods take `&self`: one reader, one writer and a closer may use the
/// same handle from different threads.
pub struct SocketHandle {
    id: SocketId,
    family: AddressFamily,
    kind: SocketKind,
    slot: RwLock<Option<Arc<Descriptor>>>,
    nonblocking: AtomicBool,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

impl SocketHandle {
    /// Create a socket of `kind` for `family`.
    ///
    /// Fails with [`Error::UnsupportedKind`] when the running kernel lacks
    /// the pair.
    pub fn new(family: AddressFamily, kind: SocketKind) -> Result<Self> {
        capabilities().require_socket(family, kind)?;
        let fd = sys::new_socket(family.as_raw(), kind.as_raw())
            .map_err(|e| Error::from_io("socket", e))?;
        let handle = Self::from_descriptor(Descriptor::new(fd, family, kind, SocketState::Created)?);
        tracing::debug!(id = %handle.id, %family, %kind, "created socket");
        Ok(handle)
    }

    /// Create a connected pair of Unix sockets.
    pub fn pair(kind: SocketKind) -> Result<(Self, Self)> {
        let caps = capabilities();
        caps.require(Capability::NativeSocketpair)?;
        caps.require_socket(AddressFamily::Unix, kind)?;
        let (a, b) = sys::socketpair(kind.as_raw()).map_err(|e| Error::from_io("socketpair", e))?;
        let a = Self::from_descriptor(Descriptor::new(
            a,
            AddressFamily::Unix,
            kind,
            SocketState::Connected,
        )?);
        let b = Self::from_descriptor(Descriptor::new(
            b,
            AddressFamily::Unix,
            kind,
            SocketState::Connected,
        )?);
        tracing::debug!(a = %a.id, b = %b.id, %kind, "created socket pair");
        Ok((a, b))
    }

    fn from_descriptor(desc: Descriptor) -> Self {
        Self {
            id: desc.id,
            family: desc.family,
            kind: desc.kind,
            slot: RwLock::new(Some(Arc::new(desc))),
            nonblocking: AtomicBool::new(false),
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
        }
    }

    pub(crate) fn descriptor(&self) -> Result<Arc<Descriptor>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)
    }

    /// Process-unique id of this socket.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Address family.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Socket kind.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.descriptor()
            .map(|d| d.state())
            .unwrap_or(SocketState::Closed)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    fn expect_state(
        &self,
        desc: &Descriptor,
        operation: &'static str,
        allowed: &[SocketState],
    ) -> Result<()> {
        let state = desc.state();
        if state == SocketState::Closed {
            return Err(Error::Closed);
        }
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }

    fn check_family(&self, addr: &SocketAddress) -> Result<()> {
        if addr.family() != self.family {
            return Err(Error::InvalidAddress(format!(
                "{} address used on {} socket",
                addr.family(),
                self.family
            )));
        }
        if addr.is_abstract() {
            capabilities().require(Capability::AbstractNamespace)?;
        }
        Ok(())
    }

    /// Bind to a local address. Created → Bound.
    pub fn bind(&self, addr: &SocketAddress) -> Result<()> {
        let desc = self.descriptor()?;
        self.expect_state(&desc, "bind", &[SocketState::Created])?;
        self.check_family(addr)?;
        let native = addr.encode()?;
        // SAFETY: native holds native.socklen() valid address bytes.
        cvt(unsafe { libc::bind(desc.raw(), native.as_ptr(), native.socklen()) })
            .map_err(|e| Error::from_io("bind", e))?;
        desc.set_state(SocketState::Bound);
        tracing::debug!(id = %self.id, %addr, "bound socket");
        Ok(())
    }

    /// Start accepting connections. Bound → Listening.
    ///
    /// The backlog is clamped to at least 1.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        let desc = self.descriptor()?;
        if !self.kind.is_connection_oriented() {
            return Err(Error::InvalidState {
                operation: "listen",
                state: desc.state(),
            });
        }
        self.expect_state(&desc, "listen", &[SocketState::Bound])?;
        let backlog = backlog.clamp(1, libc::c_int::MAX as u32) as libc::c_int;
        // SAFETY: listen() has no memory-safety preconditions.
        cvt(unsafe { libc::listen(desc.raw(), backlog) })
            .map_err(|e| Error::from_io("listen", e))?;
        desc.set_state(SocketState::Listening);
        tracing::debug!(id = %self.id, backlog, "listening");
        Ok(())
    }

    /// Connect to `addr`.
    ///
    /// In blocking mode this waits up to `timeout` (or forever) and returns
    /// [`ConnectStatus::Connected`]. In non-blocking mode it may return
    /// [`ConnectStatus::InProgress`]; the socket is then `Connecting` until
    /// [`finish_connect`](Self::finish_connect) succeeds.
    pub fn connect(&self, addr: &SocketAddress, timeout: Option<Duration>) -> Result<ConnectStatus> {
        let desc = self.descriptor()?;
        let mut allowed = vec![SocketState::Created, SocketState::Bound];
        if self.kind == SocketKind::Datagram {
            allowed.push(SocketState::Connected);
        }
        self.expect_state(&desc, "connect", &allowed)?;
        self.check_family(addr)?;
        let native = addr.encode()?;
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut backoff = Backoff::new();

        loop {
            if desc.is_closed() {
                return Err(Error::Closed);
            }
            // SAFETY: native holds native.socklen() valid address bytes.
            let ret = unsafe { libc::connect(desc.raw(), native.as_ptr(), native.socklen()) };
            let errno = if ret == 0 {
                0
            } else {
                io::Error::last_os_error().raw_os_error().unwrap_or(0)
            };
            match errno {
                0 | libc::EISCONN => {
                    desc.set_state(SocketState::Connected);
                    tracing::debug!(id = %self.id, %addr, "connected");
                    return Ok(ConnectStatus::Connected);
                }
                libc::EINTR => continue,
                libc::EINPROGRESS | libc::EALREADY if self.is_nonblocking() => {
                    desc.set_state(SocketState::Connecting);
                    tracing::debug!(id = %self.id, %addr, "connect in progress");
                    return Ok(ConnectStatus::InProgress);
                }
                libc::EINPROGRESS | libc::EALREADY => {
                    desc.set_state(SocketState::Connecting);
                    return match self.wait_connect(&desc, deadline)? {
                        ConnectStatus::Connected => {
                            tracing::debug!(id = %self.id, %addr, "connected");
                            Ok(ConnectStatus::Connected)
                        }
                        ConnectStatus::InProgress => Err(Error::ConnectTimeout),
                    };
                }
                // A full Unix listen queue reports EAGAIN instead of
                // EINPROGRESS, and an unconnected socket polls as writable, so
                // there is no readiness to wait for: retry at a growing interval.
                libc::EAGAIN if !self.is_nonblocking() => {
                    if sys::expired(deadline) {
                        tracing::debug!(id = %self.id, %addr, "connect timed out on full backlog");
                        return Err(Error::ConnectTimeout);
                    }
                    match sys::pause(&desc.signal, backoff.until(deadline))
                        .map_err(|e| Error::from_io("connect", e))?
                    {
                        WaitOutcome::Woken => return Err(Error::Closed),
                        WaitOutcome::Ready(_) | WaitOutcome::TimedOut => continue,
                    }
                }
                libc::ETIMEDOUT => return Err(Error::ConnectTimeout),
                errno => return Err(Error::from_errno("connect", errno)),
            }
        }
    }

    fn wait_connect(&self, desc: &Descriptor, deadline: Option<Instant>) -> Result<ConnectStatus> {
        loop {
            match sys::wait_fd(desc.raw(), libc::POLLOUT, &desc.signal, deadline)
                .map_err(|e| Error::from_io("connect", e))?
            {
                WaitOutcome::Ready(_) => return self.connect_result(desc),
                WaitOutcome::Woken => return Err(Error::Closed),
                WaitOutcome::TimedOut => {
                    if deadline.is_some() {
                        return Ok(ConnectStatus::InProgress);
                    }
                }
            }
        }
    }

    fn connect_result(&self, desc: &Descriptor) -> Result<ConnectStatus> {
        let err: libc::c_int = sys::getsockopt(desc.raw(), libc::SOL_SOCKET, libc::SO_ERROR)
            .map_err(|e| Error::from_io("connect", e))?;
        match err {
            0 => {
                desc.set_state(SocketState::Connected);
                Ok(ConnectStatus::Connected)
            }
            errno => {
                desc.set_state(SocketState::Created);
                Err(match errno {
                    libc::ETIMEDOUT => Error::ConnectTimeout,
                    errno => Error::from_errno("connect", errno),
                })
            }
        }
    }

    /// Complete a non-blocking connect without waiting.
    ///
    /// Returns [`ConnectStatus::InProgress`] while the kernel is still
    /// connecting. A connected socket reports `Connected` again.
    pub fn finish_connect(&self) -> Result<ConnectStatus> {
        let desc = self.descriptor()?;
        match desc.state() {
            SocketState::Connected => return Ok(ConnectStatus::Connected),
            SocketState::Connecting => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "finish_connect",
                    state,
                });
            }
        }
        match sys::wait_fd(desc.raw(), libc::POLLOUT, &desc.signal, Some(Instant::now()))
            .map_err(|e| Error::from_io("connect", e))?
        {
            WaitOutcome::Ready(_) => {
                let status = self.connect_result(&desc)?;
                tracing::debug!(id = %self.id, "connect finished");
                Ok(status)
            }
            WaitOutcome::Woken => Err(Error::Closed),
            WaitOutcome::TimedOut => Ok(ConnectStatus::InProgress),
        }
    }

    /// Accept a pending connection. Listening only.
    ///
    /// The new handle is connected and in blocking mode.
    pub fn accept(&self) -> Result<(SocketHandle, SocketAddress)> {
        let desc = self.descriptor()?;
        self.expect_state(&desc, "accept", &[SocketState::Listening])?;
        let (fd, storage, len) = desc.drive(
            "accept",
            libc::POLLIN,
            !self.is_nonblocking(),
            self.read_timeout(),
            |fd| {
                // SAFETY: sockaddr_storage is plain data; all-zero is valid.
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                // SAFETY: storage and len are live and len is its size.
                let ret = unsafe {
                    libc::accept4(
                        fd,
                        (&mut storage as *mut libc::sockaddr_storage).cast(),
                        &mut len,
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                let ret = cvt(ret)?;
                // SAFETY: accept4 returned a new descriptor we own.
                Ok((unsafe { OwnedFd::from_raw_fd(ret) }, storage, len))
            },
        )?;
        let peer = NativeAddress::from_storage(self.family, &storage, len)?.decode()?;
        let handle = Self::from_descriptor(Descriptor::new(
            fd,
            self.family,
            self.kind,
            SocketState::Connected,
        )?);
        tracing::debug!(listener = %self.id, id = %handle.id, %peer, "accepted connection");
        Ok((handle, peer))
    }

    /// Send bytes on a connected socket.
    ///
    /// Stream sockets may send fewer bytes than given; message sockets send
    /// the whole buffer as one message.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let desc = self.descriptor()?;
        desc.drive(
            "send",
            libc::POLLOUT,
            !self.is_nonblocking(),
            self.write_timeout(),
            |fd| {
                // SAFETY: buf is a live slice of buf.len() bytes.
                cvt_size(unsafe {
                    libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
                })
            },
        )
    }

    /// Send one message to `addr` (connectionless sockets).
    pub fn send_to(&self, buf: &[u8], addr: &SocketAddress) -> Result<usize> {
        let desc = self.descriptor()?;
        self.check_family(addr)?;
        let native = addr.encode()?;
        desc.drive(
            "sendto",
            libc::POLLOUT,
            !self.is_nonblocking(),
            self.write_timeout(),
            |fd| {
                // SAFETY: buf and native are live for the call.
                cvt_size(unsafe {
                    libc::sendto(
                        fd,
                        buf.as_ptr().cast(),
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                        native.as_ptr(),
                        native.socklen(),
                    )
                })
            },
        )
    }

    /// Send bytes together with descriptors (`SCM_RIGHTS`).
    ///
    /// The descriptors stay owned by the caller; the receiver gets duplicates.
    pub fn send_with_fds(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> Result<usize> {
        let desc = self.descriptor()?;
        if self.family != AddressFamily::Unix {
            return Err(Error::Unsupported(Capability::FileDescriptors));
        }
        capabilities().require(Capability::FileDescriptors)?;
        let mut control = ControlBuffer::for_send(fds, None);
        desc.drive(
            "sendmsg",
            libc::POLLOUT,
            !self.is_nonblocking(),
            self.write_timeout(),
            |fd| {
                let mut iov = libc::iovec {
                    iov_base: buf.as_ptr().cast_mut().cast(),
                    iov_len: buf.len(),
                };
                // SAFETY: msghdr is plain data; all-zero is valid.
                let mut msg: libc::msghdr = unsafe { mem::zeroed() };
                msg.msg_iov = &mut iov;
                msg.msg_iovlen = 1;
                msg.msg_control = control.as_mut_ptr();
                msg.msg_controllen = control.len() as _;
                // SAFETY: msg points at live iovec and control buffers.
                cvt_size(unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) })
            },
        )
    }

    /// Receive into `buf`.
    ///
    /// For stream sockets `Ok(0)` means end of stream. For message sockets
    /// excess bytes of a larger message are discarded; use
    /// [`recv_from`](Self::recv_from) to observe truncation.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let desc = self.descriptor()?;
        desc.drive(
            "recv",
            libc::POLLIN,
            !self.is_nonblocking(),
            self.read_timeout(),
            |fd| {
                // SAFETY: buf is a live mutable slice of buf.len() bytes.
                cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) })
            },
        )
    }

    /// Receive one message with its sender and truncation flag.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<RecvInfo> {
        self.recv_msg(buf, None)
    }

    /// Receive one message plus control data, making room for up to
    /// `max_fds` passed descriptors.
    pub fn recv_with_ancillary(&self, buf: &mut [u8], max_fds: usize) -> Result<RecvInfo> {
        if self.family == AddressFamily::Unix {
            capabilities().require(Capability::AncillaryMessages)?;
        }
        self.recv_msg(buf, Some(max_fds))
    }

    fn recv_msg(&self, buf: &mut [u8], max_fds: Option<usize>) -> Result<RecvInfo> {
        let desc = self.descriptor()?;
        let mut control = match max_fds {
            Some(n) => ControlBuffer::with_capacity(ancillary::receive_space(n)),
            // TIPC reports rejected messages through control data even
            // when the caller asked for none.
            None if self.family == AddressFamily::Tipc => {
                ControlBuffer::with_capacity(ancillary::receive_space(0))
            }
            None => ControlBuffer::with_capacity(0),
        };
        // SAFETY: sockaddr_storage is plain data; all-zero is valid.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let (len, namelen, flags, controllen) = desc.drive(
            "recvmsg",
            libc::POLLIN,
            !self.is_nonblocking(),
            self.read_timeout(),
            |fd| {
                let mut iov = libc::iovec {
                    iov_base: buf.as_mut_ptr().cast(),
                    iov_len: buf.len(),
                };
                // SAFETY: msghdr is plain data; all-zero is valid.
                let mut msg: libc::msghdr = unsafe { mem::zeroed() };
                msg.msg_name = (&mut storage as *mut libc::sockaddr_storage).cast();
                msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                msg.msg_iov = &mut iov;
                msg.msg_iovlen = 1;
                msg.msg_control = control.as_mut_ptr();
                msg.msg_controllen = control.len() as _;
                // SAFETY: msg points at live name, iovec and control buffers.
                let n = cvt_size(unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) })?;
                Ok((n, msg.msg_namelen, msg.msg_flags, msg.msg_controllen as usize))
            },
        )?;

        let ancillary = control.parse(controllen, flags & libc::MSG_CTRUNC != 0);
        let peer = if self.kind == SocketKind::Stream || namelen == 0 {
            None
        } else {
            sender_address(self.id, self.family, &storage, namelen)
        };
        let truncated = flags & libc::MSG_TRUNC != 0;
        if truncated {
            tracing::trace!(id = %self.id, len, "message truncated");
        }
        Ok(RecvInfo {
            len,
            truncated,
            peer,
            ancillary,
        })
    }

    /// Receive into a freshly allocated buffer of `capacity` bytes.
    pub fn receive(&self, capacity: usize) -> Result<Received> {
        let mut buf = BytesMut::zeroed(capacity);
        let info = self.recv_msg(&mut buf, None)?;
        buf.truncate(info.len);
        Ok(Received {
            data: buf.freeze(),
            truncated: info.truncated,
            peer: info.peer,
        })
    }

    /// Size of the next pending message (message kinds) or of the bytes
    /// queued for reading (streams), without consuming anything.
    pub fn peek_len(&self) -> Result<usize> {
        let desc = self.descriptor()?;
        if self.kind == SocketKind::Stream {
            let mut pending: libc::c_int = 0;
            // SAFETY: FIONREAD writes one c_int.
            cvt(unsafe { libc::ioctl(desc.raw(), libc::FIONREAD, &mut pending as *mut libc::c_int) })
                .map_err(|e| Error::from_io("ioctl", e))?;
            return Ok(pending.max(0) as usize);
        }
        desc.drive(
            "recv",
            libc::POLLIN,
            !self.is_nonblocking(),
            self.read_timeout(),
            |fd| {
                // SAFETY: with a zero-length buffer recv writes nothing.
                cvt_size(unsafe {
                    libc::recv(fd, std::ptr::null_mut(), 0, libc::MSG_PEEK | libc::MSG_TRUNC)
                })
            },
        )
    }

    /// Shut down one or both directions.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let desc = self.descriptor()?;
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        // SAFETY: shutdown() has no memory-safety preconditions.
        cvt(unsafe { libc::shutdown(desc.raw(), how) })
            .map_err(|e| Error::from_io("shutdown", e))?;
        Ok(())
    }

    fn socket_name(&self, peer: bool) -> Result<SocketAddress> {
        let desc = self.descriptor()?;
        let op = if peer { "getpeername" } else { "getsockname" };
        let (storage, len) = sys::socket_name(desc.raw(), peer).map_err(|e| Error::from_io(op, e))?;
        NativeAddress::from_storage(self.family, &storage, len)?.decode()
    }

    /// The locally bound address.
    pub fn local_address(&self) -> Result<SocketAddress> {
        self.socket_name(false)
    }

    /// The connected peer's address.
    pub fn peer_address(&self) -> Result<SocketAddress> {
        self.socket_name(true)
    }

    /// Credentials of the connected peer process (`SO_PEERCRED`).
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        let desc = self.descriptor()?;
        if self.family != AddressFamily::Unix {
            return Err(Error::Unsupported(Capability::PeerCredentials));
        }
        capabilities().require(Capability::PeerCredentials)?;
        let cred: libc::ucred = sys::getsockopt(desc.raw(), libc::SOL_SOCKET, libc::SO_PEERCRED)
            .map_err(|e| Error::from_io("getsockopt", e))?;
        Ok(PeerCredentials::from_ucred(cred))
    }

    /// Switch between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.descriptor()?;
        self.nonblocking.store(nonblocking, Ordering::Release);
        Ok(())
    }

    /// Whether the handle is in non-blocking mode.
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    /// Bound blocking receives and accepts. `None` or zero waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.descriptor()?;
        *self.read_timeout.lock().unwrap_or_else(PoisonError::into_inner) =
            timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    /// Current read timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bound blocking sends. `None` or zero waits forever.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.descriptor()?;
        *self.write_timeout.lock().unwrap_or_else(PoisonError::into_inner) =
            timeout.filter(|t| !t.is_zero());
        Ok(())
    }

    /// Current write timeout.
    pub fn write_timeout(&self) -> Option<Duration> {
        *self.write_timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The raw descriptor, while open.
    pub fn raw_fd(&self) -> Result<RawFd> {
        Ok(self.descriptor()?.raw())
    }

    /// Close the socket.
    ///
    /// Idempotent. Threads blocked on this handle return [`Error::Closed`],
    /// selector registrations are cancelled, and the descriptor is released
    /// once no operation is using it anymore.
    pub fn close(&self) -> Result<()> {
        let desc = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(desc) = desc
            && desc.shut()
        {
            tracing::debug!(id = %self.id, in_flight = Arc::strong_count(&desc) - 1, "closed socket");
        }
        Ok(())
    }
}

impl AsRawFd for SocketHandle {
    /// Returns `-1` once the handle is closed.
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd().unwrap_or(-1)
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("nonblocking", &self.is_nonblocking())
            .finish()
    }
}
