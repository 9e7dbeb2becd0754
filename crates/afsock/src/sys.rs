//! Thin libc wrappers shared by the handle, selector and capability probe.
//!
//! Everything here returns `io::Result` so callers decide how to classify
//! the errno (option calls map `ENOPROTOOPT` differently from I/O calls).

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use polling::Poller;

/// Create a close-on-exec, kernel-non-blocking socket.
pub(crate) fn new_socket(family: libc::c_int, kind: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: socket() has no memory-safety preconditions.
    let fd = unsafe {
        libc::socket(
            family,
            kind | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a connected pair of AF_UNIX sockets.
pub(crate) fn socketpair(kind: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds has room for the two descriptors socketpair writes.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            kind | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Wake-up source for threads parked on one descriptor.
///
/// Backed by a `polling::Poller` that is never waited on: once notified, its
/// descriptor stays readable, so every current and later `poll(2)` that
/// includes it returns at once.
pub(crate) struct CloseSignal {
    poller: Poller,
}

impl CloseSignal {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
        })
    }

    /// Fire the signal. Firing twice is harmless.
    pub(crate) fn raise(&self) {
        if let Err(e) = self.poller.notify() {
            tracing::warn!(error = %e, "cannot raise close signal");
        }
    }
}

impl AsRawFd for CloseSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }
}

impl fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseSignal")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

/// Result of [`wait_fd`] and [`pause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The socket reported these `revents`.
    Ready(i16),
    /// The close signal fired.
    Woken,
    /// The deadline passed.
    TimedOut,
}

pub(crate) fn poll_timeout(deadline: Option<Instant>) -> libc::c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Round up so a sub-millisecond remainder does not spin.
            let ms = remaining.as_micros().div_ceil(1000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Park until `fd` reports `events`, the signal fires, or `deadline` passes.
///
/// A negative `fd` waits on the signal alone. `EINTR` restarts the wait with
/// the remaining time.
pub(crate) fn wait_fd(
    fd: RawFd,
    events: i16,
    signal: &CloseSignal,
    deadline: Option<Instant>,
) -> io::Result<WaitOutcome> {
    loop {
        let mut fds = [
            libc::pollfd {
                fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: signal.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout = poll_timeout(deadline);
        // SAFETY: fds is a live array of two pollfd structs.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if fds[1].revents != 0 {
            tracing::trace!(fd, "wait interrupted by close signal");
            return Ok(WaitOutcome::Woken);
        }
        if fds[0].revents != 0 {
            return Ok(WaitOutcome::Ready(fds[0].revents));
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Ok(WaitOutcome::TimedOut);
        }
    }
}

/// Sleep until `until` unless the signal fires first.
pub(crate) fn pause(signal: &CloseSignal, until: Instant) -> io::Result<WaitOutcome> {
    wait_fd(-1, 0, signal, Some(until))
}

const BACKOFF_START: Duration = Duration::from_millis(1);
const BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Retry pacing for conditions the kernel cannot signal readiness for,
/// such as a full Unix listen queue.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            next: BACKOFF_START,
        }
    }

    /// End of the next pause, never past `deadline`.
    pub(crate) fn until(&mut self, deadline: Option<Instant>) -> Instant {
        let until = Instant::now() + self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        deadline.map_or(until, |deadline| deadline.min(until))
    }
}

/// Whether `deadline` has passed.
pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Set a socket option from a plain-data value.
pub(crate) fn setsockopt<T: Copy>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
) -> io::Result<()> {
    // SAFETY: value points to size_of::<T>() readable bytes.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read a socket option into a plain-data value.
///
/// `T` must be valid for any bit pattern (integers, `linger`, `timeval`,
/// `ucred`).
pub(crate) fn getsockopt<T: Copy>(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<T> {
    // SAFETY: every T used with this helper is a C plain-data struct or
    // integer for which all-zero is a valid value.
    let mut value: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    // SAFETY: value and len are live and len matches the size of value.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            (&mut value as *mut T).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

/// Fetch `getsockname`/`getpeername` into a `sockaddr_storage`.
pub(crate) fn socket_name(
    fd: RawFd,
    peer: bool,
) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    // SAFETY: sockaddr_storage is plain data; all-zero is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ptr = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>();
    // SAFETY: storage is large enough for any address and len says so.
    let ret = unsafe {
        if peer {
            libc::getpeername(fd, ptr, &mut len)
        } else {
            libc::getsockname(fd, ptr, &mut len)
        }
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((storage, len))
}
