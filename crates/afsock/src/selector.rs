//! Readiness multiplexing over many socket handles.
//!
//! A [`Selector`] wraps a level-triggered `polling::Poller` (epoll on
//! Linux). Handles register with an [`Interest`]; [`Selector::select`] waits
//! and yields `(SocketId, Ready)` pairs lazily.
//!
//! The poller is only armed for the events an interest can match in the
//! handle's current state. Interest is re-armed at the start of every
//! cycle, so a handle that moves from connecting to connected (or from bound
//! to listening) never wakes the selector with nothing to report.
//!
//! Registration and deregistration may happen from any thread, including
//! while another thread is parked in `select`; the change is effective for
//! the next wait cycle at the latest. Closing a handle removes it from every
//! selector it was registered with.
//!
//! # Example
//!
//! ```ignore
//! use afsock::{Interest, Selector};
//!
//! let selector = Selector::new()?;
//! selector.register(&listener, Interest::ACCEPTABLE)?;
//! for (id, ready) in selector.select(None)? {
//!     if ready.is_acceptable() {
//!         let (conn, peer) = listener.accept()?;
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};

use crate::error::{Error, Result};
use crate::handle::{Descriptor, SocketHandle, SocketId, SocketState};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Readiness a caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// Data can be received.
    pub const READABLE: Interest = Interest(0b0001);
    /// Data can be sent.
    pub const WRITABLE: Interest = Interest(0b0010);
    /// A connection is pending on a listening socket.
    pub const ACCEPTABLE: Interest = Interest(0b0100);
    /// A non-blocking connect has completed (or failed).
    pub const CONNECTABLE: Interest = Interest(0b1000);

    /// No interest.
    pub const fn empty() -> Self {
        Interest(0)
    }

    /// Check if every flag of `other` is set.
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any flag of `other` is set.
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    /// Check if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Removes interest.
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }

    /// The flag a readable descriptor satisfies in `state`.
    fn read_flag(state: SocketState) -> Interest {
        if state == SocketState::Listening {
            Self::ACCEPTABLE
        } else {
            Self::READABLE
        }
    }

    /// The flag a writable descriptor satisfies in `state`.
    fn write_flag(state: SocketState) -> Interest {
        match state {
            SocketState::Connecting => Self::CONNECTABLE,
            SocketState::Listening => Self::empty(),
            _ => Self::WRITABLE,
        }
    }

    /// `(readable, writable)` to arm the poller with in `state`.
    fn armed(self, state: SocketState) -> (bool, bool) {
        let write = Self::write_flag(state);
        (
            self.intersects(Self::read_flag(state)),
            !write.is_empty() && self.intersects(write),
        )
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Readiness reported by [`Selector::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ready(u8);

impl Ready {
    /// See [`Interest::READABLE`].
    pub const READABLE: Ready = Ready(Interest::READABLE.0);
    /// See [`Interest::WRITABLE`].
    pub const WRITABLE: Ready = Ready(Interest::WRITABLE.0);
    /// See [`Interest::ACCEPTABLE`].
    pub const ACCEPTABLE: Ready = Ready(Interest::ACCEPTABLE.0);
    /// See [`Interest::CONNECTABLE`].
    pub const CONNECTABLE: Ready = Ready(Interest::CONNECTABLE.0);
    /// Peer hang-up or an error condition on the descriptor.
    pub const CLOSED: Ready = Ready(0b1_0000);

    /// Check if every flag of `other` is set.
    pub const fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Data can be received.
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    /// Data can be sent.
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// A connection is pending.
    pub const fn is_acceptable(self) -> bool {
        self.contains(Self::ACCEPTABLE)
    }

    /// A connect has finished.
    pub const fn is_connectable(self) -> bool {
        self.contains(Self::CONNECTABLE)
    }

    /// Hang-up or error.
    pub const fn is_closed(self) -> bool {
        self.contains(Self::CLOSED)
    }

    fn from_event(event: &Event, interest: Interest, state: SocketState) -> Self {
        let mut ready = 0;
        if event.readable {
            ready |= interest.0 & Interest::read_flag(state).0;
        }
        if event.writable {
            ready |= interest.0 & Interest::write_flag(state).0;
        }
        if event.is_interrupt() || event.is_err() == Some(true) {
            ready |= Self::CLOSED.0;
        }
        Ready(ready)
    }
}

impl BitOr for Ready {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Ready(self.0 | rhs.0)
    }
}

impl fmt::Display for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "readable"),
            (Self::WRITABLE, "writable"),
            (Self::ACCEPTABLE, "acceptable"),
            (Self::CONNECTABLE, "connectable"),
            (Self::CLOSED, "closed"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

struct Registration {
    desc: Arc<Descriptor>,
    interest: Interest,
    armed: (bool, bool),
}

fn poll_event(id: SocketId, (readable, writable): (bool, bool)) -> Event {
    Event::new(id.as_u64() as usize, readable, writable)
}

/// State shared between a selector and the descriptors registered with it.
pub(crate) struct SelectorShared {
    poller: Poller,
    closed: AtomicBool,
    registry: Mutex<HashMap<SocketId, Registration>>,
}

impl SelectorShared {
    fn registry(&self) -> MutexGuard<'_, HashMap<SocketId, Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a registration. Called on deregister and when a handle closes.
    pub(crate) fn cancel(&self, id: SocketId, fd: BorrowedFd<'_>) {
        if self.registry().remove(&id).is_some() {
            // The descriptor is still open here: the caller holds it.
            let _ = self.poller.delete(fd);
            tracing::trace!(%id, "selector registration cancelled");
        }
    }

    /// Re-arm every registration whose state changed since the last cycle.
    fn rearm(&self) -> Result<()> {
        let mut registry = self.registry();
        for (id, registration) in registry.iter_mut() {
            let armed = registration.interest.armed(registration.desc.state());
            if armed != registration.armed {
                self.poller
                    .modify_with_mode(registration.desc.fd(), poll_event(*id, armed), PollMode::Level)
                    .map_err(|e| Error::from_io("epoll_ctl", e))?;
                registration.armed = armed;
                tracing::trace!(%id, ?armed, "selector interest re-armed");
            }
        }
        Ok(())
    }
}

/// Readiness multiplexer over socket handles.
pub struct Selector {
    shared: Arc<SelectorShared>,
    events: Mutex<Events>,
}

impl Selector {
    /// Create a selector.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a selector returning at most `capacity` events per cycle.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let poller = Poller::new().map_err(|e| Error::from_io("epoll_create", e))?;
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            shared: Arc::new(SelectorShared {
                poller,
                closed: AtomicBool::new(false),
                registry: Mutex::new(HashMap::new()),
            }),
            events: Mutex::new(Events::with_capacity(capacity)),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::SelectorClosed)
        } else {
            Ok(())
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Register `handle`, or replace its interest set if already registered.
    ///
    /// `ACCEPTABLE` requires a listening handle and `CONNECTABLE` a
    /// connecting one. A listening handle only accepts `ACCEPTABLE`.
    pub fn register(&self, handle: &SocketHandle, interest: Interest) -> Result<()> {
        self.check_open()?;
        let desc = handle.descriptor()?;
        let state = desc.state();
        let listening = state == SocketState::Listening;
        if (interest.contains(Interest::ACCEPTABLE) && !listening)
            || (interest.contains(Interest::CONNECTABLE) && state != SocketState::Connecting)
            || (listening && interest.intersects(Interest::READABLE | Interest::WRITABLE))
        {
            return Err(Error::InvalidState {
                operation: "register",
                state,
            });
        }

        desc.attach_selector(Arc::downgrade(&self.shared));
        {
            let mut registry = self.shared.registry();
            let armed = interest.armed(state);
            let event = poll_event(desc.id, armed);
            match registry.get_mut(&desc.id) {
                Some(existing) => {
                    self.shared
                        .poller
                        .modify_with_mode(desc.fd(), event, PollMode::Level)
                        .map_err(|e| Error::from_io("epoll_ctl", e))?;
                    existing.interest = interest;
                    existing.armed = armed;
                }
                None => {
                    // SAFETY: the registration keeps the descriptor alive, and
                    // it is deleted from the poller before the descriptor
                    // closes (deregister, selector close or handle close).
                    unsafe {
                        self.shared
                            .poller
                            .add_with_mode(desc.raw(), event, PollMode::Level)
                    }
                    .map_err(|e| Error::from_io("epoll_ctl", e))?;
                    registry.insert(
                        desc.id,
                        Registration {
                            desc: Arc::clone(&desc),
                            interest,
                            armed,
                        },
                    );
                }
            }
        }

        // A close racing with this call may have run before the insert.
        if desc.is_closed() {
            self.shared.cancel(desc.id, desc.fd());
            return Err(Error::Closed);
        }
        tracing::trace!(id = %desc.id, ?interest, "registered with selector");
        Ok(())
    }

    /// Remove `handle`. Deregistering an unknown or closed handle is a no-op.
    pub fn deregister(&self, handle: &SocketHandle) -> Result<()> {
        self.check_open()?;
        let removed = self.shared.registry().remove(&handle.id());
        if let Some(registration) = removed {
            let desc = registration.desc;
            let _ = self.shared.poller.delete(desc.fd());
            desc.detach_selector(&Arc::downgrade(&self.shared));
            tracing::trace!(id = %desc.id, "deregistered from selector");
        }
        Ok(())
    }

    /// Whether `handle` is currently registered.
    pub fn is_registered(&self, handle: &SocketHandle) -> bool {
        self.shared.registry().contains_key(&handle.id())
    }

    /// The interest `handle` is registered with.
    pub fn interest(&self, handle: &SocketHandle) -> Option<Interest> {
        self.shared.registry().get(&handle.id()).map(|r| r.interest)
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.shared.registry().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for readiness.
    ///
    /// Returns when at least one registered handle is ready, on
    /// [`wakeup`](Self::wakeup), or after `timeout` (possibly with no keys).
    /// Only one thread selects at a time; a second caller waits for the first
    /// to drop its [`SelectedKeys`].
    pub fn select(&self, timeout: Option<Duration>) -> Result<SelectedKeys<'_>> {
        self.check_open()?;
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.clear();
        self.shared.rearm()?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let count = self
            .shared
            .poller
            .wait(&mut events, remaining)
            .map_err(|e| Error::from_io("epoll_wait", e))?;

        let keys: Vec<Event> = if self.is_closed() {
            Vec::new()
        } else {
            events.iter().collect()
        };
        tracing::trace!(count, "selector cycle");

        Ok(SelectedKeys {
            _cycle: events,
            keys: keys.into_iter(),
            shared: &self.shared,
        })
    }

    /// Make a blocked or the next [`select`](Self::select) return immediately.
    pub fn wakeup(&self) -> Result<()> {
        self.check_open()?;
        self.shared
            .poller
            .notify()
            .map_err(|e| Error::from_io("notify", e))
    }

    /// Close the selector. Idempotent.
    ///
    /// Registrations are dropped and a concurrent `select` returns with no
    /// keys.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.shared.poller.notify() {
            tracing::warn!(error = %e, "cannot interrupt select on close");
        }
        let registrations: Vec<Registration> =
            self.shared.registry().drain().map(|(_, r)| r).collect();
        let weak = Arc::downgrade(&self.shared);
        for registration in &registrations {
            let _ = self.shared.poller.delete(registration.desc.fd());
            registration.desc.detach_selector(&weak);
        }
        tracing::debug!(dropped = registrations.len(), "selector closed");
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("poller", &self.shared.poller.as_raw_fd())
            .field("registered", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Keys ready after one [`Selector::select`] cycle.
///
/// Readiness is translated lazily; a handle deregistered or closed after
/// the wait returned is skipped.
pub struct SelectedKeys<'a> {
    // Held so one consumer at a time owns the cycle.
    _cycle: MutexGuard<'a, Events>,
    keys: std::vec::IntoIter<Event>,
    shared: &'a SelectorShared,
}

impl Iterator for SelectedKeys<'_> {
    type Item = (SocketId, Ready);

    fn next(&mut self) -> Option<Self::Item> {
        for event in self.keys.by_ref() {
            let id = SocketId::from_u64(event.key as u64);
            let ready = {
                let registry = self.shared.registry();
                match registry.get(&id) {
                    Some(r) => Ready::from_event(&event, r.interest, r.desc.state()),
                    None => continue,
                }
            };
            if !ready.is_empty() {
                return Some((id, ready));
            }
        }
        None
    }
}

impl fmt::Debug for SelectedKeys<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedKeys")
            .field("remaining", &self.keys.len())
            .finish()
    }
}
