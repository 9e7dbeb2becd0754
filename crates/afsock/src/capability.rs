//! Process-wide kernel capability probing.
//!
//! The first call to [`capabilities()`] probes the running kernel once and
//! caches the result for the life of the process. Concurrent first callers
//! block on the same initialisation and all observe the same set.
//!
//! Capabilities can be forced off with the `AFSOCK_DISABLE_CAPABILITIES`
//! environment variable (a comma-separated list of names), read at probe
//! time.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::addr::{AddressFamily, SocketKind};
use crate::ancillary::ControlBuffer;
use crate::error::{Error, Result};
use crate::sys;

/// Environment variable listing capabilities to disable.
pub const DISABLE_ENV: &str = "AFSOCK_DISABLE_CAPABILITIES";

/// An optional kernel feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Capability {
    /// AF_UNIX stream sockets.
    UnixDomain,
    /// AF_UNIX datagram sockets.
    UnixDatagrams,
    /// AF_UNIX sequential-packet sockets.
    UnixSeqpacket,
    /// Linux abstract namespace addresses.
    AbstractNamespace,
    /// `SO_PEERCRED`.
    PeerCredentials,
    /// Control messages on AF_UNIX sockets.
    AncillaryMessages,
    /// `SCM_RIGHTS` descriptor passing.
    FileDescriptors,
    /// `socketpair(2)`.
    NativeSocketpair,
    /// Zero-length datagram sends.
    ZeroLengthSend,
    /// AF_TIPC stream sockets.
    Tipc,
    /// AF_TIPC datagram sockets.
    TipcDatagrams,
    /// AF_TIPC sequential-packet sockets.
    TipcSeqpacket,
    /// AF_VSOCK stream sockets.
    Vsock,
    /// AF_VSOCK datagram sockets.
    VsockDatagrams,
    /// AF_VSOCK sequential-packet sockets.
    VsockSeqpacket,
}

impl Capability {
    /// Every capability, in probe order.
    pub const ALL: [Capability; 15] = [
        Self::UnixDomain,
        Self::UnixDatagrams,
        Self::UnixSeqpacket,
        Self::AbstractNamespace,
        Self::PeerCredentials,
        Self::AncillaryMessages,
        Self::FileDescriptors,
        Self::NativeSocketpair,
        Self::ZeroLengthSend,
        Self::Tipc,
        Self::TipcDatagrams,
        Self::TipcSeqpacket,
        Self::Vsock,
        Self::VsockDatagrams,
        Self::VsockSeqpacket,
    ];

    /// Get the capability name.
    pub fn name(self) -> &'static str {
        match self {
            Self::UnixDomain => "unix-domain",
            Self::UnixDatagrams => "unix-datagrams",
            Self::UnixSeqpacket => "unix-seqpacket",
            Self::AbstractNamespace => "abstract-namespace",
            Self::PeerCredentials => "peer-credentials",
            Self::AncillaryMessages => "ancillary-messages",
            Self::FileDescriptors => "file-descriptors",
            Self::NativeSocketpair => "native-socketpair",
            Self::ZeroLengthSend => "zero-length-send",
            Self::Tipc => "tipc",
            Self::TipcDatagrams => "tipc-datagrams",
            Self::TipcSeqpacket => "tipc-seqpacket",
            Self::Vsock => "vsock",
            Self::VsockDatagrams => "vsock-datagrams",
            Self::VsockSeqpacket => "vsock-seqpacket",
        }
    }

    /// The capability gating a `(family, kind)` socket.
    pub fn for_socket(family: AddressFamily, kind: SocketKind) -> Self {
        match (family, kind) {
            (AddressFamily::Unix, SocketKind::Stream) => Self::UnixDomain,
            (AddressFamily::Unix, SocketKind::Datagram) => Self::UnixDatagrams,
            (AddressFamily::Unix, SocketKind::SequentialPacket) => Self::UnixSeqpacket,
            (AddressFamily::Tipc, SocketKind::Stream) => Self::Tipc,
            (AddressFamily::Tipc, SocketKind::Datagram) => Self::TipcDatagrams,
            (AddressFamily::Tipc, SocketKind::SequentialPacket) => Self::TipcSeqpacket,
            (AddressFamily::Vsock, SocketKind::Stream) => Self::Vsock,
            (AddressFamily::Vsock, SocketKind::Datagram) => Self::VsockDatagrams,
            (AddressFamily::Vsock, SocketKind::SequentialPacket) => Self::VsockSeqpacket,
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.name() == s)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

/// An immutable set of available capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    bits: u32,
}

impl CapabilitySet {
    /// A set with nothing available.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Add a capability.
    pub fn with(mut self, cap: Capability) -> Self {
        self.bits |= cap.bit();
        self
    }

    /// Remove a capability.
    pub fn without(mut self, cap: Capability) -> Self {
        self.bits &= !cap.bit();
        self
    }

    /// Check if a capability is available.
    pub fn has(&self, cap: Capability) -> bool {
        self.bits & cap.bit() != 0
    }

    /// Check if `(family, kind)` sockets can be created.
    pub fn supports(&self, family: AddressFamily, kind: SocketKind) -> bool {
        self.has(Capability::for_socket(family, kind))
    }

    /// Fail with [`Error::Unsupported`] unless `cap` is available.
    pub fn require(&self, cap: Capability) -> Result<()> {
        if self.has(cap) {
            Ok(())
        } else {
            Err(Error::Unsupported(cap))
        }
    }

    /// Fail with [`Error::UnsupportedKind`] unless `(family, kind)` is available.
    pub fn require_socket(&self, family: AddressFamily, kind: SocketKind) -> Result<()> {
        if self.supports(family, kind) {
            Ok(())
        } else {
            Err(Error::UnsupportedKind { family, kind })
        }
    }

    /// Iterate over available capabilities.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.has(*cap))
    }

    /// The capabilities of the running kernel.
    ///
    /// The first call in the process probes (and applies the
    /// `AFSOCK_DISABLE_CAPABILITIES` list); every later call, from any
    /// thread, returns that same set. Never fails: a failed probe means
    /// absent.
    pub fn probe() -> Self {
        *capabilities()
    }

    fn probe_kernel() -> Self {
        PROBE_RUNS.fetch_add(1, Ordering::SeqCst);
        let mut set = Self::empty();
        for cap in Capability::ALL {
            if probe_one(cap) {
                set = set.with(cap);
            }
        }
        tracing::debug!(capabilities = %set, "probed kernel capabilities");
        set
    }

    /// Apply a comma-separated disable list.
    pub fn disable_from_list(mut self, list: &str) -> Self {
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name.parse::<Capability>() {
                Ok(cap) => {
                    tracing::debug!(capability = %cap, "capability disabled by configuration");
                    self = self.without(cap);
                }
                Err(e) => tracing::warn!("{DISABLE_ENV}: {e}"),
            }
        }
        self
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(cap.name())?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(Capability::ALL.len()))?;
        for cap in Capability::ALL {
            map.serialize_entry(cap.name(), &self.has(cap))?;
        }
        map.end()
    }
}

static CAPABILITIES: OnceLock<CapabilitySet> = OnceLock::new();
static PROBE_RUNS: AtomicUsize = AtomicUsize::new(0);

/// The process-wide capability set, probed on first use.
pub fn capabilities() -> &'static CapabilitySet {
    CAPABILITIES.get_or_init(|| {
        let set = CapabilitySet::probe_kernel();
        match std::env::var(DISABLE_ENV) {
            Ok(list) => set.disable_from_list(&list),
            Err(_) => set,
        }
    })
}

/// Number of times the kernel probe has run in this process.
pub fn probe_count() -> usize {
    PROBE_RUNS.load(Ordering::SeqCst)
}

fn can_create(family: AddressFamily, kind: SocketKind) -> bool {
    sys::new_socket(family.as_raw(), kind.as_raw()).is_ok()
}

fn probe_one(cap: Capability) -> bool {
    match cap {
        Capability::UnixDomain => can_create(AddressFamily::Unix, SocketKind::Stream),
        Capability::UnixDatagrams => can_create(AddressFamily::Unix, SocketKind::Datagram),
        Capability::UnixSeqpacket => {
            can_create(AddressFamily::Unix, SocketKind::SequentialPacket)
        }
        Capability::Tipc => can_create(AddressFamily::Tipc, SocketKind::Stream),
        Capability::TipcDatagrams => can_create(AddressFamily::Tipc, SocketKind::Datagram),
        Capability::TipcSeqpacket => can_create(AddressFamily::Tipc, SocketKind::SequentialPacket),
        Capability::Vsock => can_create(AddressFamily::Vsock, SocketKind::Stream),
        Capability::VsockDatagrams => can_create(AddressFamily::Vsock, SocketKind::Datagram),
        Capability::VsockSeqpacket => {
            can_create(AddressFamily::Vsock, SocketKind::SequentialPacket)
        }
        Capability::NativeSocketpair => sys::socketpair(libc::SOCK_STREAM).is_ok(),
        Capability::AbstractNamespace => probe_abstract().unwrap_or(false),
        Capability::PeerCredentials => probe_peer_credentials().unwrap_or(false),
        Capability::AncillaryMessages => probe_send_control(false).unwrap_or(false),
        Capability::FileDescriptors => probe_send_control(true).unwrap_or(false),
        Capability::ZeroLengthSend => probe_zero_length().unwrap_or(false),
    }
}

// Autobind: binding with only the family header makes the kernel pick an
// abstract name, which comes back with a leading NUL.
fn probe_abstract() -> std::io::Result<bool> {
    let fd = sys::new_socket(libc::AF_UNIX, libc::SOCK_DGRAM)?;
    let family = libc::AF_UNIX as libc::sa_family_t;
    // SAFETY: we pass a pointer to a live sa_family_t with its exact size.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&family as *const libc::sa_family_t).cast(),
            std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Ok(false);
    }
    let (storage, len) = sys::socket_name(fd.as_raw_fd(), false)?;
    let native =
        crate::addr::NativeAddress::from_storage(AddressFamily::Unix, &storage, len).ok();
    Ok(native.and_then(|n| n.decode().ok()).is_some_and(|a| a.is_abstract()))
}

fn probe_peer_credentials() -> std::io::Result<bool> {
    let (a, _b) = sys::socketpair(libc::SOCK_STREAM)?;
    let cred: libc::ucred = sys::getsockopt(a.as_raw_fd(), libc::SOL_SOCKET, libc::SO_PEERCRED)?;
    Ok(cred.pid > 0)
}

fn send_probe(fd: &OwnedFd, control: &mut ControlBuffer) -> bool {
    let byte = 0u8;
    let mut iov = libc::iovec {
        iov_base: (&byte as *const u8).cast_mut().cast(),
        iov_len: 1,
    };
    // SAFETY: msghdr is plain data; all-zero is valid.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr();
    msg.msg_controllen = control.len() as _;
    // SAFETY: msg points at live iovec and control buffers for the call.
    unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) == 1 }
}

fn probe_send_control(with_fd: bool) -> std::io::Result<bool> {
    let (a, b) = sys::socketpair(libc::SOCK_STREAM)?;
    let mut control = if with_fd {
        ControlBuffer::for_send(&[b.as_fd()], None)
    } else {
        ControlBuffer::for_send(&[], Some(crate::ancillary::PeerCredentials::current()))
    };
    Ok(send_probe(&a, &mut control))
}

fn probe_zero_length() -> std::io::Result<bool> {
    let (a, _b) = sys::socketpair(libc::SOCK_DGRAM)?;
    // SAFETY: a zero-length send never reads the buffer.
    let sent = unsafe { libc::send(a.as_raw_fd(), std::ptr::null(), 0, libc::MSG_NOSIGNAL) };
    Ok(sent == 0)
}
