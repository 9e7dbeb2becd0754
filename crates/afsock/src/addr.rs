//! Logical socket addresses and their native `sockaddr` encodings.
//!
//! A [`SocketAddress`] is what callers build: a filesystem path, an abstract
//! name, a TIPC service/socket tuple or a vsock `(cid, port)` pair. A
//! [`NativeAddress`] is the exact byte layout the kernel expects for the
//! address family, ready to hand to `bind(2)`/`connect(2)`.
//!
//! # Example
//!
//! ```ignore
//! use afsock::{SocketAddress, AddressFamily};
//!
//! let addr: SocketAddress = "tipc:18888:17".parse()?;
//! let native = addr.encode()?;
//! assert_eq!(SocketAddress::decode(native.as_bytes(), AddressFamily::Tipc)?, addr);
//! ```

use std::ffi::OsStr;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::parse::parse_family_header;

/// Size of `sockaddr_un::sun_path`.
pub const SUN_PATH_LEN: usize = 108;

/// Longest filesystem path that fits, leaving room for the terminator.
pub const MAX_PATH_LEN: usize = SUN_PATH_LEN - 1;

/// Longest abstract name (the leading NUL takes one byte of `sun_path`).
pub const MAX_ABSTRACT_LEN: usize = SUN_PATH_LEN - 1;

/// Capacity of a [`NativeAddress`] (`sizeof(struct sockaddr_storage)`).
pub const NATIVE_ADDR_CAPACITY: usize = std::mem::size_of::<libc::sockaddr_storage>();

const SA_FAMILY_LEN: usize = std::mem::size_of::<libc::sa_family_t>();

// TIPC address types (linux/tipc.h)
const TIPC_SERVICE_RANGE: u8 = 1;
const TIPC_SERVICE_ADDR: u8 = 2;
const TIPC_SOCKET_ADDR: u8 = 3;

/// Address families handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    /// Unix domain sockets (paths, abstract names).
    Unix,
    /// TIPC cluster sockets.
    Tipc,
    /// Hypervisor/VM sockets.
    Vsock,
}

impl AddressFamily {
    /// All families, in probe order.
    pub const ALL: [AddressFamily; 3] = [Self::Unix, Self::Tipc, Self::Vsock];

    /// The kernel `AF_*` constant.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Self::Unix => libc::AF_UNIX,
            Self::Tipc => libc::AF_TIPC,
            Self::Vsock => libc::AF_VSOCK,
        }
    }

    /// Map a kernel `AF_*` constant back to a family.
    pub fn from_raw(raw: libc::c_int) -> Option<Self> {
        match raw {
            libc::AF_UNIX => Some(Self::Unix),
            libc::AF_TIPC => Some(Self::Tipc),
            libc::AF_VSOCK => Some(Self::Vsock),
            _ => None,
        }
    }

    /// Get the family name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unix => "AF_UNIX",
            Self::Tipc => "AF_TIPC",
            Self::Vsock => "AF_VSOCK",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Socket semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketKind {
    /// Continuous, ordered byte stream.
    Stream,
    /// Connectionless, boundary-preserving messages.
    Datagram,
    /// Connection-oriented, ordered, boundary-preserving messages.
    SequentialPacket,
}

impl SocketKind {
    /// The kernel `SOCK_*` constant.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Datagram => libc::SOCK_DGRAM,
            Self::SequentialPacket => libc::SOCK_SEQPACKET,
        }
    }

    /// Get the kind name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Datagram => "datagram",
            Self::SequentialPacket => "seqpacket",
        }
    }

    /// Whether each send is received as one unit.
    pub fn preserves_boundaries(self) -> bool {
        !matches!(self, Self::Stream)
    }

    /// Whether the kind supports listen/accept.
    pub fn is_connection_oriented(self) -> bool {
        !matches!(self, Self::Datagram)
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SocketKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stream" => Ok(Self::Stream),
            "datagram" | "dgram" => Ok(Self::Datagram),
            "seqpacket" | "seq" => Ok(Self::SequentialPacket),
            other => Err(Error::InvalidAddress(format!("unknown socket kind '{other}'"))),
        }
    }
}

/// Lookup scope of a TIPC service address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TipcScope {
    /// Legacy zone scope.
    Zone,
    /// Whole cluster.
    Cluster,
    /// Local node only.
    Node,
}

impl TipcScope {
    fn as_raw(self) -> i8 {
        match self {
            Self::Zone => 1,
            Self::Cluster => 2,
            Self::Node => 3,
        }
    }

    fn from_raw(raw: i8) -> Option<Self> {
        match raw {
            1 => Some(Self::Zone),
            2 => Some(Self::Cluster),
            3 => Some(Self::Node),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Cluster => "cluster",
            Self::Node => "node",
        }
    }
}

/// A TIPC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TipcAddress {
    /// A single service instance: `{type, instance}`.
    Service {
        /// Service type.
        service_type: u32,
        /// Service instance.
        instance: u32,
        /// Lookup scope.
        scope: TipcScope,
    },
    /// A range of service instances, used for binding and multicast.
    ServiceRange {
        /// Service type.
        service_type: u32,
        /// Lowest instance.
        lower: u32,
        /// Highest instance.
        upper: u32,
        /// Lookup scope.
        scope: TipcScope,
    },
    /// A specific socket: `{port reference, node}`.
    Socket {
        /// Port reference.
        port_ref: u32,
        /// Node hash/address.
        node: u32,
    },
}

impl TipcAddress {
    /// A cluster-scoped service address.
    pub fn service(service_type: u32, instance: u32) -> Self {
        Self::Service {
            service_type,
            instance,
            scope: TipcScope::Cluster,
        }
    }

    /// A cluster-scoped service range.
    pub fn service_range(service_type: u32, lower: u32, upper: u32) -> Self {
        Self::ServiceRange {
            service_type,
            lower,
            upper,
            scope: TipcScope::Cluster,
        }
    }
}

/// `struct sockaddr_tipc`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SockaddrTipc {
    family: u16,
    addr_type: u8,
    scope: i8,
    addr: [u32; 3],
}

/// A vsock address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockAddress {
    /// Context ID.
    pub cid: u32,
    /// Port.
    pub port: u32,
}

impl VsockAddress {
    /// Bind to any CID.
    pub const CID_ANY: u32 = u32::MAX;
    /// The hypervisor.
    pub const CID_HYPERVISOR: u32 = 0;
    /// Local loopback.
    pub const CID_LOCAL: u32 = 1;
    /// The host.
    pub const CID_HOST: u32 = 2;
    /// Let the kernel pick a port.
    pub const PORT_ANY: u32 = u32::MAX;

    /// Create a vsock address.
    pub fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }
}

/// `struct sockaddr_vm`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SockaddrVm {
    family: u16,
    reserved1: u16,
    port: u32,
    cid: u32,
    flags: u8,
    zero: [u8; 3],
}

/// A logical socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    /// Filesystem path (AF_UNIX).
    Path(PathBuf),
    /// Linux abstract namespace name, without the leading NUL (AF_UNIX).
    Abstract(Vec<u8>),
    /// Unbound AF_UNIX peer.
    Unnamed,
    /// TIPC address.
    Tipc(TipcAddress),
    /// vsock address.
    Vsock(VsockAddress),
}

impl SocketAddress {
    /// A filesystem path address.
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    /// An abstract namespace address.
    pub fn abstract_name(name: impl AsRef<[u8]>) -> Self {
        Self::Abstract(name.as_ref().to_vec())
    }

    /// A cluster-scoped TIPC service address.
    pub fn tipc_service(service_type: u32, instance: u32) -> Self {
        Self::Tipc(TipcAddress::service(service_type, instance))
    }

    /// A vsock address.
    pub fn vsock(cid: u32, port: u32) -> Self {
        Self::Vsock(VsockAddress::new(cid, port))
    }

    /// The family this address belongs to.
    pub fn family(&self) -> AddressFamily {
        match self {
            Self::Path(_) | Self::Abstract(_) | Self::Unnamed => AddressFamily::Unix,
            Self::Tipc(_) => AddressFamily::Tipc,
            Self::Vsock(_) => AddressFamily::Vsock,
        }
    }

    /// The filesystem path, if this is a path address.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Whether this address lives in the abstract namespace.
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Abstract(_))
    }

    /// Encode into the kernel's raw layout.
    pub fn encode(&self) -> Result<NativeAddress> {
        match self {
            Self::Path(path) => {
                let bytes = path.as_os_str().as_bytes();
                if bytes.is_empty() {
                    return Err(Error::InvalidAddress("empty socket path".into()));
                }
                if bytes.contains(&0) {
                    return Err(Error::InvalidAddress(format!(
                        "socket path {} contains a NUL byte",
                        path.display()
                    )));
                }
                if bytes.len() > MAX_PATH_LEN {
                    return Err(Error::InvalidAddress(format!(
                        "socket path is {} bytes, maximum is {}",
                        bytes.len(),
                        MAX_PATH_LEN
                    )));
                }
                Ok(NativeAddress::unix(bytes, true))
            }
            Self::Abstract(name) => {
                if name.len() > MAX_ABSTRACT_LEN {
                    return Err(Error::InvalidAddress(format!(
                        "abstract name is {} bytes, maximum is {}",
                        name.len(),
                        MAX_ABSTRACT_LEN
                    )));
                }
                let mut path = Vec::with_capacity(name.len() + 1);
                path.push(0);
                path.extend_from_slice(name);
                Ok(NativeAddress::unix(&path, false))
            }
            Self::Unnamed => Ok(NativeAddress::unix(&[], false)),
            Self::Tipc(tipc) => {
                let (addr_type, scope, addr) = match *tipc {
                    TipcAddress::Service {
                        service_type,
                        instance,
                        scope,
                    } => (TIPC_SERVICE_ADDR, scope.as_raw(), [service_type, instance, 0]),
                    TipcAddress::ServiceRange {
                        service_type,
                        lower,
                        upper,
                        scope,
                    } => {
                        if lower > upper {
                            return Err(Error::InvalidAddress(format!(
                                "TIPC range {lower}..{upper} is inverted"
                            )));
                        }
                        (TIPC_SERVICE_RANGE, scope.as_raw(), [service_type, lower, upper])
                    }
                    TipcAddress::Socket { port_ref, node } => {
                        (TIPC_SOCKET_ADDR, 0, [port_ref, node, 0])
                    }
                };
                let raw = SockaddrTipc {
                    family: libc::AF_TIPC as u16,
                    addr_type,
                    scope,
                    addr,
                };
                Ok(NativeAddress::from_slice(AddressFamily::Tipc, raw.as_bytes()))
            }
            Self::Vsock(vsock) => {
                let raw = SockaddrVm {
                    family: libc::AF_VSOCK as u16,
                    port: vsock.port,
                    cid: vsock.cid,
                    ..Default::default()
                };
                Ok(NativeAddress::from_slice(AddressFamily::Vsock, raw.as_bytes()))
            }
        }
    }

    /// Decode raw kernel bytes for the given family.
    pub fn decode(raw: &[u8], family: AddressFamily) -> Result<Self> {
        let mut input = raw;
        let (tag, payload) = parse_family_header(&mut input).map_err(|_| {
            Error::MalformedAddress(format!(
                "{} byte address is shorter than its family header",
                raw.len()
            ))
        })?;
        if i32::from(tag) != family.as_raw() {
            return Err(Error::MalformedAddress(format!(
                "family tag {tag} does not match {family}"
            )));
        }

        match family {
            AddressFamily::Unix => decode_unix(payload),
            AddressFamily::Tipc => decode_tipc(raw),
            AddressFamily::Vsock => decode_vsock(raw),
        }
    }
}

fn decode_unix(path: &[u8]) -> Result<SocketAddress> {
    if path.len() > SUN_PATH_LEN {
        return Err(Error::MalformedAddress(format!(
            "sun_path is {} bytes, maximum is {}",
            path.len(),
            SUN_PATH_LEN
        )));
    }
    match path.first() {
        None => Ok(SocketAddress::Unnamed),
        Some(0) => Ok(SocketAddress::Abstract(path[1..].to_vec())),
        Some(_) => {
            let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
            Ok(SocketAddress::Path(PathBuf::from(OsStr::from_bytes(
                &path[..end],
            ))))
        }
    }
}

fn decode_tipc(raw: &[u8]) -> Result<SocketAddress> {
    let (sa, _) = SockaddrTipc::read_from_prefix(raw).map_err(|_| {
        Error::MalformedAddress(format!(
            "sockaddr_tipc needs {} bytes, got {}",
            std::mem::size_of::<SockaddrTipc>(),
            raw.len()
        ))
    })?;
    let scope = || {
        TipcScope::from_raw(sa.scope)
            .ok_or_else(|| Error::MalformedAddress(format!("unknown TIPC scope {}", sa.scope)))
    };
    let addr = match sa.addr_type {
        TIPC_SERVICE_ADDR => TipcAddress::Service {
            service_type: sa.addr[0],
            instance: sa.addr[1],
            scope: scope()?,
        },
        TIPC_SERVICE_RANGE => {
            if sa.addr[1] > sa.addr[2] {
                return Err(Error::MalformedAddress(format!(
                    "TIPC range {}..{} is inverted",
                    sa.addr[1], sa.addr[2]
                )));
            }
            TipcAddress::ServiceRange {
                service_type: sa.addr[0],
                lower: sa.addr[1],
                upper: sa.addr[2],
                scope: scope()?,
            }
        }
        TIPC_SOCKET_ADDR => TipcAddress::Socket {
            port_ref: sa.addr[0],
            node: sa.addr[1],
        },
        other => {
            return Err(Error::MalformedAddress(format!(
                "unknown TIPC address type {other}"
            )));
        }
    };
    Ok(SocketAddress::Tipc(addr))
}

fn decode_vsock(raw: &[u8]) -> Result<SocketAddress> {
    let (sa, _) = SockaddrVm::read_from_prefix(raw).map_err(|_| {
        Error::MalformedAddress(format!(
            "sockaddr_vm needs {} bytes, got {}",
            std::mem::size_of::<SockaddrVm>(),
            raw.len()
        ))
    })?;
    Ok(SocketAddress::Vsock(VsockAddress::new(sa.cid, sa.port)))
}

impl From<&Path> for SocketAddress {
    fn from(path: &Path) -> Self {
        Self::path(path)
    }
}

impl From<PathBuf> for SocketAddress {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<TipcAddress> for SocketAddress {
    fn from(addr: TipcAddress) -> Self {
        Self::Tipc(addr)
    }
}

impl From<VsockAddress> for SocketAddress {
    fn from(addr: VsockAddress) -> Self {
        Self::Vsock(addr)
    }
}

fn fmt_any(f: &mut fmt::Formatter<'_>, value: u32) -> fmt::Result {
    if value == u32::MAX {
        f.write_str("any")
    } else {
        write!(f, "{value}")
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "unix:{}", p.display()),
            Self::Abstract(name) => write!(f, "abstract:{}", name.escape_ascii()),
            Self::Unnamed => f.write_str("unnamed"),
            Self::Tipc(TipcAddress::Service {
                service_type,
                instance,
                scope,
            }) => {
                write!(f, "tipc:{service_type}:{instance}")?;
                if *scope != TipcScope::Cluster {
                    write!(f, ":{}", scope.name())?;
                }
                Ok(())
            }
            Self::Tipc(TipcAddress::ServiceRange {
                service_type,
                lower,
                upper,
                scope,
            }) => {
                write!(f, "tipc-range:{service_type}:{lower}:{upper}")?;
                if *scope != TipcScope::Cluster {
                    write!(f, ":{}", scope.name())?;
                }
                Ok(())
            }
            Self::Tipc(TipcAddress::Socket { port_ref, node }) => {
                write!(f, "tipc-socket:{port_ref}@{node}")
            }
            Self::Vsock(v) => {
                f.write_str("vsock:")?;
                fmt_any(f, v.cid)?;
                f.write_str(":")?;
                fmt_any(f, v.port)
            }
        }
    }
}

fn parse_u32_field(value: &str, what: &str) -> Result<u32> {
    if value == "any" {
        return Ok(u32::MAX);
    }
    value
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("invalid {what} '{value}'")))
}

fn parse_scope(value: Option<&str>) -> Result<TipcScope> {
    match value {
        None | Some("cluster") => Ok(TipcScope::Cluster),
        Some("node") => Ok(TipcScope::Node),
        Some("zone") => Ok(TipcScope::Zone),
        Some(other) => Err(Error::InvalidAddress(format!("unknown TIPC scope '{other}'"))),
    }
}

/// Reverse of `<[u8]>::escape_ascii`.
fn unescape_ascii(s: &str) -> Result<Vec<u8>> {
    let bad = || Error::InvalidAddress(format!("invalid escape in abstract name '{s}'"));
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next().ok_or_else(bad)? {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'x' => {
                let hi = bytes.next().ok_or_else(bad)?;
                let lo = bytes.next().ok_or_else(bad)?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).map_err(|_| bad())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| bad())?);
            }
            c @ (b'\\' | b'\'' | b'"') => out.push(c),
            _ => return Err(bad()),
        }
    }
    Ok(out)
}

impl FromStr for SocketAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "unnamed" {
            return Ok(Self::Unnamed);
        }
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing scheme in '{s}'")))?;
        let fields: Vec<&str> = rest.split(':').collect();

        match scheme {
            "unix" => Ok(Self::path(rest)),
            "abstract" => Ok(Self::Abstract(unescape_ascii(rest)?)),
            "tipc" => match fields.as_slice() {
                [t, i] | [t, i, _] => Ok(Self::Tipc(TipcAddress::Service {
                    service_type: parse_u32_field(t, "service type")?,
                    instance: parse_u32_field(i, "instance")?,
                    scope: parse_scope(fields.get(2).copied())?,
                })),
                _ => Err(Error::InvalidAddress(format!(
                    "expected tipc:<type>:<instance>[:scope], got '{s}'"
                ))),
            },
            "tipc-range" => match fields.as_slice() {
                [t, l, u] | [t, l, u, _] => Ok(Self::Tipc(TipcAddress::ServiceRange {
                    service_type: parse_u32_field(t, "service type")?,
                    lower: parse_u32_field(l, "lower bound")?,
                    upper: parse_u32_field(u, "upper bound")?,
                    scope: parse_scope(fields.get(3).copied())?,
                })),
                _ => Err(Error::InvalidAddress(format!(
                    "expected tipc-range:<type>:<lower>:<upper>[:scope], got '{s}'"
                ))),
            },
            "tipc-socket" => {
                let (port_ref, node) = rest.split_once('@').ok_or_else(|| {
                    Error::InvalidAddress(format!("expected tipc-socket:<ref>@<node>, got '{s}'"))
                })?;
                Ok(Self::Tipc(TipcAddress::Socket {
                    port_ref: parse_u32_field(port_ref, "port reference")?,
                    node: parse_u32_field(node, "node")?,
                }))
            }
            "vsock" => match fields.as_slice() {
                [cid, port] => Ok(Self::vsock(
                    parse_u32_field(cid, "cid")?,
                    parse_u32_field(port, "port")?,
                )),
                _ => Err(Error::InvalidAddress(format!(
                    "expected vsock:<cid>:<port>, got '{s}'"
                ))),
            },
            other => Err(Error::InvalidAddress(format!(
                "unknown address scheme '{other}'"
            ))),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for SocketAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Raw kernel address bytes tagged with their family.
///
/// Equality and hashing cover the family and the raw bytes only.
#[derive(Clone)]
pub struct NativeAddress {
    family: AddressFamily,
    len: usize,
    buf: [u8; NATIVE_ADDR_CAPACITY],
}

impl NativeAddress {
    fn unix(path: &[u8], terminate: bool) -> Self {
        let mut buf = [0u8; NATIVE_ADDR_CAPACITY];
        buf[..SA_FAMILY_LEN].copy_from_slice(&(libc::AF_UNIX as libc::sa_family_t).to_ne_bytes());
        buf[SA_FAMILY_LEN..SA_FAMILY_LEN + path.len()].copy_from_slice(path);
        Self {
            family: AddressFamily::Unix,
            len: SA_FAMILY_LEN + path.len() + usize::from(terminate),
            buf,
        }
    }

    fn from_slice(family: AddressFamily, raw: &[u8]) -> Self {
        let mut buf = [0u8; NATIVE_ADDR_CAPACITY];
        buf[..raw.len()].copy_from_slice(raw);
        Self {
            family,
            len: raw.len(),
            buf,
        }
    }

    /// Wrap raw bytes received from the kernel.
    pub fn from_raw(family: AddressFamily, raw: &[u8]) -> Result<Self> {
        if raw.len() > NATIVE_ADDR_CAPACITY {
            return Err(Error::MalformedAddress(format!(
                "{} byte address exceeds sockaddr_storage",
                raw.len()
            )));
        }
        Ok(Self::from_slice(family, raw))
    }

    /// Copy the first `len` bytes out of a kernel-filled `sockaddr_storage`.
    pub(crate) fn from_storage(
        family: AddressFamily,
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> Result<Self> {
        let len = (len as usize).min(NATIVE_ADDR_CAPACITY);
        // SAFETY: sockaddr_storage is plain data of NATIVE_ADDR_CAPACITY bytes
        // and len has been clamped to that size.
        let raw = unsafe {
            std::slice::from_raw_parts((storage as *const libc::sockaddr_storage).cast::<u8>(), len)
        };
        Self::from_raw(family, raw)
    }

    /// The address family.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// The raw bytes, including the `sa_family_t` header.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Length in bytes (the `socklen_t` passed to the kernel).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the address is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decode back into a logical address.
    pub fn decode(&self) -> Result<SocketAddress> {
        SocketAddress::decode(self.as_bytes(), self.family)
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self.buf.as_ptr().cast()
    }

    pub(crate) fn socklen(&self) -> libc::socklen_t {
        self.len as libc::socklen_t
    }
}

impl PartialEq for NativeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for NativeAddress {}

impl Hash for NativeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeAddress")
            .field("family", &self.family)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}
