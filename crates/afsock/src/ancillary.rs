//! Control messages carried alongside socket payloads.
//!
//! Supports `SCM_RIGHTS` (descriptor passing), `SCM_CREDENTIALS` (peer
//! credentials) and TIPC's `TIPC_ERRINFO` report for returned or rejected
//! messages. Received descriptors are wrapped in [`OwnedFd`] immediately, so
//! dropping an [`AncillaryMessage`] closes anything the caller did not keep.

use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::parse::{PResult, parse_u32_ne};

// linux/tipc.h
pub(crate) const SOL_TIPC: libc::c_int = 271;
const TIPC_ERRINFO: libc::c_int = 1;

/// Default number of descriptors a receive makes room for.
pub const DEFAULT_MAX_FDS: usize = 16;

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerCredentials {
    /// Process ID.
    pub pid: i32,
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
}

impl PeerCredentials {
    /// Credentials of the calling process.
    pub fn current() -> Self {
        // SAFETY: these calls cannot fail and have no preconditions.
        unsafe {
            Self {
                pid: libc::getpid(),
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }

    pub(crate) fn from_ucred(cred: libc::ucred) -> Self {
        Self {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        }
    }

    fn to_ucred(self) -> libc::ucred {
        libc::ucred {
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// TIPC report attached to a message that could not be delivered and was
/// returned to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipcErrorInfo {
    /// TIPC error code (e.g. no port, overload).
    pub code: u32,
    /// Length of the returned payload.
    pub returned_len: u32,
}

fn parse_errinfo(input: &mut &[u8]) -> PResult<TipcErrorInfo> {
    let code = parse_u32_ne(input)?;
    let returned_len = parse_u32_ne(input)?;
    Ok(TipcErrorInfo { code, returned_len })
}

/// Ancillary data received with a message.
#[derive(Debug, Default)]
pub struct AncillaryMessage {
    /// Descriptors passed by the peer. The receiver owns them.
    pub fds: Vec<OwnedFd>,
    /// Credentials sent by the peer (`SCM_CREDENTIALS`).
    pub credentials: Option<PeerCredentials>,
    /// TIPC returned/rejected message report.
    pub tipc_error: Option<TipcErrorInfo>,
    /// The kernel dropped control data that did not fit (`MSG_CTRUNC`).
    pub truncated: bool,
}

impl AncillaryMessage {
    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty() && self.credentials.is_none() && self.tipc_error.is_none()
    }
}

fn cmsg_space(len: usize) -> usize {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    unsafe { libc::CMSG_SPACE(len as u32) as usize }
}

fn cmsg_len(len: usize) -> usize {
    // SAFETY: CMSG_LEN is pure arithmetic.
    unsafe { libc::CMSG_LEN(len as u32) as usize }
}

/// Control buffer bytes needed to carry `count` descriptors.
pub fn space_for_fds(count: usize) -> usize {
    if count == 0 {
        0
    } else {
        cmsg_space(count * mem::size_of::<RawFd>())
    }
}

/// Control buffer space a receive reserves for `max_fds` descriptors plus
/// credentials and a TIPC error report.
pub(crate) fn receive_space(max_fds: usize) -> usize {
    space_for_fds(max_fds)
        + cmsg_space(mem::size_of::<libc::ucred>())
        + cmsg_space(2 * mem::size_of::<u32>())
}

/// An aligned buffer of `cmsghdr` records.
pub(crate) struct ControlBuffer {
    // u64 storage keeps every cmsghdr suitably aligned.
    buf: Vec<u64>,
    len: usize,
}

impl ControlBuffer {
    /// An empty buffer with room for `bytes` bytes of control data.
    pub(crate) fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: vec![0u64; bytes.div_ceil(mem::size_of::<u64>())],
            len: bytes,
        }
    }

    /// Build the control data for an outgoing message.
    pub(crate) fn for_send(fds: &[BorrowedFd<'_>], credentials: Option<PeerCredentials>) -> Self {
        let fd_bytes = mem::size_of_val(fds);
        let mut space = if fds.is_empty() { 0 } else { cmsg_space(fd_bytes) };
        if credentials.is_some() {
            space += cmsg_space(mem::size_of::<libc::ucred>());
        }
        let mut this = Self::with_capacity(space);
        let mut offset = 0;
        if !fds.is_empty() {
            let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
            offset = this.push(offset, libc::SOL_SOCKET, libc::SCM_RIGHTS, as_bytes(&raw));
        }
        if let Some(cred) = credentials {
            let ucred = cred.to_ucred();
            this.push(
                offset,
                libc::SOL_SOCKET,
                libc::SCM_CREDENTIALS,
                as_bytes(std::slice::from_ref(&ucred)),
            );
        }
        this
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: a u64 slice reinterpreted as bytes covers the same memory.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.buf.as_mut_ptr().cast::<u8>(),
                self.buf.len() * mem::size_of::<u64>(),
            )
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: a u64 slice reinterpreted as bytes covers the same memory.
        unsafe {
            std::slice::from_raw_parts(
                self.buf.as_ptr().cast::<u8>(),
                self.buf.len() * mem::size_of::<u64>(),
            )
        }
    }

    fn push(&mut self, offset: usize, level: libc::c_int, kind: libc::c_int, data: &[u8]) -> usize {
        let header = libc::cmsghdr {
            cmsg_len: cmsg_len(data.len()) as _,
            cmsg_level: level,
            cmsg_type: kind,
        };
        let data_offset = offset + cmsg_len(0);
        let bytes = self.bytes_mut();
        // SAFETY: the buffer was sized with CMSG_SPACE for every record and
        // offset is a multiple of the cmsghdr alignment.
        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(offset).cast::<libc::cmsghdr>(), header);
        }
        bytes[data_offset..data_offset + data.len()].copy_from_slice(data);
        offset + cmsg_space(data.len())
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        if self.len == 0 {
            std::ptr::null_mut()
        } else {
            self.buf.as_mut_ptr().cast()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Decode the first `filled` bytes written by `recvmsg`.
    pub(crate) fn parse(&self, filled: usize, truncated: bool) -> AncillaryMessage {
        let mut message = AncillaryMessage {
            truncated,
            ..Default::default()
        };
        let bytes = &self.bytes()[..filled.min(self.len)];
        let header_len = cmsg_len(0);
        let mut offset = 0;

        while offset + mem::size_of::<libc::cmsghdr>() <= bytes.len() {
            // SAFETY: at least one full header lies within the slice.
            let header = unsafe {
                std::ptr::read_unaligned(bytes.as_ptr().add(offset).cast::<libc::cmsghdr>())
            };
            let total = header.cmsg_len as usize;
            if total < header_len || offset + total > bytes.len() {
                break;
            }
            let data = &bytes[offset + header_len..offset + total];

            match (header.cmsg_level, header.cmsg_type) {
                (libc::SOL_SOCKET, libc::SCM_RIGHTS) => {
                    for chunk in data.chunks_exact(mem::size_of::<RawFd>()) {
                        let fd = RawFd::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        // SAFETY: the kernel installed this descriptor in our
                        // table for us; nobody else owns it.
                        message.fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
                (libc::SOL_SOCKET, libc::SCM_CREDENTIALS)
                    if data.len() >= mem::size_of::<libc::ucred>() =>
                {
                    // SAFETY: data holds at least one ucred.
                    let cred =
                        unsafe { std::ptr::read_unaligned(data.as_ptr().cast::<libc::ucred>()) };
                    message.credentials = Some(PeerCredentials::from_ucred(cred));
                }
                (SOL_TIPC, TIPC_ERRINFO) => {
                    let mut input = data;
                    if let Ok(info) = parse_errinfo(&mut input) {
                        message.tipc_error = Some(info);
                    }
                }
                (level, kind) => {
                    tracing::trace!(level, kind, "ignoring unknown control message");
                }
            }
            offset += cmsg_space(total - header_len).max(header_len);
        }
        message
    }
}

fn as_bytes<T: Copy>(values: &[T]) -> &[u8] {
    // SAFETY: T is a plain C type (RawFd or ucred) with no padding.
    unsafe { std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), mem::size_of_val(values)) }
}
