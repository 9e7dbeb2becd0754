//! Typed socket options.
//!
//! Generic `SOL_SOCKET` options apply to every family; the TIPC and vsock
//! options are only accepted on sockets of their family. Read and write
//! timeouts are handled by the handle itself because blocking is emulated
//! in user space.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::addr::AddressFamily;
use crate::ancillary::SOL_TIPC;
use crate::error::{Error, Result};
use crate::handle::SocketHandle;
use crate::sys;

// linux/tipc.h
const TIPC_IMPORTANCE: libc::c_int = 127;
const TIPC_SRC_DROPPABLE: libc::c_int = 128;
const TIPC_DEST_DROPPABLE: libc::c_int = 129;
const TIPC_CONN_TIMEOUT: libc::c_int = 130;

// linux/vm_sockets.h
const SO_VM_SOCKETS_BUFFER_SIZE: libc::c_int = 0;
const SO_VM_SOCKETS_CONNECT_TIMEOUT: libc::c_int = 6;

/// TIPC message importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TipcImportance {
    /// Default.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Critical.
    Critical,
}

impl TipcImportance {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    fn from_raw(raw: libc::c_int) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Option identifiers, used to read an option back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionName {
    /// `SO_SNDBUF`.
    SendBufferSize,
    /// `SO_RCVBUF`.
    ReceiveBufferSize,
    /// `SO_LINGER`.
    Linger,
    /// Blocking receive timeout.
    ReadTimeout,
    /// Blocking send timeout.
    WriteTimeout,
    /// `SO_KEEPALIVE`.
    KeepAlive,
    /// `SO_REUSEADDR`.
    ReuseAddress,
    /// `SO_PASSCRED` (Unix).
    PassCredentials,
    /// `TIPC_IMPORTANCE`.
    TipcImportance,
    /// `TIPC_SRC_DROPPABLE`.
    TipcSourceDroppable,
    /// `TIPC_DEST_DROPPABLE`.
    TipcDestinationDroppable,
    /// `TIPC_CONN_TIMEOUT`.
    TipcConnectTimeout,
    /// `SO_VM_SOCKETS_BUFFER_SIZE`.
    VsockBufferSize,
    /// `SO_VM_SOCKETS_CONNECT_TIMEOUT`.
    VsockConnectTimeout,
}

impl OptionName {
    /// Get the option name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendBufferSize => "send-buffer-size",
            Self::ReceiveBufferSize => "receive-buffer-size",
            Self::Linger => "linger",
            Self::ReadTimeout => "read-timeout",
            Self::WriteTimeout => "write-timeout",
            Self::KeepAlive => "keep-alive",
            Self::ReuseAddress => "reuse-address",
            Self::PassCredentials => "pass-credentials",
            Self::TipcImportance => "tipc-importance",
            Self::TipcSourceDroppable => "tipc-source-droppable",
            Self::TipcDestinationDroppable => "tipc-destination-droppable",
            Self::TipcConnectTimeout => "tipc-connect-timeout",
            Self::VsockBufferSize => "vsock-buffer-size",
            Self::VsockConnectTimeout => "vsock-connect-timeout",
        }
    }

    /// The only family this option applies to, if restricted.
    pub fn family(self) -> Option<AddressFamily> {
        match self {
            Self::PassCredentials => Some(AddressFamily::Unix),
            Self::TipcImportance
            | Self::TipcSourceDroppable
            | Self::TipcDestinationDroppable
            | Self::TipcConnectTimeout => Some(AddressFamily::Tipc),
            Self::VsockBufferSize | Self::VsockConnectTimeout => Some(AddressFamily::Vsock),
            _ => None,
        }
    }

    fn level_and_name(self) -> (libc::c_int, libc::c_int) {
        match self {
            Self::SendBufferSize => (libc::SOL_SOCKET, libc::SO_SNDBUF),
            Self::ReceiveBufferSize => (libc::SOL_SOCKET, libc::SO_RCVBUF),
            Self::Linger => (libc::SOL_SOCKET, libc::SO_LINGER),
            Self::KeepAlive => (libc::SOL_SOCKET, libc::SO_KEEPALIVE),
            Self::ReuseAddress => (libc::SOL_SOCKET, libc::SO_REUSEADDR),
            Self::PassCredentials => (libc::SOL_SOCKET, libc::SO_PASSCRED),
            Self::TipcImportance => (SOL_TIPC, TIPC_IMPORTANCE),
            Self::TipcSourceDroppable => (SOL_TIPC, TIPC_SRC_DROPPABLE),
            Self::TipcDestinationDroppable => (SOL_TIPC, TIPC_DEST_DROPPABLE),
            Self::TipcConnectTimeout => (SOL_TIPC, TIPC_CONN_TIMEOUT),
            Self::VsockBufferSize => (libc::AF_VSOCK, SO_VM_SOCKETS_BUFFER_SIZE),
            Self::VsockConnectTimeout => (libc::AF_VSOCK, SO_VM_SOCKETS_CONNECT_TIMEOUT),
            // handled without a system call
            Self::ReadTimeout | Self::WriteTimeout => (-1, -1),
        }
    }
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A socket option with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Kernel send buffer size in bytes (the kernel may adjust it).
    SendBufferSize(usize),
    /// Kernel receive buffer size in bytes (the kernel may adjust it).
    ReceiveBufferSize(usize),
    /// Linger on close; `None` disables.
    Linger(Option<Duration>),
    /// Blocking receive timeout; `None` waits forever.
    ReadTimeout(Option<Duration>),
    /// Blocking send timeout; `None` waits forever.
    WriteTimeout(Option<Duration>),
    /// Keep-alive probes.
    KeepAlive(bool),
    /// Allow rebinding a recently used address.
    ReuseAddress(bool),
    /// Receive peer credentials with every message.
    PassCredentials(bool),
    /// TIPC message importance.
    TipcImportance(TipcImportance),
    /// Drop messages on source congestion instead of blocking.
    TipcSourceDroppable(bool),
    /// Drop undeliverable messages instead of returning them.
    TipcDestinationDroppable(bool),
    /// TIPC connect timeout.
    TipcConnectTimeout(Duration),
    /// vsock stream buffer size in bytes.
    VsockBufferSize(u64),
    /// vsock connect timeout.
    VsockConnectTimeout(Duration),
}

impl SocketOption {
    /// The option's identifier.
    pub fn name(&self) -> OptionName {
        match self {
            Self::SendBufferSize(_) => OptionName::SendBufferSize,
            Self::ReceiveBufferSize(_) => OptionName::ReceiveBufferSize,
            Self::Linger(_) => OptionName::Linger,
            Self::ReadTimeout(_) => OptionName::ReadTimeout,
            Self::WriteTimeout(_) => OptionName::WriteTimeout,
            Self::KeepAlive(_) => OptionName::KeepAlive,
            Self::ReuseAddress(_) => OptionName::ReuseAddress,
            Self::PassCredentials(_) => OptionName::PassCredentials,
            Self::TipcImportance(_) => OptionName::TipcImportance,
            Self::TipcSourceDroppable(_) => OptionName::TipcSourceDroppable,
            Self::TipcDestinationDroppable(_) => OptionName::TipcDestinationDroppable,
            Self::TipcConnectTimeout(_) => OptionName::TipcConnectTimeout,
            Self::VsockBufferSize(_) => OptionName::VsockBufferSize,
            Self::VsockConnectTimeout(_) => OptionName::VsockConnectTimeout,
        }
    }
}

fn int_of(value: bool) -> libc::c_int {
    libc::c_int::from(value)
}

fn clamp_int(value: usize) -> libc::c_int {
    value.min(libc::c_int::MAX as usize) as libc::c_int
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

fn duration_of(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

impl SocketHandle {
    fn option_error(&self, operation: &'static str, name: OptionName, err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::ENOPROTOOPT | libc::EOPNOTSUPP) => Error::UnsupportedOption {
                option: name.as_str(),
                family: self.family(),
            },
            _ => Error::from_io(operation, err),
        }
    }

    fn check_option_family(&self, name: OptionName) -> Result<()> {
        match name.family() {
            Some(family) if family != self.family() => Err(Error::UnsupportedOption {
                option: name.as_str(),
                family: self.family(),
            }),
            _ => Ok(()),
        }
    }

    /// Set a socket option.
    pub fn set_option(&self, option: SocketOption) -> Result<()> {
        let name = option.name();
        let fd = self.raw_fd()?;
        self.check_option_family(name)?;
        let (level, optname) = name.level_and_name();

        let result = match option {
            SocketOption::ReadTimeout(t) => return self.set_read_timeout(t),
            SocketOption::WriteTimeout(t) => return self.set_write_timeout(t),
            SocketOption::SendBufferSize(n) | SocketOption::ReceiveBufferSize(n) => {
                sys::setsockopt(fd, level, optname, &clamp_int(n))
            }
            SocketOption::Linger(linger) => {
                let value = libc::linger {
                    l_onoff: int_of(linger.is_some()),
                    l_linger: linger
                        .map(|d| d.as_secs().min(libc::c_int::MAX as u64) as libc::c_int)
                        .unwrap_or(0),
                };
                sys::setsockopt(fd, level, optname, &value)
            }
            SocketOption::KeepAlive(on)
            | SocketOption::ReuseAddress(on)
            | SocketOption::PassCredentials(on)
            | SocketOption::TipcSourceDroppable(on)
            | SocketOption::TipcDestinationDroppable(on) => {
                sys::setsockopt(fd, level, optname, &int_of(on))
            }
            SocketOption::TipcImportance(importance) => {
                sys::setsockopt(fd, level, optname, &importance.as_raw())
            }
            SocketOption::TipcConnectTimeout(d) => sys::setsockopt(fd, level, optname, &millis(d)),
            SocketOption::VsockBufferSize(n) => sys::setsockopt(fd, level, optname, &n),
            SocketOption::VsockConnectTimeout(d) => {
                sys::setsockopt(fd, level, optname, &timeval(d))
            }
        };
        result.map_err(|e| self.option_error("setsockopt", name, e))?;
        tracing::trace!(id = %self.id(), option = %name, "set socket option");
        Ok(())
    }

    /// Read a socket option back.
    pub fn option(&self, name: OptionName) -> Result<SocketOption> {
        let fd = self.raw_fd()?;
        self.check_option_family(name)?;
        let (level, optname) = name.level_and_name();
        let err = |e| self.option_error("getsockopt", name, e);

        Ok(match name {
            OptionName::ReadTimeout => SocketOption::ReadTimeout(self.read_timeout()),
            OptionName::WriteTimeout => SocketOption::WriteTimeout(self.write_timeout()),
            OptionName::SendBufferSize => {
                let v: libc::c_int = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::SendBufferSize(v.max(0) as usize)
            }
            OptionName::ReceiveBufferSize => {
                let v: libc::c_int = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::ReceiveBufferSize(v.max(0) as usize)
            }
            OptionName::Linger => {
                let v: libc::linger = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::Linger(
                    (v.l_onoff != 0).then(|| Duration::from_secs(v.l_linger.max(0) as u64)),
                )
            }
            OptionName::KeepAlive
            | OptionName::ReuseAddress
            | OptionName::PassCredentials
            | OptionName::TipcSourceDroppable
            | OptionName::TipcDestinationDroppable => {
                let v: libc::c_int = sys::getsockopt(fd, level, optname).map_err(err)?;
                let on = v != 0;
                match name {
                    OptionName::KeepAlive => SocketOption::KeepAlive(on),
                    OptionName::ReuseAddress => SocketOption::ReuseAddress(on),
                    OptionName::PassCredentials => SocketOption::PassCredentials(on),
                    OptionName::TipcSourceDroppable => SocketOption::TipcSourceDroppable(on),
                    _ => SocketOption::TipcDestinationDroppable(on),
                }
            }
            OptionName::TipcImportance => {
                let v: libc::c_int = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::TipcImportance(TipcImportance::from_raw(v).ok_or_else(|| {
                    Error::Native {
                        operation: "getsockopt",
                        errno: 0,
                        message: format!("unknown TIPC importance {v}"),
                    }
                })?)
            }
            OptionName::TipcConnectTimeout => {
                let v: u32 = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::TipcConnectTimeout(Duration::from_millis(u64::from(v)))
            }
            OptionName::VsockBufferSize => {
                let v: u64 = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::VsockBufferSize(v)
            }
            OptionName::VsockConnectTimeout => {
                let v: libc::timeval = sys::getsockopt(fd, level, optname).map_err(err)?;
                SocketOption::VsockConnectTimeout(duration_of(v))
            }
        })
    }
}
