//! Sockets for the Linux families outside the Internet stack.
//!
//! This crate drives AF_UNIX (filesystem paths and the abstract namespace),
//! TIPC and AF_VSOCK sockets through one engine parameterised by
//! [`AddressFamily`] and [`SocketKind`]. It provides blocking and
//! non-blocking stream and datagram I/O, an epoll-based [`Selector`],
//! descriptor and credential passing, and typed socket options.
//!
//! What the running kernel supports is probed once per process and exposed
//! as a [`CapabilitySet`]; operations that need a missing capability fail
//! early with [`Error::Unsupported`].
//!
//! # Features
//!
//! - `async` - tokio adapters (`AsyncAfStream`, `AsyncAfListener`,
//!   `AsyncAfDatagram`). Enabled by default.
//! - `serde` - `Serialize` for addresses and the capability set
//! - `full` - All features enabled
//!
//! # Example
//!
//! ```ignore
//! use std::io::{Read, Write};
//! use afsock::{AfListener, AfStream, SocketAddress};
//!
//! let addr = SocketAddress::path("/tmp/echo.sock");
//! let listener = AfListener::builder(addr.clone())
//!     .remove_existing(true)
//!     .unlink_on_close(true)
//!     .bind::<AfStream>()?;
//!
//! let mut client = AfStream::connect(&addr)?;
//! let (mut server, _peer) = listener.accept()?;
//!
//! client.write_all(&[1, 2, 3])?;
//! let mut buf = [0u8; 3];
//! server.read_exact(&mut buf)?;
//! ```
//!
//! # Readiness selection
//!
//! ```ignore
//! use afsock::{Interest, Selector};
//!
//! let selector = Selector::new()?;
//! selector.register(server.handle(), Interest::READABLE)?;
//!
//! for (id, ready) in selector.select(None)? {
//!     if ready.is_readable() {
//!         println!("{id} is readable");
//!     }
//! }
//! ```

pub mod addr;
pub mod ancillary;
pub mod bridge;
pub mod capability;
pub mod datagram;
pub mod error;
pub mod handle;
pub mod options;
pub mod selector;
pub mod stream;

mod parse;
mod sys;

#[cfg(feature = "async")]
pub mod async_io;

// Re-export common types at crate root for convenience
pub use addr::{
    AddressFamily, NativeAddress, SocketAddress, SocketKind, TipcAddress, TipcScope,
    VsockAddress,
};
pub use ancillary::{AncillaryMessage, PeerCredentials, TipcErrorInfo};
pub use bridge::{Closable, HandshakeError, HandshakeObserver, ResetTolerant};
pub use capability::{Capability, CapabilitySet, capabilities};
pub use datagram::{AfDatagram, Datagram};
pub use error::{Error, Result};
pub use handle::{ConnectStatus, Received, RecvInfo, SocketHandle, SocketId, SocketState};
pub use options::{OptionName, SocketOption, TipcImportance};
pub use selector::{Interest, Ready, SelectedKeys, Selector};
pub use stream::{Accept, AfListener, AfStream, Incoming, ListenerBuilder};

#[cfg(feature = "async")]
pub use async_io::{AsyncAfDatagram, AsyncAfListener, AsyncAfStream};
