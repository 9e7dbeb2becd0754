//! Common test utilities for integration tests.
//!
//! Provides `SocketPath` for socket files that clean up after themselves,
//! unique abstract names, and macros that skip a test when the kernel lacks
//! a capability.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use afsock::{Capability, SocketAddress};

/// Global counter for unique socket names.
static SOCKET_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a unique socket name for this test.
fn unique_name(prefix: &str) -> String {
    let id = SOCKET_COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id();
    format!("afsock-test-{}-{}-{}", prefix, pid, id)
}

/// A filesystem socket path that is removed when dropped.
///
/// # Example
///
/// ```ignore
/// let path = SocketPath::new("echo");
/// let listener = AfListener::bind(&path.address())?;
/// ```
pub struct SocketPath {
    path: PathBuf,
}

impl SocketPath {
    /// Reserve a unique path in the temporary directory.
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{}.sock", unique_name(prefix)));
        let _ = std::fs::remove_file(&path);
        Self { path }
    }

    /// Get the path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path as a socket address.
    pub fn address(&self) -> SocketAddress {
        SocketAddress::path(&self.path)
    }
}

impl Drop for SocketPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A unique abstract-namespace address.
pub fn abstract_address(prefix: &str) -> SocketAddress {
    SocketAddress::abstract_name(unique_name(prefix))
}

/// Check if the running kernel offers a capability.
pub fn has_capability(cap: Capability) -> bool {
    afsock::capabilities().has(cap)
}

/// Skip the test if a capability is missing.
///
/// Use this at the beginning of tests returning `Result`.
#[macro_export]
macro_rules! require_capability {
    ($cap:expr) => {
        if !crate::common::has_capability($cap) {
            eprintln!("Skipping test: requires {}", $cap);
            return Ok(());
        }
    };
}

/// Skip the test if a capability is missing (for non-Result functions).
#[macro_export]
macro_rules! require_capability_void {
    ($cap:expr) => {
        if !crate::common::has_capability($cap) {
            eprintln!("Skipping test: requires {}", $cap);
            return;
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name() {
        let name1 = unique_name("test");
        let name2 = unique_name("test");
        assert_ne!(name1, name2);
        assert!(name1.starts_with("afsock-test-test-"));
    }

    #[test]
    fn test_socket_path_fits() {
        let path = SocketPath::new("fits");
        assert!(path.address().encode().is_ok());
    }
}
