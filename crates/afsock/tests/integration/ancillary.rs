//! Descriptor and credential passing tests.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;

use afsock::ancillary::DEFAULT_MAX_FDS;
use afsock::{
    AfDatagram, AfStream, Capability, PeerCredentials, Result, SocketKind, SocketOption,
};

use crate::common::SocketPath;

fn scratch_file(prefix: &str) -> (SocketPath, File) {
    // Reuse the unique-path helper for an ordinary scratch file.
    let path = SocketPath::new(prefix);
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path.path())
        .unwrap();
    (path, file)
}

#[test]
fn test_pass_file_descriptor() -> Result<()> {
    require_capability!(Capability::FileDescriptors);

    let (_guard, mut file) = scratch_file("fdpass");
    let (a, b) = AfStream::pair()?;

    assert_eq!(a.send_fds(b"F", &[file.as_fd()])?, 1);
    let mut buf = [0u8; 4];
    let (n, fds) = b.recv_fds(&mut buf, DEFAULT_MAX_FDS)?;
    assert_eq!(n, 1);
    assert_eq!(&buf[..1], b"F");
    assert_eq!(fds.len(), 1);

    // Writing through the received descriptor reaches the same file.
    let mut received = File::from(fds.into_iter().next().unwrap());
    received.write_all(b"written by receiver")?;

    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    assert_eq!(contents, "written by receiver");
    Ok(())
}

#[test]
fn test_pass_several_descriptors_on_datagram() -> Result<()> {
    require_capability!(Capability::FileDescriptors);

    let (_g1, one) = scratch_file("fd-one");
    let (_g2, two) = scratch_file("fd-two");
    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;

    a.send_fds(b"two files", &[one.as_fd(), two.as_fd()])?;
    let mut buf = [0u8; 32];
    let (datagram, ancillary) = b.recv_with_ancillary(&mut buf, DEFAULT_MAX_FDS)?;
    assert_eq!(&buf[..datagram.len], b"two files");
    assert_eq!(ancillary.fds.len(), 2);
    assert!(!ancillary.truncated);
    Ok(())
}

#[test]
fn test_control_truncation_reported() -> Result<()> {
    require_capability!(Capability::FileDescriptors);

    let (_guard, file) = scratch_file("fd-many");
    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;

    let many = vec![file.as_fd(); 64];
    a.send_fds(b"x", &many)?;
    let mut buf = [0u8; 4];
    let (_, ancillary) = b.recv_with_ancillary(&mut buf, 1)?;
    assert!(ancillary.truncated);
    assert!(ancillary.fds.len() < many.len());
    Ok(())
}

#[test]
fn test_credentials_with_pass_credentials() -> Result<()> {
    require_capability!(Capability::AncillaryMessages);

    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;
    b.handle().set_option(SocketOption::PassCredentials(true))?;

    a.send(b"hello")?;
    let mut buf = [0u8; 8];
    let (_, ancillary) = b.recv_with_ancillary(&mut buf, 0)?;
    assert_eq!(ancillary.credentials, Some(PeerCredentials::current()));
    assert!(ancillary.fds.is_empty());
    Ok(())
}

#[test]
fn test_plain_message_has_no_ancillary() -> Result<()> {
    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;
    a.send(b"plain")?;
    let mut buf = [0u8; 8];
    let (datagram, ancillary) = b.recv_with_ancillary(&mut buf, DEFAULT_MAX_FDS)?;
    assert_eq!(datagram.len, 5);
    assert!(ancillary.is_empty());
    assert!(datagram.rejected.is_none());
    Ok(())
}
