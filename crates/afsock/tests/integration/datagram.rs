//! Datagram and sequential-packet integration tests.

use std::time::Duration;

use afsock::{
    AddressFamily, AfDatagram, AfListener, Capability, Error, ListenerBuilder, Result,
    SocketAddress, SocketKind,
};

use crate::common::{SocketPath, abstract_address};

#[test]
fn test_truncated_receive_discards_remainder() -> Result<()> {
    let server_path = SocketPath::new("dgram-trunc");
    let server = AfDatagram::bind(&server_path.address())?;
    let client = AfDatagram::new(AddressFamily::Unix, SocketKind::Datagram)?;

    client.send_to(&[0xFF; 1000], &server_path.address())?;
    client.send_to(b"next", &server_path.address())?;

    let mut buf = [0u8; 500];
    let got = server.recv_from(&mut buf)?;
    assert_eq!(got.len, 500);
    assert!(got.truncated);
    assert!(buf.iter().all(|&b| b == 0xFF));

    // The other 500 bytes are gone; the next receive is the next message.
    let got = server.recv_from(&mut buf)?;
    assert_eq!(got.len, 4);
    assert!(!got.truncated);
    assert_eq!(&buf[..4], b"next");
    Ok(())
}

#[test]
fn test_full_buffer_receive() -> Result<()> {
    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;
    a.send(&[0xFF; 1000])?;
    let mut buf = [0u8; 1000];
    let got = b.recv(&mut buf)?;
    assert_eq!(got.len, 1000);
    assert!(!got.truncated);

    a.send(&[0xAB; 10])?;
    let mut big = [0u8; 4096];
    let got = b.recv(&mut big)?;
    assert_eq!(got.len, 10);
    assert!(!got.truncated);
    Ok(())
}

#[test]
fn test_peek_len_reports_next_message() -> Result<()> {
    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;
    a.send(&[7u8; 321])?;
    assert_eq!(b.peek_len()?, 321);
    let got = b.receive(b.peek_len()?)?;
    assert_eq!(got.data.len(), 321);
    assert!(!got.truncated);
    Ok(())
}

#[test]
fn test_sender_address_on_receive() -> Result<()> {
    require_capability!(Capability::AbstractNamespace);

    let server_addr = abstract_address("dgram-server");
    let client_addr = abstract_address("dgram-client");
    let server = AfDatagram::bind(&server_addr)?;
    let client = AfDatagram::bind(&client_addr)?;

    client.send_to(b"who am i", &server_addr)?;
    let got = server.receive(64)?;
    assert_eq!(got.peer, Some(client_addr.clone()));

    server.send_to(b"you are", &got.peer.unwrap())?;
    let mut buf = [0u8; 16];
    let reply = client.recv_from(&mut buf)?;
    assert_eq!(&buf[..reply.len], b"you are");
    assert_eq!(reply.peer, Some(server_addr));
    Ok(())
}

#[test]
fn test_connected_datagram_default_destination() -> Result<()> {
    let path = SocketPath::new("dgram-connected");
    let server = AfDatagram::bind(&path.address())?;
    let client = AfDatagram::new(AddressFamily::Unix, SocketKind::Datagram)?;
    client.connect(&path.address())?;
    assert_eq!(client.peer_address()?, path.address());

    client.send(b"via connect")?;
    assert_eq!(&server.receive(32)?.data[..], b"via connect");
    Ok(())
}

#[test]
fn test_zero_length_datagram() -> Result<()> {
    require_capability!(Capability::ZeroLengthSend);

    let (a, b) = AfDatagram::pair(SocketKind::Datagram)?;
    assert_eq!(a.send(&[])?, 0);
    let mut buf = [0u8; 8];
    let got = b.recv(&mut buf)?;
    assert_eq!(got.len, 0);
    assert!(!got.truncated);
    Ok(())
}

#[test]
fn test_seqpacket_listener_preserves_boundaries() -> Result<()> {
    require_capability!(Capability::UnixSeqpacket);

    let path = SocketPath::new("seqpacket");
    let listener: AfListener<AfDatagram> = ListenerBuilder::new(path.address())
        .backlog(1)
        .bind()?;
    let client = AfDatagram::connect_seqpacket(&path.address())?;
    let (server, _peer) = listener.accept()?;
    assert_eq!(server.handle().kind(), SocketKind::SequentialPacket);

    for size in [1usize, 100, 4000] {
        client.send(&vec![size as u8; size])?;
    }
    for size in [1usize, 100, 4000] {
        let got = server.receive(8192)?;
        assert_eq!(got.data.len(), size);
    }

    // Seqpacket truncation behaves like datagrams.
    client.send(&[1u8; 64])?;
    let mut small = [0u8; 16];
    let got = server.recv(&mut small)?;
    assert_eq!(got.len, 16);
    assert!(got.truncated);

    client.close()?;
    let got = server.receive(16)?;
    assert!(got.data.is_empty());
    Ok(())
}

#[test]
fn test_receive_timeout() -> Result<()> {
    let (a, _b) = AfDatagram::pair(SocketKind::Datagram)?;
    a.set_read_timeout(Some(Duration::from_millis(25)))?;
    let mut buf = [0u8; 8];
    assert!(matches!(a.recv(&mut buf), Err(Error::Timeout)));
    Ok(())
}

#[test]
fn test_nonblocking_receive_would_block() -> Result<()> {
    let (a, _b) = AfDatagram::pair(SocketKind::SequentialPacket)?;
    a.set_nonblocking(true)?;
    let mut buf = [0u8; 8];
    let err = a.recv(&mut buf).unwrap_err();
    assert!(err.is_would_block());
    Ok(())
}

#[test]
fn test_unbound_send_to_missing_path() -> Result<()> {
    let client = AfDatagram::new(AddressFamily::Unix, SocketKind::Datagram)?;
    let missing = SocketAddress::path(SocketPath::new("dgram-missing").path());
    let err = client.send_to(b"x", &missing).unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOENT));
    Ok(())
}
