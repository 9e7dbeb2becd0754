//! Stream integration tests.
//!
//! Listener lifecycle, byte ordering, close semantics and timeouts.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use afsock::{
    AddressFamily, AfListener, AfStream, Capability, ConnectStatus, Error, Interest, OptionName,
    PeerCredentials, Ready, Result, Selector, SocketAddress, SocketHandle, SocketKind,
    SocketOption, SocketState,
};

use crate::common::{SocketPath, abstract_address};

#[test]
fn test_bind_listen_accept_exchange() -> Result<()> {
    let path = SocketPath::new("exchange");
    let listener: AfListener = AfListener::builder(path.address()).backlog(1).bind()?;
    assert_eq!(listener.handle().state(), SocketState::Listening);

    let server = thread::spawn(move || -> Result<()> {
        let (mut conn, _peer) = listener.accept()?;
        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf)?;
        assert_eq!(buf, [1, 2, 3]);
        conn.write_all(&[1, 2, 3])?;

        // The client closes next; we must see end-of-stream.
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest)?;
        assert!(rest.is_empty());
        conn.close()?;
        Ok(())
    });

    let mut client = AfStream::connect(&path.address())?;
    assert_eq!(client.handle().state(), SocketState::Connected);
    client.write_all(&[1, 2, 3])?;
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf)?;
    assert_eq!(buf, [1, 2, 3]);
    client.close()?;

    server.join().unwrap()?;
    Ok(())
}

#[test]
fn test_ordering_under_chunked_reads() -> Result<()> {
    let (a, b) = AfStream::pair()?;
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let expected = payload.clone();

    let writer = thread::spawn(move || -> Result<()> {
        let mut a = a;
        for chunk in payload.chunks(4093) {
            a.write_all(chunk)?;
        }
        a.shutdown_output()
    });

    let mut b = b;
    let mut received = Vec::with_capacity(expected.len());
    let sizes = [1usize, 7, 64, 1000, 4096, 65536];
    let mut round = 0;
    loop {
        let mut buf = vec![0u8; sizes[round % sizes.len()]];
        round += 1;
        let n = b.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }

    writer.join().unwrap()?;
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "stream content reordered or corrupted");
    Ok(())
}

#[test]
fn test_closed_handle_rejects_everything() -> Result<()> {
    let handle = SocketHandle::new(AddressFamily::Unix, SocketKind::Stream)?;
    handle.close()?;
    // Double close is a no-op.
    handle.close()?;
    assert_eq!(handle.state(), SocketState::Closed);

    let addr = abstract_address("closed");
    let mut buf = [0u8; 8];
    assert!(matches!(handle.bind(&addr), Err(Error::Closed)));
    assert!(matches!(handle.listen(1), Err(Error::Closed)));
    assert!(matches!(handle.connect(&addr, None), Err(Error::Closed)));
    assert!(matches!(handle.accept(), Err(Error::Closed)));
    assert!(matches!(handle.send(b"x"), Err(Error::Closed)));
    assert!(matches!(handle.send_to(b"x", &addr), Err(Error::Closed)));
    assert!(matches!(handle.recv(&mut buf), Err(Error::Closed)));
    assert!(matches!(handle.recv_from(&mut buf), Err(Error::Closed)));
    assert!(matches!(handle.receive(8), Err(Error::Closed)));
    assert!(matches!(handle.peek_len(), Err(Error::Closed)));
    assert!(matches!(handle.shutdown(Shutdown::Both), Err(Error::Closed)));
    assert!(matches!(handle.local_address(), Err(Error::Closed)));
    assert!(matches!(handle.peer_address(), Err(Error::Closed)));
    assert!(matches!(handle.finish_connect(), Err(Error::Closed)));
    assert!(matches!(handle.set_nonblocking(true), Err(Error::Closed)));
    assert!(matches!(
        handle.set_option(SocketOption::KeepAlive(true)),
        Err(Error::Closed)
    ));
    assert!(matches!(
        handle.option(OptionName::ReceiveBufferSize),
        Err(Error::Closed)
    ));

    let selector = Selector::new()?;
    assert!(matches!(
        selector.register(&handle, Interest::READABLE),
        Err(Error::Closed)
    ));
    Ok(())
}

#[test]
fn test_close_unblocks_receiver() -> Result<()> {
    let (a, _b) = AfStream::pair()?;
    let started = Instant::now();

    let outcome = thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 16];
            a.handle().recv(&mut buf)
        });
        thread::sleep(Duration::from_millis(100));
        a.close().unwrap();
        reader.join().unwrap()
    });

    assert!(matches!(outcome, Err(Error::Closed)));
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn test_read_timeout_keeps_handle_usable() -> Result<()> {
    let (a, mut b) = AfStream::pair()?;
    a.set_read_timeout(Some(Duration::from_millis(50)))?;

    let mut buf = [0u8; 4];
    let err = a.handle().recv(&mut buf).unwrap_err();
    assert!(err.is_timeout());
    assert!(!a.handle().is_closed());

    b.write_all(b"late")?;
    assert_eq!(a.handle().recv(&mut buf)?, 4);
    assert_eq!(&buf, b"late");
    Ok(())
}

#[test]
fn test_accept_timeout() -> Result<()> {
    let listener: AfListener = AfListener::bind(&abstract_address("accept-timeout"))?;
    listener.set_accept_timeout(Some(Duration::from_millis(30)))?;
    assert!(matches!(listener.accept(), Err(Error::Timeout)));
    Ok(())
}

#[test]
fn test_connect_refused_after_listener_closed() -> Result<()> {
    let path = SocketPath::new("refused");
    let listener: AfListener = AfListener::builder(path.address()).bind()?;
    listener.close()?;

    // The socket file is left behind without unlink_on_close.
    assert!(path.path().exists());
    assert!(matches!(
        AfStream::connect(&path.address()),
        Err(Error::ConnectionRefused)
    ));

    // A second listener may take the path over.
    let listener: AfListener = AfListener::builder(path.address())
        .remove_existing(true)
        .unlink_on_close(true)
        .bind()?;
    listener.close()?;
    assert!(!path.path().exists());
    Ok(())
}

#[test]
fn test_nonblocking_connect_then_finish() -> Result<()> {
    let addr = abstract_address("nb-connect");
    let listener: AfListener = AfListener::bind(&addr)?;

    let handle = SocketHandle::new(AddressFamily::Unix, SocketKind::Stream)?;
    handle.set_nonblocking(true)?;
    match handle.connect(&addr, None)? {
        ConnectStatus::Connected => {}
        ConnectStatus::InProgress => {
            assert_eq!(handle.state(), SocketState::Connecting);
            while handle.finish_connect()? == ConnectStatus::InProgress {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
    assert_eq!(handle.state(), SocketState::Connected);

    let (server, _) = listener.accept()?;
    handle.send(b"nb")?;
    assert_eq!(&server.handle().receive(8)?.data[..], b"nb");
    Ok(())
}

/// Queue non-blocking clients on `addr` until the listen queue refuses more.
fn fill_backlog(addr: &SocketAddress) -> Result<Vec<SocketHandle>> {
    let mut queued = Vec::new();
    for _ in 0..64 {
        let client = SocketHandle::new(AddressFamily::Unix, SocketKind::Stream)?;
        client.set_nonblocking(true)?;
        match client.connect(addr, None) {
            Ok(_) => queued.push(client),
            Err(Error::WouldBlock) => {
                assert_eq!(client.state(), SocketState::Created);
                return Ok(queued);
            }
            Err(e) => return Err(e),
        }
    }
    panic!("listen queue on {addr} never filled");
}

#[test]
fn test_connect_timeout_on_full_backlog() -> Result<()> {
    let addr = abstract_address("full-backlog");
    let _listener: AfListener = AfListener::builder(addr.clone()).backlog(1).bind()?;
    let _queued = fill_backlog(&addr)?;

    let (tx, rx) = mpsc::channel();
    let target = addr.clone();
    thread::spawn(move || {
        let start = Instant::now();
        let result = SocketHandle::new(AddressFamily::Unix, SocketKind::Stream)
            .and_then(|handle| handle.connect(&target, Some(Duration::from_millis(200))));
        let _ = tx.send((result, start.elapsed()));
    });

    let (result, elapsed) = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("connect ignored its timeout");
    assert!(matches!(result, Err(Error::ConnectTimeout)), "{result:?}");
    assert!(elapsed >= Duration::from_millis(200));
    Ok(())
}

#[test]
fn test_connect_succeeds_once_backlog_drains() -> Result<()> {
    let addr = abstract_address("drain-backlog");
    let listener: AfListener = AfListener::builder(addr.clone()).backlog(1).bind()?;
    listener.set_accept_timeout(Some(Duration::from_secs(5)))?;
    let queued = fill_backlog(&addr)?;

    let drainer = thread::spawn(move || -> Result<usize> {
        thread::sleep(Duration::from_millis(100));
        let mut accepted = 0;
        for _ in 0..=queued.len() {
            listener.accept()?;
            accepted += 1;
        }
        Ok(accepted)
    });

    let handle = SocketHandle::new(AddressFamily::Unix, SocketKind::Stream)?;
    let status = handle.connect(&addr, Some(Duration::from_secs(5)))?;
    assert_eq!(status, ConnectStatus::Connected);
    assert!(drainer.join().unwrap()? >= 1);
    Ok(())
}

#[test]
fn test_close_interrupts_connect_on_full_backlog() -> Result<()> {
    let addr = abstract_address("close-connect");
    let _listener: AfListener = AfListener::builder(addr.clone()).backlog(1).bind()?;
    let _queued = fill_backlog(&addr)?;

    let handle = Arc::new(SocketHandle::new(AddressFamily::Unix, SocketKind::Stream)?);
    let connector = {
        let handle = Arc::clone(&handle);
        let addr = addr.clone();
        thread::spawn(move || handle.connect(&addr, None))
    };
    thread::sleep(Duration::from_millis(50));
    handle.close()?;
    assert!(matches!(connector.join().unwrap(), Err(Error::Closed)));
    Ok(())
}

#[test]
fn test_nonblocking_vsock_connect_finishes() -> Result<()> {
    require_capability!(Capability::Vsock);

    // Loopback CID; needs the vsock_loopback transport.
    let port = 40_000 + std::process::id() % 20_000;
    let addr: SocketAddress = format!("vsock:1:{port}").parse()?;
    let listener: AfListener = match AfListener::builder(addr.clone()).bind() {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Skipping test: no vsock loopback ({e})");
            return Ok(());
        }
    };
    listener.set_accept_timeout(Some(Duration::from_secs(5)))?;

    let handle = SocketHandle::new(AddressFamily::Vsock, SocketKind::Stream)?;
    handle.set_nonblocking(true)?;
    let status = match handle.connect(&addr, None) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Skipping test: vsock loopback refused ({e})");
            return Ok(());
        }
    };

    if status == ConnectStatus::InProgress {
        assert_eq!(handle.state(), SocketState::Connecting);
        let selector = Selector::new()?;
        selector.register(&handle, Interest::CONNECTABLE)?;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ready: Vec<_> = selector.select(Some(Duration::from_millis(100)))?.collect();
            if ready.iter().any(|(id, r)| *id == handle.id() && r.contains(Ready::CONNECTABLE)) {
                break;
            }
            assert!(Instant::now() < deadline, "connect never became connectable");
        }
        assert_eq!(handle.finish_connect()?, ConnectStatus::Connected);
    }
    assert_eq!(handle.state(), SocketState::Connected);

    let (server, _peer) = listener.accept()?;
    handle.set_nonblocking(false)?;
    handle.send(b"vs")?;
    assert_eq!(&server.handle().receive(8)?.data[..], b"vs");
    Ok(())
}

#[test]
fn test_peer_credentials_are_ours() -> Result<()> {
    require_capability!(afsock::Capability::PeerCredentials);

    let (a, b) = AfStream::pair()?;
    let ours = PeerCredentials::current();
    assert_eq!(a.peer_credentials()?, ours);
    assert_eq!(b.peer_credentials()?, ours);
    Ok(())
}

#[test]
fn test_write_after_peer_close_is_broken_pipe() -> Result<()> {
    let (a, b) = AfStream::pair()?;
    b.close()?;
    let err = a.handle().send(b"anyone there?").unwrap_err();
    assert!(err.is_broken_pipe());
    Ok(())
}

#[test]
fn test_buffer_size_options() -> Result<()> {
    let (a, _b) = AfStream::pair()?;
    a.handle()
        .set_option(SocketOption::SendBufferSize(64 * 1024))?;
    match a.handle().option(OptionName::SendBufferSize)? {
        // The kernel doubles the requested value for bookkeeping.
        SocketOption::SendBufferSize(n) => assert!(n >= 64 * 1024),
        other => panic!("unexpected option {other:?}"),
    }
    Ok(())
}
