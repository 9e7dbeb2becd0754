//! Address integration tests.
//!
//! Encoding, decoding and the addresses the kernel reports back.

use std::collections::HashSet;

use afsock::addr::{MAX_ABSTRACT_LEN, MAX_PATH_LEN};
use afsock::{
    AddressFamily, AfDatagram, AfListener, AfStream, Error, NativeAddress, Result, SocketAddress,
    TipcAddress, TipcScope, VsockAddress,
};

use crate::common::{SocketPath, abstract_address};

fn samples() -> Vec<SocketAddress> {
    vec![
        SocketAddress::path("/run/afsock/control.sock"),
        SocketAddress::path("relative.sock"),
        SocketAddress::path("a".repeat(MAX_PATH_LEN)),
        SocketAddress::abstract_name(b"plain"),
        SocketAddress::abstract_name([0u8, 1, 2, 0xFF, b'\\', b':']),
        SocketAddress::abstract_name(vec![b'x'; MAX_ABSTRACT_LEN]),
        SocketAddress::abstract_name(b""),
        SocketAddress::tipc_service(18888, 17),
        SocketAddress::Tipc(TipcAddress::Service {
            service_type: 1000,
            instance: 1,
            scope: TipcScope::Node,
        }),
        SocketAddress::Tipc(TipcAddress::service_range(1000, 10, 20)),
        SocketAddress::Tipc(TipcAddress::Socket {
            port_ref: 0x1234_5678,
            node: 0x0102_0304,
        }),
        SocketAddress::vsock(VsockAddress::CID_HOST, 5000),
        SocketAddress::vsock(VsockAddress::CID_ANY, VsockAddress::PORT_ANY),
    ]
}

#[test]
fn test_encode_decode_round_trip() {
    for addr in samples() {
        let native = addr.encode().unwrap();
        assert_eq!(native.family(), addr.family(), "{addr}");
        assert_eq!(native.decode().unwrap(), addr, "{addr}");
        assert_eq!(
            SocketAddress::decode(native.as_bytes(), addr.family()).unwrap(),
            addr
        );
    }
}

#[test]
fn test_text_round_trip() {
    for addr in samples() {
        let text = addr.to_string();
        let parsed: SocketAddress = text.parse().unwrap();
        assert_eq!(parsed, addr, "{text}");
    }
}

#[test]
fn test_native_equality_and_hash() {
    let mut seen = HashSet::new();
    for addr in samples() {
        assert!(seen.insert(addr.encode().unwrap()));
    }
    for addr in samples() {
        assert!(seen.contains(&addr.encode().unwrap()));
    }

    let a = NativeAddress::from_raw(
        AddressFamily::Unix,
        SocketAddress::path("/tmp/x").encode().unwrap().as_bytes(),
    )
    .unwrap();
    assert_eq!(a, SocketAddress::path("/tmp/x").encode().unwrap());
}

#[test]
fn test_invalid_addresses() {
    let too_long = SocketAddress::path("a".repeat(MAX_PATH_LEN + 1));
    assert!(matches!(too_long.encode(), Err(Error::InvalidAddress(_))));

    let abstract_too_long = SocketAddress::abstract_name(vec![b'x'; MAX_ABSTRACT_LEN + 1]);
    assert!(matches!(
        abstract_too_long.encode(),
        Err(Error::InvalidAddress(_))
    ));

    assert!(matches!(
        SocketAddress::path("").encode(),
        Err(Error::InvalidAddress(_))
    ));

    let inverted = SocketAddress::Tipc(TipcAddress::service_range(1, 20, 10));
    assert!(matches!(inverted.encode(), Err(Error::InvalidAddress(_))));
}

#[test]
fn test_malformed_raw_bytes() {
    // Too short for even the family field.
    assert!(matches!(
        SocketAddress::decode(&[1], AddressFamily::Unix),
        Err(Error::MalformedAddress(_))
    ));

    // Unix bytes claimed as vsock.
    let unix = SocketAddress::path("/tmp/y").encode().unwrap();
    assert!(matches!(
        SocketAddress::decode(unix.as_bytes(), AddressFamily::Vsock),
        Err(Error::MalformedAddress(_))
    ));
}

#[test]
fn test_bound_path_reported_back() -> Result<()> {
    let path = SocketPath::new("addr-path");
    let listener: AfListener = AfListener::bind(&path.address())?;
    assert_eq!(listener.local_address()?, path.address());

    let client = AfStream::connect(&path.address())?;
    let (server, peer) = listener.accept()?;
    // The client never bound, so the kernel reports no name for it.
    assert_eq!(peer, SocketAddress::Unnamed);
    assert_eq!(client.peer_address()?, path.address());
    assert_eq!(server.local_address()?, path.address());
    Ok(())
}

#[test]
fn test_bound_abstract_reported_back() -> Result<()> {
    require_capability!(afsock::Capability::AbstractNamespace);

    let addr = abstract_address("addr-abstract");
    let sock = AfDatagram::bind(&addr)?;
    assert_eq!(sock.local_address()?, addr);
    assert!(sock.local_address()?.is_abstract());
    Ok(())
}

#[test]
fn test_family_mismatch_rejected() -> Result<()> {
    let path = SocketPath::new("addr-mismatch");
    let sock = AfDatagram::bind(&path.address())?;
    let err = sock
        .send_to(b"x", &SocketAddress::vsock(VsockAddress::CID_HOST, 1))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
    Ok(())
}
