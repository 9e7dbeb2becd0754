//! TIPC and vsock tests.
//!
//! These families are kernel modules that are often absent; each test skips
//! itself unless the capability probe found the socket kind.

use std::time::Duration;

use afsock::{
    AddressFamily, AfDatagram, Capability, Error, OptionName, Result, SocketAddress,
    SocketHandle, SocketKind, SocketOption, TipcImportance,
};

use crate::common::abstract_address;

#[test]
fn test_foreign_family_options_rejected() -> Result<()> {
    let sock = SocketHandle::new(AddressFamily::Unix, SocketKind::Datagram)?;
    for option in [
        SocketOption::TipcImportance(TipcImportance::High),
        SocketOption::VsockConnectTimeout(Duration::from_secs(1)),
    ] {
        match sock.set_option(option) {
            Err(Error::UnsupportedOption { option: name, family }) => {
                assert_eq!(name, option.name().as_str());
                assert_eq!(family, AddressFamily::Unix);
            }
            other => panic!("expected UnsupportedOption, got {other:?}"),
        }
    }
    assert!(matches!(
        sock.option(OptionName::VsockBufferSize),
        Err(Error::UnsupportedOption { .. })
    ));
    Ok(())
}

#[test]
fn test_tipc_address_on_unix_socket_rejected() -> Result<()> {
    let sock = AfDatagram::bind(&abstract_address("tipc-mismatch"))?;
    let err = sock
        .send_to(b"x", &SocketAddress::tipc_service(18888, 1))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
    Ok(())
}

#[test]
fn test_tipc_importance_round_trip() -> Result<()> {
    require_capability!(Capability::TipcSeqpacket);

    let sock = SocketHandle::new(AddressFamily::Tipc, SocketKind::SequentialPacket)?;
    sock.set_option(SocketOption::TipcImportance(TipcImportance::Critical))?;
    assert_eq!(
        sock.option(OptionName::TipcImportance)?,
        SocketOption::TipcImportance(TipcImportance::Critical)
    );

    sock.set_option(SocketOption::TipcDestinationDroppable(false))?;
    assert_eq!(
        sock.option(OptionName::TipcDestinationDroppable)?,
        SocketOption::TipcDestinationDroppable(false)
    );
    Ok(())
}

#[test]
fn test_tipc_sockets_have_no_peer_credentials() -> Result<()> {
    require_capability!(Capability::TipcSeqpacket);

    let sock = SocketHandle::new(AddressFamily::Tipc, SocketKind::SequentialPacket)?;
    assert!(matches!(
        sock.peer_credentials(),
        Err(Error::Unsupported(Capability::PeerCredentials))
    ));
    assert!(matches!(
        sock.send_with_fds(b"x", &[]),
        Err(Error::Unsupported(Capability::FileDescriptors))
    ));
    Ok(())
}

#[test]
fn test_vsock_connect_timeout_round_trip() -> Result<()> {
    require_capability!(Capability::Vsock);

    let sock = SocketHandle::new(AddressFamily::Vsock, SocketKind::Stream)?;
    sock.set_option(SocketOption::VsockConnectTimeout(Duration::from_secs(3)))?;
    assert_eq!(
        sock.option(OptionName::VsockConnectTimeout)?,
        SocketOption::VsockConnectTimeout(Duration::from_secs(3))
    );
    Ok(())
}

#[test]
fn test_vsock_unix_only_features() -> Result<()> {
    require_capability!(Capability::Vsock);

    let sock = SocketHandle::new(AddressFamily::Vsock, SocketKind::Stream)?;
    assert!(matches!(
        sock.bind(&abstract_address("vsock-mismatch")),
        Err(Error::InvalidAddress(_))
    ));
    assert!(sock.set_option(SocketOption::PassCredentials(true)).is_err());
    Ok(())
}
