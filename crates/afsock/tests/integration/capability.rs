//! Capability integration tests.

use std::sync::Barrier;
use std::thread;

use afsock::capability::probe_count;
use afsock::{
    AddressFamily, Capability, CapabilitySet, Error, SocketHandle, SocketKind, capabilities,
};

#[test]
fn test_concurrent_first_use_probes_once() {
    let barrier = Barrier::new(8);
    let sets: Vec<&'static CapabilitySet> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    capabilities()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    for set in &sets {
        assert!(std::ptr::eq(*set, sets[0]));
        assert_eq!(**set, *sets[0]);
    }
    assert_eq!(probe_count(), 1);
}

#[test]
fn test_unix_streams_always_available() {
    let caps = capabilities();
    assert!(caps.has(Capability::UnixDomain));
    assert!(caps.supports(AddressFamily::Unix, SocketKind::Stream));
    assert!(caps.require(Capability::UnixDomain).is_ok());
}

#[test]
fn test_missing_family_fails_early() {
    for family in [AddressFamily::Tipc, AddressFamily::Vsock] {
        for kind in [
            SocketKind::Stream,
            SocketKind::Datagram,
            SocketKind::SequentialPacket,
        ] {
            if capabilities().supports(family, kind) {
                continue;
            }
            match SocketHandle::new(family, kind) {
                Err(Error::UnsupportedKind { family: f, kind: k }) => {
                    assert_eq!((f, k), (family, kind));
                }
                other => panic!("expected UnsupportedKind for {family}/{kind}, got {other:?}"),
            }
        }
    }
}

#[test]
fn test_disable_list() {
    let all = Capability::ALL
        .into_iter()
        .fold(CapabilitySet::empty(), CapabilitySet::with);

    let reduced = all.disable_from_list(" unix-datagrams ,file-descriptors,,no-such-thing");
    assert!(!reduced.has(Capability::UnixDatagrams));
    assert!(!reduced.has(Capability::FileDescriptors));
    assert!(reduced.has(Capability::UnixDomain));
    assert_eq!(reduced.iter().count(), Capability::ALL.len() - 2);

    assert!(matches!(
        reduced.require(Capability::FileDescriptors),
        Err(Error::Unsupported(Capability::FileDescriptors))
    ));
    assert!(matches!(
        reduced.require_socket(AddressFamily::Unix, SocketKind::Datagram),
        Err(Error::UnsupportedKind { .. })
    ));
}

#[test]
fn test_display_lists_names() {
    let set = CapabilitySet::empty()
        .with(Capability::UnixDomain)
        .with(Capability::Vsock);
    assert_eq!(set.to_string(), "unix-domain,vsock");
    assert_eq!("vsock".parse::<Capability>(), Ok(Capability::Vsock));
    assert!("bogus".parse::<Capability>().is_err());
}
