//! Readiness selection tests.

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use afsock::{
    AfDatagram, AfListener, AfStream, Error, Interest, Ready, Result, Selector, SocketId,
    SocketKind,
};

use crate::common::abstract_address;

const SHORT: Option<Duration> = Some(Duration::from_millis(50));
const LONG: Option<Duration> = Some(Duration::from_secs(5));

fn keys(selector: &Selector, timeout: Option<Duration>) -> Result<Vec<(SocketId, Ready)>> {
    Ok(selector.select(timeout)?.collect())
}

#[test]
fn test_listener_becomes_acceptable() -> Result<()> {
    let addr = abstract_address("sel-accept");
    let listener: AfListener = AfListener::builder(addr.clone())
        .nonblocking(true)
        .bind()?;
    let selector = Selector::new()?;
    selector.register(listener.handle(), Interest::ACCEPTABLE)?;

    assert!(keys(&selector, SHORT)?.is_empty());

    let _client = AfStream::connect(&addr)?;
    let ready = keys(&selector, LONG)?;
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0, listener.handle().id());
    assert!(ready[0].1.is_acceptable());
    assert!(!ready[0].1.is_readable());

    let (_server, _) = listener.accept()?;
    assert!(matches!(listener.accept(), Err(Error::WouldBlock)));
    Ok(())
}

#[test]
fn test_acceptable_requires_listening() -> Result<()> {
    let (a, _b) = AfStream::pair()?;
    let selector = Selector::new()?;
    assert!(matches!(
        selector.register(a.handle(), Interest::ACCEPTABLE),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        selector.register(a.handle(), Interest::CONNECTABLE),
        Err(Error::InvalidState { .. })
    ));
    assert!(!selector.is_registered(a.handle()));
    Ok(())
}

#[test]
fn test_readable_after_write() -> Result<()> {
    let (a, mut b) = AfStream::pair()?;
    let selector = Selector::new()?;
    selector.register(a.handle(), Interest::READABLE)?;

    assert!(keys(&selector, SHORT)?.is_empty());
    b.write_all(b"ping")?;

    let ready = keys(&selector, LONG)?;
    assert_eq!(ready, vec![(a.handle().id(), Ready::READABLE)]);
    Ok(())
}

#[test]
fn test_reregister_changes_interest() -> Result<()> {
    let (a, _b) = AfDatagram::pair(SocketKind::Datagram)?;
    let selector = Selector::new()?;
    selector.register(a.handle(), Interest::READABLE)?;
    assert!(keys(&selector, SHORT)?.is_empty());

    selector.register(a.handle(), Interest::READABLE | Interest::WRITABLE)?;
    assert_eq!(selector.len(), 1);
    assert_eq!(
        selector.interest(a.handle()),
        Some(Interest::READABLE | Interest::WRITABLE)
    );
    let ready = keys(&selector, LONG)?;
    assert_eq!(ready.len(), 1);
    assert!(ready[0].1.is_writable());
    Ok(())
}

#[test]
fn test_peer_close_reports_closed() -> Result<()> {
    let (a, b) = AfStream::pair()?;
    let selector = Selector::new()?;
    selector.register(a.handle(), Interest::READABLE)?;
    b.close()?;

    let ready = keys(&selector, LONG)?;
    assert_eq!(ready.len(), 1);
    assert!(ready[0].1.is_closed());
    assert!(ready[0].1.is_readable());
    Ok(())
}

#[test]
fn test_close_removes_registration() -> Result<()> {
    let (a, mut b) = AfStream::pair()?;
    let selector = Selector::new()?;
    selector.register(a.handle(), Interest::READABLE)?;
    assert!(selector.is_registered(a.handle()));

    a.close()?;
    assert!(!selector.is_registered(a.handle()));
    assert!(selector.is_empty());

    // Nothing is reported for the closed handle even with data pending.
    let _ = b.write_all(b"late");
    assert!(keys(&selector, SHORT)?.is_empty());
    Ok(())
}

#[test]
fn test_deregister() -> Result<()> {
    let (a, mut b) = AfStream::pair()?;
    let selector = Selector::new()?;
    selector.register(a.handle(), Interest::READABLE)?;
    selector.deregister(a.handle())?;
    // Deregistering again is a no-op.
    selector.deregister(a.handle())?;

    b.write_all(b"ignored")?;
    assert!(keys(&selector, SHORT)?.is_empty());
    Ok(())
}

#[test]
fn test_wakeup_interrupts_select() -> Result<()> {
    let selector = Selector::new()?;
    let started = Instant::now();

    let ready = thread::scope(|s| {
        let waiter = s.spawn(|| keys(&selector, None));
        thread::sleep(Duration::from_millis(50));
        selector.wakeup().unwrap();
        waiter.join().unwrap()
    })?;

    assert!(ready.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn test_many_handles_one_cycle() -> Result<()> {
    let selector = Selector::new()?;
    let pairs: Vec<(AfStream, AfStream)> =
        (0..16).map(|_| AfStream::pair()).collect::<Result<_>>()?;
    for (a, _) in &pairs {
        selector.register(a.handle(), Interest::READABLE)?;
    }
    for (_, b) in pairs.iter().step_by(2) {
        let mut b = b;
        b.write_all(b"x")?;
    }

    let mut ready: Vec<SocketId> = keys(&selector, LONG)?.into_iter().map(|(id, _)| id).collect();
    ready.sort_by_key(|id| id.as_u64());
    let mut expected: Vec<SocketId> = pairs
        .iter()
        .step_by(2)
        .map(|(a, _)| a.handle().id())
        .collect();
    expected.sort_by_key(|id| id.as_u64());
    assert_eq!(ready, expected);
    Ok(())
}

#[test]
fn test_closed_selector() -> Result<()> {
    let (a, _b) = AfStream::pair()?;
    let selector = Selector::new()?;
    selector.register(a.handle(), Interest::READABLE)?;
    selector.close()?;
    selector.close()?;

    assert!(selector.is_closed());
    assert!(selector.is_empty());
    assert!(matches!(
        selector.register(a.handle(), Interest::READABLE),
        Err(Error::SelectorClosed)
    ));
    assert!(matches!(selector.select(SHORT), Err(Error::SelectorClosed)));
    assert!(matches!(selector.wakeup(), Err(Error::SelectorClosed)));

    // The handle itself is unaffected.
    assert!(!a.handle().is_closed());
    Ok(())
}
