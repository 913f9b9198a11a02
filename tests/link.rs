mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use tokio::time::{sleep, timeout};

use common::{cane, named, settle, FakeTransport, ADDRESS};
use smartcane_host::device::link::DeviceLink;
use smartcane_host::device::types::{AdapterStatus, DeviceHandle, DiscoveryEvent, LinkEvent, LinkState, SafetyEvent};
use smartcane_host::error::LinkError;

fn link(transport: &Arc<FakeTransport>) -> (DeviceLink<FakeTransport>, Receiver<SafetyEvent>) {
    let (tx, rx) = channel(16);
    (DeviceLink::new(transport.clone(), tx), rx)
}

fn handle() -> DeviceHandle {
    DeviceHandle { name: "SmartCane".to_string(), address: ADDRESS.to_string() }
}

#[tokio::test(start_paused = true)]
async fn scan_yields_only_distinct_matching_devices() {
    let transport = FakeTransport::new(vec![
        named("SmartCan", "aa"),
        named("abc", "bb"),
        DiscoveryEvent::DeviceFound { name: None, address: "cc".to_string() },
        cane("dd"),
        cane("dd"),
        named("SmartCane ", "ee"),
        cane("ff"),
    ]);
    let (link, _rx) = link(&transport);

    let handles: Vec<_> = link.scan("SmartCane").await.unwrap().collect().await;
    let addresses: Vec<_> = handles.iter().map(|h| h.address.as_str()).collect();
    assert_eq!(addresses, vec!["dd", "ff"]);
    assert_eq!(link.state(), LinkState::Scanning);

    link.finish_scan().await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(transport.counters.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scan_publishes_every_discovery() {
    let transport = FakeTransport::new(vec![named("Headphones", "aa"), cane("bb")]);
    let (link, _rx) = link(&transport);
    let mut events = link.subscribe_events();

    let _: Vec<_> = link.scan("SmartCane").await.unwrap().collect().await;

    assert!(matches!(events.try_recv().unwrap(), LinkEvent::DeviceDiscovered(h) if h.name == "Headphones"));
    assert!(matches!(events.try_recv().unwrap(), LinkEvent::DeviceDiscovered(h) if h.name == "SmartCane"));
}

#[tokio::test(start_paused = true)]
async fn scan_ends_when_the_adapter_powers_off() {
    let transport = FakeTransport::new(vec![
        DiscoveryEvent::AdapterStateChanged { powered: false },
        cane("aa"),
    ]);
    let (link, _rx) = link(&transport);

    let handles: Vec<_> = link.scan("SmartCane").await.unwrap().collect().await;
    assert!(handles.is_empty());
}

#[tokio::test(start_paused = true)]
async fn scan_checks_the_adapter_first() {
    let transport = FakeTransport::with_cane();
    let (link, _rx) = link(&transport);

    *transport.adapter.lock().unwrap() = AdapterStatus::Unsupported;
    assert!(matches!(link.scan("SmartCane").await, Err(LinkError::TransportUnsupported)));

    *transport.adapter.lock().unwrap() = AdapterStatus::Disabled;
    assert!(matches!(link.scan("SmartCane").await, Err(LinkError::TransportDisabled { .. })));

    assert_eq!(transport.discoveries(), 0);
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connect_starts_forwarding_safety_events() {
    let transport = FakeTransport::with_cane();
    let (link, mut rx) = link(&transport);

    link.connect(&handle()).await.unwrap();
    assert_eq!(link.state(), LinkState::Connected);

    transport.push(&[0x01, 0x55, 0x02]);
    assert_eq!(rx.next().await, Some(SafetyEvent::GripLost));
    assert_eq!(rx.next().await, Some(SafetyEvent::GripRegained));
}

#[tokio::test(start_paused = true)]
async fn failed_handshake_releases_the_channel_exactly_once() {
    let transport = FakeTransport::with_cane();
    transport.failing_handshakes.store(1, Ordering::SeqCst);
    let (link, _rx) = link(&transport);

    let result = link.connect(&handle()).await;

    assert!(matches!(result, Err(LinkError::ConnectFailure { .. })));
    assert!(matches!(link.state(), LinkState::Error(_)));
    assert_eq!(transport.opened(), 1);
    assert_eq!(transport.closed(), 1);
    assert_eq!(transport.open_channels(), 0);

    // a later disconnect does not close it again
    link.disconnect().await;
    assert_eq!(transport.closed(), 1);
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_stops_the_receive_loop() {
    let transport = FakeTransport::with_cane();
    let (link, mut rx) = link(&transport);
    link.connect(&handle()).await.unwrap();

    link.disconnect().await;
    link.disconnect().await;

    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(transport.closed(), 1);
    assert_eq!(transport.open_channels(), 0);

    // nothing reads the channel anymore
    transport.push(&[0x01]);
    settle().await;
    assert!(rx.try_next().is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_connection_still_ends_disconnected() {
    let transport = FakeTransport::with_cane();
    let (link, _rx) = link(&transport);

    link.disconnect().await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(transport.closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn io_failure_ends_the_loop_in_error() {
    let transport = FakeTransport::with_cane();
    let (link, _rx) = link(&transport);
    let mut events = link.subscribe_events();
    link.connect(&handle()).await.unwrap();

    transport.fail_read("connection reset");
    settle().await;

    assert!(matches!(link.state(), LinkState::Error(reason) if reason.contains("connection reset")));
    assert!(matches!(events.try_recv().unwrap(), LinkEvent::LinkDropped { .. }));
    assert_eq!(transport.closed(), 1);

    assert!(matches!(link.send(b"1").await, Err(LinkError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn send_writes_to_the_open_channel() {
    let transport = FakeTransport::with_cane();
    let (link, _rx) = link(&transport);

    assert!(matches!(link.send(b"1").await, Err(LinkError::NotConnected)));

    link.connect(&handle()).await.unwrap();
    link.send(b"1").await.unwrap();
    link.send(&[0x02]).await.unwrap();

    assert_eq!(*transport.written.lock().unwrap(), vec![b'1', 0x02]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_finishes_in_bounded_time() {
    let transport = FakeTransport::with_cane();
    let (link, _rx) = link(&transport);
    link.connect(&handle()).await.unwrap();

    let result = timeout(Duration::from_secs(5), link.disconnect()).await;
    assert!(result.is_ok());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn scan_is_refused_while_connected() {
    let transport = FakeTransport::with_cane();
    let (link, _rx) = link(&transport);
    link.connect(&handle()).await.unwrap();

    assert!(matches!(link.scan("SmartCane").await, Err(LinkError::AlreadyConnected)));

    assert_eq!(link.state(), LinkState::Connected);
    assert_eq!(link.connected_device(), Some(handle()));
    assert_eq!(transport.discoveries(), 0);
    link.send(b"1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connecting_again_releases_the_previous_channel() {
    let transport = FakeTransport::with_cane();
    let (link, mut rx) = link(&transport);

    link.connect(&handle()).await.unwrap();
    link.connect(&handle()).await.unwrap();

    assert_eq!(transport.opened(), 2);
    assert_eq!(transport.closed(), 1);
    assert_eq!(transport.open_channels(), 1);
    assert_eq!(link.state(), LinkState::Connected);

    transport.push(&[0x02]);
    assert_eq!(rx.next().await, Some(SafetyEvent::GripRegained));

    link.disconnect().await;
    assert_eq!(transport.open_channels(), 0);
    assert_eq!(link.connected_device(), None);
}
