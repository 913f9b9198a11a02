#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;

use smartcane_host::config::types::Config;
use smartcane_host::device::transport::{Channel, Transport};
use smartcane_host::device::types::{AdapterStatus, DeviceHandle, DiscoveryEvent};
use smartcane_host::error::{DeviceError, DispatchError};
use smartcane_host::safety::collaborators::EmergencyDispatcher;

pub const ADDRESS: &str = "00:11:22:33:44:55";

pub fn cane(address: &str) -> DiscoveryEvent {
    DiscoveryEvent::DeviceFound { name: Some("SmartCane".to_string()), address: address.to_string() }
}

pub fn named(name: &str, address: &str) -> DiscoveryEvent {
    DiscoveryEvent::DeviceFound { name: Some(name.to_string()), address: address.to_string() }
}

pub fn test_config() -> Config {
    Config {
        connect_attempts: 1,
        retry_delay_millis: 100,
        message_template: "{location} -> fallen here, send help".to_string(),
        ..Config::default()
    }
}

type Incoming = Result<Vec<u8>, String>;

#[derive(Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub open_channels: AtomicUsize,
    pub closed: AtomicUsize,
    pub discoveries: AtomicUsize,
    pub stopped: AtomicUsize,
}

/// An in-memory transport. Tests script the discovery results and feed bytes to the open channel.
pub struct FakeTransport {
    pub adapter: Mutex<AdapterStatus>,
    pub discovered: Mutex<Vec<DiscoveryEvent>>,
    pub discovery_delay: Mutex<Duration>,
    pub failing_handshakes: AtomicUsize,
    pub counters: Arc<Counters>,
    pub written: Arc<Mutex<Vec<u8>>>,
    pub opened_handles: Mutex<Vec<DeviceHandle>>,
    peer: Mutex<Option<UnboundedSender<Incoming>>>,
}

impl FakeTransport {
    pub fn new(discovered: Vec<DiscoveryEvent>) -> Arc<Self> {
        Arc::new(FakeTransport {
            adapter: Mutex::new(AdapterStatus::Ready),
            discovered: Mutex::new(discovered),
            discovery_delay: Mutex::new(Duration::from_millis(10)),
            failing_handshakes: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
            written: Arc::new(Mutex::new(Vec::new())),
            opened_handles: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        })
    }

    pub fn with_cane() -> Arc<Self> {
        FakeTransport::new(vec![cane(ADDRESS)])
    }

    /// Bytes arriving from the cane.
    pub fn push(&self, bytes: &[u8]) {
        // a closed channel drops whatever the cane still sends
        if let Some(peer) = self.peer.lock().unwrap().as_ref() {
            let _ = peer.send(Ok(bytes.to_vec()));
        }
    }

    pub fn fail_read(&self, reason: &str) {
        if let Some(peer) = self.peer.lock().unwrap().as_ref() {
            let _ = peer.send(Err(reason.to_string()));
        }
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.counters.open_channels.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn discoveries(&self) -> usize {
        self.counters.discoveries.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn adapter_status(&self) -> BoxFuture<'_, AdapterStatus> {
        let status = *self.adapter.lock().unwrap();
        async move { status }.boxed()
    }

    fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, DiscoveryEvent>, DeviceError>> {
        self.counters.discoveries.fetch_add(1, Ordering::SeqCst);
        let events = self.discovered.lock().unwrap().clone();
        let delay = *self.discovery_delay.lock().unwrap();

        async move {
            let stream = stream::iter(events)
                .then(move |event| async move {
                    sleep(delay).await;
                    event
                })
                .boxed();
            Ok(stream)
        }.boxed()
    }

    fn stop_discovery(&self) -> BoxFuture<'_, ()> {
        self.counters.stopped.fetch_add(1, Ordering::SeqCst);
        async {}.boxed()
    }

    fn open(&self, handle: &DeviceHandle) -> BoxFuture<'_, Result<Box<dyn Channel>, DeviceError>> {
        self.opened_handles.lock().unwrap().push(handle.clone());
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.open_channels.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = unbounded_channel();
        *self.peer.lock().unwrap() = Some(tx);

        let fail_handshake = self.failing_handshakes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let channel: Box<dyn Channel> = Box::new(FakeChannel {
            fail_handshake,
            incoming: tokio::sync::Mutex::new(rx),
            counters: self.counters.clone(),
            written: self.written.clone(),
        });
        async move { Ok(channel) }.boxed()
    }
}

pub struct FakeChannel {
    fail_handshake: bool,
    incoming: tokio::sync::Mutex<UnboundedReceiver<Incoming>>,
    counters: Arc<Counters>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl Channel for FakeChannel {
    fn handshake(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        let fail = self.fail_handshake;
        async move {
            if fail {
                Err(DeviceError::Transport("handshake refused".to_string()))
            } else {
                Ok(())
            }
        }.boxed()
    }

    fn read(&self) -> BoxFuture<'_, Result<Vec<u8>, DeviceError>> {
        async move {
            match self.incoming.lock().await.recv().await {
                Some(Ok(bytes)) => Ok(bytes),
                Some(Err(reason)) => Err(DeviceError::Transport(reason)),
                None => Ok(Vec::new()),
            }
        }.boxed()
    }

    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), DeviceError>> {
        async move {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.open_channels.fetch_sub(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }
}

/// Remembers every message it was asked to send; optionally fails the first `failures` of them.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<String>>,
    pub failures: AtomicUsize,
}

impl RecordingDispatcher {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(RecordingDispatcher { sent: Mutex::new(Vec::new()), failures: AtomicUsize::new(failures) })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl EmergencyDispatcher for RecordingDispatcher {
    fn send_emergency_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), DispatchError>> {
        async move {
            self.sent.lock().unwrap().push(text.to_string());
            let fail = self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                Err(DispatchError::Unavailable("no signal".to_string()))
            } else {
                Ok(())
            }
        }.boxed()
    }
}

/// Let spawned tasks catch up.
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}
