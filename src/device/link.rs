use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use futures::channel::mpsc::Sender;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::device::codec::decode;
use crate::device::constants::{receive_stop_deadline, EVENT_CHANNEL_CAPACITY, MIN_NAME_LEN};
use crate::device::transport::{Channel, Transport};
use crate::device::types::{AdapterStatus, DeviceHandle, DiscoveryEvent, LinkEvent, LinkState, SafetyEvent};
use crate::error::{DeviceError, LinkError};

/// Whether an advertised name identifies the device we are looking for.
pub fn accepts_name(target_name: &str, name: Option<&str>) -> bool {
    match name {
        Some(name) => name.chars().count() > MIN_NAME_LEN && name == target_name,
        None => false,
    }
}

/// An opened channel that is closed at most once, however many owners try to release it.
struct LinkChannel {
    channel: Box<dyn Channel>,
    released: AtomicBool,
}

impl LinkChannel {
    fn new(channel: Box<dyn Channel>) -> Self {
        LinkChannel { channel, released: AtomicBool::new(false) }
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.channel.close().await {
            warn!("Failed to close channel: {:?}", err);
        }
    }
}

struct ReceiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the connection to one cane: discovery, the open channel and its receive loop.
///
/// The link is the only writer of its `LinkState`; everybody else reads snapshots through
/// `state()` or `subscribe_state()`.
pub struct DeviceLink<T: Transport> {
    transport: Arc<T>,
    state: Arc<watch::Sender<LinkState>>,
    events: broadcast::Sender<LinkEvent>,
    safety_sender: Sender<SafetyEvent>,
    channel: Mutex<Option<Arc<LinkChannel>>>,
    device: Mutex<Option<DeviceHandle>>,
    receive_loop: Mutex<Option<ReceiveLoop>>,
}

impl<T: Transport> DeviceLink<T> {
    pub fn new(transport: Arc<T>, safety_sender: Sender<SafetyEvent>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        DeviceLink {
            transport,
            state: Arc::new(state),
            events,
            safety_sender,
            channel: Mutex::new(None),
            device: Mutex::new(None),
            receive_loop: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// The device the link is connected to, `None` unless `Connected`.
    pub fn connected_device(&self) -> Option<DeviceHandle> {
        if !self.state().is_connected() {
            return None;
        }
        self.device.lock().expect("Failed to lock link device").clone()
    }

    fn set_state(&self, state: LinkState) {
        set_link_state(&self.state, state);
    }

    /// Start a discovery session and stream every distinct device named `target_name`.
    ///
    /// Refused while connected; the open channel has to be disconnected first.
    pub async fn scan(&self, target_name: &str) -> Result<BoxStream<'static, DeviceHandle>, LinkError> {
        if self.state().is_connected() {
            return Err(LinkError::AlreadyConnected);
        }

        match self.transport.adapter_status().await {
            AdapterStatus::Unsupported => return Err(LinkError::TransportUnsupported),
            AdapterStatus::Disabled => return Err(LinkError::TransportDisabled {
                reason: "the bluetooth adapter is turned off".to_string(),
            }),
            AdapterStatus::Ready => {},
        }

        self.set_state(LinkState::Scanning);

        let discovery = match self.transport.discover().await {
            Ok(discovery) => discovery,
            Err(err) => {
                warn!("Scanning failed {:?}", err);
                self.set_state(LinkState::Disconnected);
                return Err(LinkError::TransportDisabled { reason: err.to_string() });
            },
        };

        let events = self.events.clone();
        let target_name = target_name.to_string();
        let mut seen: HashSet<String> = HashSet::new();

        let handles = discovery
            .take_while(|event| future::ready(
                !matches!(event, DiscoveryEvent::AdapterStateChanged { powered: false })
            ))
            .filter_map(move |event| {
                let accepted = match event {
                    DiscoveryEvent::AdapterStateChanged { powered } => {
                        let _ = events.send(LinkEvent::AdapterStateChanged { powered });
                        None
                    },
                    DiscoveryEvent::DeviceFound { name, address } => {
                        let accepted = accepts_name(&target_name, name.as_deref());
                        let handle = DeviceHandle { name: name.unwrap_or_default(), address };
                        let _ = events.send(LinkEvent::DeviceDiscovered(handle.clone()));

                        if accepted && seen.insert(handle.address.clone()) {
                            Some(handle)
                        } else {
                            debug!("Ignoring discovered device {}", handle);
                            None
                        }
                    },
                };
                future::ready(accepted)
            });

        Ok(handles.boxed())
    }

    /// End the discovery session; a link that is still scanning returns to `Disconnected`.
    pub async fn finish_scan(&self) {
        self.transport.stop_discovery().await;
        self.state.send_if_modified(|state| {
            if *state == LinkState::Scanning {
                *state = LinkState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Open the serial channel to `handle` and start receiving safety events from it.
    pub async fn connect(&self, handle: &DeviceHandle) -> Result<(), LinkError> {
        let holds_channel = self.channel.lock().expect("Failed to lock link channel").is_some();
        if holds_channel || self.state().is_connected() {
            self.disconnect().await;
        }

        info!("Connecting to {}...", handle);
        self.set_state(LinkState::Connecting);

        let channel = match self.transport.open(handle).await {
            Ok(channel) => Arc::new(LinkChannel::new(channel)),
            Err(source) => {
                warn!("Opening channel to {} failed: {:?}", handle, source);
                self.set_state(LinkState::Error(source.to_string()));
                return Err(LinkError::ConnectFailure { source });
            },
        };

        // held from here on, so a disconnect while the handshake is pending still releases it
        self.channel.lock().expect("Failed to lock link channel").replace(channel.clone());

        if let Err(source) = channel.channel.handshake().await {
            warn!("Connecting to {} failed: {:?}", handle, source);
            self.channel.lock().expect("Failed to lock link channel").take();
            channel.release().await;
            self.set_state(LinkState::Error(source.to_string()));
            return Err(LinkError::ConnectFailure { source });
        }

        self.device.lock().expect("Failed to lock link device").replace(handle.clone());
        self.set_state(LinkState::Connected);
        info!("Connected to {}", handle);

        self.start_receive_loop(channel);
        Ok(())
    }

    fn start_receive_loop(&self, channel: Arc<LinkChannel>) {
        let cancel = CancellationToken::new();
        let handle = spawn(receive_loop(
            cancel.clone(),
            channel,
            self.state.clone(),
            self.events.clone(),
            self.safety_sender.clone(),
        ));

        let previous = self.receive_loop.lock().expect("Failed to lock receive loop")
            .replace(ReceiveLoop { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let channel = self.channel.lock().expect("Failed to lock link channel").clone();

        match channel {
            Some(channel) if self.state().is_connected() => {
                channel.channel.write(bytes).await
                    .map_err(|source| LinkError::IoFailure { source })
            },
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Close the channel, if any. Always leaves the link `Disconnected`.
    pub async fn disconnect(&self) {
        let receive_loop = self.receive_loop.lock().expect("Failed to lock receive loop").take();
        if let Some(ReceiveLoop { cancel, handle }) = receive_loop {
            cancel.cancel();
            info!("Waiting for receive loop to stop");
            match timeout(receive_stop_deadline(), handle).await {
                Ok(Ok(())) => info!("Receive loop stopped"),
                Ok(Err(err)) => error!("Receive loop failed: {:?}", err),
                Err(_) => warn!("Receive loop did not stop in time"),
            }
        }

        let channel = self.channel.lock().expect("Failed to lock link channel").take();
        if let Some(channel) = channel {
            channel.release().await;
        }

        self.device.lock().expect("Failed to lock link device").take();
        self.set_state(LinkState::Disconnected);
    }
}

fn set_link_state(state: &watch::Sender<LinkState>, new_state: LinkState) {
    state.send_if_modified(|current| {
        if *current == new_state {
            return false;
        }
        debug!("Link state {:?} -> {:?}", current, new_state);
        *current = new_state;
        true
    });
}

async fn receive_loop(
    cancel: CancellationToken,
    channel: Arc<LinkChannel>,
    state: Arc<watch::Sender<LinkState>>,
    events: broadcast::Sender<LinkEvent>,
    mut safety_sender: Sender<SafetyEvent>,
) {
    let failure: DeviceError = 'mainloop: loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => {
                return;
            },
            result = channel.channel.read() => match result {
                Ok(bytes) if bytes.is_empty() => break 'mainloop DeviceError::Closed,
                Ok(bytes) => bytes,
                Err(err) => break 'mainloop err,
            },
        };

        for event in decode(&bytes) {
            info!("Received {:?}", event);
            if safety_sender.send(event).await.is_err() {
                warn!("Nobody is listening for safety events anymore");
                return;
            }
        }
    };

    warn!("Receive loop stopped: {}", failure);
    channel.release().await;
    set_link_state(&state, LinkState::Error(failure.to_string()));
    let _ = events.send(LinkEvent::LinkDropped { reason: failure.to_string() });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_the_exact_target_name() {
        assert!(accepts_name("SmartCane", Some("SmartCane")));
        assert!(!accepts_name("SmartCane", Some("SmartCan")));
        assert!(!accepts_name("SmartCane", Some("SmartCane2")));
        assert!(!accepts_name("SmartCane", Some("smartcane")));
        assert!(!accepts_name("SmartCane", None));
    }

    #[test]
    fn rejects_short_names_even_when_they_match() {
        assert!(!accepts_name("abc", Some("abc")));
        assert!(!accepts_name("", Some("")));
        assert!(accepts_name("abcd", Some("abcd")));
    }
}
