use std::sync::Arc;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::link::DeviceLink;
use crate::device::transport::Transport;
use crate::device::types::{DeviceHandle, LinkEvent};
use crate::error::LinkError;
use crate::status::{Notice, StatusBoard};

/// Why the supervisor ended up in `SupervisorState::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    TransportUnsupported,
    TransportDisabled,
    ScanNoMatch,
    ConnectFailure(String),
    LinkLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Error(ConnectionFailure),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub target_name: String,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

/// Runs the scan → connect procedure against a `DeviceLink` and reports its progress.
///
/// At most one attempt is in flight; a second `connect()` while one runs fails immediately.
/// Once `cancel` fires, an attempt in flight is abandoned and no new attempt starts.
pub struct ConnectionSupervisor<T: Transport> {
    link: Arc<DeviceLink<T>>,
    settings: SupervisorSettings,
    status: StatusBoard,
    state: Arc<watch::Sender<SupervisorState>>,
    attempt: Mutex<()>,
    cancel: CancellationToken,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(
        link: Arc<DeviceLink<T>>,
        settings: SupervisorSettings,
        status: StatusBoard,
        cancel: CancellationToken,
    ) -> Self {
        ConnectionSupervisor {
            link,
            settings,
            status,
            state: Arc::new(watch::channel(SupervisorState::Idle).0),
            attempt: Mutex::new(()),
            cancel,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn link(&self) -> &Arc<DeviceLink<T>> {
        &self.link
    }

    fn set_state(&self, state: SupervisorState) {
        debug!("Supervisor state {:?}", state);
        self.state.send_replace(state);
    }

    fn fail(&self, failure: ConnectionFailure, notice: Notice, progress: &str) {
        self.status.set_progress(progress);
        self.status.notify(notice);
        self.set_state(SupervisorState::Error(failure));
    }

    /// Find the cane and connect to it. Returns the current device when already connected.
    pub async fn connect(&self) -> Result<DeviceHandle, LinkError> {
        let _attempt = match self.attempt.try_lock() {
            Ok(attempt) => attempt,
            Err(_) => {
                debug!("Ignoring connect request, an attempt is already in progress");
                return Err(LinkError::AttemptInProgress);
            },
        };

        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        if let Some(handle) = self.link.connected_device() {
            debug!("Already connected to {}", handle);
            return Ok(handle);
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.abandon_attempt().await;
                Err(LinkError::Cancelled)
            },
            result = self.scan_and_connect() => result,
        };

        match &result {
            Err(LinkError::Cancelled) => info!("Connection attempt cancelled"),
            Err(err) => warn!("Connecting to the cane failed: {}", err),
            Ok(_) => {},
        }
        result
    }

    // Whatever the abandoned attempt left behind (a discovery session, a channel) is released.
    async fn abandon_attempt(&self) {
        self.link.finish_scan().await;
        self.link.disconnect().await;
        self.status.set_progress("Disconnected");
        self.set_state(SupervisorState::Idle);
    }

    async fn scan_and_connect(&self) -> Result<DeviceHandle, LinkError> {
        self.set_state(SupervisorState::Scanning);
        self.status.set_progress("Scanning for cane");

        let mut handles = match self.link.scan(&self.settings.target_name).await {
            Ok(handles) => handles,
            Err(err) => {
                match &err {
                    LinkError::AlreadyConnected => self.set_state(SupervisorState::Connected),
                    LinkError::TransportUnsupported => self.fail(
                        ConnectionFailure::TransportUnsupported,
                        Notice::TransportUnsupported,
                        "Bluetooth is not supported",
                    ),
                    _ => self.fail(
                        ConnectionFailure::TransportDisabled,
                        Notice::RequestEnableTransport,
                        "Please turn on bluetooth",
                    ),
                }
                return Err(err);
            },
        };

        // the first match is locked in; whatever discovery reports afterwards is dropped with the stream
        let handle = handles.next().await;
        drop(handles);
        self.link.finish_scan().await;

        let handle = match handle {
            Some(handle) => handle,
            None => {
                info!("No device named {} found", self.settings.target_name);
                self.fail(ConnectionFailure::ScanNoMatch, Notice::CaneNotFound, "Could not find the cane");
                return Err(LinkError::ScanNoMatch { target: self.settings.target_name.clone() });
            },
        };

        info!("Found {}", handle);
        self.set_state(SupervisorState::Connecting);
        self.status.set_progress(format!("Connecting to {}..", handle.name));

        let attempts = self.settings.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.link.connect(&handle).await {
                Ok(()) => break,
                Err(err) if attempt < attempts => {
                    warn!("Connection attempt {}/{} failed: {}", attempt, attempts, err);
                    attempt += 1;
                    sleep(self.settings.retry_delay).await;
                },
                Err(err) => {
                    self.status.set_connected(false);
                    self.fail(
                        ConnectionFailure::ConnectFailure(err.to_string()),
                        Notice::ConnectionFailed { reason: err.to_string() },
                        "Error while connecting, please check the cane",
                    );
                    return Err(err);
                },
            }
        }

        self.set_state(SupervisorState::Connected);
        self.status.set_connected(true);
        self.status.set_progress(format!("Connected to {}", handle.name));
        Ok(handle)
    }

    /// From `Error`, go back to `Idle` and try again.
    pub async fn retry(&self) -> Result<DeviceHandle, LinkError> {
        if let SupervisorState::Error(failure) = self.state() {
            info!("Retrying after {:?}", failure);
            self.set_state(SupervisorState::Idle);
        }
        self.connect().await
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await;
        self.status.set_connected(false);
        self.status.set_progress("Disconnected");
        self.set_state(SupervisorState::Idle);
    }

    /// Cancel any attempt in flight, wait for it to clean up, then disconnect.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _attempt = self.attempt.lock().await;
        self.disconnect().await;
    }

    /// Disconnect when connected, otherwise connect.
    pub async fn toggle(&self) -> Result<(), LinkError> {
        if self.link.state().is_connected() {
            self.disconnect().await;
            Ok(())
        } else {
            self.retry().await.map(|_| ())
        }
    }

    fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::LinkDropped { reason } => {
                warn!("Connection lost: {}", reason);
                self.status.set_connected(false);
                self.fail(
                    ConnectionFailure::LinkLost(reason.clone()),
                    Notice::LinkLost { reason },
                    "Connection to the cane lost",
                );
            },
            LinkEvent::AdapterStateChanged { powered } => {
                info!("Bluetooth adapter powered: {}", powered);
            },
            LinkEvent::DeviceDiscovered(handle) => {
                debug!("Discovered {}", handle);
            },
        }
    }

    /// Follow the link's events so that a dropped connection is reported.
    pub fn spawn_link_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut events = self.link.subscribe_events();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = events.recv() => match event {
                        Ok(event) => supervisor.on_link_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Missed {} link events", skipped);
                        },
                        Err(broadcast::error::RecvError::Closed) => break 'mainloop,
                    },
                }
            }
        })
    }
}
