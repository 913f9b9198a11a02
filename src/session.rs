use std::sync::Arc;
use futures::channel::mpsc::channel;
use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::Config;
use crate::device::constants::EVENT_CHANNEL_CAPACITY;
use crate::device::link::DeviceLink;
use crate::device::supervisor::ConnectionSupervisor;
use crate::device::transport::Transport;
use crate::error::readable_thread_panic_error;
use crate::safety::collaborators::{EmergencyDispatcher, LocationProvider};
use crate::safety::coordinator::SafetyCoordinator;
use crate::safety::timer::EscalationTimer;
use crate::status::StatusBoard;

/// Everything that lives for one run of the application: the link to the cane, the supervisor
/// connecting it, and the coordinator escalating grip events.
///
/// Created once with `Session::start` and torn down with `Session::dispose`.
pub struct Session<T: Transport> {
    cancel: CancellationToken,
    supervisor: Arc<ConnectionSupervisor<T>>,
    timer: EscalationTimer,
    status: StatusBoard,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> Session<T> {
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        transport: Arc<T>,
        location: Arc<dyn LocationProvider>,
        dispatcher: Arc<dyn EmergencyDispatcher>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let status = StatusBoard::new();
        let (safety_sender, safety_receiver) = channel(EVENT_CHANNEL_CAPACITY);

        let link = Arc::new(DeviceLink::new(transport, safety_sender));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            link,
            config.supervisor_settings(),
            status.clone(),
            cancel.child_token(),
        ));

        let coordinator = SafetyCoordinator::new(config.coordinator_settings(), location, dispatcher, status.clone());
        let timer = coordinator.timer();

        let tasks = vec![
            coordinator.spawn(cancel.child_token(), safety_receiver),
            supervisor.spawn_link_watcher(cancel.child_token()),
        ];

        info!("Session started");
        Session { cancel, supervisor, timer, status, tasks }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor<T>> {
        &self.supervisor
    }

    pub fn link(&self) -> &Arc<DeviceLink<T>> {
        self.supervisor.link()
    }

    pub fn timer(&self) -> &EscalationTimer {
        &self.timer
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Reset a triggered escalation so the next dropped cane starts a new countdown from idle.
    pub fn acknowledge(&self) {
        self.timer.reset();
    }

    /// Disconnect from the cane and stop every task of this session.
    pub async fn dispose(self) {
        info!("Disposing session");
        self.supervisor.shutdown().await;
        self.cancel.cancel();

        for handle in self.tasks {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!("{}", readable_thread_panic_error(&err.into_panic()));
                } else {
                    error!("Session task failed: {:?}", err);
                }
            }
        }
        info!("Session disposed");
    }
}
