use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::{unbounded, Receiver, UnboundedReceiver};
use futures::StreamExt;
use log::{error, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::types::SafetyEvent;
use crate::safety::collaborators::{EmergencyDispatcher, EmergencyMessage, LocationProvider};
use crate::safety::timer::{EscalationState, EscalationTimer, TimerSignal};
use crate::status::{Notice, StatusBoard};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub countdown: Duration,
    pub tick: Duration,
    pub message_template: String,
    pub location_placeholder: String,
}

/// Turns grip events into escalation countdowns, and expired countdowns into emergency messages.
pub struct SafetyCoordinator {
    settings: CoordinatorSettings,
    timer: EscalationTimer,
    timer_signals: UnboundedReceiver<TimerSignal>,
    location: Arc<dyn LocationProvider>,
    dispatcher: Arc<dyn EmergencyDispatcher>,
    status: StatusBoard,
}

impl SafetyCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        location: Arc<dyn LocationProvider>,
        dispatcher: Arc<dyn EmergencyDispatcher>,
        status: StatusBoard,
    ) -> Self {
        let (signal_sender, timer_signals) = unbounded();
        let timer = EscalationTimer::new(settings.countdown, settings.tick, signal_sender);

        SafetyCoordinator { settings, timer, timer_signals, location, dispatcher, status }
    }

    /// A handle to the countdown, for observing it or resetting it after an escalation.
    pub fn timer(&self) -> EscalationTimer {
        self.timer.clone()
    }

    fn handle_safety_event(&self, event: SafetyEvent) {
        match event {
            SafetyEvent::GripLost => {
                warn!(
                    "Cane dropped; emergency message in {} unless it is picked up again",
                    humantime::format_duration(self.settings.countdown),
                );
                self.status.set_fall_detected(true);
                self.status.set_remaining(Some(self.settings.countdown));
                self.timer.start();
            },
            SafetyEvent::GripRegained => {
                info!("Cane picked up again");
                self.status.set_fall_detected(false);
                if self.timer.cancel() {
                    self.status.set_remaining(None);
                }
            },
        }
    }

    fn handle_timer_signal(&self, signal: TimerSignal) -> Option<JoinHandle<()>> {
        match signal {
            TimerSignal::Tick { run, remaining } => {
                if self.timer.is_current(run) && matches!(self.timer.state(), EscalationState::CountingDown { .. }) {
                    self.status.set_remaining(Some(remaining));
                }
                None
            },
            TimerSignal::Expired { run } => {
                info!("Escalation run {} expired", run);
                // a newer countdown owns the fall values; the expired run is still escalated
                if self.timer.is_current(run) {
                    self.status.set_fall_detected(false);
                    self.status.set_remaining(None);
                }
                Some(self.dispatch())
            },
        }
    }

    // The location is only asked for now; an unknown location never holds the message back.
    fn dispatch(&self) -> JoinHandle<()> {
        let settings = self.settings.clone();
        let location = self.location.clone();
        let dispatcher = self.dispatcher.clone();
        let status = self.status.clone();

        spawn(async move {
            let address = location.current_address().await;
            let message = EmergencyMessage::new(
                &settings.message_template,
                &address,
                &settings.location_placeholder,
            );

            warn!("Sending emergency message for location {}", message.location());
            match dispatcher.send_emergency_message(message.text()).await {
                Ok(()) => {
                    info!("Emergency message sent");
                    status.notify(Notice::EmergencyDispatched { text: message.text().to_string() });
                },
                Err(err) => {
                    error!("Failed to send emergency message \"{}\": {}", message.text(), err);
                    status.notify(Notice::DispatchFailed { reason: err.to_string() });
                },
            }
        })
    }

    /// Process events until `cancel` fires or the link side of the channel is gone.
    pub fn spawn(self, cancel: CancellationToken, safety_events: Receiver<SafetyEvent>) -> JoinHandle<()> {
        spawn(self.run(cancel, safety_events))
    }

    async fn run(mut self, cancel: CancellationToken, mut safety_events: Receiver<SafetyEvent>) {
        let mut dispatches: Vec<JoinHandle<()>> = Vec::new();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = safety_events.next() => match event {
                    Some(event) => self.handle_safety_event(event),
                    None => {
                        info!("Safety event channel closed");
                        break 'mainloop;
                    },
                },
                Some(signal) = self.timer_signals.next() => {
                    if let Some(handle) = self.handle_timer_signal(signal) {
                        dispatches.retain(|handle| !handle.is_finished());
                        dispatches.push(handle);
                    }
                },
            }
        }

        self.timer.cancel();

        // an emergency message already on its way is not abandoned
        for handle in dispatches {
            if let Err(err) = handle.await {
                error!("Emergency dispatch task failed: {:?}", err);
            }
        }
    }
}
