use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::channel::mpsc::UnboundedSender;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Idle,
    CountingDown { remaining: Duration },
    Triggered,
}

/// Emitted by a running countdown. `run` identifies the `start()` that produced the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    Tick { run: u64, remaining: Duration },
    Expired { run: u64 },
}

struct TimerInner {
    state: EscalationState,
    // incremented by every start and cancel; a countdown only acts while its run is current
    run: u64,
    cancel: Option<CancellationToken>,
}

/// A restartable countdown. When `duration` elapses without a `cancel()` it moves to `Triggered`
/// and sends `TimerSignal::Expired` exactly once for that run.
///
/// `start`, `cancel` and the expiry transition all happen under one lock, so a cancel that returns
/// before the expiry transition always wins, and a cancel after it is a no-op.
#[derive(Clone)]
pub struct EscalationTimer {
    duration: Duration,
    tick: Duration,
    inner: Arc<Mutex<TimerInner>>,
    state: Arc<watch::Sender<EscalationState>>,
    signals: UnboundedSender<TimerSignal>,
}

impl EscalationTimer {
    pub fn new(duration: Duration, tick: Duration, signals: UnboundedSender<TimerSignal>) -> Self {
        let inner = TimerInner { state: EscalationState::Idle, run: 0, cancel: None };

        EscalationTimer {
            duration,
            tick,
            inner: Arc::new(Mutex::new(inner)),
            state: Arc::new(watch::channel(EscalationState::Idle).0),
            signals,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn state(&self) -> EscalationState {
        self.inner.lock().expect("Failed to lock escalation timer").state
    }

    pub fn subscribe(&self) -> watch::Receiver<EscalationState> {
        self.state.subscribe()
    }

    /// Whether `run` is the latest `start()` and has not been cancelled since.
    pub fn is_current(&self, run: u64) -> bool {
        self.inner.lock().expect("Failed to lock escalation timer").run == run
    }

    /// Restart the countdown at the full duration, abandoning any countdown in progress.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> u64 {
        let cancel = CancellationToken::new();

        let run = {
            let mut inner = self.inner.lock().expect("Failed to lock escalation timer");
            if let Some(previous) = inner.cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            inner.run += 1;
            self.set_state(&mut inner, EscalationState::CountingDown { remaining: self.duration });
            inner.run
        };

        info!("Escalation countdown started ({})", humantime::format_duration(self.duration));
        spawn(countdown(self.clone(), run, cancel));
        run
    }

    /// Stop a countdown in progress. Does nothing when idle or already triggered.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock escalation timer");

        match inner.state {
            EscalationState::CountingDown { .. } => {
                if let Some(cancel) = inner.cancel.take() {
                    cancel.cancel();
                }
                inner.run += 1;
                self.set_state(&mut inner, EscalationState::Idle);
                info!("Escalation countdown cancelled");
                true
            },
            EscalationState::Idle => false,
            EscalationState::Triggered => {
                debug!("Escalation already triggered, nothing to cancel");
                false
            },
        }
    }

    /// Return a triggered timer to idle.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("Failed to lock escalation timer");
        if inner.state == EscalationState::Triggered {
            self.set_state(&mut inner, EscalationState::Idle);
        }
    }

    fn set_state(&self, inner: &mut TimerInner, state: EscalationState) {
        inner.state = state;
        self.state.send_replace(state);
    }

    // Called by the countdown task for every tick. Returns false once the run is no longer current.
    fn on_tick(&self, run: u64, remaining: Duration) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock escalation timer");
        if inner.run != run {
            return false;
        }

        self.set_state(&mut inner, EscalationState::CountingDown { remaining });
        drop(inner);

        debug!("Escalation in {}", humantime::format_duration(remaining));
        let _ = self.signals.unbounded_send(TimerSignal::Tick { run, remaining });
        true
    }

    fn on_expire(&self, run: u64) {
        let mut inner = self.inner.lock().expect("Failed to lock escalation timer");
        if inner.run != run {
            return;
        }

        inner.cancel = None;
        self.set_state(&mut inner, EscalationState::Triggered);
        drop(inner);

        warn!("Escalation countdown expired");
        if self.signals.unbounded_send(TimerSignal::Expired { run }).is_err() {
            warn!("Nobody is listening for escalation expiry");
        }
    }
}

async fn countdown(timer: EscalationTimer, run: u64, cancel: CancellationToken) {
    let started = Instant::now();
    let deadline = started + timer.duration;
    let mut next_tick = started + timer.tick;

    loop {
        let wake = next_tick.min(deadline);

        tokio::select! {
            _ = cancel.cancelled() => {
                return;
            },
            _ = sleep_until(wake) => {},
        }

        if wake >= deadline {
            timer.on_expire(run);
            return;
        }

        if !timer.on_tick(run, deadline - wake) {
            return;
        }
        next_tick += timer.tick;
    }
}
