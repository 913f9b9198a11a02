use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// One-shot signals for whoever presents the state of the cane to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ConnectionFailed { reason: String },
    RequestEnableTransport,
    TransportUnsupported,
    CaneNotFound,
    LinkLost { reason: String },
    EmergencyDispatched { text: String },
    DispatchFailed { reason: String },
}

/// A point-in-time copy of every observable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// `None` until the first connection attempt finishes.
    pub connected: Option<bool>,
    pub progress: String,
    pub fall_detected: bool,
    pub remaining: Option<Duration>,
}

struct StatusInner {
    connected: watch::Sender<Option<bool>>,
    progress: watch::Sender<String>,
    fall_detected: watch::Sender<bool>,
    remaining: watch::Sender<Option<Duration>>,
    notices: broadcast::Sender<Notice>,
}

/// The observable status surface. Cloning shares the same board.
///
/// The supervisor publishes the connection values and the coordinator the fall values; consumers
/// only read.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<StatusInner>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        StatusBoard::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let inner = StatusInner {
            connected: watch::channel(None).0,
            progress: watch::channel(String::new()).0,
            fall_detected: watch::channel(false).0,
            remaining: watch::channel(None).0,
            notices: broadcast::channel(16).0,
        };
        StatusBoard { inner: Arc::new(inner) }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: *self.inner.connected.borrow(),
            progress: self.inner.progress.borrow().clone(),
            fall_detected: *self.inner.fall_detected.borrow(),
            remaining: *self.inner.remaining.borrow(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.send_replace(Some(connected));
    }

    pub fn set_progress(&self, progress: impl Into<String>) {
        self.inner.progress.send_replace(progress.into());
    }

    pub fn set_fall_detected(&self, fall_detected: bool) {
        self.inner.fall_detected.send_replace(fall_detected);
    }

    pub fn set_remaining(&self, remaining: Option<Duration>) {
        self.inner.remaining.send_replace(remaining);
    }

    pub fn notify(&self, notice: Notice) {
        // nobody listening is fine, notices are not stored
        let _ = self.inner.notices.send(notice);
    }

    pub fn watch_connected(&self) -> watch::Receiver<Option<bool>> {
        self.inner.connected.subscribe()
    }

    pub fn watch_fall_detected(&self) -> watch::Receiver<bool> {
        self.inner.fall_detected.subscribe()
    }

    pub fn watch_remaining(&self) -> watch::Receiver<Option<Duration>> {
        self.inner.remaining.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_is_unknown_at_startup() {
        let status = StatusBoard::new();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.connected, None);
        assert!(!snapshot.fall_detected);
        assert_eq!(snapshot.remaining, None);
    }

    #[test]
    fn clones_share_the_same_values() {
        let status = StatusBoard::new();
        let other = status.clone();
        other.set_connected(true);
        other.set_progress("Connecting");
        assert_eq!(status.snapshot().connected, Some(true));
        assert_eq!(status.snapshot().progress, "Connecting");
    }

    #[test]
    fn notices_reach_every_subscriber_once() {
        let status = StatusBoard::new();
        let mut first = status.notices();
        let mut second = status.notices();

        status.notify(Notice::CaneNotFound);

        assert_eq!(first.try_recv().unwrap(), Notice::CaneNotFound);
        assert_eq!(second.try_recv().unwrap(), Notice::CaneNotFound);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn watchers_see_the_latest_fall_values() {
        let status = StatusBoard::new();
        let mut connected = status.watch_connected();
        let mut fall = status.watch_fall_detected();
        let mut remaining = status.watch_remaining();

        status.set_fall_detected(true);
        status.set_remaining(Some(Duration::from_secs(20)));

        assert!(fall.has_changed().unwrap());
        assert!(*fall.borrow_and_update());
        assert_eq!(*remaining.borrow_and_update(), Some(Duration::from_secs(20)));
        assert!(!connected.has_changed().unwrap());
        assert_eq!(*connected.borrow_and_update(), None);
    }
}
