use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use log::{info, warn};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::DispatchError;

/// Produces the latest known address of the user. An empty string means unknown.
pub trait LocationProvider: Send + Sync + 'static {
    fn current_address(&self) -> BoxFuture<'_, String>;
}

/// Delivers the emergency message to the pre-configured contact.
pub trait EmergencyDispatcher: Send + Sync + 'static {
    fn send_emergency_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), DispatchError>>;
}

/// Built once when the countdown expires, consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyMessage {
    location: String,
    text: String,
}

impl EmergencyMessage {
    pub const LOCATION_PLACEHOLDER: &'static str = "{location}";

    /// `address` falls back to `placeholder` when it is empty.
    pub fn new(template: &str, address: &str, placeholder: &str) -> Self {
        let address = address.trim();
        let location = if address.is_empty() { placeholder } else { address }.to_string();
        let text = template.replace(Self::LOCATION_PLACEHOLDER, &location);
        EmergencyMessage { location, text }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A location that is set from within the process, for example by a locator task.
#[derive(Clone, Default)]
pub struct SharedLocation {
    address: Arc<RwLock<String>>,
}

impl SharedLocation {
    pub fn new(address: impl Into<String>) -> Self {
        SharedLocation { address: Arc::new(RwLock::new(address.into())) }
    }

    pub fn set(&self, address: impl Into<String>) {
        *self.address.write().expect("Failed to lock location") = address.into();
    }
}

impl SharedLocation {
    pub fn get(&self) -> String {
        self.address.read().expect("Failed to lock location").clone()
    }
}

impl LocationProvider for SharedLocation {
    fn current_address(&self) -> BoxFuture<'_, String> {
        let address = self.get();
        async move { address }.boxed()
    }
}

/// A location written to a text file by an external locator. The file is read only when asked.
pub struct FileLocation {
    path: PathBuf,
}

impl FileLocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLocation { path: path.into() }
    }
}

impl LocationProvider for FileLocation {
    fn current_address(&self) -> BoxFuture<'_, String> {
        async move {
            match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content.lines().next().unwrap_or_default().trim().to_string(),
                Err(err) => {
                    warn!("Failed to read location file {}: {}", self.path.to_string_lossy(), err);
                    String::new()
                },
            }
        }.boxed()
    }
}

/// Only writes the message to the log.
pub struct LogDispatcher {
    recipient: String,
}

impl LogDispatcher {
    pub fn new(recipient: impl Into<String>) -> Self {
        LogDispatcher { recipient: recipient.into() }
    }
}

impl EmergencyDispatcher for LogDispatcher {
    fn send_emergency_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), DispatchError>> {
        async move {
            warn!("EMERGENCY for {}: {}", self.recipient, text);
            Ok(())
        }.boxed()
    }
}

/// Runs an external program, such as an SMS gateway client, as `<program> <args..> <recipient> <text>`.
///
/// A program still running after `deadline` is killed and the dispatch fails.
pub struct CommandDispatcher {
    program: String,
    args: Vec<String>,
    recipient: String,
    deadline: Duration,
}

impl CommandDispatcher {
    pub fn new(command: &[String], recipient: impl Into<String>, deadline: Duration) -> Result<Self, DispatchError> {
        let (program, args) = command.split_first()
            .ok_or_else(|| DispatchError::Unavailable("empty dispatch command".to_string()))?;

        Ok(CommandDispatcher {
            program: program.clone(),
            args: args.to_vec(),
            recipient: recipient.into(),
            deadline,
        })
    }
}

impl EmergencyDispatcher for CommandDispatcher {
    fn send_emergency_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), DispatchError>> {
        async move {
            info!("Running {} to notify {}", self.program, self.recipient);

            let running = Command::new(&self.program)
                .args(&self.args)
                .arg(&self.recipient)
                .arg(text)
                .kill_on_drop(true)
                .status();

            let status = match timeout(self.deadline, running).await {
                Ok(status) => status?,
                Err(_) => return Err(DispatchError::TimedOut { after: self.deadline }),
            };

            if status.success() {
                Ok(())
            } else {
                Err(DispatchError::CommandFailed { status })
            }
        }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "{location} -> I have fallen here. Please send help.";

    #[test]
    fn message_contains_the_address() {
        let message = EmergencyMessage::new(TEMPLATE, "1 Main Street", "unknown location");
        assert_eq!(message.location(), "1 Main Street");
        assert_eq!(message.text(), "1 Main Street -> I have fallen here. Please send help.");
    }

    #[test]
    fn message_falls_back_to_the_placeholder() {
        let message = EmergencyMessage::new(TEMPLATE, "  ", "unknown location");
        assert_eq!(message.location(), "unknown location");
        assert!(message.text().starts_with("unknown location -> "));
    }

    #[tokio::test]
    async fn shared_location_returns_the_latest_value() {
        let location = SharedLocation::default();
        assert_eq!(location.current_address().await, "");
        location.set("Station Square 4");
        assert_eq!(location.current_address().await, "Station Square 4");
    }

    #[tokio::test]
    async fn missing_location_file_reads_as_unknown() {
        let location = FileLocation::new("/nonexistent/smartcane/location.txt");
        assert_eq!(location.current_address().await, "");
    }

    #[tokio::test]
    async fn location_file_uses_its_first_line() {
        let path = std::env::temp_dir().join(format!("smartcane-location-{}.txt", std::process::id()));
        std::fs::write(&path, "Harbour Road 12\nsecond line\n").unwrap();

        assert_eq!(FileLocation::new(&path).current_address().await, "Harbour Road 12");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn command_dispatcher_needs_a_program() {
        let result = CommandDispatcher::new(&[], "119", Duration::from_secs(30));
        assert!(matches!(result, Err(DispatchError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_dispatcher_reports_a_failing_command() {
        let ok = CommandDispatcher::new(&["true".to_string()], "119", Duration::from_secs(30)).unwrap();
        assert!(ok.send_emergency_message("help").await.is_ok());

        let failing = CommandDispatcher::new(&["false".to_string()], "119", Duration::from_secs(30)).unwrap();
        assert!(matches!(
            failing.send_emergency_message("help").await,
            Err(DispatchError::CommandFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_dispatcher_gives_up_on_a_hanging_command() {
        let command = ["sleep".to_string(), "30".to_string()];
        let hanging = CommandDispatcher::new(&command, "119", Duration::from_millis(200)).unwrap();

        let started = std::time::Instant::now();
        let result = hanging.send_emergency_message("help").await;

        assert!(matches!(result, Err(DispatchError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
