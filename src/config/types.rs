use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_DELAY, DEVICE_NAME, SCAN_TIMEOUT};
use crate::device::supervisor::SupervisorSettings;
use crate::error::ConfigError;
use crate::safety::collaborators::EmergencyMessage;
use crate::safety::coordinator::CoordinatorSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub target_name: String,
    pub scan_timeout_secs: u64,
    pub connect_attempts: u32,
    pub retry_delay_millis: u64,
    pub countdown_secs: u64,
    pub tick_millis: u64,
    pub emergency_contact: String,
    pub message_template: String,
    pub location_placeholder: String,
    /// Program and leading arguments used to deliver the emergency message. When absent the
    /// message is only logged.
    pub dispatch_command: Option<Vec<String>>,
    /// How long the dispatch command may run before it is killed.
    pub dispatch_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_name.is_empty() {
            return Err(ConfigError::InvalidValue { field: "targetName", reason: "must not be empty".to_string() });
        }
        if self.countdown_secs == 0 {
            return Err(ConfigError::InvalidValue { field: "countdownSecs", reason: "must be at least 1".to_string() });
        }
        if self.tick_millis == 0 {
            return Err(ConfigError::InvalidValue { field: "tickMillis", reason: "must be at least 1".to_string() });
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue { field: "dispatchTimeoutSecs", reason: "must be at least 1".to_string() });
        }
        if !self.message_template.contains(EmergencyMessage::LOCATION_PLACEHOLDER) {
            return Err(ConfigError::InvalidValue {
                field: "messageTemplate",
                reason: format!("must contain {}", EmergencyMessage::LOCATION_PLACEHOLDER),
            });
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            target_name: self.target_name.clone(),
            connect_attempts: self.connect_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_millis),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            countdown: Duration::from_secs(self.countdown_secs),
            tick: Duration::from_millis(self.tick_millis),
            message_template: self.message_template.clone(),
            location_placeholder: self.location_placeholder.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_name: DEVICE_NAME.to_string(),
            scan_timeout_secs: SCAN_TIMEOUT / 1000,
            connect_attempts: 3,
            retry_delay_millis: CONNECT_DELAY,
            countdown_secs: 20,
            tick_millis: 1000,
            emergency_contact: "119".to_string(),
            message_template: "{location} -> I am a visually impaired person and I have fallen at this location. \
                Please send emergency assistance.".to_string(),
            location_placeholder: "unknown location".to_string(),
            dispatch_command: None,
            dispatch_timeout_secs: 30,
        }
    }
}
