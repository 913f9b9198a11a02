use std::any::Any;
use std::io;
use std::process::ExitStatus;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (runtime): {source}")]
    Runtime { #[from] source: io::Error },

    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    Device { #[from] source: DeviceError },

    #[error("Failed to start application (emergency dispatch): {source}")]
    Dispatch { #[from] source: DispatchError },
}

/// Raw errors reported by a transport backend.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("The serial service {0} is not offered by the device")]
    MissingService(uuid::Uuid),

    #[error("Device {0} is not known to the adapter")]
    UnknownDevice(String),

    #[error("The channel has been closed")]
    Closed,

    #[error("Transport failure: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No bluetooth adapter is available")]
    TransportUnsupported,

    #[error("Bluetooth is disabled: {reason}")]
    TransportDisabled { reason: String },

    #[error("Discovery completed without finding {target}")]
    ScanNoMatch { target: String },

    #[error("Failed to connect to the cane: {source}")]
    ConnectFailure { source: DeviceError },

    #[error("I/O failure on the open channel: {source}")]
    IoFailure { source: DeviceError },

    #[error("The cane is not connected")]
    NotConnected,

    #[error("A connection attempt is already in progress")]
    AttemptInProgress,

    #[error("The cane is already connected")]
    AlreadyConnected,

    #[error("The connection attempt was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to start the dispatch command: {source}")]
    Spawn { #[from] source: io::Error },

    #[error("Dispatch command failed with {status}")]
    CommandFailed { status: ExitStatus },

    #[error("Dispatch command did not finish within {after:?}")]
    TimedOut { after: std::time::Duration },

    #[error("Emergency dispatch is unavailable: {0}")]
    Unavailable(String),
}

pub fn readable_thread_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }

    format!("panic from task: [{}]", stringified)
}
