use std::fmt;

/// A peer found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub name: String,
    pub address: String,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Error(String),
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyEvent {
    GripLost,
    GripRegained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Unsupported,
    Disabled,
    Ready,
}

/// What a transport reports while a discovery session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    DeviceFound {
        name: Option<String>,
        address: String,
    },
    AdapterStateChanged {
        powered: bool,
    },
}

/// Events published by a `DeviceLink` to anyone who subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    DeviceDiscovered(DeviceHandle),
    AdapterStateChanged { powered: bool },
    LinkDropped { reason: String },
}
