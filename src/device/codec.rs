use log::debug;

use crate::device::constants::{FRAME_GRIP_LOST, FRAME_GRIP_REGAINED};
use crate::device::types::SafetyEvent;

impl SafetyEvent {
    pub fn from_byte(byte: u8) -> Option<SafetyEvent> {
        match byte {
            FRAME_GRIP_LOST => Some(SafetyEvent::GripLost),
            FRAME_GRIP_REGAINED => Some(SafetyEvent::GripRegained),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SafetyEvent::GripLost => FRAME_GRIP_LOST,
            SafetyEvent::GripRegained => FRAME_GRIP_REGAINED,
        }
    }
}

/// Decode a chunk of bytes read from the cane.
///
/// Every frame is a single byte, so chunks may be split anywhere. Bytes that are not a known frame
/// are line noise: they are logged and skipped.
pub fn decode(bytes: &[u8]) -> impl Iterator<Item = SafetyEvent> + '_ {
    bytes.iter().filter_map(|&byte| {
        let event = SafetyEvent::from_byte(byte);
        if event.is_none() {
            debug!("Ignoring unknown frame {:02x}", byte);
        }
        event
    })
}
