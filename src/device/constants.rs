use std::time::Duration;
use uuid::Uuid;

/**
 * The advertised name of the cane. Only a device with exactly this name is connected to.
 */
pub const DEVICE_NAME: &str = "SmartCane";

/**
 * Advertised names of this length or shorter are never considered, whatever the target name.
 */
pub const MIN_NAME_LEN: usize = 3;

/**
 * The UUID of the serial port profile service the cane exposes.
 */
pub const SPP_SERVICE: &str = "00001101-0000-1000-8000-00805f9b34fb";

/**
 * How long (milliseconds) a discovery session runs before it is considered complete.
 */
pub const SCAN_TIMEOUT: u64 = 12_000;

/**
 * How long (milliseconds) to wait between connection attempts.
 */
pub const CONNECT_DELAY: u64 = 1000;

/**
 * How long (milliseconds) a write to the cane may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) `disconnect` waits for the receive loop to stop.
 */
pub const RECEIVE_STOP_DEADLINE: u64 = 2000;

/**
 * Frame sent by the cane when the user lost grip of it.
 */
pub const FRAME_GRIP_LOST: u8 = 0x01;

/**
 * Frame sent by the cane when the user has picked it up again.
 */
pub const FRAME_GRIP_REGAINED: u8 = 0x02;

/**
 * Capacity of the channels carrying safety and link events.
 */
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub fn make_spp_service_uuid() -> Uuid {
    Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb)
}

pub fn receive_stop_deadline() -> Duration {
    Duration::from_millis(RECEIVE_STOP_DEADLINE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spp_uuid_matches_its_string_form() {
        assert_eq!(make_spp_service_uuid(), Uuid::parse_str(SPP_SERVICE).unwrap());
    }
}
