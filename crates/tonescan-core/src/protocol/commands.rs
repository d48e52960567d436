//! Protocol commands
//!
//! Defines the command frames understood by the colorimeter firmware.
//! Every frame is a fixed byte sequence; nothing is parameterized.

use serde::{Deserialize, Serialize};

/// Vendor key that unlocks the firmware after the port is opened.
///
/// Opaque to the host; must go out byte-for-byte.
pub const UNLOCK_KEY: [u8; 21] = [
    0xF0, 0x74, 0xA3, 0x8B, 0x89, 0x4B, 0x36, 0xAE, 0x6E, 0x05, 0x9B, 0x93, 0x3F, 0x44, 0xA6,
    0x4C, 0xE7, 0x51, 0x3C, 0xA5, 0x98,
];

const QUERY_NAME: [u8; 1] = [0x80];
const QUERY_VERSION: [u8; 3] = [0xA0, 0x03, 0xC0];
const TRIGGER_MEASUREMENT: [u8; 2] = [0xC0, 0x02];
const FETCH_LAB_RESULT: [u8; 5] = [0xC2, 0x02, 0x01, 0x03, 0x01];
const FETCH_FULL_REPORT: [u8; 4] = [0xC6, 0x02, 0x03, 0x01];

/// Commands for colorimeter communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Unlock handshake, sent once after every open
    Unlock,

    /// Query the device name
    QueryName,

    /// Query the firmware version
    QueryVersion,

    /// Start integrating a new measurement
    TriggerMeasurement,

    /// Fetch the last measurement as three little-endian f32 (L, a, b)
    FetchLabResult,

    /// Fetch the last measurement as an ASCII report
    FetchFullReport,
}

impl Command {
    /// Raw frame for this command
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Command::Unlock => &UNLOCK_KEY,
            Command::QueryName => &QUERY_NAME,
            Command::QueryVersion => &QUERY_VERSION,
            Command::TriggerMeasurement => &TRIGGER_MEASUREMENT,
            Command::FetchLabResult => &FETCH_LAB_RESULT,
            Command::FetchFullReport => &FETCH_FULL_REPORT,
        }
    }

    /// Identify a raw frame. Used by the simulated device.
    pub fn from_bytes(frame: &[u8]) -> Option<Command> {
        ALL_COMMANDS
            .iter()
            .copied()
            .find(|cmd| cmd.bytes() == frame)
    }

    /// Whether the firmware sends a reply the host has to read
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::Unlock | Command::TriggerMeasurement)
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Unlock => "unlock",
            Command::QueryName => "query-name",
            Command::QueryVersion => "query-version",
            Command::TriggerMeasurement => "trigger",
            Command::FetchLabResult => "fetch-lab",
            Command::FetchFullReport => "fetch-report",
        }
    }
}

const ALL_COMMANDS: [Command; 6] = [
    Command::Unlock,
    Command::QueryName,
    Command::QueryVersion,
    Command::TriggerMeasurement,
    Command::FetchLabResult,
    Command::FetchFullReport,
];

/// Unlock frame
pub fn encode_unlock() -> Vec<u8> {
    Command::Unlock.bytes().to_vec()
}

/// Trigger-measurement frame
pub fn encode_trigger_measurement() -> Vec<u8> {
    Command::TriggerMeasurement.bytes().to_vec()
}

/// Fetch-Lab frame
pub fn encode_fetch_lab_result() -> Vec<u8> {
    Command::FetchLabResult.bytes().to_vec()
}

/// Fetch-report frame
pub fn encode_fetch_full_report() -> Vec<u8> {
    Command::FetchFullReport.bytes().to_vec()
}
