//! OBD-II PID Definitions and Response Parsing
//!
//! Mode 01 parameter IDs and their decoding formulas. All formulas use
//! integer arithmetic so results match the adapter documentation exactly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::frame::normalize;
use crate::mode;

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Get the number of data bytes in a reply for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm => 2,
            _ => 1,
        }
    }

    /// Request text sent to the adapter, e.g. `010C`
    pub fn request(&self) -> String {
        format!("{:02X}{:02X}", mode::CURRENT_DATA, self.as_hex())
    }

    /// Short identifier used in logs and configuration
    pub fn name(&self) -> &'static str {
        match self {
            Pid::EngineLoad => "engine_load",
            Pid::CoolantTemp => "coolant_temp",
            Pid::IntakeManifoldPressure => "intake_manifold_pressure",
            Pid::Rpm => "rpm",
            Pid::Speed => "speed",
            Pid::ThrottlePosition => "throttle_position",
        }
    }

    /// Unit of the decoded value
    pub fn unit(&self) -> &'static str {
        match self {
            Pid::EngineLoad | Pid::ThrottlePosition => "%",
            Pid::CoolantTemp => "°C",
            Pid::IntakeManifoldPressure => "kPa",
            Pid::Rpm => "rpm",
            Pid::Speed => "km/h",
        }
    }

    /// Apply this PID's formula to its data bytes
    pub fn decode(&self, bytes: &[u8]) -> Option<i32> {
        if bytes.len() < self.response_bytes() {
            return None;
        }
        let a = i32::from(bytes[0]);
        let value = match self {
            // ((A*256)+B)/4
            Pid::Rpm => (a * 256 + i32::from(bytes[1])) / 4,
            // A - 40
            Pid::CoolantTemp => a - 40,
            // A
            Pid::Speed | Pid::IntakeManifoldPressure => a,
            // A*100/255
            Pid::EngineLoad | Pid::ThrottlePosition => a * 100 / 255,
        };
        Some(value)
    }

    /// Extract this PID's data bytes from a reply such as `41 0C 1A F0`.
    ///
    /// Whitespace and case are ignored. Returns `None` unless the reply starts
    /// with the positive response code and this PID, followed by enough hex
    /// digits for the PID's data length.
    pub fn data_bytes(&self, reply: &str) -> Option<Vec<u8>> {
        let cleaned = normalize(reply);
        let prefix = format!(
            "{:02X}{:02X}",
            mode::positive_response(mode::CURRENT_DATA),
            self.as_hex()
        );
        let data = cleaned.strip_prefix(&prefix)?;
        let digits = data.get(..self.response_bytes() * 2)?;
        hex::decode(digits).ok()
    }

    /// Parse a full reply into this PID's decoded value
    pub fn parse(&self, reply: &str) -> Option<i32> {
        self.data_bytes(reply).and_then(|bytes| self.decode(&bytes))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
