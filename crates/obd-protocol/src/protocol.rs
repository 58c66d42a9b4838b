//! OBD-II Protocol Selection

use serde::{Deserialize, Serialize};

/// Bus protocols an ELM327 adapter can be told to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Let the adapter search for the vehicle's protocol
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (5 baud init)
    Iso9141,
    /// ISO 14230-4 KWP (5 baud init)
    Kwp2000Slow,
    /// ISO 14230-4 KWP (fast init)
    Kwp2000Fast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Can11Bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Can29Bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Can11Bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Can29Bit250,
}

impl ObdProtocol {
    /// ELM327 protocol number used by `ATSP`
    pub fn number(&self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141 => 3,
            ObdProtocol::Kwp2000Slow => 4,
            ObdProtocol::Kwp2000Fast => 5,
            ObdProtocol::Can11Bit500 => 6,
            ObdProtocol::Can29Bit500 => 7,
            ObdProtocol::Can11Bit250 => 8,
            ObdProtocol::Can29Bit250 => 9,
        }
    }

    /// The `ATSPn` command selecting this protocol
    pub fn set_protocol_command(&self) -> String {
        format!("ATSP{}", self.number())
    }
}
