//! # Rover commands
//!
//! Encoding of [`Command`]s into the frames understood by the rover firmware.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Command code of a movement frame.
pub const CMD_MOVE: u8 = 1;

/// Command code of a sonar aim frame.
pub const CMD_AIM: u8 = 2;

/// Minimum sonar aim angle.
///
/// Units: degrees
pub const AIM_MIN_DEG: i32 = 45;

/// Maximum sonar aim angle.
///
/// Units: degrees
pub const AIM_MAX_DEG: i32 = 135;

/// Sonar aim angle which points straight ahead.
///
/// Units: degrees
pub const AIM_CENTRE_DEG: i32 = 90;

/// Half of the aim range, used to normalise angles into -1..1.
///
/// Units: degrees
pub const AIM_HALF_RANGE_DEG: f64 = 45.0;

/// Vertical aim of the sensor head, tilted slightly down towards the track.
pub const HEAD_TILT: f64 = -0.2;

/// The firmware drops commands which do not claim to come from its own client.
const IMPERSONATE_CLIENT: u8 = 1;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A command which can be sent to the rover.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Drive the rover.
    Move {
        /// Steering demand, positive to the left, negative to the right.
        ///
        /// Range: -1..1
        direction: f64,

        /// Normalised speed demand.
        ///
        /// Range: 0..1
        speed: f64,

        /// Raw thrust value forwarded to the motor driver.
        thrust: i32,
    },

    /// Point the sonar head at the given angle.
    AimSonar {
        /// Aim angle, 90 being straight ahead.
        ///
        /// Units: degrees, range: 45..135
        angle_deg: i32,
    },
}

/// Payload of a command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CmdData {
    Move {
        direction: f64,
        speed: f64,
        thrust: i32,
    },
    Aim {
        #[serde(rename = "headX")]
        head_x: f64,
        #[serde(rename = "headY")]
        head_y: f64,
    },
}

/// Errors which can occur while encoding or decoding a command.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("Sonar aim angle must be between 45 and 135 degrees, got {0}")]
    InvalidAimAngle(i32),

    #[error("Move direction must be between -1 and 1, got {0}")]
    InvalidDirection(f64),

    #[error("Move speed must be between 0 and 1, got {0}")]
    InvalidSpeed(f64),

    #[error("Could not serialize the command: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not parse the command frame: {0}")]
    DeserializeError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A command as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdFrame {
    pub cmd: u8,
    pub data: CmdData,
    pub impersonate_client: u8,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Command {
    /// Check the command's values are within the ranges accepted by the rover.
    pub fn validate(&self) -> Result<(), CmdError> {
        match *self {
            Command::Move { direction, speed, .. } => {
                if !(-1.0..=1.0).contains(&direction) {
                    return Err(CmdError::InvalidDirection(direction));
                }
                if !(0.0..=1.0).contains(&speed) {
                    return Err(CmdError::InvalidSpeed(speed));
                }
                Ok(())
            }
            Command::AimSonar { angle_deg } => {
                if !(AIM_MIN_DEG..=AIM_MAX_DEG).contains(&angle_deg) {
                    return Err(CmdError::InvalidAimAngle(angle_deg));
                }
                Ok(())
            }
        }
    }

    /// Build the wire frame for this command, validating it first.
    pub fn to_frame(&self) -> Result<CmdFrame, CmdError> {
        self.validate()?;

        let (cmd, data) = match *self {
            Command::Move { direction, speed, thrust } => (
                CMD_MOVE,
                CmdData::Move { direction, speed, thrust },
            ),
            Command::AimSonar { angle_deg } => (
                CMD_AIM,
                CmdData::Aim {
                    head_x: (angle_deg - AIM_CENTRE_DEG) as f64 / AIM_HALF_RANGE_DEG,
                    head_y: HEAD_TILT,
                },
            ),
        };

        Ok(CmdFrame {
            cmd,
            data,
            impersonate_client: IMPERSONATE_CLIENT,
        })
    }
}

impl CmdFrame {
    /// Parse a frame previously produced by [`encode`].
    pub fn from_json(json_str: &str) -> Result<Self, CmdError> {
        serde_json::from_str(json_str).map_err(CmdError::DeserializeError)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Encode a command into the JSON frame sent to the rover.
///
/// Invalid commands are rejected before anything is serialized.
pub fn encode(cmd: &Command) -> Result<String, CmdError> {
    let frame = cmd.to_frame()?;

    serde_json::to_string(&frame).map_err(CmdError::SerializationError)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
