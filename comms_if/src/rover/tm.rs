//! # Rover telemetry
//!
//! Every frame the rover sends once a session is open is a snapshot of its sensors and actuators.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cmd::{AIM_CENTRE_DEG, AIM_HALF_RANGE_DEG};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Telemetry frame exactly as sent by the rover.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReading {
    pub battery_voltage: f64,

    pub photosensitive: i32,

    pub track_left: u8,

    pub track_middle: u8,

    pub track_right: u8,

    /// Some firmware versions truncate this key to `ultrasonic_di`.
    #[serde(alias = "ultrasonic_di")]
    pub ultrasonic_distance: f64,

    pub speed: f64,

    pub direction: f64,

    #[serde(rename = "headX")]
    pub head_x: f64,

    pub thrust: i32,
}

/// A decoded telemetry snapshot.
///
/// Track bits are kept exactly as reported by the device. A reported `1` means the sensor does
/// *not* see the line, consumers wanting "on line" semantics must invert them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Units: volts
    pub battery_voltage: f64,

    pub photosensitive: i32,

    pub track_left: u8,

    pub track_middle: u8,

    pub track_right: u8,

    /// Distance measured by the sonar.
    ///
    /// Units: device units (roughly centimetres)
    pub sonar_distance: f64,

    /// Current horizontal aim of the sonar head.
    ///
    /// Range: -1..1, 0 being straight ahead
    pub head_x: f64,

    pub speed: f64,

    pub direction: f64,

    pub thrust: i32,

    /// Time the frame was received, assigned by the receiver rather than the device.
    pub arrived_at: DateTime<Utc>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TmParseError {
    #[error("Telemetry contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Track sensor {0} reported {1}, expected 0 or 1")]
    InvalidTrackBit(&'static str, u8),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RawReading {
    /// Attach the arrival time to a raw frame, checking the track bits are binary.
    pub fn into_reading(self, arrived_at: DateTime<Utc>) -> Result<Reading, TmParseError> {
        check_bit("left", self.track_left)?;
        check_bit("middle", self.track_middle)?;
        check_bit("right", self.track_right)?;

        Ok(Reading {
            battery_voltage: self.battery_voltage,
            photosensitive: self.photosensitive,
            track_left: self.track_left,
            track_middle: self.track_middle,
            track_right: self.track_right,
            sonar_distance: self.ultrasonic_distance,
            head_x: self.head_x,
            speed: self.speed,
            direction: self.direction,
            thrust: self.thrust,
            arrived_at,
        })
    }
}

impl Reading {
    /// Parse a telemetry frame received at `arrived_at`.
    pub fn from_json(json_str: &str, arrived_at: DateTime<Utc>) -> Result<Self, TmParseError> {
        let raw: RawReading =
            serde_json::from_str(json_str).map_err(TmParseError::InvalidJson)?;

        raw.into_reading(arrived_at)
    }

    /// The sonar head aim converted back into degrees, 90 being straight ahead.
    pub fn head_aim_deg(&self) -> f64 {
        AIM_CENTRE_DEG as f64 + self.head_x * AIM_HALF_RANGE_DEG
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn check_bit(sensor: &'static str, bit: u8) -> Result<(), TmParseError> {
    match bit {
        0 | 1 => Ok(()),
        b => Err(TmParseError::InvalidTrackBit(sensor, b)),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
