//! Line tracking from the three track sensors.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::rover::Reading;
use serde::{Deserialize, Serialize};

use super::Maneuver;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Track sensor states, `true` meaning the sensor sees the line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrackBits {
    pub left: bool,
    pub middle: bool,
    pub right: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Which sensor last saw the line on its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSide {
    Left,
    Middle,
    Right,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TrackBits {
    /// Read the sensors of a reading.
    ///
    /// The device reports `1` when a sensor does *not* see the line, this is the only place the
    /// polarity is corrected.
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            left: reading.track_left == 0,
            middle: reading.track_middle == 0,
            right: reading.track_right == 0,
        }
    }

    pub fn none(&self) -> bool {
        !(self.left || self.middle || self.right)
    }
}

impl Default for TrackSide {
    fn default() -> Self {
        TrackSide::Middle
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Choose the maneuver which keeps the rover on the line.
///
/// A single sensor seeing the line steers towards it and is remembered in `last_side`. When the
/// line is lost the rover turns hard towards the side it was last seen on. Any other combination
/// demands nothing.
pub fn line_tracking(bits: TrackBits, last_side: &mut TrackSide) -> Option<Maneuver> {
    match (bits.left, bits.middle, bits.right) {
        (false, true, false) => {
            *last_side = TrackSide::Middle;
            Some(Maneuver::GoAhead)
        }
        (true, false, false) => {
            *last_side = TrackSide::Left;
            Some(Maneuver::SlightLeft)
        }
        (false, false, true) => {
            *last_side = TrackSide::Right;
            Some(Maneuver::SlightRight)
        }
        (false, false, false) => Some(match last_side {
            TrackSide::Left => Maneuver::FullLeft,
            TrackSide::Middle => Maneuver::GoAhead,
            TrackSide::Right => Maneuver::FullRight,
        }),
        _ => None,
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
