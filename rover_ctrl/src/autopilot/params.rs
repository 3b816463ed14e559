//! Parameters structure for the Autopilot

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::Maneuver;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the Autopilot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotParams {
    /// Movement demanded for each maneuver.
    pub maneuvers: ManeuverTable,

    /// The two angles the sonar is swept between.
    ///
    /// Units: degrees
    pub scan_angles_deg: [i32; 2],

    /// An obstacle closer than this triggers avoidance.
    ///
    /// Units: device units
    pub avoidance_threshold: f64,

    /// How long avoidance overrides line tracking.
    ///
    /// Units: milliseconds
    pub avoidance_lockout_ms: u64,
}

/// The movement profile of every maneuver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManeuverTable {
    pub go_ahead: MoveProfile,
    pub slight_left: MoveProfile,
    pub slight_right: MoveProfile,
    pub full_left: MoveProfile,
    pub full_right: MoveProfile,
}

/// Demands sent to the rover for one maneuver, before the speed mode is applied.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveProfile {
    /// Range: -1 (right) to 1 (left)
    pub direction: f64,

    /// Range: 0..1
    pub speed: f64,

    pub thrust: i32,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Global speed scaling applied to every movement the autopilot demands.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedMode {
    Max,
    Constant,
    Min,
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown speed mode {0:?}, expected one of max, constant, min")]
pub struct ParseSpeedModeError(String);

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for AutopilotParams {
    fn default() -> Self {
        Self {
            maneuvers: ManeuverTable::default(),
            scan_angles_deg: [68, 113],
            avoidance_threshold: 30.0,
            avoidance_lockout_ms: 1500,
        }
    }
}

impl Default for ManeuverTable {
    fn default() -> Self {
        Self {
            go_ahead: MoveProfile::new(0.0, 0.3, 1),
            slight_left: MoveProfile::new(0.5, 0.5, 100),
            slight_right: MoveProfile::new(-0.5, 0.5, 1),
            full_left: MoveProfile::new(1.0, 0.7, 100),
            full_right: MoveProfile::new(-1.0, 0.7, 1),
        }
    }
}

impl ManeuverTable {
    pub fn profile(&self, maneuver: Maneuver) -> &MoveProfile {
        match maneuver {
            Maneuver::GoAhead => &self.go_ahead,
            Maneuver::SlightLeft => &self.slight_left,
            Maneuver::SlightRight => &self.slight_right,
            Maneuver::FullLeft => &self.full_left,
            Maneuver::FullRight => &self.full_right,
        }
    }
}

impl MoveProfile {
    pub fn new(direction: f64, speed: f64, thrust: i32) -> Self {
        Self {
            direction,
            speed,
            thrust,
        }
    }
}

impl Default for MoveProfile {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1)
    }
}

impl SpeedMode {
    /// Factor applied to the speed of every movement.
    pub fn multiplier(&self) -> f64 {
        match self {
            SpeedMode::Max => 1.0,
            SpeedMode::Constant => 0.5,
            SpeedMode::Min => 0.2,
        }
    }
}

impl Default for SpeedMode {
    fn default() -> Self {
        SpeedMode::Max
    }
}

impl FromStr for SpeedMode {
    type Err = ParseSpeedModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "max" => Ok(SpeedMode::Max),
            "constant" => Ok(SpeedMode::Constant),
            "min" => Ok(SpeedMode::Min),
            _ => Err(ParseSpeedModeError(s.into())),
        }
    }
}
