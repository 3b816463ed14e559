//! # Rover Control Parameters
//!
//! This module provides the parameters for the rover control stack, loaded from
//! `params/rover_ctrl.toml`. Every section may be omitted, in which case its defaults are used.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

pub use crate::autopilot::AutopilotParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters of the whole stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverCtrlParams {
    pub link: LinkParams,

    pub autopilot: AutopilotParams,

    pub recorder: RecorderParams,

    pub session: SessionParams,
}

/// Parameters of the connection to the rover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkParams {
    /// Time a receive waits for a frame before giving the transport up to pending sends.
    ///
    /// Units: milliseconds
    pub recv_timeout_ms: i32,

    /// Maximum time a single frame write may take.
    ///
    /// Units: milliseconds
    pub send_timeout_ms: i32,

    /// Maximum time to establish the transport.
    ///
    /// Units: milliseconds
    pub connect_timeout_ms: i32,

    /// Maximum time to wait for the rover's handshake reply.
    ///
    /// Units: milliseconds
    pub handshake_timeout_ms: u64,
}

/// Parameters of run recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderParams {
    /// A reading with a sonar distance below this counts as a collision.
    ///
    /// Units: device units
    pub collision_threshold: f64,

    /// Time over which one unit of speed covers one unit of distance.
    ///
    /// Units: milliseconds
    pub distance_norm_ms: f64,
}

/// Parameters of client sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// A session with no activity for this long is discarded.
    ///
    /// Units: seconds
    pub inactivity_timeout_s: i64,

    /// Number of characters in a session identifier.
    pub session_id_len: usize,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 10,
            send_timeout_ms: 100,
            connect_timeout_ms: 1000,
            handshake_timeout_ms: 5000,
        }
    }
}

impl Default for RecorderParams {
    fn default() -> Self {
        Self {
            collision_threshold: 10.0,
            distance_norm_ms: 50.0,
        }
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            inactivity_timeout_s: 30 * 60,
            session_id_len: 32,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
