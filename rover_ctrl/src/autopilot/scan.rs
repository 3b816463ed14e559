//! Sonar sweep and obstacle detection.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{cmp::Ordering, collections::BTreeMap};

use super::TrackSide;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Number of samples in one sweep.
pub const SAMPLES_PER_SCAN: usize = 2;

/// Added to the aim angle before flooring so `113` recovered from the normalised aim does not
/// floor to `112`.
const AIM_KEY_EPSILON: f64 = 1e-6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Distances sampled during the current sweep, keyed by whole aim angle in degrees.
#[derive(Debug, Default, Clone)]
pub struct SonarScan {
    samples: BTreeMap<i32, f64>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Result of recording one sample.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ScanOutcome {
    /// The sweep is not complete yet.
    Sampling,

    /// The sample landed on an angle already sampled, the sweep was discarded.
    Stalled,

    /// The sweep completed with nothing closer than the threshold.
    Clear,

    /// The sweep completed and the nearest sample was closer than the threshold.
    Obstacle { angle_key: i32, distance: f64 },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SonarScan {
    /// Angle the sonar should be aimed at next, or `None` once every angle has been sampled.
    pub fn next_aim(&self, scan_angles_deg: &[i32; SAMPLES_PER_SCAN]) -> Option<i32> {
        scan_angles_deg.get(self.samples.len()).copied()
    }

    /// Record the distance measured at `angle_key`.
    ///
    /// Completing the sweep evaluates it and clears the samples, so there are never more than
    /// [`SAMPLES_PER_SCAN`] of them.
    pub fn record(&mut self, angle_key: i32, distance: f64, threshold: f64) -> ScanOutcome {
        let num_before = self.samples.len();
        self.samples.insert(angle_key, distance);

        if self.samples.len() == num_before {
            self.samples.clear();
            return ScanOutcome::Stalled;
        }

        if self.samples.len() < SAMPLES_PER_SCAN {
            return ScanOutcome::Sampling;
        }

        let nearest = self
            .samples
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(&k, &d)| (k, d));
        self.samples.clear();

        match nearest {
            Some((angle_key, distance)) if distance < threshold => ScanOutcome::Obstacle {
                angle_key,
                distance,
            },
            _ => ScanOutcome::Clear,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Whole degree key under which a sample taken at `head_aim_deg` is stored.
pub fn aim_key(head_aim_deg: f64) -> i32 {
    (head_aim_deg + AIM_KEY_EPSILON).floor() as i32
}

/// Side line tracking resumes towards once avoiding an obstacle seen at `angle_key`.
pub fn avoidance_bias(angle_key: i32) -> TrackSide {
    if angle_key >= 90 {
        TrackSide::Left
    } else {
        TrackSide::Right
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
