//! Finalised runs and the statistics derived from their readings.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use comms_if::rover::Reading;
use serde::Serialize;
use util::time::duration_to_millis;

use crate::{
    autopilot::TrackBits,
    params::RecorderParams,
    store::{ConnectionId, RunId},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// What a run is, supplied when recording starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunInfo {
    /// Hardware id of the car driven.
    pub car: Option<String>,

    /// The connection the run was driven over.
    pub connection: Option<ConnectionId>,

    /// The autopilot drove the run.
    pub is_auto: bool,

    pub is_competitive: bool,
}

/// A completed run.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub info: RunInfo,

    pub started_at: DateTime<Utc>,

    pub stopped_at: DateTime<Utc>,

    /// Every reading received during the run, in arrival order.
    pub readings: Vec<Reading>,

    /// Arrival times of readings closer to an obstacle than the collision threshold.
    pub collisions: Vec<DateTime<Utc>>,

    /// Times the rover lost the line, autonomous runs only.
    pub off_roads: Vec<DateTime<Utc>>,

    /// Units: device units
    pub estimated_distance: f64,
}

/// Outcome of a run reported when it stops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub collisions: usize,
    pub off_roads: usize,
    pub estimated_distance: f64,
    pub last_battery_voltage: Option<f64>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Run {
    /// Build the run and derive its statistics from the readings.
    pub fn finalise(
        info: RunInfo,
        started_at: DateTime<Utc>,
        stopped_at: DateTime<Utc>,
        readings: Vec<Reading>,
        params: &RecorderParams,
    ) -> Self {
        let collisions = detect_collisions(&readings, params.collision_threshold);
        let estimated_distance = estimate_distance(&readings, params.distance_norm_ms);
        let off_roads = if info.is_auto {
            detect_off_roads(&readings)
        } else {
            Vec::new()
        };

        Self {
            info,
            started_at,
            stopped_at,
            readings,
            collisions,
            off_roads,
            estimated_distance,
        }
    }

    pub fn last_battery_voltage(&self) -> Option<f64> {
        self.readings.last().map(|r| r.battery_voltage)
    }
}

impl RunSummary {
    pub fn new(id: RunId, run: &Run) -> Self {
        Self {
            id,
            collisions: run.collisions.len(),
            off_roads: run.off_roads.len(),
            estimated_distance: run.estimated_distance,
            last_battery_voltage: run.last_battery_voltage(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Arrival time of every reading whose sonar distance is below `threshold`.
pub fn detect_collisions(readings: &[Reading], threshold: f64) -> Vec<DateTime<Utc>> {
    readings
        .iter()
        .filter(|r| r.sonar_distance < threshold)
        .map(|r| r.arrived_at)
        .collect()
}

/// Distance covered, the sum of the speeds scaled by the mean interval between readings.
///
/// Zero with fewer than two readings.
pub fn estimate_distance(readings: &[Reading], norm_ms: f64) -> f64 {
    if readings.len() < 2 {
        return 0.0;
    }

    let total_interval_ms: f64 = readings
        .windows(2)
        .map(|w| duration_to_millis(w[1].arrived_at - w[0].arrived_at).unwrap_or(0.0))
        .sum();
    let avg_interval_ms = total_interval_ms / (readings.len() - 1) as f64;

    readings.iter().map(|r| r.speed).sum::<f64>() * (avg_interval_ms / norm_ms)
}

/// Arrival time of every reading where the line was lost after having been seen.
///
/// The rover is assumed to start on the line.
pub fn detect_off_roads(readings: &[Reading]) -> Vec<DateTime<Utc>> {
    let mut on_line = true;
    let mut off_roads = Vec::new();

    for r in readings {
        let seen = !TrackBits::from_reading(r).none();
        if on_line && !seen {
            off_roads.push(r.arrived_at);
        }
        on_line = seen;
    }

    off_roads
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::loopback::{epoch, reading_at};
    use chrono::Duration;

    fn at(ms: i64) -> DateTime<Utc> {
        epoch() + Duration::milliseconds(ms)
    }

    fn off_line(ms: i64) -> Reading {
        Reading {
            track_middle: 1,
            ..reading_at(ms, 0.3)
        }
    }

    #[test]
    fn test_distance() {
        let readings: Vec<_> = [0, 50, 100].iter().map(|&ms| reading_at(ms, 1.0)).collect();
        assert_eq!(estimate_distance(&readings, 50.0), 3.0);

        // Mean interval 50 ms from uneven gaps
        let readings = vec![reading_at(0, 1.0), reading_at(30, 2.0), reading_at(100, 3.0)];
        assert_eq!(estimate_distance(&readings, 50.0), 6.0);

        assert_eq!(estimate_distance(&readings[..1], 50.0), 0.0);
        assert_eq!(estimate_distance(&[], 50.0), 0.0);
    }

    #[test]
    fn test_collisions() {
        let mut near = reading_at(50, 0.3);
        near.sonar_distance = 8.0;
        let mut far = reading_at(100, 0.3);
        far.sonar_distance = 12.0;

        let collisions = detect_collisions(&[reading_at(0, 0.3), near, far], 10.0);
        assert_eq!(collisions, vec![at(50)]);
    }

    #[test]
    fn test_off_roads() {
        let readings = vec![
            reading_at(0, 0.3),
            off_line(50),
            off_line(100),
            reading_at(150, 0.3),
            off_line(200),
        ];
        assert_eq!(detect_off_roads(&readings), vec![at(50), at(200)]);
    }

    #[test]
    fn test_finalise() {
        let readings = vec![reading_at(0, 1.0), off_line(50)];
        let params = RecorderParams::default();

        let manual = Run::finalise(RunInfo::default(), at(0), at(60), readings.clone(), &params);
        assert!(manual.off_roads.is_empty());
        assert_eq!(manual.estimated_distance, 1.3);
        assert_eq!(manual.last_battery_voltage(), Some(7.4));

        let info = RunInfo {
            is_auto: true,
            ..Default::default()
        };
        let auto = Run::finalise(info, at(0), at(60), readings, &params);
        assert_eq!(auto.off_roads, vec![at(50)]);

        let summary = RunSummary::new(RunId(3), &auto);
        assert_eq!(summary.off_roads, 1);
        assert_eq!(summary.collisions, 0);
    }
}
