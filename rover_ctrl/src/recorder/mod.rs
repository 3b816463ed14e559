//! # Run Recorder
//!
//! Records the readings of a rover while a run is in progress. [`RunRecorder::start`] subscribes
//! to the link's [`ReadingBus`] and buffers every reading in arrival order. [`RunRecorder::stop`]
//! unsubscribes, derives the run statistics, hands the finished [`Run`] to the [`RunStore`] and
//! drops the buffer.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod run;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use comms_if::rover::Reading;
use log::{info, warn};
use std::sync::{Arc, Mutex};

use crate::{
    bus::{ReadingBus, SubscriptionId},
    lock,
    params::RecorderParams,
    store::{RunStore, StoreError},
};

pub use run::{
    detect_collisions, detect_off_roads, estimate_distance, Run, RunInfo, RunSummary,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct RunRecorder {
    bus: Arc<ReadingBus>,

    params: RecorderParams,

    store: Arc<dyn RunStore>,

    active: Mutex<Option<ActiveRun>>,
}

struct ActiveRun {
    info: RunInfo,

    started_at: DateTime<Utc>,

    subscription: SubscriptionId,

    buffer: Arc<Mutex<Vec<Reading>>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Cannot {0} a run, a run is {1}")]
    InvalidState(&'static str, &'static str),

    #[error("Could not save the run: {0}")]
    StoreError(StoreError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RunRecorder {
    pub fn new(bus: Arc<ReadingBus>, params: RecorderParams, store: Arc<dyn RunStore>) -> Self {
        Self {
            bus,
            params,
            store,
            active: Mutex::new(None),
        }
    }

    /// Start recording a run.
    pub fn start(&self, info: RunInfo) -> Result<(), RecorderError> {
        let mut active = lock(&self.active);

        if active.is_some() {
            return Err(RecorderError::InvalidState("start", "already being recorded"));
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sub_buffer = buffer.clone();
        let subscription = self
            .bus
            .subscribe(move |reading| lock(&sub_buffer).push(reading.clone()));

        info!(
            "Run recording started (car: {:?}, auto: {}, competitive: {})",
            info.car, info.is_auto, info.is_competitive
        );

        *active = Some(ActiveRun {
            info,
            started_at: Utc::now(),
            subscription,
            buffer,
        });

        Ok(())
    }

    /// Stop the run, save it and return its summary.
    ///
    /// The recording ends even if saving fails.
    pub fn stop(&self) -> Result<RunSummary, RecorderError> {
        let run = self
            .end()
            .ok_or(RecorderError::InvalidState("stop", "not being recorded"))?;

        let run = Run::finalise(
            run.info,
            run.started_at,
            Utc::now(),
            std::mem::take(&mut *lock(&run.buffer)),
            &self.params,
        );

        let id = self.store.save(&run).map_err(|e| {
            warn!("Run could not be saved, it is lost: {}", e);
            RecorderError::StoreError(e)
        })?;

        let summary = RunSummary::new(id, &run);
        info!(
            "Run {} recorded: {} readings, {} collisions, {} off-roads, distance {:.2}",
            id,
            run.readings.len(),
            summary.collisions,
            summary.off_roads,
            summary.estimated_distance
        );

        Ok(summary)
    }

    /// Stop recording without saving, returning `true` if a run was being recorded.
    pub fn discard(&self) -> bool {
        match self.end() {
            Some(run) => {
                info!(
                    "Run recording discarded ({} readings)",
                    lock(&run.buffer).len()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Number of readings buffered for the active run.
    pub fn num_buffered(&self) -> usize {
        lock(&self.active)
            .as_ref()
            .map(|r| lock(&r.buffer).len())
            .unwrap_or(0)
    }

    /// Leave the active state and unsubscribe.
    fn end(&self) -> Option<ActiveRun> {
        let run = lock(&self.active).take()?;
        self.bus.unsubscribe(run.subscription);
        Some(run)
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        if self.discard() {
            warn!("Recorder dropped during a run, the run was not saved");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        loopback::{epoch, reading_at},
        store::MemoryStore,
    };
    use chrono::Duration;

    fn recorder() -> (Arc<ReadingBus>, Arc<MemoryStore>, RunRecorder) {
        let bus = Arc::new(ReadingBus::new());
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(bus.clone(), RecorderParams::default(), store.clone());
        (bus, store, recorder)
    }

    #[test]
    fn test_round_trip() {
        let (bus, store, recorder) = recorder();

        // Not recorded
        bus.publish(&reading_at(-50, 5.0));

        recorder.start(RunInfo::default()).unwrap();
        for &ms in &[0, 50, 100] {
            bus.publish(&reading_at(ms, 1.0));
        }
        assert_eq!(recorder.num_buffered(), 3);

        let summary = recorder.stop().unwrap();
        assert_eq!(summary.estimated_distance, 3.0);
        assert_eq!(summary.collisions, 0);
        assert_eq!(summary.last_battery_voltage, Some(7.4));

        assert!(!recorder.is_active());
        assert_eq!(bus.num_subscribers(), 0);

        let run = store.get_run(summary.id).unwrap();
        assert_eq!(run.readings.len(), 3);
        assert_eq!(store.summary(summary.id), Some(summary));
    }

    #[test]
    fn test_collision_timestamps() {
        let (bus, store, recorder) = recorder();
        recorder.start(RunInfo::default()).unwrap();

        let mut near = reading_at(50, 0.3);
        near.sonar_distance = 8.0;
        let mut far = reading_at(100, 0.3);
        far.sonar_distance = 12.0;
        bus.publish(&reading_at(0, 0.3));
        bus.publish(&near);
        bus.publish(&far);

        let summary = recorder.stop().unwrap();
        assert_eq!(summary.collisions, 1);
        assert_eq!(
            store.get_run(summary.id).unwrap().collisions,
            vec![epoch() + Duration::milliseconds(50)]
        );
    }

    #[test]
    fn test_invalid_state() {
        let (_bus, store, recorder) = recorder();

        assert!(matches!(
            recorder.stop(),
            Err(RecorderError::InvalidState(..))
        ));

        recorder.start(RunInfo::default()).unwrap();
        assert!(matches!(
            recorder.start(RunInfo::default()),
            Err(RecorderError::InvalidState(..))
        ));

        recorder.stop().unwrap();
        assert!(matches!(
            recorder.stop(),
            Err(RecorderError::InvalidState(..))
        ));

        // Only the first stop saved a run
        assert_eq!(store.num_runs(), 1);
    }

    #[test]
    fn test_discard() {
        let (bus, store, recorder) = recorder();

        assert!(!recorder.discard());
        recorder.start(RunInfo::default()).unwrap();
        bus.publish(&reading_at(0, 1.0));

        assert!(recorder.discard());
        assert!(!recorder.is_active());
        assert_eq!(bus.num_subscribers(), 0);
        assert_eq!(store.num_runs(), 0);
    }
}
