//! # Autopilot
//!
//! Drives the rover along a line while sweeping the sonar for obstacles. The autopilot subscribes
//! to a [`ReadingBus`] and reacts to every reading with two interleaved behaviours:
//!
//! - Sonar sweep: aims the sonar alternately at the two scan angles and, once both have been
//!   sampled, turns hard right away from anything closer than the avoidance threshold. For the
//!   lockout period after that line tracking is suspended. When it expires line tracking resumes
//!   biased towards the side away from the obstacle.
//! - Line tracking: steers from the three track sensors, see [`line_tracking`].
//!
//! All state is behind one mutex shared by the reading handler and the expiry timer. Commands are
//! decided under the lock and sent once it is released, in the order they were decided.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod params;
mod scan;
mod timer;
mod track;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use comms_if::rover::{Command, Reading};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    bus::{ReadingBus, SubscriptionId},
    link::{BindingId, CommandSink, LinkError, RoverLink, Teardown},
    lock,
};

pub use params::{AutopilotParams, ManeuverTable, MoveProfile, ParseSpeedModeError, SpeedMode};
pub use scan::{aim_key, avoidance_bias, ScanOutcome, SonarScan, SAMPLES_PER_SCAN};
pub use timer::ExpiryTimer;
pub use track::{line_tracking, TrackBits, TrackSide};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An autopilot driving one rover.
///
/// Dropping it (or [`Autopilot::disengage`]) stops it and releases its link.
pub struct Autopilot {
    core: Arc<PilotCore>,

    binding: Option<(Arc<RoverLink>, BindingId)>,
}

/// Snapshot of the autopilot state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutopilotStatus {
    pub engaged: bool,
    pub speed_mode: SpeedMode,
    pub last_track_side: TrackSide,
    pub avoidance_active: bool,
    pub avoidance_expires_at: Option<DateTime<Utc>>,
    pub pending_bias: Option<TrackSide>,
    pub num_samples: usize,
}

struct PilotCore {
    params: AutopilotParams,

    sink: Arc<dyn CommandSink>,

    bus: Arc<ReadingBus>,

    subscription: Mutex<Option<SubscriptionId>>,

    state: Mutex<AutopilotState>,
}

#[derive(Default)]
struct AutopilotState {
    speed_mode: SpeedMode,

    last_track_side: TrackSide,

    avoidance_active: bool,

    avoidance_expires_at: Option<DateTime<Utc>>,

    /// Side given to `last_track_side` when the avoidance lockout expires.
    pending_bias: Option<TrackSide>,

    scan: SonarScan,

    timer: Option<ExpiryTimer>,

    /// Incremented for each lockout so a timer which lost the race with a cancel does nothing.
    timer_generation: u64,

    torn_down: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A movement the autopilot can demand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum Maneuver {
    GoAhead,
    SlightLeft,
    SlightRight,
    FullLeft,
    FullRight,
}

#[derive(Debug, thiserror::Error)]
pub enum AutopilotError {
    #[error("An autopilot is already driving this rover")]
    AlreadyBound,

    #[error("Could not bind to the link: {0}")]
    LinkError(LinkError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Autopilot {
    /// Start driving the rover on `link`.
    ///
    /// Fails if another autopilot is already bound to the link.
    pub fn engage(link: &Arc<RoverLink>, params: AutopilotParams) -> Result<Self, AutopilotError> {
        let sink: Arc<dyn CommandSink> = link.clone();
        let core = Arc::new(PilotCore::new(params, sink, link.bus().clone()));

        let binding = link.bind_autopilot(core.clone()).map_err(|e| match e {
            LinkError::AutopilotAlreadyBound => AutopilotError::AlreadyBound,
            e => AutopilotError::LinkError(e),
        })?;

        PilotCore::subscribe(&core);

        info!("Autopilot engaged");

        Ok(Self {
            core,
            binding: Some((link.clone(), binding)),
        })
    }

    /// Start driving from `bus`, sending commands to `sink`, without binding to a link.
    pub fn attach(
        bus: &Arc<ReadingBus>,
        sink: Arc<dyn CommandSink>,
        params: AutopilotParams,
    ) -> Self {
        let core = Arc::new(PilotCore::new(params, sink, bus.clone()));
        PilotCore::subscribe(&core);

        Self {
            core,
            binding: None,
        }
    }

    /// Stop driving and release the link.
    pub fn disengage(self) {}

    /// `false` once the autopilot has been stopped, including by its link disconnecting.
    pub fn is_engaged(&self) -> bool {
        !lock(&self.core.state).torn_down
    }

    pub fn set_speed_mode(&self, mode: SpeedMode) {
        lock(&self.core.state).speed_mode = mode;
        debug!("Autopilot speed mode set to {:?}", mode);
    }

    pub fn speed_mode(&self) -> SpeedMode {
        lock(&self.core.state).speed_mode
    }

    pub fn status(&self) -> AutopilotStatus {
        self.core.status()
    }
}

impl Drop for Autopilot {
    fn drop(&mut self) {
        self.core.teardown();

        if let Some((link, id)) = self.binding.take() {
            link.unbind_autopilot(id);
        }

        info!("Autopilot disengaged");
    }
}

impl PilotCore {
    fn new(params: AutopilotParams, sink: Arc<dyn CommandSink>, bus: Arc<ReadingBus>) -> Self {
        Self {
            params,
            sink,
            bus,
            subscription: Mutex::new(None),
            state: Mutex::new(AutopilotState::default()),
        }
    }

    fn subscribe(core: &Arc<Self>) {
        let handler_core = core.clone();
        let id = core
            .bus
            .subscribe(move |reading| handler_core.on_reading(reading));

        *lock(&core.subscription) = Some(id);
    }

    fn on_reading(self: &Arc<Self>, reading: &Reading) {
        let mut cmds = Vec::with_capacity(3);

        {
            let mut state = lock(&self.state);

            if state.torn_down {
                return;
            }

            // ---- SONAR SWEEP ----

            if let Some(angle_deg) = state.scan.next_aim(&self.params.scan_angles_deg) {
                cmds.push(Command::AimSonar { angle_deg });
            }

            let angle_key = aim_key(reading.head_aim_deg());

            match state
                .scan
                .record(angle_key, reading.sonar_distance, self.params.avoidance_threshold)
            {
                ScanOutcome::Sampling => (),
                ScanOutcome::Clear => trace!("Sonar sweep clear"),
                ScanOutcome::Stalled => {
                    // A running lockout still expires and applies its bias
                    warn!("Sonar sweep stalled at {} deg, restarting it", angle_key);
                    state.avoidance_active = false;
                }
                ScanOutcome::Obstacle {
                    angle_key,
                    distance,
                } => {
                    info!(
                        "Obstacle at {} deg ({:.1} away), avoiding",
                        angle_key, distance
                    );
                    cmds.push(self.move_cmd(Maneuver::FullRight, state.speed_mode));
                    self.start_avoidance(&mut state, avoidance_bias(angle_key), reading.arrived_at);
                }
            }

            // ---- LINE TRACKING ----

            if !state.avoidance_active {
                let bits = TrackBits::from_reading(reading);
                let speed_mode = state.speed_mode;

                if let Some(maneuver) = line_tracking(bits, &mut state.last_track_side) {
                    trace!("Line tracking: {:?} -> {:?}", bits, maneuver);
                    cmds.push(self.move_cmd(maneuver, speed_mode));
                }
            }
        }

        for cmd in cmds.iter() {
            if let Err(e) = self.sink.send(cmd) {
                warn!("Autopilot could not send {:?}: {}", cmd, e);
            }
        }
    }

    fn move_cmd(&self, maneuver: Maneuver, speed_mode: SpeedMode) -> Command {
        let profile = self.params.maneuvers.profile(maneuver);

        Command::Move {
            direction: profile.direction,
            speed: profile.speed * speed_mode.multiplier(),
            thrust: profile.thrust,
        }
    }

    /// Suspend line tracking for the lockout period, replacing any lockout already running.
    fn start_avoidance(
        self: &Arc<Self>,
        state: &mut AutopilotState,
        bias: TrackSide,
        now: DateTime<Utc>,
    ) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let lockout_ms = self.params.avoidance_lockout_ms;

        let core: Weak<Self> = Arc::downgrade(self);
        let timer = ExpiryTimer::schedule(
            "avoidance_expiry",
            Duration::from_millis(lockout_ms),
            move || {
                if let Some(core) = core.upgrade() {
                    core.expire_avoidance(generation);
                }
            },
        );

        // Replacing the timer cancels the previous one
        state.timer = match timer {
            Ok(t) => Some(t),
            Err(e) => {
                error!("Could not schedule the avoidance expiry, not locking out: {}", e);
                None
            }
        };

        if state.timer.is_some() {
            state.avoidance_active = true;
            state.pending_bias = Some(bias);
            state.avoidance_expires_at =
                Some(now + ChronoDuration::milliseconds(lockout_ms as i64));
        }
    }

    fn expire_avoidance(&self, generation: u64) {
        let mut state = lock(&self.state);

        if state.torn_down || state.timer_generation != generation {
            return;
        }

        if let Some(bias) = state.pending_bias.take() {
            state.last_track_side = bias;
        }
        state.avoidance_active = false;
        state.avoidance_expires_at = None;
        state.timer = None;

        debug!(
            "Avoidance lockout expired, resuming line tracking towards {:?}",
            state.last_track_side
        );
    }

    fn status(&self) -> AutopilotStatus {
        let state = lock(&self.state);

        AutopilotStatus {
            engaged: !state.torn_down,
            speed_mode: state.speed_mode,
            last_track_side: state.last_track_side,
            avoidance_active: state.avoidance_active,
            avoidance_expires_at: state.avoidance_expires_at,
            pending_bias: state.pending_bias,
            num_samples: state.scan.len(),
        }
    }
}

impl Teardown for PilotCore {
    fn teardown(&self) {
        let subscription = lock(&self.subscription).take();
        if let Some(id) = subscription {
            self.bus.unsubscribe(id);
        }

        let mut state = lock(&self.state);
        if !state.torn_down {
            state.torn_down = true;
            state.timer = None;
            debug!("Autopilot torn down");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::loopback::{connect_loopback, connected_link, sensor_reading, RecordingSink};
    use comms_if::rover::cmd::{CmdData, CMD_AIM, CMD_MOVE};
    use std::thread;

    const ON_MIDDLE: (u8, u8, u8) = (1, 0, 1);
    const NO_LINE: (u8, u8, u8) = (1, 1, 1);

    fn pilot(lockout_ms: u64) -> (Arc<ReadingBus>, Arc<RecordingSink>, Autopilot) {
        let bus = Arc::new(ReadingBus::new());
        let sink = Arc::new(RecordingSink::default());
        let params = AutopilotParams {
            avoidance_lockout_ms: lockout_ms,
            ..Default::default()
        };

        let autopilot = Autopilot::attach(&bus, sink.clone(), params);

        (bus, sink, autopilot)
    }

    fn moves(cmds: &[Command]) -> Vec<Command> {
        cmds.iter()
            .filter(|c| matches!(c, Command::Move { .. }))
            .copied()
            .collect()
    }

    fn maneuver(m: Maneuver) -> Command {
        let p = *AutopilotParams::default().maneuvers.profile(m);
        Command::Move {
            direction: p.direction,
            speed: p.speed,
            thrust: p.thrust,
        }
    }

    /// Publish the two readings of a sweep finding an obstacle at 113 deg.
    fn trigger_avoidance(bus: &ReadingBus, sink: &RecordingSink) {
        bus.publish(&sensor_reading(ON_MIDDLE, 68.0, 50.0));
        sink.take();
        bus.publish(&sensor_reading(ON_MIDDLE, 113.0, 20.0));
    }

    #[test]
    fn test_follows_line() {
        let (bus, sink, _autopilot) = pilot(1500);

        bus.publish(&sensor_reading(ON_MIDDLE, 90.0, 100.0));

        assert_eq!(
            sink.take(),
            vec![
                Command::AimSonar { angle_deg: 68 },
                maneuver(Maneuver::GoAhead)
            ]
        );
    }

    #[test]
    fn test_line_lost_turns_to_last_side() {
        let (bus, sink, autopilot) = pilot(1500);

        // Line under the left sensor only
        bus.publish(&sensor_reading((0, 1, 1), 68.0, 100.0));
        assert_eq!(autopilot.status().last_track_side, TrackSide::Left);
        sink.take();

        bus.publish(&sensor_reading(NO_LINE, 113.0, 100.0));
        assert_eq!(moves(&sink.take()), vec![maneuver(Maneuver::FullLeft)]);
        assert_eq!(autopilot.status().last_track_side, TrackSide::Left);
    }

    #[test]
    fn test_sweep_without_obstacle() {
        let (bus, sink, autopilot) = pilot(1500);

        bus.publish(&sensor_reading(ON_MIDDLE, 68.0, 40.0));
        assert_eq!(autopilot.status().num_samples, 1);
        sink.take();

        bus.publish(&sensor_reading(ON_MIDDLE, 113.0, 45.0));
        assert_eq!(
            sink.take(),
            vec![
                Command::AimSonar { angle_deg: 113 },
                maneuver(Maneuver::GoAhead)
            ]
        );

        let status = autopilot.status();
        assert!(!status.avoidance_active);
        assert_eq!(status.num_samples, 0);
    }

    #[test]
    fn test_obstacle_triggers_avoidance() {
        let (bus, sink, autopilot) = pilot(1500);

        trigger_avoidance(&bus, &sink);

        assert_eq!(
            sink.take(),
            vec![
                Command::AimSonar { angle_deg: 113 },
                maneuver(Maneuver::FullRight)
            ]
        );

        let status = autopilot.status();
        assert!(status.avoidance_active);
        assert_eq!(status.pending_bias, Some(TrackSide::Left));
        assert_eq!(status.num_samples, 0);
        assert!(status.avoidance_expires_at.is_some());
    }

    #[test]
    fn test_avoidance_lockout() {
        let (bus, sink, autopilot) = pilot(100);

        trigger_avoidance(&bus, &sink);
        sink.take();

        // Line tracking is suspended, the sweep carries on
        bus.publish(&sensor_reading(ON_MIDDLE, 113.0, 100.0));
        assert_eq!(sink.take(), vec![Command::AimSonar { angle_deg: 68 }]);

        thread::sleep(Duration::from_millis(400));

        let status = autopilot.status();
        assert!(!status.avoidance_active);
        assert_eq!(status.pending_bias, None);
        assert_eq!(status.last_track_side, TrackSide::Left);

        bus.publish(&sensor_reading(NO_LINE, 68.0, 100.0));
        assert_eq!(moves(&sink.take()), vec![maneuver(Maneuver::FullLeft)]);
    }

    #[test]
    fn test_stalled_sweep_ends_avoidance() {
        let (bus, sink, autopilot) = pilot(100);

        trigger_avoidance(&bus, &sink);
        bus.publish(&sensor_reading(ON_MIDDLE, 90.0, 100.0));
        sink.take();

        // Head did not move, same key again
        bus.publish(&sensor_reading(ON_MIDDLE, 90.0, 100.0));
        assert_eq!(
            sink.take(),
            vec![
                Command::AimSonar { angle_deg: 113 },
                maneuver(Maneuver::GoAhead)
            ]
        );

        let status = autopilot.status();
        assert!(!status.avoidance_active);
        assert_eq!(status.num_samples, 0);
        assert_eq!(status.last_track_side, TrackSide::Middle);
        assert_eq!(status.pending_bias, Some(TrackSide::Left));

        // The lockout keeps running and still steers back away from the obstacle
        thread::sleep(Duration::from_millis(300));
        let status = autopilot.status();
        assert_eq!(status.last_track_side, TrackSide::Left);
        assert_eq!(status.pending_bias, None);
        assert_eq!(status.avoidance_expires_at, None);
    }

    #[test]
    fn test_speed_mode() {
        let (bus, sink, autopilot) = pilot(1500);
        autopilot.set_speed_mode(SpeedMode::Min);
        assert_eq!(autopilot.speed_mode(), SpeedMode::Min);

        bus.publish(&sensor_reading(ON_MIDDLE, 90.0, 100.0));

        match moves(&sink.take()).as_slice() {
            [Command::Move {
                direction,
                speed,
                thrust,
            }] => {
                assert_eq!(*direction, 0.0);
                assert!((speed - 0.3 * 0.2).abs() < 1e-9);
                assert_eq!(*thrust, 1);
            }
            other => panic!("Unexpected commands {:?}", other),
        }
    }

    #[test]
    fn test_teardown_cancels_lockout() {
        let (bus, sink, autopilot) = pilot(100);
        let core = autopilot.core.clone();

        trigger_avoidance(&bus, &sink);
        sink.take();
        autopilot.disengage();

        assert_eq!(bus.num_subscribers(), 0);
        thread::sleep(Duration::from_millis(300));

        let status = core.status();
        assert!(!status.engaged);
        assert_eq!(status.last_track_side, TrackSide::Middle);

        bus.publish(&sensor_reading(ON_MIDDLE, 90.0, 100.0));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_engage_link() {
        let (link, rover) = connected_link();

        let autopilot = Autopilot::engage(&link, AutopilotParams::default()).unwrap();
        assert!(matches!(
            Autopilot::engage(&link, AutopilotParams::default()),
            Err(AutopilotError::AlreadyBound)
        ));

        rover.send_telemetry(ON_MIDDLE, 90.0, 100.0);

        let aim = rover.recv_cmd().unwrap();
        assert_eq!(aim.cmd, CMD_AIM);
        assert!(matches!(aim.data, CmdData::Aim { .. }));
        let mv = rover.recv_cmd().unwrap();
        assert_eq!(mv.cmd, CMD_MOVE);

        // Disconnecting the link stops the autopilot
        link.disconnect();
        assert!(!link.has_autopilot());
        assert!(!autopilot.is_engaged());
        drop(autopilot);

        // The binding is free again once reconnected
        let _rover = connect_loopback(&link);
        let first = Autopilot::engage(&link, AutopilotParams::default()).unwrap();
        first.disengage();
        assert!(!link.has_autopilot());
        assert!(Autopilot::engage(&link, AutopilotParams::default()).is_ok());
    }
}
