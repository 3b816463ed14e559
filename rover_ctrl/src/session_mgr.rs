//! # Client Sessions
//!
//! A [`ClientSession`] is the control stack of one client: its [`RoverLink`], the
//! [`RunRecorder`] fed by that link and, while automode is on, the [`Autopilot`] driving it.
//!
//! The [`SessionMgr`] creates sessions on first contact, identifies returning clients by session
//! id, and tears sessions down when they end explicitly, go idle for longer than the inactivity
//! timeout, or are presented from a different address than the one they were created for.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Duration, Utc};
use comms_if::{net::Transport, rover::ConnectionStatus};
use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use crate::{
    autopilot::{Autopilot, AutopilotError, SpeedMode},
    link::{LinkError, RoverLink},
    lock,
    params::RoverCtrlParams,
    recorder::{RecorderError, RunInfo, RunRecorder, RunSummary},
    store::{Car, ConnectionId, RunStore, StoreError},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The car a client claims to be driving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarIdentity {
    pub hardware_id: String,

    /// Name registered if the car is not known yet.
    pub name: String,
}

/// The control stack of one client.
pub struct ClientSession {
    id: String,

    client_ip: IpAddr,

    params: RoverCtrlParams,

    store: Arc<dyn RunStore>,

    link: Arc<RoverLink>,

    recorder: RunRecorder,

    autopilot: Mutex<Option<Autopilot>>,

    speed_mode: Mutex<SpeedMode>,

    car: Mutex<Option<Car>>,

    connection: Mutex<Option<ConnectionId>>,

    last_activity: Mutex<DateTime<Utc>>,
}

/// Every live client session.
pub struct SessionMgr {
    params: RoverCtrlParams,

    store: Arc<dyn RunStore>,

    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("The session is not connected to a rover")]
    NotConnected,

    #[error("Automode is already on")]
    AutomodeAlreadyOn,

    #[error("Automode is already off")]
    AutomodeAlreadyOff,

    #[error("Rover link error: {0}")]
    LinkError(LinkError),

    #[error("Autopilot error: {0}")]
    AutopilotError(AutopilotError),

    #[error("Run recorder error: {0}")]
    RecorderError(RecorderError),

    #[error("Store error: {0}")]
    StoreError(StoreError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ClientSession {
    fn new(
        id: String,
        client_ip: IpAddr,
        params: RoverCtrlParams,
        store: Arc<dyn RunStore>,
        now: DateTime<Utc>,
    ) -> Self {
        let link = Arc::new(RoverLink::new(params.link.clone()));
        let recorder =
            RunRecorder::new(link.bus().clone(), params.recorder.clone(), store.clone());

        Self {
            id,
            client_ip,
            params,
            store,
            link,
            recorder,
            autopilot: Mutex::new(None),
            speed_mode: Mutex::new(SpeedMode::default()),
            car: Mutex::new(None),
            connection: Mutex::new(None),
            last_activity: Mutex::new(now),
        }
    }

    /// Connect this session to the rover at `endpoint`.
    ///
    /// Refusals by the rover are returned as the status, not as an error.
    pub fn login(
        &self,
        endpoint: &str,
        api_key: &str,
        car: &CarIdentity,
    ) -> Result<ConnectionStatus, SessionError> {
        let status = self
            .link
            .connect(endpoint, api_key)
            .map_err(SessionError::LinkError)?;
        self.on_connected(status, car)
    }

    /// Connect this session to a rover over an already open transport.
    pub fn login_with(
        &self,
        transport: Box<dyn Transport>,
        api_key: &str,
        car: &CarIdentity,
    ) -> Result<ConnectionStatus, SessionError> {
        let status = self
            .link
            .connect_with(transport, api_key)
            .map_err(SessionError::LinkError)?;
        self.on_connected(status, car)
    }

    /// Turn the autopilot on or off.
    pub fn set_automode(&self, enable: bool) -> Result<(), SessionError> {
        let mut autopilot = lock(&self.autopilot);

        // An autopilot stopped by its link going down no longer counts
        if matches!(&*autopilot, Some(a) if !a.is_engaged()) {
            autopilot.take();
        }

        match (enable, autopilot.is_some()) {
            (true, true) => Err(SessionError::AutomodeAlreadyOn),
            (false, false) => Err(SessionError::AutomodeAlreadyOff),
            (true, false) => {
                if !self.link.is_connected() {
                    return Err(SessionError::NotConnected);
                }

                let a = Autopilot::engage(&self.link, self.params.autopilot.clone())
                    .map_err(SessionError::AutopilotError)?;
                a.set_speed_mode(*lock(&self.speed_mode));
                *autopilot = Some(a);

                info!("Session {}: automode on", self.id);
                Ok(())
            }
            (false, true) => {
                if let Some(a) = autopilot.take() {
                    a.disengage();
                }

                info!("Session {}: automode off", self.id);
                Ok(())
            }
        }
    }

    pub fn automode(&self) -> bool {
        lock(&self.autopilot)
            .as_ref()
            .map(|a| a.is_engaged())
            .unwrap_or(false)
    }

    /// Set the speed mode, kept across automode being switched off and on.
    pub fn set_speed_mode(&self, mode: SpeedMode) {
        *lock(&self.speed_mode) = mode;

        if let Some(a) = lock(&self.autopilot).as_ref() {
            a.set_speed_mode(mode);
        }
    }

    pub fn speed_mode(&self) -> SpeedMode {
        *lock(&self.speed_mode)
    }

    /// Start recording a run with the current car, connection and automode.
    pub fn start_run(&self, is_competitive: bool) -> Result<(), SessionError> {
        if !self.link.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let info = RunInfo {
            car: lock(&self.car).as_ref().map(|c| c.hardware_id.clone()),
            connection: *lock(&self.connection),
            is_auto: self.automode(),
            is_competitive,
        };

        self.recorder.start(info).map_err(SessionError::RecorderError)
    }

    pub fn stop_run(&self) -> Result<RunSummary, SessionError> {
        self.recorder.stop().map_err(SessionError::RecorderError)
    }

    /// Stop driving and recording, then disconnect from the rover.
    ///
    /// A run in progress is discarded.
    pub fn teardown(&self) {
        if let Some(a) = lock(&self.autopilot).take() {
            a.disengage();
        }

        if self.recorder.discard() {
            warn!("Session {}: run in progress discarded", self.id);
        }

        self.link.disconnect();

        debug!("Session {} torn down", self.id);
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        *lock(&self.last_activity) = now;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *lock(&self.last_activity)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    /// `true` while the session is connected to a rover.
    pub fn is_logged(&self) -> bool {
        self.link.is_connected()
    }

    pub fn link(&self) -> &Arc<RoverLink> {
        &self.link
    }

    pub fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    pub fn car(&self) -> Option<Car> {
        lock(&self.car).clone()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        *lock(&self.connection)
    }

    // ---- PRIVATE ----

    /// Record the connection and resolve the car once the link is up.
    fn on_connected(
        &self,
        status: ConnectionStatus,
        identity: &CarIdentity,
    ) -> Result<ConnectionStatus, SessionError> {
        if status != ConnectionStatus::Ok {
            info!("Session {}: rover refused the connection ({:?})", self.id, status);
            return Ok(status);
        }

        let connection = self
            .store
            .record_connection(self.link.connection_attempts())
            .map_err(SessionError::StoreError)?;
        *lock(&self.connection) = Some(connection);

        let car = match self.store.lookup_car(&identity.hardware_id) {
            Ok(car) => car,
            Err(StoreError::CarNotFound(_)) => {
                let car = Car {
                    hardware_id: identity.hardware_id.clone(),
                    name: identity.name.clone(),
                };
                self.store
                    .register_car(car.clone())
                    .map_err(SessionError::StoreError)?;
                car
            }
            Err(e) => return Err(SessionError::StoreError(e)),
        };

        info!("Session {}: connected to {:?}", self.id, car.name);
        *lock(&self.car) = Some(car);

        Ok(status)
    }
}

impl SessionMgr {
    pub fn new(params: RoverCtrlParams, store: Arc<dyn RunStore>) -> Self {
        Self {
            params,
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Find the session of a client, creating a new one if needed.
    ///
    /// A session presented from another address than the one it was created for is ended and
    /// replaced. A returning client's activity time is updated.
    pub fn identify(
        &self,
        session_id: Option<&str>,
        client_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Arc<ClientSession> {
        if let Some(session) = session_id.and_then(|id| self.validate(id, now)) {
            if session.client_ip == client_ip {
                session.touch(now);
                return session;
            }

            warn!(
                "Session {} presented from {} instead of {}, replacing it",
                session.id, client_ip, session.client_ip
            );
            self.end(&session.id);
        }

        self.create(client_ip, now)
    }

    /// Get a live session, ending it if it has been idle for too long.
    pub fn validate(&self, session_id: &str, now: DateTime<Utc>) -> Option<Arc<ClientSession>> {
        let session = lock(&self.sessions).get(session_id).cloned()?;

        if self.is_expired(&session, now) {
            info!("Session {} expired", session_id);
            self.end(session_id);
            return None;
        }

        Some(session)
    }

    /// End a session, returning `false` if it did not exist.
    pub fn end(&self, session_id: &str) -> bool {
        let session = lock(&self.sessions).remove(session_id);

        match session {
            Some(s) => {
                s.teardown();
                info!("Session {} ended", session_id);
                true
            }
            None => false,
        }
    }

    /// End every session idle for longer than the inactivity timeout, returning how many ended.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = lock(&self.sessions)
            .values()
            .filter(|s| self.is_expired(s, now))
            .map(|s| s.id.clone())
            .collect();

        expired.iter().filter(|id| self.end(id)).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    // ---- PRIVATE ----

    fn create(&self, client_ip: IpAddr, now: DateTime<Utc>) -> Arc<ClientSession> {
        let mut sessions = lock(&self.sessions);

        let mut id = random_id(self.params.session.session_id_len);
        while sessions.contains_key(&id) {
            id = random_id(self.params.session.session_id_len);
        }

        let session = Arc::new(ClientSession::new(
            id.clone(),
            client_ip,
            self.params.clone(),
            self.store.clone(),
            now,
        ));
        sessions.insert(id, session.clone());

        info!("Session {} created for {}", session.id, client_ip);

        session
    }

    fn is_expired(&self, session: &ClientSession, now: DateTime<Utc>) -> bool {
        now - session.last_activity() > Duration::seconds(self.params.session.inactivity_timeout_s)
    }
}

impl Drop for SessionMgr {
    fn drop(&mut self) {
        for (_, session) in lock(&self.sessions).drain() {
            session.teardown();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        link::ConnectionState,
        loopback::{epoch, loopback_pair, RoverEnd},
        store::MemoryStore,
    };
    use std::thread;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 0, last])
    }

    fn identity() -> CarIdentity {
        CarIdentity {
            hardware_id: "car-01".into(),
            name: "Bolide".into(),
        }
    }

    fn mgr() -> (Arc<MemoryStore>, SessionMgr) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), SessionMgr::new(RoverCtrlParams::default(), store))
    }

    /// Log `session` in to an in-memory rover answering `reply`.
    fn login(session: &ClientSession, reply: &'static str) -> (ConnectionStatus, RoverEnd) {
        let (transport, rover) = loopback_pair();

        let rover = thread::spawn(move || {
            rover.recv().unwrap();
            rover.send(reply);
            rover
        });

        let status = session
            .login_with(Box::new(transport), "key", &identity())
            .unwrap();

        (status, rover.join().unwrap())
    }

    #[test]
    fn test_identify() {
        let (_store, mgr) = mgr();

        let a = mgr.identify(None, ip(1), epoch());
        assert_eq!(a.id().len(), 32);
        assert!(a.id().chars().all(|c| c.is_ascii_alphanumeric()));

        let again = mgr.identify(Some(a.id()), ip(1), epoch() + Duration::minutes(5));
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(again.last_activity(), epoch() + Duration::minutes(5));

        let unknown = mgr.identify(Some("nope"), ip(1), epoch());
        assert_ne!(unknown.id(), a.id());
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_address_change_replaces_session() {
        let (_store, mgr) = mgr();

        let a = mgr.identify(None, ip(1), epoch());
        let b = mgr.identify(Some(a.id()), ip(2), epoch());

        assert_ne!(a.id(), b.id());
        assert_eq!(b.client_ip(), ip(2));
        assert!(mgr.validate(a.id(), epoch()).is_none());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let (_store, mgr) = mgr();

        let a = mgr.identify(None, ip(1), epoch());
        let b = mgr.identify(None, ip(2), epoch() + Duration::minutes(20));

        assert!(mgr.validate(a.id(), epoch() + Duration::minutes(30)).is_some());
        assert!(mgr.validate(a.id(), epoch() + Duration::minutes(31)).is_none());

        assert_eq!(mgr.expire_idle(epoch() + Duration::minutes(60)), 1);
        assert!(mgr.is_empty());
        assert!(!mgr.end(b.id()));
    }

    #[test]
    fn test_login_registers_car() {
        let (store, mgr) = mgr();
        let session = mgr.identify(None, ip(1), epoch());

        let (status, _rover) = login(&session, "error:occupied");
        assert_eq!(status, ConnectionStatus::Busy);
        assert!(!session.is_logged());
        assert!(session.car().is_none());

        let (status, _rover) = login(&session, "ok");
        assert_eq!(status, ConnectionStatus::Ok);
        assert!(session.is_logged());
        assert_eq!(store.lookup_car("car-01").unwrap().name, "Bolide");
        assert_eq!(session.car().unwrap().hardware_id, "car-01");

        // One refused attempt before this connection
        let conn = store.connection(session.connection().unwrap()).unwrap();
        assert_eq!(conn.try_count, 1);
    }

    #[test]
    fn test_automode() {
        let (_store, mgr) = mgr();
        let session = mgr.identify(None, ip(1), epoch());

        assert!(matches!(
            session.set_automode(true),
            Err(SessionError::NotConnected)
        ));

        let (_, _rover) = login(&session, "ok");
        session.set_speed_mode(SpeedMode::Constant);

        session.set_automode(true).unwrap();
        assert!(session.automode());
        assert!(session.link().has_autopilot());
        assert!(matches!(
            session.set_automode(true),
            Err(SessionError::AutomodeAlreadyOn)
        ));

        session.set_automode(false).unwrap();
        assert!(!session.automode());
        assert!(!session.link().has_autopilot());
        assert!(matches!(
            session.set_automode(false),
            Err(SessionError::AutomodeAlreadyOff)
        ));
        assert_eq!(session.speed_mode(), SpeedMode::Constant);
    }

    #[test]
    fn test_run_lifecycle() {
        let (store, mgr) = mgr();
        let session = mgr.identify(None, ip(1), epoch());

        assert!(matches!(
            session.start_run(false),
            Err(SessionError::NotConnected)
        ));

        let (_, rover) = login(&session, "ok");
        session.set_automode(true).unwrap();
        session.start_run(true).unwrap();

        for _ in 0..3 {
            rover.send_telemetry((1, 0, 1), 90.0, 100.0);
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while session.recorder().num_buffered() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }

        let summary = session.stop_run().unwrap();
        let run = store.get_run(summary.id).unwrap();
        assert_eq!(run.readings.len(), 3);
        assert!(run.info.is_auto);
        assert!(run.info.is_competitive);
        assert_eq!(run.info.car.as_deref(), Some("car-01"));
        assert_eq!(run.info.connection, session.connection());

        assert!(matches!(
            session.stop_run(),
            Err(SessionError::RecorderError(RecorderError::InvalidState(..)))
        ));
    }

    #[test]
    fn test_end_tears_down() {
        let (store, mgr) = mgr();
        let session = mgr.identify(None, ip(1), epoch());

        let (_, _rover) = login(&session, "ok");
        session.set_automode(true).unwrap();
        session.start_run(false).unwrap();

        assert!(mgr.end(session.id()));

        assert_eq!(session.link().state(), ConnectionState::Disconnected);
        assert!(!session.automode());
        assert!(!session.recorder().is_active());
        assert_eq!(store.num_runs(), 0);
    }
}
