//! # Run Store
//!
//! Persistence of the cars, connections and runs produced by the rover control stack. The stack
//! only talks to persistence through the [`RunStore`] trait. [`MemoryStore`] keeps everything in
//! memory, [`SessionStore`] also writes each run into the process session directory.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Mutex,
};
use util::session::Session;

use crate::{
    lock,
    recorder::{Run, RunSummary},
};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

pub trait RunStore: Send + Sync {
    /// Keep a finished run, returning its new id.
    fn save(&self, run: &Run) -> Result<RunId, StoreError>;

    /// Find a registered car.
    fn lookup_car(&self, hardware_id: &str) -> Result<Car, StoreError>;

    /// Register a new car.
    fn register_car(&self, car: Car) -> Result<(), StoreError>;

    /// Record a successful connection which needed `try_count` failed attempts first.
    fn record_connection(&self, try_count: u32) -> Result<ConnectionId, StoreError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub hardware_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: ConnectionId,

    /// Failed attempts before this connection succeeded.
    pub try_count: u32,

    pub connected_at: DateTime<Utc>,
}

/// A [`RunStore`] holding everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

/// A [`MemoryStore`] which also saves every run as `runs/run_<id>.json` in the session.
pub struct SessionStore {
    inner: MemoryStore,

    session: Session,
}

#[derive(Default)]
struct StoreData {
    cars: HashMap<String, Car>,

    connections: Vec<Connection>,

    runs: BTreeMap<RunId, Run>,

    next_run_id: u64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No car with hardware id {0:?} is registered")]
    CarNotFound(String),

    #[error("A car with hardware id {0:?} is already registered")]
    CarAlreadyRegistered(String),

    #[error("The run references unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_run(&self, id: RunId) -> Option<Run> {
        lock(&self.data).runs.get(&id).cloned()
    }

    pub fn summary(&self, id: RunId) -> Option<RunSummary> {
        lock(&self.data)
            .runs
            .get(&id)
            .map(|run| RunSummary::new(id, run))
    }

    /// Ids of every run driven with the given car, oldest first.
    pub fn runs_for_car(&self, hardware_id: &str) -> Vec<RunId> {
        lock(&self.data)
            .runs
            .iter()
            .filter(|(_, run)| run.info.car.as_deref() == Some(hardware_id))
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        lock(&self.data)
            .connections
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn num_runs(&self) -> usize {
        lock(&self.data).runs.len()
    }
}

impl RunStore for MemoryStore {
    fn save(&self, run: &Run) -> Result<RunId, StoreError> {
        let mut data = lock(&self.data);

        if let Some(conn) = run.info.connection {
            if !data.connections.iter().any(|c| c.id == conn) {
                return Err(StoreError::UnknownConnection(conn));
            }
        }

        let id = RunId(data.next_run_id);
        data.next_run_id += 1;
        data.runs.insert(id, run.clone());

        debug!("Run {} stored", id);

        Ok(id)
    }

    fn lookup_car(&self, hardware_id: &str) -> Result<Car, StoreError> {
        lock(&self.data)
            .cars
            .get(hardware_id)
            .cloned()
            .ok_or_else(|| StoreError::CarNotFound(hardware_id.into()))
    }

    fn register_car(&self, car: Car) -> Result<(), StoreError> {
        let mut data = lock(&self.data);

        if data.cars.contains_key(&car.hardware_id) {
            return Err(StoreError::CarAlreadyRegistered(car.hardware_id));
        }

        info!("Car {:?} registered as {:?}", car.hardware_id, car.name);
        data.cars.insert(car.hardware_id.clone(), car);

        Ok(())
    }

    fn record_connection(&self, try_count: u32) -> Result<ConnectionId, StoreError> {
        let mut data = lock(&self.data);

        let id = ConnectionId(data.connections.len() as u64);
        data.connections.push(Connection {
            id,
            try_count,
            connected_at: Utc::now(),
        });

        Ok(id)
    }
}

impl SessionStore {
    pub fn new(session: Session) -> Self {
        Self {
            inner: MemoryStore::new(),
            session,
        }
    }

    /// The in-memory store behind this one.
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }
}

impl RunStore for SessionStore {
    fn save(&self, run: &Run) -> Result<RunId, StoreError> {
        let id = self.inner.save(run)?;
        self.session.save(format!("runs/run_{}.json", id), run.clone());
        Ok(id)
    }

    fn lookup_car(&self, hardware_id: &str) -> Result<Car, StoreError> {
        self.inner.lookup_car(hardware_id)
    }

    fn register_car(&self, car: Car) -> Result<(), StoreError> {
        self.inner.register_car(car)
    }

    fn record_connection(&self, try_count: u32) -> Result<ConnectionId, StoreError> {
        self.inner.record_connection(try_count)
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
        params::RecorderParams,
        recorder::RunInfo,
    };

    fn run_for(car: Option<&str>, connection: Option<ConnectionId>) -> Run {
        let info = RunInfo {
            car: car.map(String::from),
            connection,
            ..Default::default()
        };
        Run::finalise(
            info,
            epoch(),
            epoch(),
            vec![reading_at(0, 1.0), reading_at(50, 1.0)],
            &RecorderParams::default(),
        )
    }

    #[test]
    fn test_cars() {
        let store = MemoryStore::new();

        assert!(matches!(
            store.lookup_car("abc"),
            Err(StoreError::CarNotFound(_))
        ));

        let car = Car {
            hardware_id: "abc".into(),
            name: "Bolide".into(),
        };
        store.register_car(car.clone()).unwrap();
        assert_eq!(store.lookup_car("abc").unwrap(), car);
        assert!(matches!(
            store.register_car(car),
            Err(StoreError::CarAlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_runs() {
        let store = MemoryStore::new();
        let conn = store.record_connection(2).unwrap();
        assert_eq!(store.connection(conn).unwrap().try_count, 2);

        let a = store.save(&run_for(Some("abc"), Some(conn))).unwrap();
        let b = store.save(&run_for(Some("def"), None)).unwrap();
        let c = store.save(&run_for(Some("abc"), None)).unwrap();
        assert_ne!(a, b);

        assert_eq!(store.runs_for_car("abc"), vec![a, c]);
        assert_eq!(store.summary(b).unwrap().estimated_distance, 2.0);
        assert!(store.get_run(RunId(99)).is_none());

        assert!(matches!(
            store.save(&run_for(None, Some(ConnectionId(7)))),
            Err(StoreError::UnknownConnection(_))
        ));
        assert_eq!(store.num_runs(), 3);
    }

    #[test]
    fn test_session_store() {
        let root = std::env::temp_dir().join(format!("rover_ctrl_test_{}", std::process::id()));
        let (session, save_thread) = Session::with_root(&root, "store_test").unwrap();
        let session_root = session.session_root.clone();

        let store = SessionStore::new(session.clone());
        let id = store.save(&run_for(Some("abc"), None)).unwrap();
        assert_eq!(store.memory().num_runs(), 1);

        drop(store);
        session.exit(save_thread);

        let saved = std::fs::read_to_string(session_root.join(format!("runs/run_{}.json", id)))
            .unwrap();
        let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(saved["info"]["car"], "abc");
        assert_eq!(saved["readings"].as_array().unwrap().len(), 2);

        std::fs::remove_dir_all(&root).ok();
    }
}
