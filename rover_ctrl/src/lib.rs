//! # Rover control library.
//!
//! Links the server to a single rover, fans its telemetry out to subscribers, drives it
//! autonomously along a line while avoiding obstacles, and records runs for later analysis.
//!
//! Dependency order, leaves first:
//!
//! - [`bus`] - multicast of decoded readings,
//! - [`link`] - the session with the rover, owning the receive loop,
//! - [`autopilot`] - line following and sonar obstacle avoidance,
//! - [`recorder`] - run recording and statistics,
//! - [`store`] - persistence of runs, cars and connections,
//! - [`session_mgr`] - per-client sessions binding the above together.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Autopilot - line tracking and obstacle avoidance control loop
pub mod autopilot;

/// Reading bus - fans telemetry out to subscribers
pub mod bus;

/// Rover link - connection, handshake, command transmission and the receive loop
pub mod link;

/// Parameters of the whole rover control stack
pub mod params;

/// Run recorder - buffers readings during a run and derives its statistics
pub mod recorder;

/// Client sessions - creation, expiry and teardown of the per-client control stack
pub mod session_mgr;

/// Persistence collaborator for runs, cars and connections
pub mod store;

#[cfg(test)]
pub(crate) mod loopback;

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
