//! # Communications interface crate.
//!
//! Provides the wire protocol spoken with the rover and the transports that carry it.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Rover protocol: handshake, commands and telemetry frames
pub mod rover;

/// Network module
pub mod net;
