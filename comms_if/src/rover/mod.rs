//! # Rover protocol
//!
//! JSON frames exchanged with the rover over its persistent connection:
//!
//! - `handshake` - the single request/reply pair which opens a session,
//! - `cmd` - commands sent to the rover (movement and sonar aiming),
//! - `tm` - telemetry readings sent back by the rover.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod cmd;
pub mod handshake;
pub mod tm;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use cmd::{Command, CmdError};
pub use handshake::{ConnectionStatus, HandshakeError};
pub use tm::{Reading, TmParseError};
