//! # Session handshake
//!
//! The first frame sent on a new connection identifies the server to the rover with its API key.
//! The rover answers with a single frame, either the literal `ok` or `<prefix>:<reason>`.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Frame type identifying a handshake request.
const HANDSHAKE_TYPE: u8 = 1;

/// Reply sent by the rover when the session is accepted.
const REPLY_OK: &str = "ok";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Handshake request sent to the rover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeFrame {
    #[serde(rename = "type")]
    pub frame_type: u8,

    #[serde(rename = "apiKey")]
    pub api_key: String,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Outcome of a handshake which the rover understood.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Session accepted.
    Ok,

    /// Another server already holds the rover.
    Busy,

    /// The rover's own client is not connected yet.
    NoClient,

    /// The API key was refused.
    WrongApiKey,
}

/// Replies which violate the handshake protocol.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Unknown rover message: {0:?}")]
    UnknownReply(String),

    #[error("Could not serialize the handshake: {0}")]
    SerializationError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl HandshakeFrame {
    pub fn new(api_key: &str) -> Self {
        Self {
            frame_type: HANDSHAKE_TYPE,
            api_key: api_key.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, HandshakeError> {
        serde_json::to_string(self).map_err(HandshakeError::SerializationError)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Interpret the rover's reply to a handshake.
///
/// Only the exact text `ok` accepts the connection. Otherwise the reason code after the last `:`
/// (or the whole reply if there is none) is matched case-insensitively.
pub fn parse_reply(reply: &str) -> Result<ConnectionStatus, HandshakeError> {
    if reply == REPLY_OK {
        return Ok(ConnectionStatus::Ok);
    }

    let reason = reply.rsplit(':').next().unwrap_or("").to_lowercase();

    match reason.as_str() {
        "client" => Ok(ConnectionStatus::NoClient),
        "occupied" => Ok(ConnectionStatus::Busy),
        "unauthorized" => Ok(ConnectionStatus::WrongApiKey),
        _ => Err(HandshakeError::UnknownReply(reply.into())),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handshake_frame() {
        let json = HandshakeFrame::new("abc123").to_json().unwrap();
        assert_eq!(json, r#"{"type":1,"apiKey":"abc123"}"#);
    }

    #[test]
    fn test_reply_ok() {
        assert_eq!(parse_reply("ok").unwrap(), ConnectionStatus::Ok);
    }

    #[test]
    fn test_reply_ok_must_be_exact() {
        for reply in &[" ok", "ok\n", "\"ok\"", "OK"] {
            assert!(
                matches!(parse_reply(reply), Err(HandshakeError::UnknownReply(_))),
                "{:?} accepted",
                reply
            );
        }
    }

    #[test]
    fn test_reply_reasons() {
        assert_eq!(parse_reply("error:client").unwrap(), ConnectionStatus::NoClient);
        assert_eq!(parse_reply("error:OCCUPIED").unwrap(), ConnectionStatus::Busy);
        assert_eq!(
            parse_reply("refused:Unauthorized").unwrap(),
            ConnectionStatus::WrongApiKey
        );
        assert_eq!(parse_reply("a:b:client").unwrap(), ConnectionStatus::NoClient);
        assert_eq!(parse_reply("client").unwrap(), ConnectionStatus::NoClient);
    }

    #[test]
    fn test_reply_reason_not_trimmed() {
        assert!(parse_reply("error: client").is_err());
        assert!(parse_reply("error:occupied\n").is_err());
    }

    #[test]
    fn test_reply_unknown() {
        assert!(matches!(
            parse_reply("error:overheated"),
            Err(HandshakeError::UnknownReply(_))
        ));
        assert!(parse_reply("").is_err());
    }
}
