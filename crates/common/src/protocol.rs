//! Harness wire protocol
//!
//! Newline-delimited JSON over a Unix socket, shaped after QMP:
//!
//! ```text
//! <- {"greeting": {"version": "0.1.0", "binding": "..."}}
//! -> {"id": 1, "execute": "start", "test": {"path": "a.test"}}
//! <- {"id": 1, "return": "scheduled"}
//! -> {"id": 2, "execute": "on_test_complete", "result_text": "PASS", "pixels": ""}
//! <- {"id": 2, "error": {"class": "LogicError", "desc": "..."}}
//! <- {"event": "run_finished", "data": {...}}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{InputEvent, RunReport, SingleTest};
use crate::Error;

/// Largest accepted frame; a full-page RGBA snapshot in base64 fits comfortably
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Harness operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "execute", rename_all = "snake_case")]
pub enum Command {
    SetPackageRoot {
        root: String,
    },
    Start {
        #[serde(default)]
        test: Option<SingleTest>,
    },
    OnTestComplete {
        result_text: String,
        #[serde(default, with = "pixels_base64")]
        pixels: Vec<u8>,
    },
    DispatchInputEvent {
        event: InputEvent,
    },
    Status,
    Subscribe,
}

impl Command {
    /// Wire name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetPackageRoot { .. } => "set_package_root",
            Command::Start { .. } => "start",
            Command::OnTestComplete { .. } => "on_test_complete",
            Command::DispatchInputEvent { .. } => "dispatch_input_event",
            Command::Status => "status",
            Command::Subscribe => "subscribe",
        }
    }
}

/// Anything the daemon writes to a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Greeting {
        greeting: Greeting,
    },
    Return {
        id: u64,
        #[serde(rename = "return")]
        value: serde_json::Value,
    },
    Error {
        id: Option<u64>,
        error: ErrorBody,
    },
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub version: String,
    pub binding: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub class: String,
    pub desc: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        let desc = match e {
            Error::Remote { desc, .. } => desc.clone(),
            other => other.to_string(),
        };
        Self {
            class: e.class().to_string(),
            desc,
        }
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::Remote {
            class: body.class,
            desc: body.desc,
        }
    }
}

/// Asynchronous notification for subscribed connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    RunFinished(RunReport),
}

mod pixels_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pixels: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(pixels))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = Request {
            id: 3,
            command: Command::Start {
                test: Some(SingleTest::new("a.test")),
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"id\":3"));
        assert!(json.contains("\"execute\":\"start\""));
        assert!(json.contains("\"path\":\"a.test\""));
    }

    #[test]
    fn test_unit_command_parsing() {
        let request: Request = serde_json::from_str(r#"{"id": 9, "execute": "status"}"#).unwrap();
        assert_eq!(request.id, 9);
        assert_eq!(request.command, Command::Status);
    }

    #[test]
    fn test_start_without_test() {
        let request: Request = serde_json::from_str(r#"{"id": 1, "execute": "start"}"#).unwrap();
        assert_eq!(request.command, Command::Start { test: None });
    }

    #[test]
    fn test_completion_pixels_are_base64() {
        let request: Request = serde_json::from_str(
            r#"{"id": 2, "execute": "on_test_complete", "result_text": "PASS", "pixels": "AQID"}"#,
        )
        .unwrap();
        match request.command {
            Command::OnTestComplete { result_text, pixels } => {
                assert_eq!(result_text, "PASS");
                assert_eq!(pixels, vec![1, 2, 3]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_completion_without_pixels() {
        let request: Request = serde_json::from_str(
            r#"{"id": 2, "execute": "on_test_complete", "result_text": "PASS"}"#,
        )
        .unwrap();
        assert_eq!(
            request.command,
            Command::OnTestComplete {
                result_text: "PASS".to_string(),
                pixels: Vec::new(),
            }
        );
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let result: Result<Request, _> =
            serde_json::from_str(r#"{"id": 1, "execute": "reboot"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_message_parsing() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"id": 4, "return": "scheduled"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Return {
                id: 4,
                value: serde_json::json!("scheduled"),
            }
        );

        let msg: ServerMessage = serde_json::from_str(
            r#"{"id": 5, "error": {"class": "LogicError", "desc": "already running"}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Error { id, error } => {
                assert_eq!(id, Some(5));
                assert_eq!(error.class, "LogicError");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ServerMessage = serde_json::from_str(
            r#"{"greeting": {"version": "0.1.0", "binding": "b1"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ServerMessage::Greeting { .. }));
    }

    #[test]
    fn test_error_body_from_logic_error() {
        let body = ErrorBody::from(&Error::Logic("no test running".to_string()));
        assert_eq!(body.class, "LogicError");
        assert_eq!(body.desc, "Logic error: no test running");
    }
}
