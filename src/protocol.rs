/// Message protocol between the controller and the engine worker
///
/// Every request is a `Command`; every reply is a `Response`. Both are
/// internally tagged by a `"command"` field so the same types can cross a
/// process boundary as JSON. Any reply tag the controller does not know
/// decodes to `Response::Unrecognized`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Status codes reported by the engine alongside a `Failed` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    OutOfMemory,
    IoError,
    InvalidArgument,
    StopIteration,
    KeyError,
    InvalidState,
    RuntimeError,
    ActivationError,
    ActivationLimitReached,
    ActivationThrottled,
    ActivationRefused,

    /// Any status code this side of the protocol does not know
    #[serde(other)]
    Unknown,
}

impl EngineStatus {
    /// Whether this status belongs to the activation (credential) family
    pub fn is_activation(self) -> bool {
        matches!(
            self,
            EngineStatus::ActivationError
                | EngineStatus::ActivationLimitReached
                | EngineStatus::ActivationThrottled
                | EngineStatus::ActivationRefused
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineStatus::OutOfMemory => "out of memory",
            EngineStatus::IoError => "i/o error",
            EngineStatus::InvalidArgument => "invalid argument",
            EngineStatus::StopIteration => "stop iteration",
            EngineStatus::KeyError => "key error",
            EngineStatus::InvalidState => "invalid state",
            EngineStatus::RuntimeError => "runtime error",
            EngineStatus::ActivationError => "activation error",
            EngineStatus::ActivationLimitReached => "activation limit reached",
            EngineStatus::ActivationThrottled => "activation throttled",
            EngineStatus::ActivationRefused => "activation refused",
            EngineStatus::Unknown => "unknown status",
        };
        f.write_str(name)
    }
}

/// Engine binary payloads taken from the asset registry at Init time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineAssets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Arc<[u8]>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simd: Option<Arc<[u8]>>,
}

/// Options forwarded to the worker (the error callback stays on the controller side)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub storage_path: String,
    pub force_overwrite: bool,
    pub asset_version: u32,
}

/// Payload of the `init` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub credential: String,
    pub model_path: PathBuf,
    pub keyword_paths: Vec<String>,
    pub keyword_labels: Vec<String>,
    pub sensitivities: Vec<f32>,
    pub assets: EngineAssets,
    pub options: WorkerOptions,
}

/// Controller → worker request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Init(InitRequest),
    Process { input_frame: Vec<i16> },
    Release,
}

impl Command {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Init(_) => "init",
            Command::Process { .. } => "process",
            Command::Release => "release",
        }
    }
}

/// Engine properties reported by a successful Init
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub version: String,
    pub frame_length: usize,
    pub sample_rate: u32,
}

/// A positive match for one keyword
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub index: usize,
    pub label: String,
}

/// Body of an `ok` response; which fields are set depends on the request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<Detection>,
}

/// Body of a `failed` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub status: EngineStatus,
    pub message: String,
}

/// Body of an `error` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Worker → controller reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Response {
    Ok(OkPayload),
    Failed(FailurePayload),
    Error(ErrorPayload),
    #[serde(other)]
    Unrecognized,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(OkPayload::default())
    }

    pub fn initialized(info: EngineInfo) -> Self {
        Response::Ok(OkPayload {
            engine: Some(info),
            detection: None,
        })
    }

    pub fn detected(detection: Option<Detection>) -> Self {
        Response::Ok(OkPayload {
            engine: None,
            detection,
        })
    }

    pub fn failed(status: EngineStatus, message: impl Into<String>) -> Self {
        Response::Failed(FailurePayload {
            status,
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(ErrorPayload {
            message: message.into(),
        })
    }
}

pub fn encode_command(command: &Command) -> serde_json::Result<String> {
    serde_json::to_string(command)
}

pub fn decode_command(text: &str) -> serde_json::Result<Command> {
    serde_json::from_str(text)
}

pub fn encode_response(response: &Response) -> serde_json::Result<String> {
    serde_json::to_string(response)
}

pub fn decode_response(text: &str) -> serde_json::Result<Response> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_response_tag_is_unrecognized() {
        let response = decode_response(r#"{"command":"progress","percent":40}"#).unwrap();
        assert_eq!(response, Response::Unrecognized);
    }

    #[test]
    fn test_unknown_failure_status_still_decodes() {
        let response = decode_response(r#"{"command":"failed","status":"disk_on_fire","message":"boom"}"#).unwrap();
        assert_eq!(response, Response::failed(EngineStatus::Unknown, "boom"));
    }

    #[test]
    fn test_failed_response_wire_shape() {
        let response = Response::failed(EngineStatus::ActivationRefused, "key rejected");
        let value: serde_json::Value =
            serde_json::from_str(&encode_response(&response).unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"command": "failed", "status": "activation_refused", "message": "key rejected"})
        );
    }

    #[test]
    fn test_process_ok_without_detection() {
        let response = decode_response(r#"{"command":"ok"}"#).unwrap();
        assert_eq!(response, Response::detected(None));
    }

    #[test]
    fn test_detection_decodes() {
        let text = r#"{"command":"ok","detection":{"index":1,"label":"jarvis"}}"#;
        match decode_response(text).unwrap() {
            Response::Ok(payload) => {
                let detection = payload.detection.unwrap();
                assert_eq!(detection.index, 1);
                assert_eq!(detection.label, "jarvis");
            }
            other => panic!("Expected ok response, got {:?}", other),
        }
    }

    #[test]
    fn test_command_tags() {
        let release = encode_command(&Command::Release).unwrap();
        assert_eq!(release, r#"{"command":"release"}"#);

        let process = decode_command(r#"{"command":"process","input_frame":[0,1,-1]}"#).unwrap();
        match process {
            Command::Process { input_frame } => assert_eq!(input_frame, vec![0, 1, -1]),
            other => panic!("Expected process command, got {}", other.kind()),
        }
    }

    #[test]
    fn test_activation_family() {
        assert!(EngineStatus::ActivationThrottled.is_activation());
        assert!(EngineStatus::ActivationLimitReached.is_activation());
        assert!(!EngineStatus::InvalidArgument.is_activation());
        assert!(!EngineStatus::RuntimeError.is_activation());
    }
}
