/// Error taxonomy shared by the controller, the worker and the model store

use crate::model_store::ModelStoreError;
use crate::protocol::{EngineStatus, FailurePayload};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Activation failed ({status}): {message}")]
    Activation { status: EngineStatus, message: String },

    #[error("Engine failure ({status}): {message}")]
    Engine { status: EngineStatus, message: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Model provisioning failed: {0}")]
    Provisioning(String),

    #[error("Cannot {operation} while worker is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Worker terminated")]
    Terminated,

    #[error("Failed to spawn engine worker: {0}")]
    WorkerSpawn(String),
}

impl EngineError {
    /// Credential / activation failures reported by the engine
    pub fn is_activation(&self) -> bool {
        matches!(self, EngineError::Activation { .. })
    }

    /// Unexpected faults, including protocol violations
    pub fn is_runtime(&self) -> bool {
        matches!(self, EngineError::Runtime(_) | EngineError::Protocol(_))
    }
}

impl From<FailurePayload> for EngineError {
    fn from(failure: FailurePayload) -> Self {
        if failure.status == EngineStatus::Unknown {
            EngineError::Protocol(format!("Unknown failure status: {}", failure.message))
        } else if failure.status.is_activation() {
            EngineError::Activation {
                status: failure.status,
                message: failure.message,
            }
        } else {
            EngineError::Engine {
                status: failure.status,
                message: failure.message,
            }
        }
    }
}

impl From<ModelStoreError> for EngineError {
    fn from(err: ModelStoreError) -> Self {
        EngineError::Provisioning(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mapping() {
        let err: EngineError = FailurePayload {
            status: EngineStatus::ActivationLimitReached,
            message: "limit".to_string(),
        }
        .into();
        assert!(err.is_activation());
        assert!(!err.is_runtime());

        let err: EngineError = FailurePayload {
            status: EngineStatus::IoError,
            message: "missing".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::Engine { status: EngineStatus::IoError, .. }));

        let err: EngineError = FailurePayload {
            status: EngineStatus::Unknown,
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert!(err.is_runtime());
    }

    #[test]
    fn test_protocol_is_runtime_family() {
        assert!(EngineError::Protocol("bad tag".to_string()).is_runtime());
        assert!(!EngineError::Terminated.is_runtime());
    }

    #[test]
    fn test_display() {
        let err = EngineError::InvalidState {
            operation: "process",
            state: "releasing",
        };
        assert_eq!(err.to_string(), "Cannot process while worker is releasing");
    }
}
