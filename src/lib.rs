/// Wake-word worker library
///
/// Runs a keyword-spotting engine on a dedicated worker thread and drives it
/// through a request/response protocol: provisioning, frame streaming,
/// detection dispatch and teardown.

pub mod audio_buffer;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod keywords;
pub mod model_store;
pub mod protocol;
pub mod registry;
pub mod worker;

// Re-export main types
pub use audio_buffer::{AudioSample, FrameBuffer, FrameBufferError};
pub use config::{ConfigError, ServiceConfig};
pub use controller::{
    detection_channel, error_channel, DetectionCallback, EngineOptions, ErrorCallback, PendingWorker,
    WakeWordWorker, WorkerEnvironment, WorkerState,
};
pub use engine::{DetectionEngine, EnergyEngineFactory, EngineConfig, EngineFactory, EngineFailure};
pub use error::EngineError;
pub use keywords::{resolve_keywords, BuiltInKeyword, CustomKeyword, KeywordSet, KeywordSpec};
pub use model_store::{FsModelStore, ModelProvisioner, ModelSource, ModelStoreError, ProvisionRequest};
pub use protocol::{Command, Detection, EngineInfo, EngineStatus, Response};
pub use registry::{AssetRegistry, AssetVariant};
pub use worker::{ThreadSpawner, WorkerChannels, WorkerEndpoint, WorkerSpawner};
