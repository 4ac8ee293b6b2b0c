/// Engine worker
///
/// The engine lives on its own OS thread and is reached only through a pair of
/// unbounded channels: commands in, responses out. Commands are handled one at
/// a time in arrival order, so responses come back in the order their
/// requests were sent.

use crate::engine::{DetectionEngine, EngineConfig, EngineFactory};
use crate::error::EngineError;
use crate::protocol::{Command, Detection, EngineInfo, EngineStatus, InitRequest, Response};
use crate::registry::AssetVariant;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Controller-side handle to a running worker
pub trait WorkerEndpoint: Send + Sync + fmt::Debug {
    /// Queue a command; fails once the worker is gone
    fn post(&self, command: Command) -> Result<(), EngineError>;

    /// Stop the worker without waiting for queued commands
    fn terminate(&self);

    fn is_terminated(&self) -> bool;
}

/// A freshly spawned worker: where to send commands and where replies arrive
pub struct WorkerChannels {
    pub endpoint: Arc<dyn WorkerEndpoint>,
    pub responses: mpsc::UnboundedReceiver<Response>,
}

pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerChannels, EngineError>;
}

/// Spawns one engine thread per worker
#[derive(Clone)]
pub struct ThreadSpawner {
    factory: Arc<dyn EngineFactory>,
}

impl ThreadSpawner {
    pub fn new(factory: impl EngineFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    pub fn from_shared(factory: Arc<dyn EngineFactory>) -> Self {
        Self { factory }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self) -> Result<WorkerChannels, EngineError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let worker = EngineWorker {
            factory: self.factory.clone(),
            engine: None,
            labels: Vec::new(),
            terminated: terminated.clone(),
        };

        thread::Builder::new()
            .name("wakeword-engine".to_string())
            .spawn(move || worker.run(command_rx, response_tx))
            .map_err(|e| EngineError::WorkerSpawn(e.to_string()))?;

        debug!("Engine worker thread spawned");

        Ok(WorkerChannels {
            endpoint: Arc::new(ThreadEndpoint {
                commands: Mutex::new(Some(command_tx)),
                terminated,
            }),
            responses: response_rx,
        })
    }
}

/// Endpoint backed by an engine thread
pub struct ThreadEndpoint {
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    terminated: Arc<AtomicBool>,
}

impl fmt::Debug for ThreadEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEndpoint")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl WorkerEndpoint for ThreadEndpoint {
    fn post(&self, command: Command) -> Result<(), EngineError> {
        let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        match commands.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| EngineError::Terminated),
            None => Err(EngineError::Terminated),
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let sender = self.commands.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_some() {
            info!("Engine worker terminated");
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// State owned by the engine thread
struct EngineWorker {
    factory: Arc<dyn EngineFactory>,
    engine: Option<Box<dyn DetectionEngine>>,
    labels: Vec<String>,
    terminated: Arc<AtomicBool>,
}

impl EngineWorker {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, responses: mpsc::UnboundedSender<Response>) {
        while let Some(command) = commands.blocking_recv() {
            if self.terminated.load(Ordering::SeqCst) {
                break;
            }

            trace!("Worker handling {} command", command.kind());
            let response = self.handle(command);

            if responses.send(response).is_err() {
                debug!("Response channel closed, stopping worker");
                break;
            }
        }

        if self.engine.take().is_some() {
            debug!("Engine dropped on worker exit");
        }
    }

    fn handle(&mut self, command: Command) -> Response {
        match command {
            Command::Init(request) => self.init(request),
            Command::Process { input_frame } => self.process(&input_frame),
            Command::Release => {
                if self.engine.take().is_some() {
                    info!("Engine released");
                } else {
                    debug!("Release requested with no engine loaded");
                }
                self.labels.clear();
                Response::ok()
            }
        }
    }

    fn init(&mut self, request: InitRequest) -> Response {
        if self.engine.is_some() {
            return Response::failed(EngineStatus::InvalidState, "Engine is already initialized");
        }

        if request.keyword_labels.len() != request.keyword_paths.len() {
            return Response::failed(
                EngineStatus::InvalidArgument,
                "Keyword labels and paths differ in length",
            );
        }

        let preferred = AssetVariant::preferred();
        let selected = match preferred {
            AssetVariant::Simd => request
                .assets
                .simd
                .clone()
                .map(|b| (AssetVariant::Simd, b))
                .or_else(|| request.assets.baseline.clone().map(|b| (AssetVariant::Baseline, b))),
            AssetVariant::Baseline => request.assets.baseline.clone().map(|b| (AssetVariant::Baseline, b)),
        };

        let Some((variant, binary)) = selected else {
            return Response::failed(
                EngineStatus::InvalidState,
                format!("No engine payload registered for {:?}", preferred),
            );
        };

        let config = EngineConfig {
            credential: request.credential,
            model_path: request.model_path,
            keyword_paths: request.keyword_paths,
            sensitivities: request.sensitivities,
            variant,
            binary,
        };

        let factory = self.factory.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| factory.initialize(&config))) {
            Ok(Ok(engine)) => {
                let info = EngineInfo {
                    version: engine.version().to_string(),
                    frame_length: engine.frame_length(),
                    sample_rate: engine.sample_rate(),
                };
                self.engine = Some(engine);
                self.labels = request.keyword_labels;
                Response::initialized(info)
            }
            Ok(Err(failure)) => {
                warn!("Engine initialization failed: {}", failure);
                Response::failed(failure.status, failure.message)
            }
            Err(_) => {
                error!("Engine panicked during initialization");
                Response::error("Engine panicked during initialization")
            }
        }
    }

    fn process(&mut self, frame: &[i16]) -> Response {
        let Some(engine) = self.engine.as_mut() else {
            return Response::failed(EngineStatus::InvalidState, "Engine is not initialized");
        };

        match panic::catch_unwind(AssertUnwindSafe(|| engine.process(frame))) {
            Ok(Ok(Some(index))) => match self.labels.get(index) {
                Some(label) => Response::detected(Some(Detection {
                    index,
                    label: label.clone(),
                })),
                None => Response::error(format!("Engine reported unknown keyword index {}", index)),
            },
            Ok(Ok(None)) => Response::detected(None),
            Ok(Err(failure)) => Response::failed(failure.status, failure.message),
            Err(_) => {
                error!("Engine panicked while processing a frame");
                self.engine = None;
                Response::error("Engine panicked while processing a frame")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineFailure;
    use crate::protocol::{EngineAssets, WorkerOptions};
    use std::path::PathBuf;

    struct FixedEngine;

    impl DetectionEngine for FixedEngine {
        fn version(&self) -> &str {
            "test"
        }

        fn frame_length(&self) -> usize {
            4
        }

        fn sample_rate(&self) -> u32 {
            16000
        }

        fn process(&mut self, frame: &[i16]) -> Result<Option<usize>, EngineFailure> {
            match frame[0] {
                0 => Ok(None),
                1 => Ok(Some(0)),
                7 => Ok(Some(7)),
                9 => panic!("engine fault"),
                _ => Err(EngineFailure::new(EngineStatus::InvalidArgument, "bad frame")),
            }
        }
    }

    struct FixedFactory;

    impl EngineFactory for FixedFactory {
        fn initialize(&self, _config: &EngineConfig) -> Result<Box<dyn DetectionEngine>, EngineFailure> {
            Ok(Box::new(FixedEngine))
        }
    }

    fn init_request() -> InitRequest {
        InitRequest {
            credential: "key".to_string(),
            model_path: PathBuf::from("model.pv"),
            keyword_paths: vec!["builtin:porcupine".to_string()],
            keyword_labels: vec!["porcupine".to_string()],
            sensitivities: vec![0.5],
            assets: EngineAssets {
                baseline: Some(Arc::from(vec![1u8])),
                simd: Some(Arc::from(vec![2u8])),
            },
            options: WorkerOptions {
                storage_path: "model".to_string(),
                force_overwrite: false,
                asset_version: 1,
            },
        }
    }

    fn frame(first: i16) -> Command {
        Command::Process {
            input_frame: vec![first, 0, 0, 0],
        }
    }

    #[tokio::test]
    async fn test_responses_follow_command_order() {
        let mut channels = ThreadSpawner::new(FixedFactory).spawn().unwrap();

        channels.endpoint.post(Command::Init(init_request())).unwrap();
        for first in [0, 1, 0, 1, 2] {
            channels.endpoint.post(frame(first)).unwrap();
        }
        channels.endpoint.post(Command::Release).unwrap();

        let init = channels.responses.recv().await.unwrap();
        assert!(matches!(init, Response::Ok(ref p) if p.engine.as_ref().map(|e| e.frame_length) == Some(4)));

        let mut kinds = Vec::new();
        for _ in 0..5 {
            kinds.push(match channels.responses.recv().await.unwrap() {
                Response::Ok(p) if p.detection.is_some() => "hit",
                Response::Ok(_) => "miss",
                Response::Failed(_) => "failed",
                other => panic!("Unexpected response {:?}", other),
            });
        }
        assert_eq!(kinds, ["miss", "hit", "miss", "hit", "failed"]);

        assert_eq!(channels.responses.recv().await.unwrap(), Response::ok());
        channels.endpoint.terminate();
    }

    #[tokio::test]
    async fn test_process_before_init_fails() {
        let mut channels = ThreadSpawner::new(FixedFactory).spawn().unwrap();

        channels.endpoint.post(frame(0)).unwrap();
        match channels.responses.recv().await.unwrap() {
            Response::Failed(f) => assert_eq!(f.status, EngineStatus::InvalidState),
            other => panic!("Expected failure, got {:?}", other),
        }
        channels.endpoint.terminate();
    }

    #[tokio::test]
    async fn test_missing_payload_fails_init() {
        let mut channels = ThreadSpawner::new(FixedFactory).spawn().unwrap();

        let mut request = init_request();
        request.assets = EngineAssets::default();
        channels.endpoint.post(Command::Init(request)).unwrap();

        match channels.responses.recv().await.unwrap() {
            Response::Failed(f) => assert_eq!(f.status, EngineStatus::InvalidState),
            other => panic!("Expected failure, got {:?}", other),
        }
        channels.endpoint.terminate();
    }

    #[tokio::test]
    async fn test_engine_faults_become_error_responses() {
        let mut channels = ThreadSpawner::new(FixedFactory).spawn().unwrap();

        channels.endpoint.post(Command::Init(init_request())).unwrap();
        channels.endpoint.post(frame(7)).unwrap();
        channels.endpoint.post(frame(9)).unwrap();

        channels.responses.recv().await.unwrap();
        assert!(matches!(channels.responses.recv().await.unwrap(), Response::Error(_)));
        assert!(matches!(channels.responses.recv().await.unwrap(), Response::Error(_)));
        channels.endpoint.terminate();
    }

    #[tokio::test]
    async fn test_terminate_closes_endpoint() {
        let channels = ThreadSpawner::new(FixedFactory).spawn().unwrap();

        channels.endpoint.terminate();
        assert!(channels.endpoint.is_terminated());
        assert_eq!(
            channels.endpoint.post(frame(0)).unwrap_err(),
            EngineError::Terminated
        );
        // second call is a no-op
        channels.endpoint.terminate();
    }
}
