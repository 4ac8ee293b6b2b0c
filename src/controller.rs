/// Worker lifecycle controller
///
/// `WakeWordWorker` owns one engine worker. It provisions the model, sends the
/// single `init` request, streams frames with `process`, dispatches per-frame
/// replies to the application callbacks and tears the worker down.
///
/// Replies are correlated by arrival order: the worker answers strictly FIFO,
/// so every reply first settles an outstanding frame and only then the pending
/// `init` or `release` request.

use crate::engine::EnergyEngineFactory;
use crate::error::EngineError;
use crate::keywords::{check_storage_key, resolve_keywords, KeywordAsset, KeywordSet, KeywordSpec};
use crate::model_store::{FsModelStore, ModelProvisioner, ModelSource, ProvisionRequest};
use crate::protocol::{Command, Detection, EngineInfo, InitRequest, Response, WorkerOptions};
use crate::registry::AssetRegistry;
use crate::worker::{ThreadSpawner, WorkerChannels, WorkerEndpoint, WorkerSpawner};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Invoked on the dispatcher task for every detection; must not block
pub type DetectionCallback = Arc<dyn Fn(Detection) + Send + Sync>;

/// Invoked on the dispatcher task for every frame-level error; must not block
pub type ErrorCallback = Arc<dyn Fn(EngineError) + Send + Sync>;

pub const DEFAULT_STORAGE_PATH: &str = "porcupine_model";

/// Options fixed at creation time
#[derive(Clone)]
pub struct EngineOptions {
    /// Receives errors from `process`; errors are logged when unset
    pub error_callback: Option<ErrorCallback>,

    /// Storage key of the model in the model store
    pub storage_path: String,

    /// Rewrite stored assets even if the stored version is current
    pub force_overwrite: bool,

    /// Version of the supplied assets
    pub asset_version: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            error_callback: None,
            storage_path: DEFAULT_STORAGE_PATH.to_string(),
            force_overwrite: false,
            asset_version: 1,
        }
    }
}

impl EngineOptions {
    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(EngineError) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_storage_path(mut self, storage_path: impl Into<String>) -> Self {
        self.storage_path = storage_path.into();
        self
    }

    pub fn with_force_overwrite(mut self, force_overwrite: bool) -> Self {
        self.force_overwrite = force_overwrite;
        self
    }

    pub fn with_asset_version(mut self, asset_version: u32) -> Self {
        self.asset_version = asset_version;
        self
    }

    fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            storage_path: self.storage_path.clone(),
            force_overwrite: self.force_overwrite,
            asset_version: self.asset_version,
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("error_callback", &self.error_callback.is_some())
            .field("storage_path", &self.storage_path)
            .field("force_overwrite", &self.force_overwrite)
            .field("asset_version", &self.asset_version)
            .finish()
    }
}

/// Collaborators a controller is built from
#[derive(Clone)]
pub struct WorkerEnvironment {
    pub provisioner: Arc<dyn ModelProvisioner>,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub registry: Arc<AssetRegistry>,
}

impl WorkerEnvironment {
    pub fn new(
        provisioner: Arc<dyn ModelProvisioner>,
        spawner: Arc<dyn WorkerSpawner>,
        registry: Arc<AssetRegistry>,
    ) -> Self {
        Self {
            provisioner,
            spawner,
            registry,
        }
    }

    /// Filesystem model store, energy reference engine and the global registry
    pub fn local(storage_root: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(FsModelStore::new(storage_root)),
            Arc::new(ThreadSpawner::new(EnergyEngineFactory::new())),
            AssetRegistry::global(),
        )
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Initializing,
    Ready,
    Releasing,
    Released,
    Terminated,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Initializing => "initializing",
            WorkerState::Ready => "ready",
            WorkerState::Releasing => "releasing",
            WorkerState::Released => "released",
            WorkerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot request awaiting its reply
enum Pending {
    None,
    Init(oneshot::Sender<Result<EngineInfo, EngineError>>),
    Release(oneshot::Sender<Result<(), EngineError>>),
}

impl Pending {
    fn reject(self, err: EngineError) {
        match self {
            Pending::None => {}
            Pending::Init(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Release(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct Shared {
    state: WorkerState,
    pending: Pending,
    /// Process commands sent but not yet answered
    outstanding_frames: u64,
    frame_length: usize,
}

/// What a reply turned out to be, decided under the lock and acted on after
enum Routed {
    Frame(Response),
    Unsolicited(Response),
    Settled,
}

struct Core {
    shared: Mutex<Shared>,
    endpoint: Arc<dyn WorkerEndpoint>,
    on_detection: DetectionCallback,
    on_error: Option<ErrorCallback>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> WorkerState {
        self.lock().state
    }

    fn report(&self, err: EngineError) {
        match &self.on_error {
            Some(callback) => {
                let message = err.to_string();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(err))) {
                    error!(
                        "Error callback panicked ({}) while reporting: {}",
                        panic_message(payload.as_ref()),
                        message
                    );
                }
            }
            None => error!("Wake-word worker error: {}", err),
        }
    }

    fn process(&self, frame: &[i16]) {
        let result = {
            let mut shared = self.lock();
            if shared.state != WorkerState::Ready {
                Err(EngineError::InvalidState {
                    operation: "process",
                    state: shared.state.as_str(),
                })
            } else if frame.len() != shared.frame_length {
                Err(EngineError::Validation(format!(
                    "Frame must contain {} samples, got {}",
                    shared.frame_length,
                    frame.len()
                )))
            } else {
                let sent = self.endpoint.post(Command::Process {
                    input_frame: frame.to_vec(),
                });
                if sent.is_ok() {
                    shared.outstanding_frames += 1;
                }
                sent
            }
        };

        if let Err(err) = result {
            warn!("Frame not sent: {}", err);
            self.report(err);
        }
    }

    fn dispatch(&self, response: Response) {
        let routed = {
            let mut shared = self.lock();
            if shared.state == WorkerState::Terminated {
                return;
            }

            if shared.outstanding_frames > 0 {
                shared.outstanding_frames -= 1;
                Routed::Frame(response)
            } else {
                match std::mem::replace(&mut shared.pending, Pending::None) {
                    Pending::None => Routed::Unsolicited(response),
                    Pending::Init(tx) => {
                        let result = init_result(response);
                        if let Ok(info) = &result {
                            shared.frame_length = info.frame_length;
                            shared.state = WorkerState::Ready;
                        }
                        let _ = tx.send(result);
                        Routed::Settled
                    }
                    Pending::Release(tx) => {
                        let result = release_result(response);
                        if result.is_ok() {
                            shared.state = WorkerState::Released;
                            info!("Engine released");
                        }
                        let _ = tx.send(result);
                        Routed::Settled
                    }
                }
            }
        };

        match routed {
            Routed::Frame(response) => self.on_frame_response(response),
            Routed::Unsolicited(response) => {
                self.report(EngineError::Protocol(format!(
                    "Unsolicited response from worker: {:?}",
                    response
                )));
            }
            Routed::Settled => {}
        }
    }

    fn on_frame_response(&self, response: Response) {
        match response {
            Response::Ok(payload) => {
                if let Some(detection) = payload.detection {
                    debug!("Detected keyword {} ('{}')", detection.index, detection.label);
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.on_detection)(detection))) {
                        self.report(EngineError::Runtime(format!(
                            "Detection callback panicked: {}",
                            panic_message(payload.as_ref())
                        )));
                    }
                } else {
                    trace!("Frame processed, no detection");
                }
            }
            Response::Failed(failure) => self.report(failure.into()),
            Response::Error(fault) => self.report(EngineError::Runtime(fault.message)),
            Response::Unrecognized => {
                self.report(EngineError::Protocol(
                    "Unrecognized response to process".to_string(),
                ));
            }
        }
    }

    fn worker_exited(&self) {
        let pending = {
            let mut shared = self.lock();
            if shared.state == WorkerState::Terminated {
                return;
            }
            shared.state = WorkerState::Terminated;
            std::mem::replace(&mut shared.pending, Pending::None)
        };

        warn!("Engine worker exited unexpectedly");
        self.endpoint.terminate();
        pending.reject(EngineError::Runtime("Engine worker exited unexpectedly".to_string()));
    }

    fn terminate(&self) {
        let pending = {
            let mut shared = self.lock();
            if shared.state == WorkerState::Terminated {
                return;
            }
            shared.state = WorkerState::Terminated;
            std::mem::replace(&mut shared.pending, Pending::None)
        };

        self.endpoint.terminate();
        if let Some(dispatcher) = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            dispatcher.abort();
        }
        pending.reject(EngineError::Terminated);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn init_result(response: Response) -> Result<EngineInfo, EngineError> {
    match response {
        Response::Ok(payload) => payload
            .engine
            .ok_or_else(|| EngineError::Protocol("Init response carried no engine info".to_string())),
        Response::Failed(failure) => Err(failure.into()),
        Response::Error(fault) => Err(EngineError::Runtime(fault.message)),
        Response::Unrecognized => Err(EngineError::Protocol("Unrecognized response to init".to_string())),
    }
}

fn release_result(response: Response) -> Result<(), EngineError> {
    match response {
        Response::Ok(_) => Ok(()),
        Response::Failed(failure) => Err(failure.into()),
        Response::Error(fault) => Err(EngineError::Runtime(fault.message)),
        Response::Unrecognized => Err(EngineError::Protocol("Unrecognized response to release".to_string())),
    }
}

async fn dispatch_loop(core: Arc<Core>, mut responses: mpsc::UnboundedReceiver<Response>) {
    while let Some(response) = responses.recv().await {
        core.dispatch(response);
    }
    core.worker_exited();
}

async fn provision_keyword_assets(
    provisioner: &dyn ModelProvisioner,
    keywords: &KeywordSet,
) -> Result<Vec<String>, EngineError> {
    let mut paths = Vec::with_capacity(keywords.len());

    for asset in keywords.assets() {
        match asset {
            KeywordAsset::BuiltIn(keyword) => paths.push(keyword.asset_name()),
            KeywordAsset::Custom {
                source,
                storage_key,
                force_overwrite,
                version,
            } => {
                let path = provisioner
                    .provision(ProvisionRequest {
                        source: source.clone(),
                        storage_key: storage_key.clone(),
                        force_overwrite: *force_overwrite,
                        version: *version,
                    })
                    .await?;
                paths.push(path.to_string_lossy().into_owned());
            }
        }
    }

    Ok(paths)
}

/// Worker whose `init` request is still in flight
///
/// Dropping it terminates the worker.
pub struct PendingWorker {
    core: Option<Arc<Core>>,
    init: Option<oneshot::Receiver<Result<EngineInfo, EngineError>>>,
    labels: Vec<String>,
}

impl PendingWorker {
    pub fn state(&self) -> WorkerState {
        self.core.as_ref().map_or(WorkerState::Terminated, |core| core.state())
    }

    /// Cancel initialization; `ready` then resolves to `EngineError::Terminated`
    pub fn terminate(&self) {
        if let Some(core) = &self.core {
            core.terminate();
        }
    }

    /// Wait for the `init` reply
    pub async fn ready(mut self) -> Result<WakeWordWorker, EngineError> {
        let result = match self.init.take() {
            Some(rx) => rx.await.unwrap_or(Err(EngineError::Terminated)),
            None => Err(EngineError::Terminated),
        };

        let core = self.core.take().ok_or(EngineError::Terminated)?;
        // init may have answered just before a terminate
        let result = match result {
            Ok(_) if core.state() == WorkerState::Terminated => Err(EngineError::Terminated),
            other => other,
        };

        match result {
            Ok(info) => {
                info!(
                    "Wake-word engine ready (version {}, frame_length {}, sample_rate {})",
                    info.version, info.frame_length, info.sample_rate
                );
                Ok(WakeWordWorker {
                    core,
                    info,
                    labels: std::mem::take(&mut self.labels),
                })
            }
            Err(err) => {
                error!("Wake-word engine failed to initialize: {}", err);
                core.terminate();
                Err(err)
            }
        }
    }
}

impl Drop for PendingWorker {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.terminate();
        }
    }
}

impl fmt::Debug for PendingWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWorker")
            .field("state", &self.state())
            .field("keywords", &self.labels)
            .finish()
    }
}

/// Controller for one engine worker
pub struct WakeWordWorker {
    core: Arc<Core>,
    info: EngineInfo,
    labels: Vec<String>,
}

impl WakeWordWorker {
    /// Provision, spawn and initialize a worker, resolving once it is ready
    pub async fn create<I, K, F>(
        env: &WorkerEnvironment,
        credential: &str,
        keywords: I,
        on_detection: F,
        model: ModelSource,
        options: EngineOptions,
    ) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = K>,
        K: Into<KeywordSpec>,
        F: Fn(Detection) + Send + Sync + 'static,
    {
        Self::start(env, credential, keywords, on_detection, model, options)
            .await?
            .ready()
            .await
    }

    /// Like `create`, but returns as soon as `init` has been sent
    pub async fn start<I, K, F>(
        env: &WorkerEnvironment,
        credential: &str,
        keywords: I,
        on_detection: F,
        model: ModelSource,
        options: EngineOptions,
    ) -> Result<PendingWorker, EngineError>
    where
        I: IntoIterator<Item = K>,
        K: Into<KeywordSpec>,
        F: Fn(Detection) + Send + Sync + 'static,
    {
        if credential.trim().is_empty() {
            return Err(EngineError::Validation("Credential is required".to_string()));
        }
        if model.is_empty() {
            return Err(EngineError::Validation("Model source is empty".to_string()));
        }

        check_storage_key("model", &options.storage_path)?;
        let keywords = resolve_keywords(keywords, &options.storage_path)?;

        info!("Provisioning model '{}'", options.storage_path);
        let model_path = env
            .provisioner
            .provision(ProvisionRequest {
                source: model,
                storage_key: options.storage_path.clone(),
                force_overwrite: options.force_overwrite,
                version: options.asset_version,
            })
            .await?;
        let keyword_paths = provision_keyword_assets(env.provisioner.as_ref(), &keywords).await?;

        let WorkerChannels { endpoint, responses } = env.spawner.spawn()?;

        let core = Arc::new(Core {
            shared: Mutex::new(Shared {
                state: WorkerState::Uninitialized,
                pending: Pending::None,
                outstanding_frames: 0,
                frame_length: 0,
            }),
            endpoint,
            on_detection: Arc::new(on_detection),
            on_error: options.error_callback.clone(),
            dispatcher: Mutex::new(None),
        });

        let request = InitRequest {
            credential: credential.to_string(),
            model_path,
            keyword_paths,
            keyword_labels: keywords.labels().to_vec(),
            sensitivities: keywords.sensitivities().to_vec(),
            assets: env.registry.snapshot(),
            options: options.worker_options(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut shared = core.lock();
            if let Err(err) = core.endpoint.post(Command::Init(request)) {
                drop(shared);
                core.endpoint.terminate();
                return Err(err);
            }
            shared.pending = Pending::Init(tx);
            shared.state = WorkerState::Initializing;
        }
        debug!("Init sent for {} keyword(s)", keywords.len());

        let dispatcher = tokio::spawn(dispatch_loop(core.clone(), responses));
        *core.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);

        Ok(PendingWorker {
            core: Some(core),
            init: Some(rx),
            labels: keywords.labels().to_vec(),
        })
    }

    /// Queue one frame of exactly `frame_length` samples
    ///
    /// Never blocks. Frames sent outside the ready state or with the wrong
    /// length are not queued; the error goes to the error callback instead.
    pub fn process(&self, frame: &[i16]) {
        self.core.process(frame);
    }

    /// Free the engine; the worker stays alive but accepts no more frames
    ///
    /// Calling it again after it succeeded resolves immediately. After a
    /// failed release the worker stays in `Releasing` and release may be
    /// retried.
    pub async fn release(&self) -> Result<(), EngineError> {
        let rx = {
            let mut shared = self.core.lock();
            match shared.state {
                WorkerState::Released => return Ok(()),
                WorkerState::Terminated => return Err(EngineError::Terminated),
                WorkerState::Releasing if matches!(shared.pending, Pending::Release(_)) => {
                    return Err(EngineError::InvalidState {
                        operation: "release",
                        state: "releasing",
                    });
                }
                WorkerState::Ready | WorkerState::Releasing => {}
                other => {
                    return Err(EngineError::InvalidState {
                        operation: "release",
                        state: other.as_str(),
                    });
                }
            }

            self.core.endpoint.post(Command::Release)?;
            let (tx, rx) = oneshot::channel();
            shared.pending = Pending::Release(tx);
            shared.state = WorkerState::Releasing;
            debug!("Release sent ({} frame(s) in flight)", shared.outstanding_frames);
            rx
        };

        rx.await.unwrap_or(Err(EngineError::Terminated))
    }

    /// Tear the worker down immediately; pending requests resolve to `Terminated`
    pub fn terminate(&self) {
        self.core.terminate();
    }

    pub fn state(&self) -> WorkerState {
        self.core.state()
    }

    pub fn info(&self) -> &EngineInfo {
        &self.info
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn frame_length(&self) -> usize {
        self.info.frame_length
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    pub fn keyword_labels(&self) -> &[String] {
        &self.labels
    }

    pub fn endpoint(&self) -> &Arc<dyn WorkerEndpoint> {
        &self.core.endpoint
    }
}

impl Drop for WakeWordWorker {
    fn drop(&mut self) {
        self.core.terminate();
    }
}

impl fmt::Debug for WakeWordWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeWordWorker")
            .field("state", &self.state())
            .field("info", &self.info)
            .field("keywords", &self.labels)
            .finish()
    }
}

/// Detection callback that forwards into a channel
pub fn detection_channel() -> (
    impl Fn(Detection) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Detection>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |detection: Detection| {
        let _ = tx.send(detection);
    };
    (callback, rx)
}

/// Error callback that forwards into a channel
pub fn error_channel() -> (ErrorCallback, mpsc::UnboundedReceiver<EngineError>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ErrorCallback = Arc::new(move |err: EngineError| {
        let _ = tx.send(err);
    });
    (callback, rx)
}
