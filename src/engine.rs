/// Detection engine interface and the energy-onset reference engine
///
/// The worker only talks to engines through `EngineFactory` and
/// `DetectionEngine`. `EnergyEngine` is a lightweight stand-in for the native
/// keyword-spotting engine: it keeps the same contract (fixed frame length,
/// credential check, zero-or-one detection per frame) and triggers on the
/// rising edge of frame energy.

use crate::keywords::{BuiltInKeyword, BUILTIN_ASSET_PREFIX};
use crate::protocol::EngineStatus;
use crate::registry::AssetVariant;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Failure reported by an engine; becomes a `failed` response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct EngineFailure {
    pub status: EngineStatus,
    pub message: String,
}

impl EngineFailure {
    pub fn new(status: EngineStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Everything an engine needs to initialize
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub credential: String,
    pub model_path: PathBuf,
    pub keyword_paths: Vec<String>,
    pub sensitivities: Vec<f32>,
    pub variant: AssetVariant,
    pub binary: Arc<[u8]>,
}

pub trait DetectionEngine: Send {
    fn version(&self) -> &str;

    fn frame_length(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Returns the index of the detected keyword, if any
    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>, EngineFailure>;
}

pub trait EngineFactory: Send + Sync {
    fn initialize(&self, config: &EngineConfig) -> Result<Box<dyn DetectionEngine>, EngineFailure>;
}

pub const ENERGY_ENGINE_VERSION: &str = "3.0.0";
pub const ENERGY_FRAME_LENGTH: usize = 512;
pub const ENERGY_SAMPLE_RATE: u32 = 16000;

/// RMS threshold at sensitivity 1.0
const MIN_THRESHOLD: f64 = 0.05;

/// Threshold added as sensitivity drops to 0.0
const THRESHOLD_SPAN: f64 = 0.5;

/// Builds `EnergyEngine`s, optionally restricted to a set of access keys
#[derive(Debug, Clone, Default)]
pub struct EnergyEngineFactory {
    access_keys: Option<HashSet<String>>,
}

impl EnergyEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only these credentials activate; anything else is refused
    pub fn with_access_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            access_keys: Some(keys.into_iter().map(Into::into).collect()),
        }
    }

    fn check_credential(&self, credential: &str) -> Result<(), EngineFailure> {
        if credential.is_empty() || credential.chars().any(char::is_whitespace) {
            return Err(EngineFailure::new(
                EngineStatus::InvalidArgument,
                "AccessKey is malformed",
            ));
        }

        if let Some(keys) = &self.access_keys {
            if !keys.contains(credential) {
                return Err(EngineFailure::new(
                    EngineStatus::ActivationRefused,
                    "AccessKey is invalid or has been revoked",
                ));
            }
        }
        Ok(())
    }

    fn check_keyword_path(path: &str) -> Result<(), EngineFailure> {
        if let Some(name) = path.strip_prefix(BUILTIN_ASSET_PREFIX) {
            return name
                .parse::<BuiltInKeyword>()
                .map(|_| ())
                .map_err(|_| EngineFailure::new(EngineStatus::KeyError, format!("Unknown built-in keyword asset '{}'", path)));
        }

        if !Path::new(path).is_file() {
            return Err(EngineFailure::new(
                EngineStatus::IoError,
                format!("Keyword file not found: {}", path),
            ));
        }
        Ok(())
    }
}

impl EngineFactory for EnergyEngineFactory {
    fn initialize(&self, config: &EngineConfig) -> Result<Box<dyn DetectionEngine>, EngineFailure> {
        if config.binary.is_empty() {
            return Err(EngineFailure::new(
                EngineStatus::InvalidState,
                format!("{:?} engine payload is empty", config.variant),
            ));
        }

        self.check_credential(&config.credential)?;

        if !config.model_path.is_file() {
            return Err(EngineFailure::new(
                EngineStatus::IoError,
                format!("Model file not found: {}", config.model_path.display()),
            ));
        }

        if config.keyword_paths.is_empty() || config.keyword_paths.len() != config.sensitivities.len() {
            return Err(EngineFailure::new(
                EngineStatus::InvalidArgument,
                format!(
                    "Expected one sensitivity per keyword ({} keywords, {} sensitivities)",
                    config.keyword_paths.len(),
                    config.sensitivities.len()
                ),
            ));
        }

        for path in &config.keyword_paths {
            Self::check_keyword_path(path)?;
        }

        let mut thresholds = Vec::with_capacity(config.sensitivities.len());
        for &sensitivity in &config.sensitivities {
            if !(0.0..=1.0).contains(&sensitivity) {
                return Err(EngineFailure::new(
                    EngineStatus::InvalidArgument,
                    format!("Sensitivity {} is outside [0, 1]", sensitivity),
                ));
            }
            thresholds.push(MIN_THRESHOLD + (1.0 - sensitivity as f64) * THRESHOLD_SPAN);
        }

        info!(
            "Energy engine initialized ({} keywords, {:?} payload)",
            thresholds.len(),
            config.variant
        );

        Ok(Box::new(EnergyEngine {
            active: vec![false; thresholds.len()],
            thresholds,
        }))
    }
}

/// Reference engine: fires a keyword when frame RMS rises above its threshold
#[derive(Debug)]
pub struct EnergyEngine {
    thresholds: Vec<f64>,
    active: Vec<bool>,
}

impl EnergyEngine {
    fn rms(frame: &[i16]) -> f64 {
        let energy: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();

        (energy / frame.len() as f64).sqrt()
    }
}

impl DetectionEngine for EnergyEngine {
    fn version(&self) -> &str {
        ENERGY_ENGINE_VERSION
    }

    fn frame_length(&self) -> usize {
        ENERGY_FRAME_LENGTH
    }

    fn sample_rate(&self) -> u32 {
        ENERGY_SAMPLE_RATE
    }

    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>, EngineFailure> {
        if frame.len() != ENERGY_FRAME_LENGTH {
            return Err(EngineFailure::new(
                EngineStatus::InvalidArgument,
                format!(
                    "Frame must contain {} samples, got {}",
                    ENERGY_FRAME_LENGTH,
                    frame.len()
                ),
            ));
        }

        let rms = Self::rms(frame);
        let mut detected = None;

        for (index, (&threshold, active)) in self.thresholds.iter().zip(self.active.iter_mut()).enumerate() {
            let above = rms >= threshold;
            if above && !*active && detected.is_none() {
                detected = Some(index);
            }
            *active = above;
        }

        if let Some(index) = detected {
            debug!("Keyword {} triggered (rms={:.3})", index, rms);
        }
        Ok(detected)
    }
}
