/// Service configuration
///
/// Loaded from an optional JSON file, then overridden by environment
/// variables. Used by the `wakeword-service` binary.

use crate::controller::{EngineOptions, DEFAULT_STORAGE_PATH};
use crate::keywords::{KeywordSpec, DEFAULT_SENSITIVITY};
use crate::model_store::ModelSource;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const ENV_CONFIG_FILE: &str = "WAKEWORD_CONFIG";
pub const ENV_ACCESS_KEY: &str = "PORCUPINE_ACCESS_KEY";
pub const ENV_KEYWORDS: &str = "WAKEWORD_KEYWORDS";
pub const ENV_SENSITIVITY: &str = "WAKEWORD_SENSITIVITY";
pub const ENV_MODEL_PATH: &str = "WAKEWORD_MODEL_PATH";
pub const ENV_STORAGE_DIR: &str = "WAKEWORD_STORAGE_DIR";
pub const ENV_ENGINE_BINARY: &str = "WAKEWORD_ENGINE_BINARY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub access_key: String,
    pub keywords: Vec<String>,
    pub sensitivity: f32,
    pub model_path: PathBuf,
    pub storage_dir: PathBuf,
    pub storage_path: String,
    pub force_overwrite: bool,
    pub asset_version: u32,

    /// Engine payload registered as the baseline variant
    pub engine_binary: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(), // Must be provided by user
            keywords: vec!["porcupine".to_string()],
            sensitivity: DEFAULT_SENSITIVITY,
            model_path: PathBuf::from("models/porcupine_params.pv"),
            storage_dir: PathBuf::from(".wakeword"),
            storage_path: DEFAULT_STORAGE_PATH.to_string(),
            force_overwrite: false,
            asset_version: 1,
            engine_binary: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// File named by `WAKEWORD_CONFIG` (if any), then process environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let base = match vars.get(ENV_CONFIG_FILE) {
            Some(path) => Self::from_file(Path::new(path))?,
            None => Self::default(),
        };
        let config = base.with_overrides(&vars)?;
        config.validate()?;
        debug!("Loaded service config: keywords={:?}", config.keywords);
        Ok(config)
    }

    pub fn with_overrides(mut self, vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        if let Some(key) = vars.get(ENV_ACCESS_KEY) {
            self.access_key = key.clone();
        }
        if let Some(keywords) = vars.get(ENV_KEYWORDS) {
            self.keywords = keywords
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = vars.get(ENV_SENSITIVITY) {
            self.sensitivity = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_SENSITIVITY,
                value: value.clone(),
            })?;
        }
        if let Some(path) = vars.get(ENV_MODEL_PATH) {
            self.model_path = PathBuf::from(path);
        }
        if let Some(dir) = vars.get(ENV_STORAGE_DIR) {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(path) = vars.get(ENV_ENGINE_BINARY) {
            self.engine_binary = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_key.is_empty() {
            return Err(ConfigError::Invalid(format!("{} is required", ENV_ACCESS_KEY)));
        }

        if self.keywords.is_empty() {
            return Err(ConfigError::Invalid("At least one keyword is required".to_string()));
        }

        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(ConfigError::Invalid(
                "Sensitivity must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn keyword_specs(&self) -> Vec<KeywordSpec> {
        self.keywords
            .iter()
            .map(|k| KeywordSpec::from(k.as_str()).with_sensitivity(self.sensitivity))
            .collect()
    }

    pub fn model_source(&self) -> ModelSource {
        ModelSource::PublicPath(self.model_path.clone())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions::default()
            .with_storage_path(self.storage_path.clone())
            .with_force_overwrite(self.force_overwrite)
            .with_asset_version(self.asset_version)
    }
}
