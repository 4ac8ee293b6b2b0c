/// Model store
///
/// Turns a base64 blob or a file path into a durable on-disk model path.
/// The controller only depends on the `ModelProvisioner` trait; `FsModelStore`
/// is the filesystem-backed default.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ModelStoreError {
    #[error("Invalid storage key: '{0}'")]
    InvalidKey(String),

    #[error("Invalid base64 model payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Model payload is empty")]
    EmptyPayload,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a model asset comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Model bytes encoded as standard base64
    Base64(String),

    /// Model file readable by this process
    PublicPath(PathBuf),
}

impl ModelSource {
    pub fn is_empty(&self) -> bool {
        match self {
            ModelSource::Base64(data) => data.trim().is_empty(),
            ModelSource::PublicPath(path) => path.as_os_str().is_empty(),
        }
    }
}

/// One provisioning call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub source: ModelSource,
    pub storage_key: String,
    pub force_overwrite: bool,
    pub version: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelProvisioner: Send + Sync {
    /// Store the asset (if needed) and return its durable path
    async fn provision(&self, request: ProvisionRequest) -> Result<PathBuf, ModelStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredModel {
    version: u32,
    bytes: u64,
}

/// Filesystem model store rooted at a directory
///
/// Each asset lives at `<root>/<storage_key>` with a `<storage_key>.meta.json`
/// sidecar recording its version. A stored asset is reused unless the caller
/// forces an overwrite or asks for a newer version.
#[derive(Debug, Clone)]
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_key(key: &str) -> Result<(), ModelStoreError> {
        let bad = key.is_empty()
            || key == "."
            || key == ".."
            || key.contains(['/', '\\'])
            || key.ends_with(".meta.json");
        if bad {
            return Err(ModelStoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    async fn stored_version(meta_path: &Path) -> Option<u32> {
        let text = tokio::fs::read_to_string(meta_path).await.ok()?;
        serde_json::from_str::<StoredModel>(&text).ok().map(|m| m.version)
    }

    async fn load_payload(source: &ModelSource) -> Result<Vec<u8>, ModelStoreError> {
        let bytes = match source {
            ModelSource::Base64(data) => STANDARD.decode(data.trim())?,
            ModelSource::PublicPath(path) => tokio::fs::read(path).await.map_err(|source| ModelStoreError::Io {
                path: path.clone(),
                source,
            })?,
        };

        if bytes.is_empty() {
            return Err(ModelStoreError::EmptyPayload);
        }
        Ok(bytes)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ModelStoreError + '_ {
    move |source| ModelStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ModelProvisioner for FsModelStore {
    async fn provision(&self, request: ProvisionRequest) -> Result<PathBuf, ModelStoreError> {
        Self::check_key(&request.storage_key)?;

        let target = self.root.join(&request.storage_key);
        let meta_path = self.root.join(format!("{}.meta.json", request.storage_key));

        if !request.force_overwrite && tokio::fs::try_exists(&target).await.unwrap_or(false) {
            if let Some(stored) = Self::stored_version(&meta_path).await {
                if stored >= request.version {
                    debug!("Reusing stored model {} (version {})", target.display(), stored);
                    return Ok(target);
                }
            }
        }

        let bytes = Self::load_payload(&request.source).await?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_error(&self.root))?;

        let staging = self.root.join(format!(".{}.partial", request.storage_key));
        tokio::fs::write(&staging, &bytes).await.map_err(io_error(&staging))?;
        tokio::fs::rename(&staging, &target).await.map_err(io_error(&target))?;

        let meta = StoredModel {
            version: request.version,
            bytes: bytes.len() as u64,
        };
        let meta_json = serde_json::to_string(&meta).map_err(|e| ModelStoreError::Io {
            path: meta_path.clone(),
            source: e.into(),
        })?;
        tokio::fs::write(&meta_path, meta_json)
            .await
            .map_err(io_error(&meta_path))?;

        info!(
            "Stored model {} ({} bytes, version {})",
            target.display(),
            bytes.len(),
            request.version
        );
        Ok(target)
    }
}
