//! Resolution of the storage backend from the workspace storage setting.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use memos_core::{Error, Result, S3Config, StorageSetting, StorageType};
use memos_db::{LocalBackend, S3Backend, StorageBackend};

type S3Cache = Arc<Mutex<Option<(S3Config, Arc<dyn StorageBackend>)>>>;

/// Picks the backend for new objects and for existing ones.
#[derive(Clone)]
pub enum StorageResolver {
    /// Follow the persisted setting: local directory or the configured S3 bucket.
    Settings {
        local: Arc<LocalBackend>,
        s3: S3Cache,
    },
    /// Always use one backend regardless of the setting.
    Fixed(Arc<dyn StorageBackend>),
}

impl StorageResolver {
    pub fn from_settings(local_root: impl Into<PathBuf>) -> Self {
        Self::Settings {
            local: Arc::new(LocalBackend::new(local_root)),
            s3: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fixed(backend: Arc<dyn StorageBackend>) -> Self {
        Self::Fixed(backend)
    }

    /// Backend receiving new uploads under `setting`.
    pub fn resolve(&self, setting: &StorageSetting) -> Result<Arc<dyn StorageBackend>> {
        self.backend_for(setting.storage_type, setting)
    }

    /// Backend holding objects of `storage_type`.
    pub fn backend_for(
        &self,
        storage_type: StorageType,
        setting: &StorageSetting,
    ) -> Result<Arc<dyn StorageBackend>> {
        match self {
            Self::Fixed(backend) => Ok(backend.clone()),
            Self::Settings { local, s3 } => match storage_type {
                StorageType::Local => Ok(local.clone() as Arc<dyn StorageBackend>),
                StorageType::S3 => {
                    let config = setting.s3_config.as_ref().ok_or_else(|| {
                        Error::Config("S3 storage selected without s3_config".into())
                    })?;
                    let mut cache = s3.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some((cached_config, backend)) = cache.as_ref() {
                        if cached_config == config {
                            return Ok(backend.clone());
                        }
                    }
                    let backend: Arc<dyn StorageBackend> = Arc::new(S3Backend::new(config)?);
                    *cache = Some((config.clone(), backend.clone()));
                    Ok(backend)
                }
            },
        }
    }

    /// The local backend, when this resolver has one.
    pub fn local(&self) -> Option<&LocalBackend> {
        match self {
            Self::Settings { local, .. } => Some(local.as_ref()),
            Self::Fixed(_) => None,
        }
    }
}
