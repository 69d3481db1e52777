use crate::error::{Error, Result};
use crate::types::{BundleArtifactStorage, JobBundleVersion};
use bytes::Bytes;
use std::path::PathBuf;

/// Fetches bundle artifact bytes for the cache to materialize.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch(&self, version: &JobBundleVersion) -> Result<Bytes>;

    async fn exists(&self, version: &JobBundleVersion) -> Result<bool>;
}

/// Filesystem-rooted artifact store for `local` storage
/// (development and single-node deployments).
#[derive(Clone)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn artifact_path(&self, version: &JobBundleVersion) -> Result<PathBuf> {
        let relative = PathBuf::from(&version.artifact_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::validation(format!(
                "artifact path '{}' escapes the storage root",
                version.artifact_path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn fetch(&self, version: &JobBundleVersion) -> Result<Bytes> {
        let path = self.artifact_path(version)?;
        let data = tokio::fs::read(&path).await.map_err(|e| {
            Error::BundleResolution {
                binding: version.key(),
                reason: format!("reading artifact {}: {e}", path.display()),
            }
        })?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, version: &JobBundleVersion) -> Result<bool> {
        Ok(self.artifact_path(version)?.exists())
    }
}

/// Object-store-backed artifacts (S3, MinIO, anything `object_store`
/// speaks) for `s3` storage.
pub struct ObjectArtifactStore {
    store: Box<dyn object_store::ObjectStore>,
    prefix: String,
}

impl ObjectArtifactStore {
    pub fn new(store: Box<dyn object_store::ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn artifact_key(&self, version: &JobBundleVersion) -> object_store::path::Path {
        let key = if self.prefix.is_empty() {
            version.artifact_path.clone()
        } else {
            format!("{}/{}", self.prefix, version.artifact_path)
        };
        object_store::path::Path::from(key)
    }
}

#[async_trait::async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn fetch(&self, version: &JobBundleVersion) -> Result<Bytes> {
        let key = self.artifact_key(version);
        let result = self
            .store
            .get(&key)
            .await
            .map_err(|e| Error::BundleResolution {
                binding: version.key(),
                reason: format!("fetching {key}: {e}"),
            })?;
        result.bytes().await.map_err(|e| Error::BundleResolution {
            binding: version.key(),
            reason: format!("reading {key}: {e}"),
        })
    }

    async fn exists(&self, version: &JobBundleVersion) -> Result<bool> {
        let key = self.artifact_key(version);
        match self.store.head(&key).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Error::store(e.to_string())),
        }
    }
}

/// Routes fetches by the version's declared storage kind.
pub struct RoutingArtifactStore {
    local: FilesystemArtifactStore,
    remote: Option<ObjectArtifactStore>,
}

impl RoutingArtifactStore {
    pub fn new(local: FilesystemArtifactStore, remote: Option<ObjectArtifactStore>) -> Self {
        Self { local, remote }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for RoutingArtifactStore {
    async fn fetch(&self, version: &JobBundleVersion) -> Result<Bytes> {
        match version.artifact_storage {
            BundleArtifactStorage::Local => self.local.fetch(version).await,
            BundleArtifactStorage::S3 => match &self.remote {
                Some(remote) => remote.fetch(version).await,
                None => Err(Error::BundleResolution {
                    binding: version.key(),
                    reason: "s3 artifact storage is not configured".to_string(),
                }),
            },
        }
    }

    async fn exists(&self, version: &JobBundleVersion) -> Result<bool> {
        match version.artifact_storage {
            BundleArtifactStorage::Local => self.local.exists(version).await,
            BundleArtifactStorage::S3 => match &self.remote {
                Some(remote) => remote.exists(version).await,
                None => Ok(false),
            },
        }
    }
}
