//! Filesystem object store
//!
//! A local directory acting as a bucket. Headers and ETags are kept in JSON
//! sidecars under `.meta/`. Conditional writes are serialized in-process;
//! create-only writes are also atomic across processes on one host.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ObjectHeaders, ObjectMetadata, ObjectStore, ObjectSummary, Precondition, VersionedObject};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::sha256_hash;

const META_DIR: &str = ".meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    headers: ObjectHeaders,
    etag: String,
}

/// Filesystem-based object store
pub struct FsObjectStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsObjectStore {
    /// Create new filesystem store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, DeployError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !key.starts_with(META_DIR);
        if !valid {
            return Err(DeployError::ValidationError(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(relative))
    }

    fn sidecar(&self, key: &str) -> File {
        File::new(self.root.join(META_DIR).join(format!("{key}.json")))
    }

    async fn current_etag(&self, key: &str) -> Result<Option<String>, DeployError> {
        let path = self.object_path(key)?;
        if fs::metadata(&path).await.is_err() {
            return Ok(None);
        }
        let sidecar = self.sidecar(key);
        if sidecar.exists().await {
            let meta: Sidecar = sidecar.read_json().await?;
            return Ok(Some(meta.etag));
        }
        Ok(Some(sha256_hash(&fs::read(&path).await?)))
    }

    async fn write_sidecar(&self, key: &str, headers: &ObjectHeaders, etag: &str) -> Result<(), DeployError> {
        self.sidecar(key)
            .write_json(&Sidecar {
                headers: headers.clone(),
                etag: etag.to_string(),
            })
            .await
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn check(&self) -> Result<(), DeployError> {
        let dir = Dir::new(&self.root);
        dir.create().await.map_err(|e| {
            DeployError::Environment(format!("cannot use {}: {}", self.root.display(), e))
        })?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes, headers: &ObjectHeaders) -> Result<(), DeployError> {
        let path = self.object_path(key)?;
        let etag = sha256_hash(&body);
        File::new(path).write_atomic(&body).await?;
        self.write_sidecar(key, headers, &etag).await
    }

    async fn put_object_if(
        &self,
        key: &str,
        body: Bytes,
        headers: &ObjectHeaders,
        precondition: Precondition,
    ) -> Result<String, DeployError> {
        let _guard = self.write_lock.lock().await;
        let path = self.object_path(key)?;
        let etag = sha256_hash(&body);

        match precondition {
            Precondition::DoesNotExist => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                // Link a fully written temp file into place; linking fails
                // if the target already exists.
                let temp = path.with_file_name(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
                let mut file = fs::File::create(&temp).await?;
                file.write_all(&body).await?;
                file.sync_all().await?;
                drop(file);

                let linked = fs::hard_link(&temp, &path).await;
                let _ = fs::remove_file(&temp).await;
                match linked {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(DeployError::PreconditionFailed(format!("{key} already exists")));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Precondition::Matches(expected) => {
                match self.current_etag(key).await? {
                    Some(current) if current == expected => {}
                    Some(_) => {
                        return Err(DeployError::PreconditionFailed(format!("{key} was modified")));
                    }
                    None => {
                        return Err(DeployError::PreconditionFailed(format!("{key} no longer exists")));
                    }
                }
                File::new(&path).write_atomic(&body).await?;
            }
        }

        self.write_sidecar(key, headers, &etag).await?;
        Ok(etag)
    }

    async fn get_object(&self, key: &str) -> Result<VersionedObject, DeployError> {
        let path = self.object_path(key)?;
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let etag = match self.sidecar(key).read_json::<Sidecar>().await {
            Ok(meta) => meta.etag,
            Err(_) => sha256_hash(&body),
        };
        Ok(VersionedObject {
            body: Bytes::from(body),
            etag,
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, DeployError> {
        if !Dir::new(&self.root).exists().await {
            return Ok(Vec::new());
        }
        let entries = Dir::new(&self.root).walk_files().await?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.relative_path.starts_with(META_DIR))
            .filter(|e| !is_temp_file(&e.relative_path))
            .filter(|e| e.relative_path.starts_with(prefix))
            .map(|e| ObjectSummary {
                key: e.relative_path,
                size: e.size,
            })
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<(), DeployError> {
        let path = self.object_path(key)?;
        File::new(path).delete().await?;
        self.sidecar(key).delete().await
    }

    async fn get_object_metadata(&self, key: &str) -> Result<ObjectMetadata, DeployError> {
        let path = self.object_path(key)?;
        let size = match fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let sidecar = self.sidecar(key);
        let (headers, etag) = if sidecar.exists().await {
            let meta: Sidecar = sidecar.read_json().await?;
            (meta.headers, Some(meta.etag))
        } else {
            (ObjectHeaders::default(), None)
        };
        Ok(ObjectMetadata { headers, size, etag })
    }
}

fn is_temp_file(relative_path: &str) -> bool {
    relative_path
        .rsplit('/')
        .next()
        .map(|name| name.starts_with('.') && name.ends_with(".tmp"))
        .unwrap_or(false)
}
