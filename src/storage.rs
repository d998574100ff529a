//! Remote storage targets for the upload job.
//!
//! A [`RemoteStore`] copies one local file to a remote path. Two stores
//! exist:
//!
//! | `upload.store` | Type | Target |
//! |----------------|------|--------|
//! | `dir` | [`DirStore`] | a mounted directory (NFS, SMB, USB disk) |
//! | `s3` | [`S3Store`](crate::storage_s3::S3Store) | an S3-compatible bucket |
//!
//! Both write atomically from the reader's point of view: a partially
//! transferred object is never visible under its final name.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::storage_s3::S3Store;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;

    /// Upload `local` to `remote` (a `/`-separated path), replacing any
    /// existing object.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Upload `local` under a fixed snapshot name, overwriting the previous one.
    async fn upload_snapshot(&self, local: &Path, name: &str) -> Result<()> {
        self.upload(local, name).await
    }
}

/// Build the store named by `upload.store`.
pub fn store_from_config(cfg: &UploadConfig) -> Result<Arc<dyn RemoteStore>> {
    match cfg.store.as_str() {
        "dir" => {
            let root = cfg
                .dir
                .clone()
                .ok_or_else(|| Error::Config("upload.dir is not set".into()))?;
            Ok(Arc::new(DirStore::new(root)))
        }
        "s3" => {
            let s3 = cfg
                .s3
                .clone()
                .ok_or_else(|| Error::Config("[upload.s3] is not set".into()))?;
            let store = S3Store::from_env(s3, std::time::Duration::from_secs(cfg.timeout_secs))?;
            Ok(Arc::new(store))
        }
        other => Err(Error::Config(format!("unknown upload store '{}'", other))),
    }
}

/// Copies into a local or mounted directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self, remote: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in remote.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(Error::Upload(format!("invalid remote path '{}'", remote)));
            }
            path.push(part);
        }
        if path == self.root {
            return Err(Error::Upload("empty remote path".into()));
        }
        Ok(path)
    }
}

#[async_trait]
impl RemoteStore for DirStore {
    fn name(&self) -> &str {
        "dir"
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let target = self.target(remote)?;
        let parent = target
            .parent()
            .ok_or_else(|| Error::Upload(format!("no parent for {}", target.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Upload(format!("cannot create {}: {}", parent.display(), e)))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = parent.join(format!(".{}.part", file_name));
        tokio::fs::copy(local, &partial).await.map_err(|e| {
            Error::Upload(format!(
                "copy {} -> {}: {}",
                local.display(),
                partial.display(),
                e
            ))
        })?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| Error::Upload(format!("rename to {}: {}", target.display(), e)))?;
        tracing::debug!(remote, target = %target.display(), "Copied to directory store");
        Ok(())
    }
}
