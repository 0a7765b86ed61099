//! Remote object storage abstraction plus a filesystem-backed implementation.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use walkdir::WalkDir;

use crate::{md5_hex, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    /// Content digest as reported by the store, without surrounding quotes.
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store request for {key} failed: {source}")]
    Transport {
        key: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("object store returned HTTP {status} for {key}: {body}")]
    Status { status: u16, key: String, body: String },
    #[error("object store i/o for {key} failed: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object {key} does not exist")]
    NotFound { key: String },
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("object store misconfigured: {0}")]
    Config(String),
}

/// Minimal bucket contract: get/put/head/copy/delete/list by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket`.
    fn describe(&self) -> String;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// `Ok(None)` when the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<ObjectMeta, StoreError>;

    /// Server-side copy; the source must exist.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;
}

/// Object store rooted at a local directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !clean {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn io_error(key: &str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            source,
        }
    }

    async fn meta_for(&self, key: &str, path: &Path) -> Result<Option<ObjectMeta>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(key, err)),
        };
        let last_modified = fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            etag: md5_hex(&bytes),
            size: bytes.len() as u64,
            last_modified,
        }))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(key, err)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let path = self.path_for(key)?;
        self.meta_for(key, &path).await
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<ObjectMeta, StoreError> {
        let path = self.path_for(key)?;
        write_atomic(&path, &body).await.map_err(|err| {
            Self::io_error(key, std::io::Error::new(std::io::ErrorKind::Other, format!("{err:#}")))
        })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            etag: md5_hex(&body),
            size: body.len() as u64,
            last_modified: Some(Utc::now()),
        })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let body = self.get(from).await?.ok_or_else(|| StoreError::NotFound {
            key: from.to_string(),
        })?;
        self.put(to, body).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|err| {
                Self::io_error(prefix, std::io::Error::new(std::io::ErrorKind::Other, err))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.path_for(&key)?;
            if let Some(meta) = self.meta_for(&key, &path).await? {
                out.push(meta);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_objects_are_none_not_errors() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        assert!(store.get("jobs/missing.jsonl").await.expect("get").is_none());
        assert!(store.head("jobs/missing.jsonl").await.expect("head").is_none());
        store.delete("jobs/missing.jsonl").await.expect("delete missing");
        assert!(matches!(
            store.copy("jobs/missing.jsonl", "jobs/copy.jsonl").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn put_head_copy_and_list_agree_on_etags() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        let put = store
            .put("jobs/sql/jobs.sqlite", b"db-bytes".to_vec())
            .await
            .expect("put");
        assert_eq!(put.etag, md5_hex(b"db-bytes"));

        store
            .copy("jobs/sql/jobs.sqlite", "jobs/sql/backup/jobs_1.sqlite")
            .await
            .expect("copy");
        let head = store
            .head("jobs/sql/backup/jobs_1.sqlite")
            .await
            .expect("head")
            .expect("exists");
        assert_eq!(head.etag, put.etag);
        assert_eq!(head.size, 8);

        let listed = store.list("jobs/sql/backup/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "jobs/sql/backup/jobs_1.sqlite");
        assert_eq!(store.list("jobs/").await.expect("list all").len(), 2);
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get("/abs").await, Err(StoreError::InvalidKey(_))));
    }
}
