//! Single-file database hosted as an object: fingerprint staleness checks,
//! backup-before-overwrite uploads, a best-effort lease, and a scoped
//! download → body → upload helper.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use jjop_storage::{md5_hex, write_atomic, ObjectStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub owner: String,
    pub ttl: Duration,
}

impl LeaseSettings {
    /// Owner id unique to this process.
    pub fn for_this_process(ttl: Duration) -> Self {
        Self {
            owner: format!("jjop-{}-{}", std::process::id(), Uuid::new_v4()),
            ttl,
        }
    }
}

/// Contents of the `<db key>.lease` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of [`RemoteDatabase::with_synced_database`]: the body's own result
/// and, separately, whether the write-back succeeded.
#[derive(Debug)]
pub struct SyncedRun<T> {
    pub output: Result<T>,
    /// Backup key created before the upload, if any.
    pub write_back: Result<Option<String>>,
}

#[derive(Clone)]
pub struct RemoteDatabase {
    store: Arc<dyn ObjectStore>,
    key: String,
    local_path: PathBuf,
    backup_prefix: Option<String>,
    lease: Option<LeaseSettings>,
}

/// `{prefix}/{stem}_{YYYYmmdd_HHMMSS}.{ext}` for the file name of `key`.
pub fn backup_key(prefix: &str, key: &str, at: DateTime<Utc>) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    let stamp = at.format("%Y%m%d_%H%M%S");
    let file = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{stamp}.{ext}"),
        _ => format!("{name}_{stamp}"),
    };
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file
    } else {
        format!("{prefix}/{file}")
    }
}

impl RemoteDatabase {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            key: key.into(),
            local_path: local_path.into(),
            backup_prefix: None,
            lease: None,
        }
    }

    pub fn with_backup_prefix(mut self, prefix: Option<String>) -> Self {
        self.backup_prefix = prefix.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_lease(mut self, lease: Option<LeaseSettings>) -> Self {
        self.lease = lease;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Sidecar holding the fingerprint of the last synced content.
    pub fn fingerprint_path(&self) -> PathBuf {
        let mut path = self.local_path.clone().into_os_string();
        path.push(".etag");
        PathBuf::from(path)
    }

    pub fn lease_key(&self) -> String {
        format!("{}.lease", self.key)
    }

    /// True only when a local copy exists and its cached fingerprint equals the
    /// remote entity tag. Any lookup failure counts as stale.
    pub async fn is_up_to_date(&self) -> bool {
        if !fs::try_exists(&self.local_path).await.unwrap_or(false) {
            return false;
        }
        let cached = match fs::read_to_string(self.fingerprint_path()).await {
            Ok(text) => text.trim().to_string(),
            Err(_) => return false,
        };
        match self.store.head(&self.key).await {
            Ok(Some(meta)) => !cached.is_empty() && meta.etag == cached,
            Ok(None) => false,
            Err(err) => {
                warn!(key = %self.key, error = %err, "remote fingerprint lookup failed");
                false
            }
        }
    }

    /// Replace the local file with the remote object; the local file is only
    /// touched once the whole object has arrived.
    pub async fn download(&self) -> Result<()> {
        let bytes = self
            .store
            .get(&self.key)
            .await
            .with_context(|| format!("downloading {}", self.key))?
            .ok_or_else(|| anyhow!("remote database {} does not exist", self.key))?;
        write_atomic(&self.local_path, &bytes).await?;
        write_atomic(self.fingerprint_path(), md5_hex(&bytes).as_bytes()).await?;
        info!(key = %self.key, path = %self.local_path.display(), bytes = bytes.len(), "database downloaded");
        Ok(())
    }

    async fn backup_current(&self, prefix: &str) -> Result<Option<String>> {
        let existing = self
            .store
            .head(&self.key)
            .await
            .with_context(|| format!("checking {} before backup", self.key))?;
        if existing.is_none() {
            info!(key = %self.key, "no remote copy yet; skipping backup");
            return Ok(None);
        }
        let target = backup_key(prefix, &self.key, Utc::now());
        self.store
            .copy(&self.key, &target)
            .await
            .with_context(|| format!("backing up {} to {target}", self.key))?;
        info!(from = %self.key, to = %target, "database backed up");
        Ok(Some(target))
    }

    /// Back up the current remote copy (when a prefix is set and it exists),
    /// then upload the local file and refresh the cached fingerprint.
    pub async fn upload(&self) -> Result<Option<String>> {
        let bytes = fs::read(&self.local_path)
            .await
            .with_context(|| format!("reading {}", self.local_path.display()))?;
        let backup = match &self.backup_prefix {
            Some(prefix) => self.backup_current(prefix).await?,
            None => None,
        };
        let fingerprint = md5_hex(&bytes);
        let size = bytes.len();
        self.store
            .put(&self.key, bytes)
            .await
            .with_context(|| format!("uploading {}", self.key))?;
        write_atomic(self.fingerprint_path(), fingerprint.as_bytes()).await?;
        info!(key = %self.key, bytes = size, "database uploaded");
        Ok(backup)
    }

    async fn read_lease(&self) -> Result<Option<Lease>> {
        let key = self.lease_key();
        let Some(bytes) = self
            .store
            .get(&key)
            .await
            .with_context(|| format!("reading lease {key}"))?
        else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(lease) => Ok(Some(lease)),
            Err(err) => {
                warn!(key = %key, error = %err, "ignoring unreadable lease object");
                Ok(None)
            }
        }
    }

    /// Write our lease unless another owner holds a live one. Object stores
    /// give no compare-and-swap here, so two writers racing within the same
    /// instant can both succeed.
    pub async fn acquire_lease(&self) -> Result<Option<Lease>> {
        let Some(settings) = &self.lease else {
            return Ok(None);
        };
        let now = Utc::now();
        if let Some(current) = self.read_lease().await? {
            if current.owner != settings.owner {
                if current.expires_at > now {
                    bail!(
                        "database {} is leased by {} until {}",
                        self.key,
                        current.owner,
                        current.expires_at
                    );
                }
                warn!(previous_owner = %current.owner, expired_at = %current.expires_at, "taking over expired database lease");
            }
        }

        let lease = Lease {
            owner: settings.owner.clone(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(settings.ttl).context("lease ttl out of range")?,
        };
        let body = serde_json::to_vec(&lease).context("serializing lease")?;
        self.store
            .put(&self.lease_key(), body)
            .await
            .with_context(|| format!("writing lease {}", self.lease_key()))?;
        info!(owner = %lease.owner, expires_at = %lease.expires_at, "database lease acquired");
        Ok(Some(lease))
    }

    async fn ensure_lease_held(&self, lease: Option<&Lease>) -> Result<()> {
        let Some(lease) = lease else {
            return Ok(());
        };
        match self.read_lease().await? {
            Some(current) if current.owner != lease.owner => bail!(
                "database lease for {} was taken over by {}; refusing to overwrite",
                self.key,
                current.owner
            ),
            _ => Ok(()),
        }
    }

    pub async fn release_lease(&self, lease: &Lease) -> Result<()> {
        match self.read_lease().await? {
            Some(current) if current.owner == lease.owner => {
                self.store
                    .delete(&self.lease_key())
                    .await
                    .with_context(|| format!("deleting lease {}", self.lease_key()))?;
                info!(owner = %lease.owner, "database lease released");
            }
            Some(current) => {
                warn!(owner = %current.owner, "lease belongs to another owner; leaving it")
            }
            None => {}
        }
        Ok(())
    }

    async fn release_quietly(&self, lease: &Lease) {
        if let Err(err) = self.release_lease(lease).await {
            warn!(error = %format!("{err:#}"), "failed to release database lease");
        }
    }

    async fn ensure_current(&self) -> Result<()> {
        if self.is_up_to_date().await {
            info!(key = %self.key, "local database is current; skipping download");
            return Ok(());
        }
        let remote = self
            .store
            .head(&self.key)
            .await
            .with_context(|| format!("looking up {}", self.key))?;
        match remote {
            Some(_) => self.download().await,
            None => {
                warn!(key = %self.key, "no remote database yet; starting from the local file");
                Ok(())
            }
        }
    }

    /// Lease, bring the local copy up to date, run `body` on it, then always
    /// upload (with backup) and release. A failed download aborts before
    /// `body` runs; a failed body still gets its partial work written back.
    pub async fn with_synced_database<T, F, Fut>(&self, body: F) -> Result<SyncedRun<T>>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!("synced_database", key = %self.key);
        async move {
            let lease = self.acquire_lease().await?;

            if let Err(err) = self.ensure_current().await {
                if let Some(lease) = &lease {
                    self.release_quietly(lease).await;
                }
                return Err(err.context("database sync failed; not running against a stale store"));
            }

            let output = body(self.local_path.clone()).await;
            if let Err(err) = &output {
                warn!(error = %format!("{err:#}"), "run failed; writing back partial progress");
            }

            let write_back = match self.ensure_lease_held(lease.as_ref()).await {
                Ok(()) => self.upload().await,
                Err(err) => Err(err),
            };
            if let Err(err) = &write_back {
                error!(error = %format!("{err:#}"), "database write-back failed; local file keeps the results");
            }

            if let Some(lease) = &lease {
                self.release_quietly(lease).await;
            }
            Ok(SyncedRun { output, write_back })
        }
        .instrument(span)
        .await
    }
}
