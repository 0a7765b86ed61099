//! Per-run log files and their upload into the object store.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jjop_storage::landing::partition_dir;
use jjop_storage::ObjectStore;
use tokio::fs;
use tracing::{info, warn};

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Fetch,
    Import,
}

fn stamped_name(log_file: &Path, at: DateTime<Utc>) -> String {
    let stem = log_file
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("jjop");
    format!("{stem}_{}.log", at.format("%Y-%m-%d-%H-%M-%S"))
}

/// Fetch logs sit beside the partition of the run's day; every other run
/// goes under `log_prefix`.
pub fn run_log_key(
    kind: RunKind,
    landing_prefix: &str,
    log_prefix: &str,
    log_file: &Path,
    at: DateTime<Utc>,
) -> String {
    let dir = match kind {
        RunKind::Fetch => partition_dir(landing_prefix, at.date_naive()),
        RunKind::Import => log_prefix.trim_end_matches('/').to_string(),
    };
    let name = stamped_name(log_file, at);
    if dir.is_empty() {
        name
    } else {
        format!("{dir}/{name}")
    }
}

/// Put the log file under `key` and truncate the local copy. `None` when
/// there was nothing to upload.
pub async fn upload_run_log(
    store: &dyn ObjectStore,
    log_file: &Path,
    key: &str,
) -> Result<Option<String>> {
    let body = match fs::read(log_file).await {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %log_file.display(), "run log missing; nothing to upload");
            return Ok(None);
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", log_file.display())),
    };
    if body.is_empty() {
        return Ok(None);
    }

    store
        .put(key, body)
        .await
        .with_context(|| format!("uploading run log to {key}"))?;
    fs::write(log_file, b"")
        .await
        .with_context(|| format!("truncating {}", log_file.display()))?;
    info!(key, "run log uploaded");
    Ok(Some(key.to_string()))
}

pub async fn ship_run_log(
    config: &PipelineConfig,
    store: &dyn ObjectStore,
    kind: RunKind,
) -> Result<Option<String>> {
    let key = run_log_key(
        kind,
        &config.import_prefix,
        &config.log_prefix,
        &config.log_file,
        Utc::now(),
    );
    upload_run_log(store, &config.log_file, &key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jjop_storage::FsObjectStore;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 5, 14, 7, 9).unwrap()
    }

    #[test]
    fn keys_follow_the_bucket_layout() {
        let log = Path::new("logs/justjoinit.log");
        assert_eq!(
            run_log_key(RunKind::Fetch, "jobs/", "jobs/sql/logs", log, at()),
            "jobs/year=2025/month=03/day=05/justjoinit_2025-03-05-14-07-09.log"
        );
        assert_eq!(
            run_log_key(RunKind::Import, "jobs/", "jobs/sql/logs/", log, at()),
            "jobs/sql/logs/justjoinit_2025-03-05-14-07-09.log"
        );
        assert_eq!(
            run_log_key(RunKind::Import, "jobs/", "", Path::new("run.log"), at()),
            "run_2025-03-05-14-07-09.log"
        );
    }

    #[tokio::test]
    async fn upload_moves_the_log_into_the_store_and_truncates_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("bucket"));
        let log = dir.path().join("jjop.log");
        tokio::fs::write(&log, b"2025-03-05 INFO import run finished\n")
            .await
            .unwrap();

        let key = run_log_key(RunKind::Import, "jobs/", "jobs/sql/logs", &log, at());
        let uploaded = upload_run_log(&store, &log, &key).await.unwrap();
        assert_eq!(uploaded.as_deref(), Some("jobs/sql/logs/jjop_2025-03-05-14-07-09.log"));
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(b"2025-03-05 INFO import run finished\n".to_vec())
        );
        assert!(tokio::fs::read(&log).await.unwrap().is_empty());

        // Nothing new since the last upload.
        assert_eq!(upload_run_log(&store, &log, "jobs/sql/logs/again.log").await.unwrap(), None);
        assert_eq!(store.get("jobs/sql/logs/again.log").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_log_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let missing = dir.path().join("absent.log");
        assert_eq!(upload_run_log(&store, &missing, "jobs/sql/logs/x.log").await.unwrap(), None);
    }
}
