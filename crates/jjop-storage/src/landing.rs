//! Date-partitioned JSON Lines landing zone with per-partition slug dedup.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use jjop_core::{RawOffer, WriteOutcome};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::object_store::ObjectStore;

pub const LANDING_FILE_PREFIX: &str = "justjoinit_";

/// Calendar date of a publication timestamp, taken in the offset it is
/// written in (`Z` is UTC).
pub fn partition_date(published: &str) -> Option<NaiveDate> {
    let published = published.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(published) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(published, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    NaiveDate::parse_from_str(published, "%Y-%m-%d").ok()
}

pub fn landing_filename(date: NaiveDate) -> String {
    format!("{LANDING_FILE_PREFIX}{}.jsonl", date.format("%Y-%m-%d"))
}

/// `jobs/year=2025/month=03/day=05` for prefix `jobs/`.
pub fn partition_dir(prefix: &str, date: NaiveDate) -> String {
    let prefix = prefix.trim_end_matches('/');
    let hive = format!(
        "year={}/month={}/day={}",
        date.format("%Y"),
        date.format("%m"),
        date.format("%d"),
    );
    if prefix.is_empty() {
        hive
    } else {
        format!("{prefix}/{hive}")
    }
}

/// `jobs/year=2025/month=03/day=05/justjoinit_2025-03-05.jsonl` for prefix `jobs/`.
pub fn partition_key(prefix: &str, date: NaiveDate) -> String {
    format!("{}/{}", partition_dir(prefix, date), landing_filename(date))
}

/// Partition date encoded in a landing file name or key.
pub fn date_from_filename(name: &str) -> Option<NaiveDate> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let stem = file
        .strip_prefix(LANDING_FILE_PREFIX)?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

fn publication_of(offer: &RawOffer) -> Option<&str> {
    offer
        .get("publishedAt")
        .or_else(|| offer.get("published_at"))
        .and_then(|v| v.as_str())
}

fn slug_of(offer: &RawOffer) -> Option<String> {
    match offer.get("slug")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Slugs already present in a partition's JSON Lines content.
pub fn seen_slugs(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<RawOffer>(line) {
            Ok(value) => slug_of(&value),
            Err(err) => {
                warn!(error = %err, "unreadable line in landing partition");
                None
            }
        })
        .collect()
}

/// Where partition files live. `append` must be a single write of `chunk`.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    fn location(&self, date: NaiveDate) -> String;

    async fn load(&self, date: NaiveDate) -> anyhow::Result<Option<String>>;

    /// `existing` is the content returned by `load` for the same date.
    async fn append(&self, date: NaiveDate, existing: Option<&str>, chunk: &str)
        -> anyhow::Result<()>;
}

/// Flat `justjoinit_YYYY-MM-DD.jsonl` files in a local directory.
#[derive(Debug, Clone)]
pub struct LocalPartitions {
    dir: PathBuf,
}

impl LocalPartitions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(landing_filename(date))
    }
}

#[async_trait]
impl PartitionStore for LocalPartitions {
    fn location(&self, date: NaiveDate) -> String {
        self.path_for(date).display().to_string()
    }

    async fn load(&self, date: NaiveDate) -> anyhow::Result<Option<String>> {
        let path = self.path_for(date);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn append(
        &self,
        date: NaiveDate,
        _existing: Option<&str>,
        chunk: &str,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(date);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(chunk.as_bytes())
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

/// Hive-partitioned objects; an append is a read-modify-put of the whole object.
#[derive(Clone)]
pub struct RemotePartitions {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl RemotePartitions {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl PartitionStore for RemotePartitions {
    fn location(&self, date: NaiveDate) -> String {
        format!(
            "{}/{}",
            self.store.describe(),
            partition_key(&self.prefix, date)
        )
    }

    async fn load(&self, date: NaiveDate) -> anyhow::Result<Option<String>> {
        let key = partition_key(&self.prefix, date);
        let Some(bytes) = self
            .store
            .get(&key)
            .await
            .with_context(|| format!("loading partition {key}"))?
        else {
            return Ok(None);
        };
        let content =
            String::from_utf8(bytes).with_context(|| format!("partition {key} is not UTF-8"))?;
        Ok(Some(content))
    }

    async fn append(
        &self,
        date: NaiveDate,
        existing: Option<&str>,
        chunk: &str,
    ) -> anyhow::Result<()> {
        let key = partition_key(&self.prefix, date);
        let mut body = existing.unwrap_or_default().to_string();
        body.push_str(chunk);
        self.store
            .put(&key, body.into_bytes())
            .await
            .with_context(|| format!("writing partition {key}"))?;
        Ok(())
    }
}

/// Persists fetched pages, dropping offers whose slug its partition already holds.
#[derive(Clone)]
pub struct LandingWriter {
    partitions: Arc<dyn PartitionStore>,
}

impl LandingWriter {
    pub fn new(partitions: Arc<dyn PartitionStore>) -> Self {
        Self { partitions }
    }

    pub async fn write_batch(&self, offers: &[RawOffer]) -> anyhow::Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut by_date: BTreeMap<NaiveDate, Vec<(String, &RawOffer)>> = BTreeMap::new();

        for offer in offers {
            let date = publication_of(offer).and_then(partition_date);
            let slug = slug_of(offer);
            match (date, slug) {
                (Some(date), Some(slug)) => by_date.entry(date).or_default().push((slug, offer)),
                _ => {
                    warn!(
                        has_date = date.is_some(),
                        "skipping offer without a usable slug or publication date"
                    );
                    outcome.invalid += 1;
                }
            }
        }

        for (date, candidates) in by_date {
            let existing = self.partitions.load(date).await?;
            let mut seen = existing.as_deref().map(seen_slugs).unwrap_or_default();

            let mut chunk = String::new();
            let mut saved = 0usize;
            for (slug, offer) in candidates {
                if !seen.insert(slug) {
                    outcome.duplicates += 1;
                    continue;
                }
                let line = serde_json::to_string(offer).context("serializing offer")?;
                chunk.push_str(&line);
                chunk.push('\n');
                saved += 1;
            }

            if saved == 0 {
                debug!(partition = %date, "nothing new for partition");
                continue;
            }
            if let Some(content) = existing.as_deref() {
                if !content.is_empty() && !content.ends_with('\n') {
                    chunk.insert(0, '\n');
                }
            }
            self.partitions
                .append(date, existing.as_deref(), &chunk)
                .await?;
            info!(
                partition = %self.partitions.location(date),
                saved,
                "appended offers"
            );
            outcome.saved += saved;
        }

        outcome.any_new_written = outcome.duplicates != offers.len();
        Ok(outcome)
    }
}
