//! End-to-end runs: the paginated fetch into the landing zone, and the import
//! of settled landing files into the synced database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use jjop_adapters::PageSource;
use jjop_core::{FetchSummary, ImportRunSummary, StopReason};
use jjop_storage::landing::date_from_filename;
use jjop_storage::{
    FsObjectStore, LandingWriter, LocalPartitions, ObjectStore, PartitionStore, RemotePartitions,
    S3Config, S3ObjectStore,
};
use rand::Rng;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{LandingMode, PipelineConfig};
use crate::importer::{was_file_imported, Importer, QuarantineSink};
use crate::migrate::{connect, run_migrations};
use crate::remote_db::{LeaseSettings, RemoteDatabase, SyncedRun};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub start_page: u64,
    pub per_page: u64,
    /// Pages consumed, successful or abandoned.
    pub max_pages: u64,
    /// Upper bound of the random pause between pages; zero disables it.
    pub page_delay_max: Duration,
    /// Extra attempts for a failing page before moving past it.
    pub failure_budget: u32,
    /// Upper bound of the random pause before re-trying a failed page.
    pub failure_cooldown: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            start_page: 1,
            per_page: 100,
            max_pages: 50,
            page_delay_max: Duration::from_secs(100),
            failure_budget: 2,
            failure_cooldown: Duration::from_secs(100),
        }
    }
}

/// Uniform in `[min(1s, max), max]`.
fn random_pause(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
    let min_ms = max_ms.min(1_000);
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

async fn pause(max: Duration) {
    let delay = random_pause(max);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Walk the listing from `start_page`, following `nextPage`, until a page
/// brings nothing new, the listing ends, or `max_pages` are consumed.
pub async fn run_fetch(
    source: &dyn PageSource,
    writer: &LandingWriter,
    opts: &FetchOptions,
) -> Result<FetchSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("fetch_run", %run_id);

    async move {
        let mut page = opts.start_page;
        let mut pages_left = opts.max_pages;
        let mut attempts = 0u32;
        let mut pages_fetched = 0usize;
        let mut pages_failed = 0usize;
        let mut offers_saved = 0usize;
        let mut offers_duplicate = 0usize;
        let mut offers_invalid = 0usize;

        let stop_reason = loop {
            if pages_left == 0 {
                info!(page, "page limit reached");
                break StopReason::PageLimit;
            }

            let result = match source.fetch_page(page, opts.per_page).await {
                Ok(result) if !result.is_empty() => result,
                // An empty page that reports itself as past the last one ends the walk.
                Ok(result) if result.next_page.is_none() && result.total_pages > 0 && result.total_pages <= page => {
                    info!(page, total_pages = result.total_pages, "listing ends before this page");
                    break StopReason::EndOfData;
                }
                outcome => {
                    match outcome {
                        Err(err) => warn!(page, error = %err, "page fetch failed"),
                        Ok(_) => warn!(page, "page came back without offers"),
                    }
                    attempts += 1;
                    if attempts <= opts.failure_budget {
                        info!(page, attempt = attempts, "cooling down before retrying page");
                        pause(opts.failure_cooldown).await;
                    } else {
                        warn!(page, next = page + 1, "failure budget spent; moving to next page");
                        pages_failed += 1;
                        pages_left -= 1;
                        attempts = 0;
                        page += 1;
                    }
                    continue;
                }
            };

            attempts = 0;
            pages_fetched += 1;
            pages_left -= 1;
            let outcome = writer
                .write_batch(&result.offers)
                .await
                .with_context(|| format!("writing offers from page {page}"))?;
            offers_saved += outcome.saved;
            offers_duplicate += outcome.duplicates;
            offers_invalid += outcome.invalid;

            if !outcome.any_new_written {
                info!(page, "page held only known offers; stopping");
                break StopReason::NoNewOffers;
            }
            let Some(next) = result.next_page else {
                info!(page, total_pages = result.total_pages, total_items = result.total_items, "end of listing");
                break StopReason::EndOfData;
            };
            if pages_left == 0 {
                info!(page, "page limit reached");
                break StopReason::PageLimit;
            }
            pause(opts.page_delay_max).await;
            page = next;
        };

        let summary = FetchSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            pages_failed,
            offers_saved,
            offers_duplicate,
            offers_invalid,
            stop_reason,
        };
        info!(%summary, "fetch run finished");
        Ok(summary)
    }
    .instrument(span)
    .await
}

/// S3-compatible store when a bucket is configured, else a directory.
pub fn open_object_store(config: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match &config.bucket {
        Some(bucket) => Arc::new(
            S3ObjectStore::from_env(S3Config {
                bucket: bucket.clone(),
                region: config.region.clone(),
                endpoint_url: config.endpoint_url.clone(),
            })
            .context("configuring object store")?,
        ),
        None => Arc::new(FsObjectStore::new(config.store_dir.clone())),
    };
    info!(store = %store.describe(), "object store ready");
    Ok(store)
}

pub fn landing_writer(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> LandingWriter {
    let partitions: Arc<dyn PartitionStore> = match config.landing {
        LandingMode::Remote => Arc::new(RemotePartitions::new(store, config.import_prefix.clone())),
        LandingMode::Local => Arc::new(LocalPartitions::new(config.landing_dir.clone())),
    };
    LandingWriter::new(partitions)
}

/// Where `run_import` finds the files `landing_writer` produces, with the
/// prefix to list under.
pub fn import_source(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> (Arc<dyn ObjectStore>, String) {
    match config.landing {
        LandingMode::Remote => (store, config.import_prefix.clone()),
        LandingMode::Local => (Arc::new(FsObjectStore::new(config.landing_dir.clone())), String::new()),
    }
}

/// Import every settled landing file under `prefix`, newest first. Files dated
/// on or after `today - skip_recent_days` may still grow and are left alone;
/// files already in the ledger are skipped before download.
pub async fn run_import(
    store: &dyn ObjectStore,
    importer: &Importer,
    prefix: &str,
    skip_recent_days: i64,
    today: NaiveDate,
) -> Result<ImportRunSummary> {
    let objects = store
        .list(prefix)
        .await
        .with_context(|| format!("listing landing files under {prefix}"))?;
    let cutoff = today - chrono::Duration::days(skip_recent_days);

    let mut candidates = Vec::new();
    for object in objects {
        if !object.key.ends_with(".jsonl") {
            continue;
        }
        let date = date_from_filename(&object.key);
        if date.is_some_and(|d| d >= cutoff) {
            info!(key = %object.key, "skipping recent landing file");
            continue;
        }
        candidates.push((date, object.key));
    }
    // Newest first; undated names sort last.
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut summary = ImportRunSummary {
        files_total: candidates.len(),
        ..Default::default()
    };

    for (_, key) in &candidates {
        let filename = key.rsplit('/').next().unwrap_or(key);
        match was_file_imported(importer.pool(), filename).await {
            Ok(true) => {
                info!(filename, "already imported");
                summary.files_skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(filename, error = %err, "ledger lookup failed");
                summary.files_failed += 1;
                continue;
            }
        }

        let bytes = match store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(key = %key, "landing file vanished before import");
                summary.files_failed += 1;
                continue;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "landing file download failed");
                summary.files_failed += 1;
                continue;
            }
        };

        info!(key = %key, bytes = bytes.len(), "importing landing file");
        match importer.import_bytes(&bytes, filename).await {
            Ok(stats) => {
                summary.files_imported += 1;
                summary.offers.absorb(&stats);
            }
            Err(err) => {
                warn!(filename, error = %format!("{err:#}"), "landing file import failed");
                summary.files_failed += 1;
            }
        }
    }

    info!(%summary, "import run finished");
    Ok(summary)
}

pub fn remote_database(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> RemoteDatabase {
    let lease = config
        .db_lease
        .then(|| LeaseSettings::for_this_process(config.db_lease_ttl));
    RemoteDatabase::new(store, config.db_key.clone(), config.db_path.clone())
        .with_backup_prefix(config.db_backup_prefix.clone())
        .with_lease(lease)
}

async fn import_into(
    db_path: PathBuf,
    source: &dyn ObjectStore,
    prefix: &str,
    config: &PipelineConfig,
    today: NaiveDate,
) -> Result<ImportRunSummary> {
    let pool = connect(&db_path).await?;
    let result = async {
        run_migrations(&pool).await?;
        let importer = Importer::new(pool.clone(), QuarantineSink::new(config.quarantine_path.clone()));
        run_import(source, &importer, prefix, config.import_skip_recent_days, today).await
    }
    .await;
    // The file is uploaded next; every connection must be closed first.
    pool.close().await;
    result
}

/// The import run wrapped in the synced-database scope.
pub async fn run_synced_import(
    config: &PipelineConfig,
    store: Arc<dyn ObjectStore>,
) -> Result<SyncedRun<ImportRunSummary>> {
    let today = Utc::now().date_naive();
    let database = remote_database(config, store.clone());
    let (source, prefix) = import_source(config, store);
    database
        .with_synced_database(|path| async move {
            import_into(path, source.as_ref(), &prefix, config, today).await
        })
        .await
}
