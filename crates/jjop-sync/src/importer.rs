//! Landing-file import into the normalized store, with ingestion ledger and
//! quarantine of records that fail to map.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use jjop_adapters::{adapter_for, as_record, detect_version, AdapterError, OfferIdentity};
use jjop_core::{
    ImportStats, ImportStatus, ImportedFile, NormalizedOffer, RawOffer, OFFERENT_NAME, OFFERENT_URL,
};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::upsert::upsert_by_natural_key;

pub(crate) fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Append-only JSON Lines file of records that failed import.
#[derive(Debug, Clone, Default)]
pub struct QuarantineSink {
    path: Option<PathBuf>,
}

impl QuarantineSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Failed records are only logged.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `line` must be a single line of text.
    pub async fn append_line(&self, line: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating quarantine directory {}", parent.display()))?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening quarantine file {}", path.display()))?;
        let mut buf = line.trim_end_matches(['\r', '\n']).to_string();
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("writing quarantine file {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }

    pub async fn append(&self, raw: &RawOffer) -> Result<()> {
        let line = serde_json::to_string(raw).context("serializing quarantined record")?;
        self.append_line(&line).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(i64),
    Duplicate(i64),
}

pub async fn was_file_imported(pool: &SqlitePool, filename: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM imported_files WHERE filename = ?")
        .bind(filename)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Ledger insert; a second row for the same filename is silently ignored.
pub async fn record_imported_file(
    pool: &SqlitePool,
    filename: &str,
    stats: &ImportStats,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO imported_files
            (filename, imported_at, status, lines_total, lines_ok, lines_duplicate, lines_failed)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(filename) DO NOTHING
        "#,
    )
    .bind(filename)
    .bind(db_timestamp(Utc::now()))
    .bind(stats.status().as_str())
    .bind(stats.lines_total as i64)
    .bind(stats.lines_ok as i64)
    .bind(stats.lines_duplicate as i64)
    .bind(stats.lines_failed as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn imported_file(pool: &SqlitePool, filename: &str) -> Result<Option<ImportedFile>> {
    let row = sqlx::query(
        r#"
        SELECT filename, imported_at, status, lines_total, lines_ok, lines_duplicate, lines_failed
        FROM imported_files WHERE filename = ?
        "#,
    )
    .bind(filename)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let imported_at: String = row.try_get("imported_at")?;
    let status: Option<String> = row.try_get("status")?;
    let status = match status.as_deref() {
        Some("all_ok") => ImportStatus::AllOk,
        Some("partial") => ImportStatus::Partial,
        _ => ImportStatus::Failed,
    };
    Ok(Some(ImportedFile {
        filename: row.try_get("filename")?,
        imported_at: DateTime::parse_from_rfc3339(&imported_at)
            .with_context(|| format!("ledger timestamp {imported_at:?}"))?
            .with_timezone(&Utc),
        status,
        stats: ImportStats {
            lines_total: row.try_get::<i64, _>("lines_total")? as usize,
            lines_ok: row.try_get::<i64, _>("lines_ok")? as usize,
            lines_duplicate: row.try_get::<i64, _>("lines_duplicate")? as usize,
            lines_failed: row.try_get::<i64, _>("lines_failed")? as usize,
        },
    }))
}

async fn find_offer(
    conn: &mut SqliteConnection,
    identity: &OfferIdentity,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id FROM offers WHERE schema_version = ? AND original_id = ? AND published_at = ?",
    )
    .bind(identity.version.to_string())
    .bind(&identity.original_id)
    .bind(db_timestamp(identity.published_at))
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| row.try_get::<i64, _>(0)).transpose()
}

async fn insert_slug(conn: &mut SqliteConnection, offer_id: i64, slug: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO slugs (offer_id, slug) VALUES (?, ?)")
        .bind(offer_id)
        .bind(slug)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn skill_id(conn: &mut SqliteConnection, name: &str) -> Result<i64, sqlx::Error> {
    upsert_by_natural_key(conn, "skills", &[("name", name.into())], &[]).await
}

/// Writes the full offer graph; the caller owns the transaction.
async fn insert_offer_graph(conn: &mut SqliteConnection, offer: &NormalizedOffer) -> Result<i64> {
    let category_id = upsert_by_natural_key(
        conn,
        "categories",
        &[
            ("id", offer.category.id.into()),
            ("name", offer.category.name.as_str().into()),
        ],
        &[],
    )
    .await
    .context("resolving category")?;
    let experience_level_id = upsert_by_natural_key(
        conn,
        "experience_levels",
        &[("name", offer.experience_level.as_str().into())],
        &[],
    )
    .await
    .context("resolving experience level")?;
    let workplace_type_id = upsert_by_natural_key(
        conn,
        "workplace_types",
        &[("name", offer.workplace_type.as_str().into())],
        &[],
    )
    .await
    .context("resolving workplace type")?;
    let working_time_id = upsert_by_natural_key(
        conn,
        "working_times",
        &[("name", offer.working_time.as_str().into())],
        &[],
    )
    .await
    .context("resolving working time")?;
    let company_id = upsert_by_natural_key(
        conn,
        "companies",
        &[("name", offer.company.name.as_str().into())],
        &[("logo_url", offer.company.logo_url.clone().into())],
    )
    .await
    .context("resolving company")?;
    let offerent_id = upsert_by_natural_key(
        conn,
        "offerents",
        &[("name", OFFERENT_NAME.into())],
        &[("url", OFFERENT_URL.into())],
    )
    .await
    .context("resolving offerent")?;

    let offer_id = sqlx::query(
        r#"
        INSERT INTO offers
            (schema_version, original_id, title, remote_interview, published_at,
             open_to_hire_ukrainians, category_id, experience_level_id, workplace_type_id,
             working_time_id, company_id, offerent_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(offer.version.to_string())
    .bind(&offer.original_id)
    .bind(&offer.title)
    .bind(offer.remote_interview)
    .bind(db_timestamp(offer.published_at))
    .bind(offer.open_to_hire_ukrainians)
    .bind(category_id)
    .bind(experience_level_id)
    .bind(workplace_type_id)
    .bind(working_time_id)
    .bind(company_id)
    .bind(offerent_id)
    .execute(&mut *conn)
    .await
    .context("inserting offer")?
    .last_insert_rowid();

    let mut location_ids: Vec<i64> = Vec::new();
    if offer.multilocation {
        for (idx, location) in offer.locations.iter().enumerate() {
            if let Some(slug) = &location.slug {
                insert_slug(conn, offer_id, slug).await?;
            }
            let id = upsert_location(conn, company_id, location, idx == 0).await?;
            location_ids.push(id);
        }
    } else {
        if let Some(slug) = &offer.primary_slug {
            insert_slug(conn, offer_id, slug).await?;
        }
        if let Some(location) = offer.locations.first() {
            location_ids.push(upsert_location(conn, company_id, location, true).await?);
        }
    }
    let mut linked = Vec::with_capacity(location_ids.len());
    for location_id in location_ids {
        if linked.contains(&location_id) {
            continue;
        }
        sqlx::query("INSERT INTO offer_location_association (offer_id, location_id) VALUES (?, ?)")
            .bind(offer_id)
            .bind(location_id)
            .execute(&mut *conn)
            .await
            .context("linking location")?;
        linked.push(location_id);
    }

    for name in &offer.required_skills {
        let skill_id = skill_id(conn, name).await.context("resolving skill")?;
        sqlx::query(
            "INSERT OR IGNORE INTO required_skill_association (offer_id, skill_id, level) VALUES (?, ?, NULL)",
        )
        .bind(offer_id)
        .bind(skill_id)
        .execute(&mut *conn)
        .await
        .context("linking required skill")?;
    }

    for name in &offer.nice_to_have_skills {
        let skill_id = skill_id(conn, name).await.context("resolving skill")?;
        sqlx::query(
            "INSERT OR IGNORE INTO nice_to_have_skill_association (offer_id, skill_id) VALUES (?, ?)",
        )
        .bind(offer_id)
        .bind(skill_id)
        .execute(&mut *conn)
        .await
        .context("linking nice-to-have skill")?;
    }

    for language in &offer.languages {
        let language_id = upsert_by_natural_key(
            conn,
            "languages",
            &[
                ("code", language.code.as_str().into()),
                ("level", language.level.clone().into()),
            ],
            &[],
        )
        .await
        .context("resolving language")?;
        sqlx::query("INSERT OR IGNORE INTO language_association (offer_id, language_id) VALUES (?, ?)")
            .bind(offer_id)
            .bind(language_id)
            .execute(&mut *conn)
            .await
            .context("linking language")?;
    }

    for employment in &offer.employment_types {
        sqlx::query(
            r#"
            INSERT INTO employment_types
                (offer_id, type, currency, unit, gross, from_amount, to_amount,
                 from_pln, to_pln, from_usd, to_usd, from_eur, to_eur,
                 from_gbp, to_gbp, from_chf, to_chf)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(offer_id)
        .bind(&employment.kind)
        .bind(&employment.currency)
        .bind(&employment.unit)
        .bind(employment.gross)
        .bind(employment.from_amount)
        .bind(employment.to_amount)
        .bind(employment.from_pln)
        .bind(employment.to_pln)
        .bind(employment.from_usd)
        .bind(employment.to_usd)
        .bind(employment.from_eur)
        .bind(employment.to_eur)
        .bind(employment.from_gbp)
        .bind(employment.to_gbp)
        .bind(employment.from_chf)
        .bind(employment.to_chf)
        .execute(&mut *conn)
        .await
        .context("inserting employment type")?;
    }

    Ok(offer_id)
}

async fn upsert_location(
    conn: &mut SqliteConnection,
    company_id: i64,
    location: &jjop_core::LocationDraft,
    is_main: bool,
) -> Result<i64> {
    let id = upsert_by_natural_key(
        conn,
        "locations",
        &[
            ("company_id", company_id.into()),
            ("city", location.city.clone().into()),
            ("street", location.street.clone().into()),
            ("latitude", location.latitude.into()),
            ("longitude", location.longitude.into()),
            ("is_main", is_main.into()),
        ],
        &[],
    )
    .await
    .context("resolving location")?;
    Ok(id)
}

/// Imports landing files into one SQLite database.
#[derive(Debug, Clone)]
pub struct Importer {
    pool: SqlitePool,
    quarantine: QuarantineSink,
}

impl Importer {
    pub fn new(pool: SqlitePool, quarantine: QuarantineSink) -> Self {
        Self { pool, quarantine }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// One record in its own transaction; any error rolls the record back.
    pub async fn import_record(&self, raw: &RawOffer) -> Result<RecordOutcome> {
        let record = as_record(raw)?;
        let version = detect_version(raw).ok_or(AdapterError::UnknownVersion)?;
        let adapter = adapter_for(version);
        let identity = adapter.identity(record)?;

        let mut tx = self.pool.begin().await.context("starting transaction")?;
        if let Some(existing) = find_offer(&mut tx, &identity).await? {
            debug!(original_id = %identity.original_id, %version, "offer already imported");
            return Ok(RecordOutcome::Duplicate(existing));
        }

        let offer = adapter.extract(record)?;
        let offer_id = insert_offer_graph(&mut tx, &offer).await?;
        tx.commit().await.context("committing offer")?;
        debug!(offer_id, original_id = %offer.original_id, %version, "offer imported");
        Ok(RecordOutcome::Inserted(offer_id))
    }

    /// Stream JSON Lines into the store and, when anything committed, write
    /// the ledger row for `filename`.
    pub async fn import_stream<R>(&self, source: R, filename: &str) -> Result<ImportStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = ImportStats::default();
        let mut lines = source.lines();
        let mut line_number = 0usize;

        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("reading {filename}"))?
        {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            stats.lines_total += 1;

            let raw: RawOffer = match serde_json::from_str(&line) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(filename, line_number, error = %err, "unparsable line quarantined");
                    stats.lines_failed += 1;
                    self.quarantine_line(&line).await;
                    continue;
                }
            };

            match self.import_record(&raw).await {
                Ok(RecordOutcome::Inserted(_)) => stats.lines_ok += 1,
                Ok(RecordOutcome::Duplicate(_)) => {
                    stats.lines_ok += 1;
                    stats.lines_duplicate += 1;
                }
                Err(err) => {
                    warn!(filename, line_number, error = %format!("{err:#}"), "record quarantined");
                    stats.lines_failed += 1;
                    if let Err(err) = self.quarantine.append(&raw).await {
                        warn!(error = %format!("{err:#}"), "could not write quarantine record");
                    }
                }
            }
        }

        if stats.lines_ok > 0 {
            record_imported_file(&self.pool, filename, &stats)
                .await
                .with_context(|| format!("recording {filename} in the ledger"))?;
        }
        info!(
            filename,
            status = stats.status().as_str(),
            total = stats.lines_total,
            ok = stats.lines_ok,
            duplicate = stats.lines_duplicate,
            failed = stats.lines_failed,
            "file import finished"
        );
        Ok(stats)
    }

    pub async fn import_bytes(&self, bytes: &[u8], filename: &str) -> Result<ImportStats> {
        self.import_stream(bytes, filename).await
    }

    pub async fn import_file(&self, path: &Path) -> Result<ImportStats> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let file = fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        self.import_stream(BufReader::new(file), &filename).await
    }

    async fn quarantine_line(&self, line: &str) {
        if let Err(err) = self.quarantine.append_line(line).await {
            warn!(error = %format!("{err:#}"), "could not write quarantine record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{connect_in_memory, run_migrations};
    use serde_json::json;

    async fn importer(quarantine: QuarantineSink) -> Importer {
        let pool = connect_in_memory().await.expect("pool");
        run_migrations(&pool).await.expect("migrate");
        Importer::new(pool, quarantine)
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .expect("count")
            .get(0)
    }

    fn v1_line(guid: &str, slug: &str) -> String {
        json!({
            "guid": guid,
            "slug": slug,
            "title": "Backend Engineer",
            "publishedAt": "2025-04-01T09:30:00Z",
            "categoryId": 3,
            "experienceLevel": "mid",
            "workplaceType": "remote",
            "workingTime": "full_time",
            "companyName": "Initech",
            "city": "Łódź",
            "street": "Piotrkowska 100",
            "latitude": 51.76,
            "longitude": 19.45,
            "multilocation": [
                { "slug": slug, "city": "Łódź", "street": "Piotrkowska 100", "latitude": 51.76, "longitude": 19.45 },
                { "slug": format!("{slug}-remote"), "city": "Łódź", "street": "Piotrkowska 100", "latitude": 51.76, "longitude": 19.45 }
            ],
            "requiredSkills": ["Rust", "PostgreSQL"],
            "niceToHaveSkills": ["Kafka"],
            "languages": [{ "code": "pl", "level": "C2" }, { "code": "en", "level": "B2" }],
            "employmentTypes": [{ "type": "b2b", "currency": "pln", "unit": "month", "gross": false, "from": 18000, "to": 24000 }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn importing_a_file_twice_changes_nothing_the_second_time() {
        let importer = importer(QuarantineSink::disabled()).await;
        let body = format!("{}\n\n{}\n", v1_line("g-1", "initech-be"), v1_line("g-2", "initech-be-2"));

        let first = importer.import_bytes(body.as_bytes(), "justjoinit_2025-04-01.jsonl").await.expect("first");
        assert_eq!(first.lines_total, 2);
        assert_eq!(first.lines_ok, 2);
        assert_eq!(first.lines_duplicate, 0);

        let pool = importer.pool();
        let snapshot = [
            count(pool, "offers").await,
            count(pool, "slugs").await,
            count(pool, "locations").await,
            count(pool, "offer_location_association").await,
            count(pool, "skills").await,
            count(pool, "languages").await,
            count(pool, "employment_types").await,
        ];
        assert_eq!(snapshot, [2, 4, 2, 4, 3, 2, 2]);

        let second = importer.import_bytes(body.as_bytes(), "again.jsonl").await.expect("second");
        assert_eq!(second.lines_ok, 2);
        assert_eq!(second.lines_duplicate, 2);
        let after = [
            count(pool, "offers").await,
            count(pool, "slugs").await,
            count(pool, "locations").await,
            count(pool, "offer_location_association").await,
            count(pool, "skills").await,
            count(pool, "languages").await,
            count(pool, "employment_types").await,
        ];
        assert_eq!(snapshot, after);
        assert_eq!(count(pool, "companies").await, 1);
        assert_eq!(count(pool, "offerents").await, 1);
    }

    #[tokio::test]
    async fn required_skill_levels_start_unset() {
        let importer = importer(QuarantineSink::disabled()).await;
        importer
            .import_bytes(v1_line("g-1", "initech-be").as_bytes(), "f.jsonl")
            .await
            .expect("import");
        let unset: i64 = sqlx::query("SELECT COUNT(*) FROM required_skill_association WHERE level IS NULL")
            .fetch_one(importer.pool())
            .await
            .expect("count")
            .get(0);
        assert_eq!(unset, 2);
    }

    #[tokio::test]
    async fn malformed_records_are_quarantined_and_the_file_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let quarantine_path = dir.path().join("offers_failed.jsonl");
        let importer = importer(QuarantineSink::new(&quarantine_path)).await;

        let missing_company = json!({
            "guid": "g-bad",
            "slug": "bad",
            "title": "Broken",
            "publishedAt": "2025-04-01T09:30:00Z",
            "categoryId": 99,
            "experienceLevel": "lead",
            "workplaceType": "remote",
            "workingTime": "full_time"
        })
        .to_string();
        let unknown = json!({ "hello": "world" }).to_string();
        let body = format!("{}\n{missing_company}\n{unknown}\nnot json\n", v1_line("g-1", "ok"));

        let stats = importer.import_bytes(body.as_bytes(), "mixed.jsonl").await.expect("import");
        assert_eq!(stats.lines_total, 4);
        assert_eq!(stats.lines_ok, 1);
        assert_eq!(stats.lines_failed, 3);
        assert_eq!(stats.status(), ImportStatus::Partial);
        assert_eq!(count(importer.pool(), "offers").await, 1);

        let quarantined = std::fs::read_to_string(&quarantine_path).expect("quarantine");
        let lines: Vec<_> = quarantined.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("g-bad"));
        assert_eq!(lines[2], "not json");

        let ledger = imported_file(importer.pool(), "mixed.jsonl")
            .await
            .expect("ledger")
            .expect("row");
        assert_eq!(ledger.status, ImportStatus::Partial);
        assert_eq!(ledger.stats, stats);
    }

    #[tokio::test]
    async fn storage_failure_mid_record_rolls_back_every_row() {
        let importer = importer(QuarantineSink::disabled()).await;
        let pool = importer.pool();
        // compensation rows are written last, after dimensions, offer and slugs
        sqlx::query("DROP TABLE employment_types")
            .execute(pool)
            .await
            .expect("drop");

        let result = importer
            .import_record(&serde_json::from_str(&v1_line("g-1", "initech-be")).expect("json"))
            .await;
        assert!(result.is_err());

        for table in ["offers", "slugs", "companies", "skills", "locations", "categories"] {
            assert_eq!(count(pool, table).await, 0, "{table} kept rows");
        }
    }

    #[tokio::test]
    async fn ledger_row_only_when_something_committed() {
        let importer = importer(QuarantineSink::disabled()).await;
        let pool = importer.pool();

        let stats = importer.import_bytes(b"{\"x\":1}\n", "junk.jsonl").await.expect("import");
        assert_eq!(stats.status(), ImportStatus::Failed);
        assert!(!was_file_imported(pool, "junk.jsonl").await.expect("lookup"));

        importer
            .import_bytes(v1_line("g-1", "ok").as_bytes(), "good.jsonl")
            .await
            .expect("import");
        assert!(was_file_imported(pool, "good.jsonl").await.expect("lookup"));

        // direct re-import of a committed file leaves the first ledger row alone
        let before = imported_file(pool, "good.jsonl").await.expect("ledger").expect("row");
        importer
            .import_bytes(v1_line("g-1", "ok").as_bytes(), "good.jsonl")
            .await
            .expect("reimport");
        let after = imported_file(pool, "good.jsonl").await.expect("ledger").expect("row");
        assert_eq!(before, after);
        assert_eq!(after.stats.lines_duplicate, 0);
    }

    #[tokio::test]
    async fn quarantine_creates_its_directory_and_reports_when_it_cannot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = QuarantineSink::new(dir.path().join("failed").join("offers_failed.jsonl"));
        nested.append_line("{\"broken\": true}").await.expect("append");
        assert!(dir.path().join("failed").join("offers_failed.jsonl").exists());

        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("blocker");
        let blocked = QuarantineSink::new(blocker.join("offers_failed.jsonl"));
        let err = blocked.append_line("{}").await.expect_err("parent is a file");
        assert!(format!("{err:#}").contains("creating quarantine directory"));
    }
}
