//! SQLite connection and schema for the normalized offer store.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Open (creating if missing) the database file. Rollback journal mode keeps
/// every committed page inside the single file that gets uploaded.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("opening sqlite database {}", path.display()))?;
    Ok(pool)
}

/// Private in-memory database; a single connection so every query sees it.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("opening in-memory sqlite database")?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS experience_levels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workplace_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS working_times (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS companies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        logo_url TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offerents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        url TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS locations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        company_id INTEGER REFERENCES companies(id),
        city TEXT,
        street TEXT,
        latitude REAL,
        longitude REAL,
        is_main INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS skills (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS languages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        code TEXT NOT NULL,
        level TEXT,
        UNIQUE(code, level)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        schema_version TEXT NOT NULL,
        original_id TEXT NOT NULL,
        title TEXT NOT NULL,
        remote_interview INTEGER,
        published_at TEXT NOT NULL,
        open_to_hire_ukrainians INTEGER,
        category_id INTEGER NOT NULL REFERENCES categories(id),
        experience_level_id INTEGER NOT NULL REFERENCES experience_levels(id),
        workplace_type_id INTEGER NOT NULL REFERENCES workplace_types(id),
        working_time_id INTEGER NOT NULL REFERENCES working_times(id),
        company_id INTEGER NOT NULL REFERENCES companies(id),
        offerent_id INTEGER NOT NULL REFERENCES offerents(id),
        UNIQUE(schema_version, original_id, published_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS slugs (
        offer_id INTEGER NOT NULL REFERENCES offers(id),
        slug TEXT NOT NULL,
        PRIMARY KEY (offer_id, slug)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offer_location_association (
        offer_id INTEGER NOT NULL REFERENCES offers(id),
        location_id INTEGER NOT NULL REFERENCES locations(id),
        PRIMARY KEY (offer_id, location_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS required_skill_association (
        offer_id INTEGER NOT NULL REFERENCES offers(id),
        skill_id INTEGER NOT NULL REFERENCES skills(id),
        level INTEGER,
        PRIMARY KEY (offer_id, skill_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nice_to_have_skill_association (
        offer_id INTEGER NOT NULL REFERENCES offers(id),
        skill_id INTEGER NOT NULL REFERENCES skills(id),
        level INTEGER,
        PRIMARY KEY (offer_id, skill_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS language_association (
        offer_id INTEGER NOT NULL REFERENCES offers(id),
        language_id INTEGER NOT NULL REFERENCES languages(id),
        PRIMARY KEY (offer_id, language_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS employment_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        offer_id INTEGER NOT NULL REFERENCES offers(id),
        type TEXT,
        currency TEXT,
        unit TEXT,
        gross INTEGER,
        from_amount REAL,
        to_amount REAL,
        from_pln REAL,
        to_pln REAL,
        from_usd REAL,
        to_usd REAL,
        from_eur REAL,
        to_eur REAL,
        from_gbp REAL,
        to_gbp REAL,
        from_chf REAL,
        to_chf REAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scraper (
        offer_id INTEGER PRIMARY KEY REFERENCES offers(id),
        scraped_at TEXT NOT NULL,
        status TEXT NOT NULL,
        url TEXT,
        notes TEXT,
        experience_description TEXT,
        years_of_experience TEXT,
        interview_mode TEXT,
        position_title TEXT,
        position_level TEXT,
        responsibilities TEXT,
        requirements TEXT,
        benefits TEXT,
        industry TEXT,
        company_size TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS imported_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL UNIQUE,
        imported_at TEXT NOT NULL,
        status TEXT,
        lines_total INTEGER NOT NULL DEFAULT 0,
        lines_ok INTEGER NOT NULL DEFAULT 0,
        lines_duplicate INTEGER NOT NULL DEFAULT 0,
        lines_failed INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_slugs_slug ON slugs(slug)",
    "CREATE INDEX IF NOT EXISTS idx_offers_published_at ON offers(published_at)",
    "CREATE INDEX IF NOT EXISTS idx_locations_company ON locations(company_id)",
];

/// Idempotent; safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("applying schema statement: {}", statement.trim()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = connect_in_memory().await.expect("pool");
        run_migrations(&pool).await.expect("first");
        run_migrations(&pool).await.expect("second");

        let tables: i64 = sqlx::query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(&pool)
        .await
        .expect("count")
        .get(0);
        assert_eq!(tables, 18);
    }

    #[tokio::test]
    async fn file_database_is_created_with_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("jobs.sqlite");
        let pool = connect(&path).await.expect("connect");
        run_migrations(&pool).await.expect("migrate");
        pool.close().await;
        assert!(path.exists());
    }
}
