//! Persistence pass for per-offer enrichment: picks offers that were never
//! scraped, asks an [`Enricher`] about each, and stores what it returns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jjop_core::{offer_page_url, Enrichment, EnrichmentStats, ParsedOffer, ScrapeStatus};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tracing::{info, warn};

use crate::importer::db_timestamp;

/// Turns an offer page into notes, parsed fields and per-skill levels.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, url: &str, required_skills: &[String]) -> Result<Enrichment>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOffer {
    pub offer_id: i64,
    pub slug: String,
    pub url: String,
}

/// Offers without a scraper row, each with its lowest slug.
pub async fn pending_offers(pool: &SqlitePool, limit: u32) -> Result<Vec<PendingOffer>> {
    let rows = sqlx::query(
        r#"
        SELECT o.id, MIN(s.slug) AS slug
        FROM offers o
        JOIN slugs s ON s.offer_id = o.id
        LEFT JOIN scraper sc ON sc.offer_id = o.id
        WHERE sc.offer_id IS NULL
        GROUP BY o.id
        ORDER BY o.id
        LIMIT ?
        "#,
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await
    .context("selecting offers to enrich")?;

    rows.into_iter()
        .map(|row| -> Result<PendingOffer> {
            let slug: String = row.try_get("slug")?;
            Ok(PendingOffer {
                offer_id: row.try_get(0)?,
                url: offer_page_url(&slug),
                slug,
            })
        })
        .collect()
}

async fn required_skills(pool: &SqlitePool, offer_id: i64) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT sk.name FROM required_skill_association r
        JOIN skills sk ON sk.id = r.skill_id
        WHERE r.offer_id = ?
        ORDER BY sk.name
        "#,
    )
    .bind(offer_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("loading required skills of offer {offer_id}"))?;
    Ok(names)
}

async fn save_scrape(
    conn: &mut SqliteConnection,
    offer: &PendingOffer,
    status: ScrapeStatus,
    notes: Option<&str>,
    parsed: &ParsedOffer,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO scraper (
            offer_id, scraped_at, status, url, notes,
            experience_description, years_of_experience, interview_mode,
            position_title, position_level, responsibilities, requirements,
            benefits, industry, company_size
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(offer.offer_id)
    .bind(db_timestamp(Utc::now()))
    .bind(status.as_str())
    .bind(&offer.url)
    .bind(notes)
    .bind(&parsed.experience_description)
    .bind(&parsed.years_of_experience)
    .bind(&parsed.interview_mode)
    .bind(&parsed.position_title)
    .bind(&parsed.position_level)
    .bind(&parsed.responsibilities)
    .bind(&parsed.requirements)
    .bind(&parsed.benefits)
    .bind(&parsed.industry)
    .bind(&parsed.company_size)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("saving scrape result for offer {}", offer.offer_id))?;
    Ok(())
}

/// Returns (required skills updated, nice-to-have rows added or raised).
async fn apply_skill_levels(
    conn: &mut SqliteConnection,
    offer_id: i64,
    enrichment: &Enrichment,
) -> Result<(usize, usize)> {
    let mut updated = 0;
    let mut nice_to_have = 0;
    let mut levels: Vec<_> = enrichment.skill_levels.iter().collect();
    levels.sort();

    for (skill, level) in levels {
        let result = sqlx::query(
            r#"
            UPDATE required_skill_association SET level = ?
            WHERE offer_id = ? AND skill_id = (SELECT id FROM skills WHERE name = ?)
            "#,
        )
        .bind(*level)
        .bind(offer_id)
        .bind(skill)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("updating level of {skill} for offer {offer_id}"))?;
        if result.rows_affected() == 0 {
            continue;
        }
        updated += 1;

        if *level == 1 {
            let result = sqlx::query(
                r#"
                INSERT INTO nice_to_have_skill_association (offer_id, skill_id, level)
                SELECT ?, id, 1 FROM skills WHERE name = ?
                ON CONFLICT(offer_id, skill_id) DO UPDATE SET level = 1
                "#,
            )
            .bind(offer_id)
            .bind(skill)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("adding {skill} as nice-to-have for offer {offer_id}"))?;
            nice_to_have += result.rows_affected() as usize;
        }
    }
    Ok((updated, nice_to_have))
}

async fn persist(
    pool: &SqlitePool,
    offer: &PendingOffer,
    result: &Result<Enrichment>,
) -> Result<(ScrapeStatus, usize, usize)> {
    let mut tx = pool.begin().await.context("starting transaction")?;
    let outcome = match result {
        Ok(enrichment) => {
            let status = if enrichment.notes.as_deref().is_some_and(|n| !n.trim().is_empty()) {
                ScrapeStatus::Ok
            } else {
                ScrapeStatus::NoNotes
            };
            let parsed = enrichment.parsed.clone().unwrap_or_default();
            save_scrape(&mut tx, offer, status, enrichment.notes.as_deref(), &parsed).await?;
            let (updated, added) = apply_skill_levels(&mut tx, offer.offer_id, enrichment).await?;
            (status, updated, added)
        }
        Err(err) => {
            let text = format!("{err:#}");
            save_scrape(&mut tx, offer, ScrapeStatus::Error, Some(&text), &ParsedOffer::default()).await?;
            (ScrapeStatus::Error, 0, 0)
        }
    };
    tx.commit().await.context("committing scrape result")?;
    Ok(outcome)
}

/// Enrich up to `limit` offers that have never been scraped. A failing offer
/// is recorded (or logged) and the batch moves on.
pub async fn enrich_pending(
    pool: &SqlitePool,
    enricher: &dyn Enricher,
    limit: u32,
) -> Result<EnrichmentStats> {
    let pending = pending_offers(pool, limit).await?;
    let mut stats = EnrichmentStats {
        total: pending.len(),
        ..Default::default()
    };

    for offer in &pending {
        let result = match required_skills(pool, offer.offer_id).await {
            Ok(skills) => enricher.enrich(&offer.url, &skills).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(offer_id = offer.offer_id, url = %offer.url, error = %format!("{err:#}"), "enrichment failed");
        }

        match persist(pool, offer, &result).await {
            Ok((status, updated, added)) => {
                match status {
                    ScrapeStatus::Ok => stats.ok += 1,
                    ScrapeStatus::NoNotes => stats.no_notes += 1,
                    ScrapeStatus::Error => stats.errors += 1,
                }
                stats.skills_updated += updated;
                stats.nice_to_have_added += added;
            }
            Err(err) => {
                warn!(offer_id = offer.offer_id, error = %format!("{err:#}"), "could not store enrichment");
                stats.errors += 1;
            }
        }
    }

    info!(
        total = stats.total,
        ok = stats.ok,
        errors = stats.errors,
        no_notes = stats.no_notes,
        skills_updated = stats.skills_updated,
        nice_to_have_added = stats.nice_to_have_added,
        "enrichment pass finished"
    );
    Ok(stats)
}
