//! Core domain model shared by the JustJoin offer pipeline crates.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jjop-core";

/// Offerent every imported offer is attributed to.
pub const OFFERENT_NAME: &str = "JustJoinIt";
pub const OFFERENT_URL: &str = "https://justjoin.it/";

/// Public offer page, used by the enrichment pass.
pub fn offer_page_url(slug: &str) -> String {
    format!("https://justjoin.it/job-offer/{slug}")
}

/// A raw offer exactly as returned by the listing API.
pub type RawOffer = serde_json::Value;

/// One page of the upstream listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub offers: Vec<RawOffer>,
    pub total_pages: u64,
    pub total_items: u64,
    /// `None` marks the terminal page.
    pub next_page: Option<u64>,
}

impl PageResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// Outcome of persisting one page into the landing zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// `false` only when every offer of the batch was already present.
    pub any_new_written: bool,
    pub saved: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

/// Historical payload shapes of the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// camelCase payload keyed by `guid` (from 2025-03-21).
    V1,
    /// camelCase payload keyed by `slug` (2023-01-01 .. 2025-03-21).
    V2,
    /// snake_case payload keyed by `id` (until 2023-12-31).
    V3,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SchemaVersion::V1 => "v1",
            SchemaVersion::V2 => "v2",
            SchemaVersion::V3 => "v3",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRef {
    pub name: String,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationDraft {
    pub city: Option<String>,
    pub street: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Location-specific slug of a multi-location posting.
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageDraft {
    pub code: String,
    pub level: Option<String>,
}

/// Compensation row; v1/v2 fill the per-currency ranges, v3 only the base amount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmploymentDraft {
    pub kind: String,
    pub currency: Option<String>,
    pub unit: Option<String>,
    pub gross: Option<bool>,
    pub from_amount: Option<f64>,
    pub to_amount: Option<f64>,
    pub from_pln: Option<f64>,
    pub to_pln: Option<f64>,
    pub from_usd: Option<f64>,
    pub to_usd: Option<f64>,
    pub from_eur: Option<f64>,
    pub to_eur: Option<f64>,
    pub from_gbp: Option<f64>,
    pub to_gbp: Option<f64>,
    pub from_chf: Option<f64>,
    pub to_chf: Option<f64>,
}

/// Version-independent offer graph produced by a schema adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOffer {
    pub version: SchemaVersion,
    pub original_id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub remote_interview: Option<bool>,
    pub open_to_hire_ukrainians: Option<bool>,
    pub category: CategoryRef,
    pub experience_level: String,
    pub workplace_type: String,
    pub working_time: String,
    pub company: CompanyRef,
    /// Slug used when the offer has no multi-location list.
    pub primary_slug: Option<String>,
    /// First entry is the primary location.
    pub locations: Vec<LocationDraft>,
    pub multilocation: bool,
    pub required_skills: Vec<String>,
    pub nice_to_have_skills: Vec<String>,
    pub languages: Vec<LanguageDraft>,
    pub employment_types: Vec<EmploymentDraft>,
}

/// Terminal status recorded in the ingestion ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    AllOk,
    Partial,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::AllOk => "all_ok",
            ImportStatus::Partial => "partial",
            ImportStatus::Failed => "failed",
        }
    }
}

/// Per-file line counters of one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    /// Lines that ended committed, duplicates included.
    pub lines_ok: usize,
    pub lines_failed: usize,
    pub lines_duplicate: usize,
    pub lines_total: usize,
}

impl ImportStats {
    pub fn status(&self) -> ImportStatus {
        if self.lines_ok == 0 {
            ImportStatus::Failed
        } else if self.lines_failed == 0 {
            ImportStatus::AllOk
        } else {
            ImportStatus::Partial
        }
    }

    pub fn absorb(&mut self, other: &ImportStats) {
        self.lines_ok += other.lines_ok;
        self.lines_failed += other.lines_failed;
        self.lines_duplicate += other.lines_duplicate;
        self.lines_total += other.lines_total;
    }
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedFile {
    pub filename: String,
    pub imported_at: DateTime<Utc>,
    pub status: ImportStatus,
    pub stats: ImportStats,
}

/// Aggregate of one import run across many landing files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRunSummary {
    pub files_total: usize,
    pub files_imported: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub offers: ImportStats,
}

impl fmt::Display for ImportRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "files: {} (imported {}, skipped {}, failed {}) | offers: {} (ok {}, duplicate {}, failed {})",
            self.files_total,
            self.files_imported,
            self.files_skipped,
            self.files_failed,
            self.offers.lines_total,
            self.offers.lines_ok,
            self.offers.lines_duplicate,
            self.offers.lines_failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoNewOffers,
    EndOfData,
    PageLimit,
}

/// Aggregate of one fetch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub offers_saved: usize,
    pub offers_duplicate: usize,
    pub offers_invalid: usize,
    pub stop_reason: StopReason,
}

impl fmt::Display for FetchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: pages {} (failed {}) | offers saved {}, duplicate {}, invalid {} | stop: {:?}",
            self.run_id,
            self.pages_fetched,
            self.pages_failed,
            self.offers_saved,
            self.offers_duplicate,
            self.offers_invalid,
            self.stop_reason
        )
    }
}

/// Structured fields extracted from an offer page by the enrichment collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedOffer {
    pub experience_description: Option<String>,
    pub years_of_experience: Option<String>,
    pub interview_mode: Option<String>,
    pub position_title: Option<String>,
    pub position_level: Option<String>,
    pub responsibilities: Option<String>,
    pub requirements: Option<String>,
    pub benefits: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
}

/// Whatever the enrichment collaborator managed to produce for one offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub notes: Option<String>,
    pub parsed: Option<ParsedOffer>,
    pub skill_levels: HashMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Ok,
    NoNotes,
    Error,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Ok => "ok",
            ScrapeStatus::NoNotes => "no_notes",
            ScrapeStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
    pub no_notes: usize,
    pub skills_updated: usize,
    pub nice_to_have_added: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_failed_and_ok_counts() {
        let clean = ImportStats {
            lines_ok: 3,
            lines_failed: 0,
            lines_duplicate: 1,
            lines_total: 3,
        };
        let partial = ImportStats {
            lines_failed: 1,
            lines_total: 4,
            ..clean
        };
        let broken = ImportStats {
            lines_ok: 0,
            lines_failed: 2,
            lines_duplicate: 0,
            lines_total: 2,
        };

        assert_eq!(clean.status(), ImportStatus::AllOk);
        assert_eq!(partial.status(), ImportStatus::Partial);
        assert_eq!(broken.status(), ImportStatus::Failed);
    }

    #[test]
    fn schema_version_serializes_lowercase() {
        let json = serde_json::to_string(&SchemaVersion::V3).expect("serialize");
        assert_eq!(json, "\"v3\"");
        assert_eq!(SchemaVersion::V1.to_string(), "v1");
    }
}
