//! Upstream listing client plus the schema adapters for the three historical
//! payload shapes.

use chrono::{DateTime, NaiveDateTime, Utc};
use jjop_core::{
    CategoryRef, CompanyRef, EmploymentDraft, LanguageDraft, LocationDraft, NormalizedOffer,
    RawOffer, SchemaVersion,
};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod api;

pub use api::{parse_page_body, JustJoinApi, PageSource, DEFAULT_API_URL};

pub const CRATE_NAME: &str = "jjop-adapters";

/// Working time recorded for eras that did not publish one.
pub const UNKNOWN_WORKING_TIME: &str = "unknown";

type Record = Map<String, Value>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record matches no known schema version")]
    UnknownVersion,
    #[error("{version} record is missing `{field}`")]
    MissingField {
        version: SchemaVersion,
        field: String,
    },
    #[error("{version} record has invalid `{field}`: {reason}")]
    InvalidField {
        version: SchemaVersion,
        field: String,
        reason: String,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Version-specific natural key of an offer. Keys from different schema eras
/// never match each other, even when the id text coincides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferIdentity {
    pub version: SchemaVersion,
    pub original_id: String,
    pub published_at: DateTime<Utc>,
}

/// One historical payload shape: how to recognise it and how to map it.
pub trait SchemaAdapter: Send + Sync {
    fn version(&self) -> SchemaVersion;

    /// Key-presence test; adapters are consulted in v1, v2, v3 order.
    fn detect(&self, record: &Record) -> bool;

    fn identity(&self, record: &Record) -> Result<OfferIdentity, AdapterError>;

    fn extract(&self, record: &Record) -> Result<NormalizedOffer, AdapterError>;
}

/// camelCase payload keyed by `guid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Adapter;

/// camelCase payload keyed by `slug`, no `guid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V2Adapter;

/// snake_case payload keyed by `id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V3Adapter;

static ADAPTERS: [&dyn SchemaAdapter; 3] = [&V1Adapter, &V2Adapter, &V3Adapter];

pub fn as_record(raw: &RawOffer) -> Result<&Record, AdapterError> {
    raw.as_object().ok_or(AdapterError::NotAnObject)
}

/// Schema era of a raw record, decided purely from its key set.
pub fn detect_version(raw: &RawOffer) -> Option<SchemaVersion> {
    let record = raw.as_object()?;
    ADAPTERS
        .iter()
        .find(|adapter| adapter.detect(record))
        .map(|adapter| adapter.version())
}

pub fn adapter_for(version: SchemaVersion) -> &'static dyn SchemaAdapter {
    match version {
        SchemaVersion::V1 => &V1Adapter,
        SchemaVersion::V2 => &V2Adapter,
        SchemaVersion::V3 => &V3Adapter,
    }
}

/// Detect and map in one step.
pub fn normalize(raw: &RawOffer) -> Result<NormalizedOffer, AdapterError> {
    let record = as_record(raw)?;
    let version = detect_version(raw).ok_or(AdapterError::UnknownVersion)?;
    adapter_for(version).extract(record)
}

/// RFC 3339 timestamps keep their offset; naive timestamps are taken as UTC.
pub fn parse_published(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc())
}

impl SchemaAdapter for V1Adapter {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::V1
    }

    fn detect(&self, record: &Record) -> bool {
        record.contains_key("guid") && record.contains_key("slug") && record.contains_key("publishedAt")
    }

    fn identity(&self, record: &Record) -> Result<OfferIdentity, AdapterError> {
        identity(record, self.version(), "guid", "publishedAt")
    }

    fn extract(&self, record: &Record) -> Result<NormalizedOffer, AdapterError> {
        extract_camel_case(record, self.identity(record)?, self.version())
    }
}

impl SchemaAdapter for V2Adapter {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::V2
    }

    fn detect(&self, record: &Record) -> bool {
        !record.contains_key("guid") && record.contains_key("slug") && record.contains_key("publishedAt")
    }

    fn identity(&self, record: &Record) -> Result<OfferIdentity, AdapterError> {
        identity(record, self.version(), "slug", "publishedAt")
    }

    fn extract(&self, record: &Record) -> Result<NormalizedOffer, AdapterError> {
        extract_camel_case(record, self.identity(record)?, self.version())
    }
}

impl SchemaAdapter for V3Adapter {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::V3
    }

    fn detect(&self, record: &Record) -> bool {
        record.contains_key("id") && record.contains_key("published_at")
    }

    fn identity(&self, record: &Record) -> Result<OfferIdentity, AdapterError> {
        identity(record, self.version(), "id", "published_at")
    }

    fn extract(&self, record: &Record) -> Result<NormalizedOffer, AdapterError> {
        let version = self.version();
        let OfferIdentity {
            original_id,
            published_at,
            ..
        } = self.identity(record)?;

        let (locations, multilocation) = match non_empty_array(record, "multilocation") {
            Some(entries) => {
                let mut locations = Vec::with_capacity(entries.len());
                for (idx, entry) in entries.iter().enumerate() {
                    let field = format!("multilocation[{idx}]");
                    let entry = entry.as_object().ok_or_else(|| invalid(version, &field, "not an object"))?;
                    locations.push(LocationDraft {
                        city: Some(opt_str(entry, "city").unwrap_or_else(|| "unknown".into())),
                        street: Some(opt_str(entry, "street").unwrap_or_default()),
                        latitude: opt_f64(entry, "latitude", version)?,
                        longitude: opt_f64(entry, "longitude", version)?,
                        slug: opt_str(entry, "slug"),
                    });
                }
                (locations, true)
            }
            None => (
                vec![LocationDraft {
                    city: Some(opt_str(record, "city").unwrap_or_else(|| "unknown".into())),
                    street: Some(opt_str(record, "street").unwrap_or_default()),
                    latitude: opt_f64(record, "latitude", version)?,
                    longitude: opt_f64(record, "longitude", version)?,
                    slug: None,
                }],
                false,
            ),
        };

        let mut employment_types = Vec::new();
        for (idx, entry) in array(record, "employment_types").iter().enumerate() {
            let field = format!("employment_types[{idx}]");
            let entry = entry.as_object().ok_or_else(|| invalid(version, &field, "not an object"))?;
            let salary = entry.get("salary").and_then(Value::as_object);
            let salary_f64 = |key: &str| -> Result<Option<f64>, AdapterError> {
                match salary {
                    Some(salary) => opt_f64(salary, key, version),
                    None => Ok(None),
                }
            };
            employment_types.push(EmploymentDraft {
                kind: req_str(entry, "type", version)?,
                currency: salary.and_then(|s| opt_str(s, "currency")),
                unit: Some(opt_str(entry, "unit").unwrap_or_else(|| "month".into())),
                gross: match salary {
                    Some(salary) => opt_bool(salary, "gross", version)?,
                    None => None,
                },
                from_amount: salary_f64("from")?,
                to_amount: salary_f64("to")?,
                ..EmploymentDraft::default()
            });
        }

        Ok(NormalizedOffer {
            version,
            primary_slug: Some(original_id.clone()),
            original_id,
            published_at,
            title: req_str(record, "title", version)?,
            remote_interview: opt_bool(record, "remote_interview", version)?,
            open_to_hire_ukrainians: Some(
                opt_bool(record, "open_to_hire_ukrainians", version)?.unwrap_or(false),
            ),
            category: CategoryRef {
                id: 0,
                name: category_name(0),
            },
            experience_level: req_str(record, "experience_level", version)?,
            workplace_type: req_str(record, "workplace_type", version)?,
            working_time: UNKNOWN_WORKING_TIME.to_string(),
            company: CompanyRef {
                name: req_str(record, "company_name", version)?,
                logo_url: opt_str(record, "company_logo_url"),
            },
            locations,
            multilocation,
            required_skills: skill_names(record, "skills", version)?,
            nice_to_have_skills: Vec::new(),
            languages: Vec::new(),
            employment_types,
        })
    }
}

pub fn category_name(id: i64) -> String {
    format!("Kategoria {id}")
}

fn extract_camel_case(
    record: &Record,
    identity: OfferIdentity,
    version: SchemaVersion,
) -> Result<NormalizedOffer, AdapterError> {
    let category_id = opt_i64(record, "categoryId", version)?
        .ok_or_else(|| missing(version, "categoryId"))?;

    let (locations, multilocation) = match non_empty_array(record, "multilocation") {
        Some(entries) => {
            let mut locations = Vec::with_capacity(entries.len());
            for (idx, entry) in entries.iter().enumerate() {
                let field = format!("multilocation[{idx}]");
                let entry = entry.as_object().ok_or_else(|| invalid(version, &field, "not an object"))?;
                locations.push(LocationDraft {
                    city: opt_str(entry, "city"),
                    street: opt_str(entry, "street"),
                    latitude: opt_f64(entry, "latitude", version)?,
                    longitude: opt_f64(entry, "longitude", version)?,
                    slug: opt_str(entry, "slug"),
                });
            }
            (locations, true)
        }
        None => (
            vec![LocationDraft {
                city: opt_str(record, "city"),
                street: opt_str(record, "street"),
                latitude: opt_f64(record, "latitude", version)?,
                longitude: opt_f64(record, "longitude", version)?,
                slug: None,
            }],
            false,
        ),
    };

    let mut languages = Vec::new();
    for (idx, entry) in array(record, "languages").iter().enumerate() {
        let field = format!("languages[{idx}]");
        let entry = entry.as_object().ok_or_else(|| invalid(version, &field, "not an object"))?;
        languages.push(LanguageDraft {
            code: req_str(entry, "code", version)?,
            level: opt_str(entry, "level"),
        });
    }

    let mut employment_types = Vec::new();
    for (idx, entry) in array(record, "employmentTypes").iter().enumerate() {
        let field = format!("employmentTypes[{idx}]");
        let entry = entry.as_object().ok_or_else(|| invalid(version, &field, "not an object"))?;
        employment_types.push(EmploymentDraft {
            kind: req_str(entry, "type", version)?,
            currency: opt_str(entry, "currency"),
            unit: opt_str(entry, "unit"),
            gross: opt_bool(entry, "gross", version)?,
            from_amount: opt_f64(entry, "from", version)?,
            to_amount: opt_f64(entry, "to", version)?,
            from_pln: opt_f64(entry, "fromPln", version)?,
            to_pln: opt_f64(entry, "toPln", version)?,
            from_usd: opt_f64(entry, "fromUsd", version)?,
            to_usd: opt_f64(entry, "toUsd", version)?,
            from_eur: opt_f64(entry, "fromEur", version)?,
            to_eur: opt_f64(entry, "toEur", version)?,
            from_gbp: opt_f64(entry, "fromGbp", version)?,
            to_gbp: opt_f64(entry, "toGbp", version)?,
            from_chf: opt_f64(entry, "fromChf", version)?,
            to_chf: opt_f64(entry, "toChf", version)?,
        });
    }

    Ok(NormalizedOffer {
        version,
        original_id: identity.original_id,
        published_at: identity.published_at,
        title: req_str(record, "title", version)?,
        remote_interview: opt_bool(record, "remoteInterview", version)?,
        open_to_hire_ukrainians: opt_bool(record, "openToHireUkrainians", version)?,
        category: CategoryRef {
            id: category_id,
            name: category_name(category_id),
        },
        experience_level: req_str(record, "experienceLevel", version)?,
        workplace_type: req_str(record, "workplaceType", version)?,
        working_time: req_str(record, "workingTime", version)?,
        company: CompanyRef {
            name: req_str(record, "companyName", version)?,
            logo_url: opt_str(record, "companyLogoThumbUrl"),
        },
        primary_slug: opt_str(record, "slug"),
        locations,
        multilocation,
        required_skills: skill_names(record, "requiredSkills", version)?,
        nice_to_have_skills: skill_names(record, "niceToHaveSkills", version)?,
        languages,
        employment_types,
    })
}

fn identity(
    record: &Record,
    version: SchemaVersion,
    id_field: &str,
    published_field: &str,
) -> Result<OfferIdentity, AdapterError> {
    let original_id = match record.get(id_field) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Null) | None => return Err(missing(version, id_field)),
        Some(_) => return Err(invalid(version, id_field, "expected a string or number")),
    };
    let published = opt_str(record, published_field).ok_or_else(|| missing(version, published_field))?;
    let published_at = parse_published(&published)
        .ok_or_else(|| invalid(version, published_field, &format!("unparsable timestamp {published:?}")))?;
    Ok(OfferIdentity {
        version,
        original_id,
        published_at,
    })
}

fn missing(version: SchemaVersion, field: &str) -> AdapterError {
    AdapterError::MissingField {
        version,
        field: field.to_string(),
    }
}

fn invalid(version: SchemaVersion, field: &str, reason: &str) -> AdapterError {
    AdapterError::InvalidField {
        version,
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn opt_str(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn req_str(record: &Record, field: &str, version: SchemaVersion) -> Result<String, AdapterError> {
    match record.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(missing(version, field)),
        Some(_) => Err(invalid(version, field, "expected a string")),
    }
}

fn opt_bool(record: &Record, field: &str, version: SchemaVersion) -> Result<Option<bool>, AdapterError> {
    match record.get(field) {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(invalid(version, field, "expected a boolean")),
    }
}

/// Numbers, or numeric strings as older payloads used for coordinates.
fn opt_f64(record: &Record, field: &str, version: SchemaVersion) -> Result<Option<f64>, AdapterError> {
    match record.get(field) {
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid(version, field, &format!("not a number: {s:?}"))),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(invalid(version, field, "expected a number")),
    }
}

fn opt_i64(record: &Record, field: &str, version: SchemaVersion) -> Result<Option<i64>, AdapterError> {
    match record.get(field) {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(version, field, "expected an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(version, field, &format!("not an integer: {s:?}"))),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(invalid(version, field, "expected an integer")),
    }
}

fn array<'a>(record: &'a Record, field: &str) -> &'a [Value] {
    record
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn non_empty_array<'a>(record: &'a Record, field: &str) -> Option<&'a [Value]> {
    let entries = array(record, field);
    (!entries.is_empty()).then_some(entries)
}

/// Skill lists are plain names in some eras and `{name, ...}` objects in others.
fn skill_names(record: &Record, field: &str, version: SchemaVersion) -> Result<Vec<String>, AdapterError> {
    let mut names = Vec::new();
    for (idx, entry) in array(record, field).iter().enumerate() {
        let name = match entry {
            Value::String(s) => s.clone(),
            Value::Object(obj) => req_str(obj, "name", version)?,
            _ => return Err(invalid(version, &format!("{field}[{idx}]"), "expected a skill name")),
        };
        let name = name.trim().to_string();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v1_offer() -> RawOffer {
        json!({
            "guid": "0b9c6f1e-guid",
            "slug": "acme-rust-dev-warszawa",
            "title": "Rust Developer",
            "publishedAt": "2025-03-25T08:15:00.000Z",
            "categoryId": 7,
            "experienceLevel": "senior",
            "workplaceType": "remote",
            "workingTime": "full_time",
            "companyName": "Acme",
            "companyLogoThumbUrl": "https://cdn.example/acme.png",
            "remoteInterview": true,
            "openToHireUkrainians": false,
            "city": "Warszawa",
            "street": "Prosta 1",
            "latitude": 52.23,
            "longitude": "21.01",
            "multilocation": [],
            "requiredSkills": ["Rust", "SQL", "Rust"],
            "niceToHaveSkills": null,
            "languages": [{ "code": "en", "level": "B2" }],
            "employmentTypes": [{
                "type": "b2b", "currency": "pln", "unit": "month", "gross": false,
                "from": 20000, "to": 28000, "fromPln": 20000, "toPln": 28000,
                "fromUsd": 5000.5, "toUsd": 7000
            }]
        })
    }

    #[test]
    fn detection_follows_key_priority() {
        assert_eq!(detect_version(&v1_offer()), Some(SchemaVersion::V1));
        assert_eq!(
            detect_version(&json!({"slug": "x", "publishedAt": "2025-01-01T00:00:00Z"})),
            Some(SchemaVersion::V2)
        );
        assert_eq!(
            detect_version(&json!({"id": "x", "published_at": "2023-01-01T00:00:00Z"})),
            Some(SchemaVersion::V3)
        );
        // guid without slug is neither v1 nor v2
        assert_eq!(
            detect_version(&json!({"guid": "g", "publishedAt": "2025-01-01T00:00:00Z"})),
            None
        );
        assert_eq!(detect_version(&json!([1, 2])), None);
    }

    #[test]
    fn v1_maps_camel_case_fields() {
        let offer = normalize(&v1_offer()).expect("normalize");
        assert_eq!(offer.version, SchemaVersion::V1);
        assert_eq!(offer.original_id, "0b9c6f1e-guid");
        assert_eq!(offer.published_at.to_rfc3339(), "2025-03-25T08:15:00+00:00");
        assert_eq!(offer.category, CategoryRef { id: 7, name: "Kategoria 7".into() });
        assert_eq!(offer.company.logo_url.as_deref(), Some("https://cdn.example/acme.png"));
        assert!(!offer.multilocation);
        assert_eq!(offer.primary_slug.as_deref(), Some("acme-rust-dev-warszawa"));
        assert_eq!(offer.locations.len(), 1);
        assert_eq!(offer.locations[0].longitude, Some(21.01));
        assert_eq!(offer.required_skills, vec!["Rust", "SQL"]);
        assert!(offer.nice_to_have_skills.is_empty());
        assert_eq!(offer.languages[0].level.as_deref(), Some("B2"));
        let employment = &offer.employment_types[0];
        assert_eq!(employment.kind, "b2b");
        assert_eq!(employment.from_usd, Some(5000.5));
        assert_eq!(employment.from_eur, None);
    }

    #[test]
    fn v3_defaults_fill_missing_dimensions() {
        let raw = json!({
            "id": "acme-dev",
            "published_at": "2023-06-01T10:00:00+02:00",
            "title": "Dev",
            "experience_level": "mid",
            "workplace_type": "office",
            "company_name": "Acme",
            "multilocation": [
                { "city": "Kraków", "slug": "acme-dev-krakow", "latitude": "50.06", "longitude": "19.94" },
                { "latitude": "", "longitude": null }
            ],
            "skills": [{ "name": "Go", "level": 3 }],
            "employment_types": [
                { "type": "permanent", "salary": { "from": 10000, "to": 15000, "currency": "pln" } },
                { "type": "b2b", "salary": null }
            ]
        });
        let offer = normalize(&raw).expect("normalize");
        assert_eq!(offer.version, SchemaVersion::V3);
        assert_eq!(offer.published_at.to_rfc3339(), "2023-06-01T08:00:00+00:00");
        assert_eq!(offer.category.id, 0);
        assert_eq!(offer.working_time, UNKNOWN_WORKING_TIME);
        assert_eq!(offer.open_to_hire_ukrainians, Some(false));
        assert!(offer.multilocation);
        assert_eq!(offer.locations[0].latitude, Some(50.06));
        assert_eq!(offer.locations[1].city.as_deref(), Some("unknown"));
        assert_eq!(offer.locations[1].street.as_deref(), Some(""));
        assert_eq!(offer.locations[1].latitude, None);
        assert_eq!(offer.required_skills, vec!["Go"]);
        assert_eq!(offer.employment_types[0].unit.as_deref(), Some("month"));
        assert_eq!(offer.employment_types[0].to_amount, Some(15000.0));
        assert_eq!(offer.employment_types[1].currency, None);
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let mut raw = v1_offer();
        raw.as_object_mut().expect("object").remove("companyName");
        match normalize(&raw) {
            Err(AdapterError::MissingField { version, field }) => {
                assert_eq!(version, SchemaVersion::V1);
                assert_eq!(field, "companyName");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let mut raw = v1_offer();
        raw["publishedAt"] = json!("last tuesday");
        assert!(matches!(normalize(&raw), Err(AdapterError::InvalidField { .. })));

        assert!(matches!(
            normalize(&json!({"title": "orphan"})),
            Err(AdapterError::UnknownVersion)
        ));
    }

    #[test]
    fn numeric_identities_are_accepted() {
        let raw = json!({"id": 123456, "published_at": "2022-02-02T02:02:02Z"});
        let identity = V3Adapter.identity(as_record(&raw).expect("record")).expect("identity");
        assert_eq!(identity.original_id, "123456");
    }
}
