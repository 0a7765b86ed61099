use jjop_adapters::{adapter_for, as_record, detect_version, normalize};
use jjop_core::SchemaVersion;
use serde_json::json;

#[test]
fn same_slug_across_eras_keeps_distinct_identities() {
    let v2 = json!({
        "slug": "acme-dev",
        "publishedAt": "2025-03-05T10:00:00Z",
        "title": "Developer",
        "categoryId": 1,
        "experienceLevel": "junior",
        "workplaceType": "hybrid",
        "workingTime": "full_time",
        "companyName": "Acme",
        "city": "Gdańsk",
        "street": "Długa 2",
        "latitude": 54.35,
        "longitude": 18.65
    });
    let v3 = json!({
        "id": "acme-dev",
        "published_at": "2025-03-05T10:00:00+00:00",
        "title": "Developer",
        "experience_level": "junior",
        "workplace_type": "hybrid",
        "company_name": "Acme",
        "latitude": "54.35",
        "longitude": "18.65"
    });

    assert_eq!(detect_version(&v2), Some(SchemaVersion::V2));
    assert_eq!(detect_version(&v3), Some(SchemaVersion::V3));

    let a = normalize(&v2).expect("v2");
    let b = normalize(&v3).expect("v3");
    assert_eq!(a.original_id, "acme-dev");
    assert_eq!(b.original_id, "acme-dev");
    assert_eq!(a.published_at, b.published_at);
    assert_ne!(a.version, b.version);
    assert_eq!(b.primary_slug.as_deref(), Some("acme-dev"));
}

#[test]
fn v2_multilocation_carries_per_location_slugs() {
    let raw = json!({
        "slug": "globex-qa-wroclaw",
        "publishedAt": "2024-11-02T12:00:00Z",
        "title": "QA Engineer",
        "categoryId": "12",
        "experienceLevel": "mid",
        "workplaceType": "office",
        "workingTime": "part_time",
        "companyName": "Globex",
        "multilocation": [
            { "slug": "globex-qa-wroclaw", "city": "Wrocław", "street": "Rynek 1", "latitude": 51.11, "longitude": 17.03 },
            { "slug": "globex-qa-poznan", "city": "Poznań", "street": "Półwiejska 2", "latitude": 52.40, "longitude": 16.92 }
        ],
        "requiredSkills": [{ "name": "Selenium", "level": 3 }],
        "niceToHaveSkills": ["Python"]
    });

    let record = as_record(&raw).expect("record");
    let adapter = adapter_for(SchemaVersion::V2);
    assert!(adapter.detect(record));
    let identity = adapter.identity(record).expect("identity");
    assert_eq!(identity.original_id, "globex-qa-wroclaw");

    let offer = adapter.extract(record).expect("extract");
    assert_eq!(offer.category.id, 12);
    assert!(offer.multilocation);
    let slugs: Vec<_> = offer.locations.iter().filter_map(|l| l.slug.as_deref()).collect();
    assert_eq!(slugs, vec!["globex-qa-wroclaw", "globex-qa-poznan"]);
    assert_eq!(offer.required_skills, vec!["Selenium"]);
    assert_eq!(offer.nice_to_have_skills, vec!["Python"]);
    assert!(offer.employment_types.is_empty());
}
