//! Paginated client for the public offer listing API.

use std::sync::Arc;

use async_trait::async_trait;
use jjop_core::PageResult;
use jjop_storage::{FetchError, HttpClientConfig, HttpFetcher, ProxyPool};
use serde_json::Value;
use tracing::{error, info};

pub const DEFAULT_API_URL: &str = "https://api.justjoin.it/v2/user-panel/offers";

/// Anything that can hand out listing pages; the fetch loop only sees this.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u64, per_page: u64) -> Result<PageResult, FetchError>;
}

#[derive(Debug)]
pub struct JustJoinApi {
    fetcher: HttpFetcher,
    base_url: String,
}

impl JustJoinApi {
    pub fn new(fetcher: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }

    pub fn connect(
        config: HttpClientConfig,
        proxies: Option<Arc<ProxyPool>>,
        base_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let mut fetcher = HttpFetcher::new(config)?;
        if let Some(pool) = proxies {
            fetcher = fetcher.with_proxies(pool);
        }
        Ok(Self::new(fetcher, base_url))
    }
}

#[async_trait]
impl PageSource for JustJoinApi {
    async fn fetch_page(&self, page: u64, per_page: u64) -> Result<PageResult, FetchError> {
        let query = [
            ("sortBy", "published".to_string()),
            ("orderBy", "DESC".to_string()),
            ("perPage", per_page.to_string()),
            ("page", page.to_string()),
            ("salaryCurrencies", "PLN".to_string()),
        ];
        let response = self
            .fetcher
            .fetch_bytes(&self.base_url, &query, &[("Version", "2")])
            .await?;
        let result = parse_page_body(&response.body);
        info!(
            page,
            offers = result.offers.len(),
            total_items = result.total_items,
            total_pages = result.total_pages,
            next_page = ?result.next_page,
            proxied = response.proxied,
            "fetched listing page"
        );
        Ok(result)
    }
}

/// Decode a listing envelope. Invalid JSON is a soft failure and yields an
/// empty page rather than an error.
pub fn parse_page_body(body: &[u8]) -> PageResult {
    let envelope: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            error!(error = %err, "listing response is not valid JSON");
            return PageResult::empty();
        }
    };
    let meta = envelope.get("meta");
    let meta_u64 = |field: &str| meta.and_then(|m| m.get(field)).and_then(as_page_number);
    PageResult {
        offers: envelope
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        total_pages: meta_u64("totalPages").unwrap_or(0),
        total_items: meta_u64("totalItems").unwrap_or(0),
        next_page: meta_u64("nextPage"),
    }
}

fn as_page_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
