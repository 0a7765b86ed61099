//! Durable storage + HTTP fetch utilities for the offer pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod landing;
pub mod object_store;
pub mod s3;

pub use landing::{LandingWriter, LocalPartitions, PartitionStore, RemotePartitions};
pub use object_store::{FsObjectStore, ObjectMeta, ObjectStore, StoreError};
pub use s3::{AwsCredentials, S3Config, S3ObjectStore};

pub const CRATE_NAME: &str = "jjop-storage";

/// Hex MD5 of a byte slice; matches the entity tag of a single-part object upload.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Hex MD5 of a file's contents.
pub async fn md5_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {} for fingerprint", path.display()))?;
    Ok(md5_hex(&bytes))
}

/// Write bytes through a sibling temp file and an atomic rename, so readers
/// never observe a partially written file.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Exponential backoff clamped to `[min_delay, max_delay]`, plus random jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub multiplier: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            multiplier: Duration::from_secs(1),
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.multiplier.saturating_mul(factor);
        delay.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(extra)
    }
}

/// Turn one line of a proxy list into a proxy URL.
///
/// Accepts `host:port:user:password` (credentials embedded into the URL) and
/// bare `host:port`.
pub fn parse_proxy_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.split(':').collect();
    match parts.as_slice() {
        [host, port] if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Some(format!("http://{host}:{port}"))
        }
        [host, port, user, password, ..] if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Some(format!("http://{user}:{password}@{host}:{port}"))
        }
        _ => None,
    }
}

/// Proxy URL with any embedded password masked, for logs and errors.
pub fn redact_proxy(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let creds = &url[scheme_end + 3..at];
            let user = creds.split(':').next().unwrap_or_default();
            format!("{}{user}:***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let parsed = parse_proxy_line(line);
            if parsed.is_none() && !line.trim().is_empty() {
                warn!("skipping malformed proxy entry");
            }
            parsed
        })
        .collect()
}

#[derive(Debug)]
struct ProxyState {
    proxies: Vec<String>,
    refreshed_at: Option<Instant>,
}

/// Egress proxies downloaded from a list URL and refreshed periodically.
/// An empty pool means direct connections.
#[derive(Debug)]
pub struct ProxyPool {
    source_url: Option<String>,
    refresh_every: Duration,
    client: reqwest::Client,
    state: Mutex<ProxyState>,
}

impl ProxyPool {
    pub fn new(source_url: Option<String>, refresh_every: Duration) -> Self {
        Self {
            source_url: source_url.filter(|url| !url.trim().is_empty()),
            refresh_every,
            client: reqwest::Client::new(),
            state: Mutex::new(ProxyState {
                proxies: Vec::new(),
                refreshed_at: None,
            }),
        }
    }

    /// Fixed list, never refreshed.
    pub fn fixed(proxies: Vec<String>) -> Self {
        Self {
            source_url: None,
            refresh_every: Duration::MAX,
            client: reqwest::Client::new(),
            state: Mutex::new(ProxyState {
                proxies,
                refreshed_at: Some(Instant::now()),
            }),
        }
    }

    async fn download(&self) -> Vec<String> {
        let Some(url) = &self.source_url else {
            return Vec::new();
        };
        let result = async {
            let resp = self.client.get(url).send().await?.error_for_status()?;
            resp.text().await
        }
        .await;
        match result {
            Ok(text) => parse_proxy_list(&text),
            Err(err) => {
                warn!(error = %err, "failed to download proxy list; using direct connection");
                Vec::new()
            }
        }
    }

    /// Random proxy URL, or `None` for a direct connection.
    pub async fn pick(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let stale = match state.refreshed_at {
            None => true,
            Some(at) => at.elapsed() >= self.refresh_every,
        };
        if self.source_url.is_some() && (stale || state.proxies.is_empty()) {
            state.proxies = self.download().await;
            state.refreshed_at = Some(Instant::now());
            info!(count = state.proxies.len(), "proxy list refreshed");
        }
        state.proxies.choose(&mut rand::thread_rng()).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub proxied: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
}

/// GET client with bounded retries; every attempt draws a fresh proxy.
#[derive(Debug)]
pub struct HttpFetcher {
    direct: reqwest::Client,
    config: HttpClientConfig,
    proxies: Option<Arc<ProxyPool>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let direct = Self::builder(&config)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            direct,
            config,
            proxies: None,
        })
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.config.backoff
    }

    fn builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        // Only the proxy pool decides which proxy a request goes through.
        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    async fn client_for_attempt(&self) -> Result<(reqwest::Client, bool), FetchError> {
        let proxy = match &self.proxies {
            Some(pool) => pool.pick().await,
            None => None,
        };
        match proxy {
            Some(url) => {
                let proxy = reqwest::Proxy::all(&url).map_err(|source| FetchError::Proxy {
                    proxy: redact_proxy(&url),
                    source,
                })?;
                let client = Self::builder(&self.config).proxy(proxy).build()?;
                Ok((client, true))
            }
            None => Ok((self.direct.clone(), false)),
        }
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query, headers)
            .instrument(span)
            .await
    }

    /// 429 and 5xx are worth another attempt.
    fn transient_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    fn transient_transport(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request()
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let attempts = self.config.backoff.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let (client, proxied) = self.client_for_attempt().await?;
            let mut request = client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            let (error, transient) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                        proxied,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let error = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (error, Self::transient_status(status))
                }
                Err(err) => {
                    let transient = Self::transient_transport(&err);
                    (FetchError::Request(err), transient)
                }
            };

            attempt += 1;
            if !transient || attempt >= attempts {
                return Err(error);
            }
            let delay = self.config.backoff.jittered_delay(attempt - 1);
            warn!(attempt, error = %error, ?delay, proxied, "transient failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
