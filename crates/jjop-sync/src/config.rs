use std::path::PathBuf;
use std::time::Duration;

use jjop_adapters::DEFAULT_API_URL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandingMode {
    /// Hive-partitioned objects in the object store.
    Remote,
    /// Flat files under `landing_dir`.
    Local,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_url: String,
    pub proxy_list_url: Option<String>,
    pub proxy_refresh: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub bucket: Option<String>,
    pub endpoint_url: Option<String>,
    pub region: String,
    /// Root of the filesystem object store used when no bucket is configured.
    pub store_dir: PathBuf,
    pub landing: LandingMode,
    pub landing_dir: PathBuf,
    pub db_key: String,
    pub db_path: PathBuf,
    pub db_backup_prefix: Option<String>,
    pub db_lease: bool,
    pub db_lease_ttl: Duration,
    pub quarantine_path: PathBuf,
    pub import_prefix: String,
    pub import_skip_recent_days: i64,
    pub webhook_url: Option<String>,
    /// Run log written next to stdout and uploaded when a run ends.
    pub log_file: PathBuf,
    /// Object prefix for import and migrate run logs.
    pub log_prefix: String,
}

/// Variable lookup used by [`PipelineConfig::from_vars`].
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.trim().is_empty())
    }

    fn path(&self, name: &str, default: &str) -> PathBuf {
        self.raw(name)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(default))
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        self.raw(name)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
            .unwrap_or(default)
    }

    fn number<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.raw(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Same variables and defaults as [`from_env`](Self::from_env), read through `get`.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(get);
        let bucket = vars.non_empty("BUCKET_NAME");
        let landing = match vars.raw("JJOP_LANDING").as_deref() {
            Some("local") => LandingMode::Local,
            Some("remote") => LandingMode::Remote,
            _ if bucket.is_some() => LandingMode::Remote,
            _ => LandingMode::Local,
        };
        let db_backup_prefix = match vars.raw("JJOP_DB_BACKUP_PREFIX") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v),
            None => Some("jobs/sql/backup".to_string()),
        };

        Self {
            api_url: vars.non_empty("JJOP_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            proxy_list_url: vars.non_empty("PROXY_URL"),
            proxy_refresh: Duration::from_secs(vars.number("JJOP_PROXY_REFRESH_SECS", 3600)),
            http_timeout_secs: vars.number("JJOP_HTTP_TIMEOUT_SECS", 10),
            user_agent: vars.non_empty("JJOP_USER_AGENT"),
            bucket,
            endpoint_url: vars.non_empty("ENDPOINT_URL"),
            region: vars.non_empty("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            store_dir: vars.path("JJOP_STORE_DIR", "store"),
            landing,
            landing_dir: vars.path("JJOP_LANDING_DIR", "data"),
            db_key: vars.non_empty("JJOP_DB_KEY").unwrap_or_else(|| "jobs/sql/jobs.sqlite".to_string()),
            db_path: vars.path("JJOP_DB_PATH", "/tmp/jobs.sqlite"),
            db_backup_prefix,
            db_lease: vars.flag("JJOP_DB_LEASE", true),
            db_lease_ttl: Duration::from_secs(vars.number("JJOP_DB_LEASE_TTL_SECS", 7200)),
            quarantine_path: vars.path("JJOP_QUARANTINE_PATH", "offers_failed.jsonl"),
            import_prefix: vars.non_empty("JJOP_IMPORT_PREFIX").unwrap_or_else(|| "jobs/".to_string()),
            import_skip_recent_days: vars.number("JJOP_IMPORT_SKIP_RECENT_DAYS", 1),
            webhook_url: vars.non_empty("DISCORD_WEBHOOK_URL"),
            log_file: vars.path("JJOP_LOG_FILE", "jjop.log"),
            log_prefix: vars.non_empty("JJOP_LOG_PREFIX").unwrap_or_else(|| "jobs/sql/logs".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn landing_follows_the_bucket_unless_overridden() {
        assert_eq!(config(&[]).landing, LandingMode::Local);
        assert_eq!(config(&[("BUCKET_NAME", "offers")]).landing, LandingMode::Remote);
        assert_eq!(
            config(&[("BUCKET_NAME", "offers"), ("JJOP_LANDING", "local")]).landing,
            LandingMode::Local
        );
    }

    #[test]
    fn empty_backup_prefix_disables_backups() {
        assert_eq!(config(&[]).db_backup_prefix.as_deref(), Some("jobs/sql/backup"));
        assert_eq!(config(&[("JJOP_DB_BACKUP_PREFIX", " ")]).db_backup_prefix, None);
        assert_eq!(config(&[]).log_prefix, "jobs/sql/logs");
        assert_eq!(config(&[]).log_file, PathBuf::from("jjop.log"));
    }
}
