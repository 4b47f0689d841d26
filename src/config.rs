// src/config.rs
//! Environment-backed configuration for one sync run.
//!
//! Every option has a documented default; the binary loads `.env` via dotenvy
//! before calling [`SyncConfig::from_env`], so a local `.env` file works the
//! same as real environment variables.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "https://otx.alienvault.com";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `OTX_API_KEY`: required to build the HTTP client; absent is an error
    /// there, not here, so tests can construct configs without credentials.
    pub api_key: Option<String>,
    /// `OTX_BASE_URL`, default `https://otx.alienvault.com`.
    pub base_url: String,
    /// `STORE_URI`: root of the local document store, default `state/store`.
    pub store_uri: String,
    /// `STORE_DATABASE`, default `threatintel`.
    pub store_database: String,
    /// `STORE_COLLECTION`, default `otx_pulses_raw`.
    pub store_collection: String,
    /// `OTX_PAGE_LIMIT`, default 50.
    pub page_limit: u32,
    /// `OTX_MODIFIED_SINCE`: initial since when no watermark exists.
    pub initial_since: Option<DateTime<Utc>>,
    /// `OTX_WATERMARK_FILE`, default `state/otx_watermark.json`.
    pub watermark_file: PathBuf,
    /// `REQUEST_TIMEOUT_SECS`, default 30.
    pub request_timeout_secs: u64,
    /// `MAX_RETRIES`: total attempts per page fetch, default 5.
    pub max_retries: u32,
    /// `BACKOFF_SECONDS`: base of the exponential backoff, default 2.0.
    pub backoff_seconds: f64,
    /// `BACKOFF_CAP_SECS`: ceiling for a single backoff wait, default 60.
    pub backoff_cap_secs: u64,
    /// `MAX_PAGES_PER_RUN`: pagination loop-detection ceiling, default 1000.
    pub max_pages_per_run: u32,
    /// `PAGE_PAUSE_MS`: politeness delay between pages, default 100.
    pub page_pause_ms: u64,
    /// `OTX_DRY_RUN`: extract+transform only, writes go to a no-op store.
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            store_uri: "state/store".to_string(),
            store_database: "threatintel".to_string(),
            store_collection: "otx_pulses_raw".to_string(),
            page_limit: 50,
            initial_since: None,
            watermark_file: PathBuf::from("state/otx_watermark.json"),
            request_timeout_secs: 30,
            max_retries: 5,
            backoff_seconds: 2.0,
            backoff_cap_secs: 60,
            max_pages_per_run: 1000,
            page_pause_ms: 100,
            dry_run: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: env_string("OTX_API_KEY"),
            base_url: env_string("OTX_BASE_URL").unwrap_or(defaults.base_url),
            store_uri: env_string("STORE_URI").unwrap_or(defaults.store_uri),
            store_database: env_string("STORE_DATABASE").unwrap_or(defaults.store_database),
            store_collection: env_string("STORE_COLLECTION").unwrap_or(defaults.store_collection),
            page_limit: env_parse("OTX_PAGE_LIMIT", defaults.page_limit),
            initial_since: env_string("OTX_MODIFIED_SINCE")
                .as_deref()
                .and_then(parse_since),
            watermark_file: env_string("OTX_WATERMARK_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.watermark_file),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            backoff_seconds: env_parse("BACKOFF_SECONDS", defaults.backoff_seconds),
            backoff_cap_secs: env_parse("BACKOFF_CAP_SECS", defaults.backoff_cap_secs),
            max_pages_per_run: env_parse("MAX_PAGES_PER_RUN", defaults.max_pages_per_run),
            page_pause_ms: env_parse("PAGE_PAUSE_MS", defaults.page_pause_ms),
            dry_run: env_flag("OTX_DRY_RUN"),
        }
    }
}

/// Parse an ISO8601 timestamp into UTC; unparseable input is dropped with a
/// warning rather than aborting startup.
pub fn parse_since(s: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(error = %e, value = s, "ignoring unparseable since timestamp");
            None
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .is_some_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[serial_test::serial]
    #[test]
    fn defaults_apply_without_env() {
        for k in [
            "OTX_API_KEY",
            "OTX_BASE_URL",
            "OTX_PAGE_LIMIT",
            "MAX_RETRIES",
            "OTX_MODIFIED_SINCE",
            "OTX_DRY_RUN",
        ] {
            env::remove_var(k);
        }
        let cfg = SyncConfig::from_env();
        assert_eq!(cfg.page_limit, 50);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert!(cfg.api_key.is_none());
        assert!(cfg.initial_since.is_none());
        assert!(!cfg.dry_run);
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_and_bad_values_fall_back() {
        env::set_var("OTX_PAGE_LIMIT", "25");
        env::set_var("MAX_RETRIES", "not-a-number");
        env::set_var("OTX_MODIFIED_SINCE", "2025-01-01T00:00:00+00:00");
        env::set_var("OTX_DRY_RUN", "1");

        let cfg = SyncConfig::from_env();
        assert_eq!(cfg.page_limit, 25);
        assert_eq!(cfg.max_retries, 5); // unparseable -> default
        assert!(cfg.dry_run);
        let since = cfg.initial_since.expect("since parsed");
        assert_eq!(since.to_rfc3339(), "2025-01-01T00:00:00+00:00");

        for k in [
            "OTX_PAGE_LIMIT",
            "MAX_RETRIES",
            "OTX_MODIFIED_SINCE",
            "OTX_DRY_RUN",
        ] {
            env::remove_var(k);
        }
    }

    #[test]
    fn garbage_since_is_dropped() {
        assert!(parse_since("yesterday").is_none());
        assert!(parse_since("2025-06-01T12:00:00Z").is_some());
    }
}
