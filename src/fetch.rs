// src/fetch.rs
//! HTTP client for the subscribed-pulses endpoint.
//!
//! One `fetch_page` call owns its whole retry budget: transient failures
//! (429, 5xx, timeouts, connection errors) are retried with exponential
//! backoff, auth and other 4xx failures abort immediately. Nothing is shared
//! between calls.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::types::{Page, PulseSource};

pub const API_KEY_HEADER: &str = "X-OTX-API-KEY";
const PULSES_SUBSCRIBED_PATH: &str = "/api/v1/pulses/subscribed";
const USER_ME_PATH: &str = "/api/v1/users/me";

/// Wire shape of one feed page.
#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    results: Vec<Value>,
    next: Option<String>,
    #[serde(default)]
    has_more: Option<bool>,
}

impl From<PageBody> for Page {
    fn from(b: PageBody) -> Self {
        // `has_more` is not always sent; a present continuation token means
        // there is more to fetch.
        let has_more = b.has_more.unwrap_or(b.next.is_some());
        Page {
            results: b.results,
            next_cursor: b.next,
            has_more,
        }
    }
}

/// Delay before retrying after attempt `attempt` (1-based):
/// `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base_secs: f64, cap_secs: u64) -> Duration {
    let exp = base_secs * 2f64.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64(exp.min(cap_secs as f64).max(0.0))
}

/// Map a non-2xx status to the error taxonomy. 401/403 are fatal auth
/// failures, 429 and 5xx are transient, the remaining 4xx are client bugs.
pub fn classify_status(status: u16, body: &str) -> SyncError {
    match status {
        401 | 403 => SyncError::Auth,
        429 => SyncError::Transport {
            message: format!("rate limited (429): {}", truncate(body)),
        },
        500..=599 => SyncError::Transport {
            message: format!("server error ({status}): {}", truncate(body)),
        },
        _ => SyncError::Client {
            status,
            body: truncate(body),
        },
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

fn transport_err(e: reqwest::Error) -> SyncError {
    SyncError::Transport {
        message: e.to_string(),
    }
}

pub struct HttpFetchClient {
    mode: Mode,
    page_limit: u32,
    max_retries: u32,
    backoff_seconds: f64,
    backoff_cap_secs: u64,
}

enum Mode {
    Http {
        client: reqwest::Client,
        base_url: String,
        api_key: String,
    },
    #[cfg(test)]
    Scripted {
        outcomes: std::sync::Mutex<std::collections::VecDeque<Result<Page>>>,
        attempts: std::sync::atomic::AtomicU32,
    },
}

impl HttpFetchClient {
    pub fn from_config(cfg: &SyncConfig) -> anyhow::Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .context("Missing OTX_API_KEY in environment or .env file")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("building http client")?;
        Ok(Self {
            mode: Mode::Http {
                client,
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                api_key,
            },
            page_limit: cfg.page_limit,
            max_retries: cfg.max_retries.max(1),
            backoff_seconds: cfg.backoff_seconds,
            backoff_cap_secs: cfg.backoff_cap_secs,
        })
    }

    /// Scripted attempt outcomes instead of the network, for retry tests.
    #[cfg(test)]
    fn scripted(outcomes: Vec<Result<Page>>, max_retries: u32, backoff_seconds: f64) -> Self {
        Self {
            mode: Mode::Scripted {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                attempts: std::sync::atomic::AtomicU32::new(0),
            },
            page_limit: 50,
            max_retries,
            backoff_seconds,
            backoff_cap_secs: 60,
        }
    }

    #[cfg(test)]
    fn attempts(&self) -> u32 {
        match &self.mode {
            Mode::Scripted { attempts, .. } => attempts.load(std::sync::atomic::Ordering::SeqCst),
            _ => 0,
        }
    }

    /// One-shot key check against `/users/me`; an auth failure here is final,
    /// so the run can abort before touching the watermark.
    pub async fn validate_credentials(&self) -> Result<Value> {
        match &self.mode {
            Mode::Http {
                client,
                base_url,
                api_key,
            } => {
                let url = format!("{base_url}{USER_ME_PATH}");
                let resp = client
                    .get(&url)
                    .header(API_KEY_HEADER, api_key)
                    .send()
                    .await
                    .map_err(transport_err)?;
                let status = resp.status();
                if status.is_success() {
                    return resp.json().await.map_err(|e| SyncError::Client {
                        status: status.as_u16(),
                        body: format!("invalid account body: {e}"),
                    });
                }
                let body = resp.text().await.unwrap_or_default();
                Err(classify_status(status.as_u16(), &body))
            }
            #[cfg(test)]
            Mode::Scripted { .. } => Ok(Value::Object(Default::default())),
        }
    }

    async fn attempt_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page> {
        match &self.mode {
            Mode::Http {
                client,
                base_url,
                api_key,
            } => {
                let url = format!("{base_url}{PULSES_SUBSCRIBED_PATH}");
                let mut req = client
                    .get(&url)
                    .header(API_KEY_HEADER, api_key)
                    .query(&[("limit", self.page_limit.to_string())]);
                if let Some(s) = since {
                    req = req.query(&[(
                        "modified_since",
                        s.to_rfc3339_opts(SecondsFormat::Secs, true),
                    )]);
                }
                if let Some(c) = cursor {
                    req = req.query(&[("cursor", c)]);
                }

                let resp = req.send().await.map_err(transport_err)?;
                let status = resp.status();
                if status.is_success() {
                    let body: PageBody = match resp.json().await {
                        Ok(b) => b,
                        Err(e) if e.is_decode() => {
                            return Err(SyncError::Client {
                                status: status.as_u16(),
                                body: format!("invalid page body: {e}"),
                            })
                        }
                        Err(e) => return Err(transport_err(e)),
                    };
                    return Ok(body.into());
                }
                let body = resp.text().await.unwrap_or_default();
                Err(classify_status(status.as_u16(), &body))
            }
            #[cfg(test)]
            Mode::Scripted { outcomes, attempts } => {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("scripted outcomes exhausted")
            }
        }
    }
}

#[async_trait]
impl PulseSource for HttpFetchClient {
    async fn fetch_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let t0 = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_page(since, cursor).await {
                Ok(page) => {
                    histogram!("sync_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                    return Ok(page);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt, self.backoff_seconds, self.backoff_cap_secs);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "transient fetch error, backing off"
                    );
                    counter!("sync_fetch_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(SyncError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &'static str {
        "otx"
    }
}
