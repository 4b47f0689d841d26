// src/types.rs
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// One page of the subscribed-pulses feed: raw records plus the continuation
/// token for the next fetch.
#[derive(Debug, Clone)]
pub struct Page {
    pub results: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl Page {
    /// Terminal empty page; what a source past the end of the window returns.
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

#[async_trait::async_trait]
pub trait PulseSource: Send + Sync {
    /// Fetch one page of the since-window, starting at `cursor` (`None` means
    /// the beginning of the window). Retry policy, if any, is the
    /// implementation's business; retry state never outlives one call.
    async fn fetch_page(&self, since: Option<DateTime<Utc>>, cursor: Option<&str>)
        -> Result<Page>;

    fn name(&self) -> &'static str;
}
