// src/walker.rs
//! Drives a [`PulseSource`] page-by-page until the window is exhausted.
//!
//! The walk is strictly sequential: each page's cursor comes from the prior
//! response, so there is nothing to parallelize. A ceiling on the page count
//! guards against a source whose cursor stops advancing.

use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::types::{Page, PulseSource};

pub struct PageWalker<'a> {
    source: &'a dyn PulseSource,
    since: Option<DateTime<Utc>>,
    cursor: Option<String>,
    pages_fetched: u32,
    max_pages: u32,
    finished: bool,
}

impl<'a> PageWalker<'a> {
    pub fn new(
        source: &'a dyn PulseSource,
        since: Option<DateTime<Utc>>,
        initial_cursor: Option<String>,
        max_pages: u32,
    ) -> Self {
        Self {
            source,
            since,
            cursor: initial_cursor,
            pages_fetched: 0,
            max_pages,
            finished: false,
        }
    }

    /// Cursor the next fetch would use; on failure this is how far the walk
    /// got before stopping.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Fetch the next page. `Ok(None)` means the window is exhausted; any
    /// error is sticky and ends the walk.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.finished {
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            self.finished = true;
            return Err(SyncError::LoopDetected {
                pages: self.pages_fetched,
            });
        }

        let page = match self
            .source
            .fetch_page(self.since, self.cursor.as_deref())
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.finished = true;
                tracing::warn!(
                    error = %e,
                    source = self.source.name(),
                    cursor = ?self.cursor,
                    "page fetch failed, aborting walk"
                );
                return Err(e);
            }
        };

        self.pages_fetched += 1;
        if page.results.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        if !page.has_more || page.next_cursor.is_none() {
            self.finished = true;
        }
        self.cursor = page.next_cursor.clone();
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves a fixed script of pages and records the cursors it was asked for.
    struct FixturePages {
        pages: Vec<Page>,
        seen_cursors: Mutex<Vec<Option<String>>>,
    }

    impl FixturePages {
        fn new(pages: Vec<Page>) -> Self {
            Self {
                pages,
                seen_cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PulseSource for FixturePages {
        async fn fetch_page(
            &self,
            _since: Option<DateTime<Utc>>,
            cursor: Option<&str>,
        ) -> Result<Page> {
            let mut seen = self.seen_cursors.lock().unwrap();
            seen.push(cursor.map(str::to_string));
            let idx = seen.len() - 1;
            Ok(self.pages.get(idx).cloned().unwrap_or_else(Page::empty))
        }

        fn name(&self) -> &'static str {
            "fixture"
        }
    }

    fn page_of(n: usize, offset: usize, next: Option<&str>) -> Page {
        Page {
            results: (0..n).map(|i| json!({"id": format!("p{}", offset + i)})).collect(),
            next_cursor: next.map(str::to_string),
            has_more: next.is_some(),
        }
    }

    #[tokio::test]
    async fn walks_pages_in_order_and_terminates() {
        let source = FixturePages::new(vec![
            page_of(50, 0, Some("c1")),
            page_of(50, 50, Some("c2")),
            page_of(17, 100, None),
        ]);
        let mut walker = PageWalker::new(&source, None, None, 100);

        let mut ids = Vec::new();
        while let Some(page) = walker.next_page().await.unwrap() {
            for r in &page.results {
                ids.push(r["id"].as_str().unwrap().to_string());
            }
        }

        assert_eq!(ids.len(), 117);
        assert_eq!(ids.first().map(String::as_str), Some("p0"));
        assert_eq!(ids.last().map(String::as_str), Some("p116"));
        assert_eq!(walker.pages_fetched(), 3);
        // Exhausted walker stays exhausted.
        assert!(walker.next_page().await.unwrap().is_none());
        // Cursor handoff: None, then c1, then c2; no fourth fetch happened.
        let seen = source.seen_cursors.lock().unwrap();
        assert_eq!(
            *seen,
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn empty_first_page_ends_walk() {
        let source = FixturePages::new(vec![Page::empty()]);
        let mut walker = PageWalker::new(&source, None, None, 100);
        assert!(walker.next_page().await.unwrap().is_none());
        assert_eq!(walker.pages_fetched(), 1);
    }

    #[tokio::test]
    async fn resumes_from_initial_cursor() {
        let source = FixturePages::new(vec![page_of(3, 0, None)]);
        let mut walker = PageWalker::new(&source, None, Some("resume-tok".into()), 100);
        walker.next_page().await.unwrap();
        let seen = source.seen_cursors.lock().unwrap();
        assert_eq!(*seen, vec![Some("resume-tok".to_string())]);
    }

    /// A cursor that never advances must trip the page ceiling.
    struct StuckCursor;

    #[async_trait::async_trait]
    impl PulseSource for StuckCursor {
        async fn fetch_page(
            &self,
            _since: Option<DateTime<Utc>>,
            _cursor: Option<&str>,
        ) -> Result<Page> {
            Ok(page_of(5, 0, Some("same-token")))
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn non_advancing_cursor_is_detected() {
        let source = StuckCursor;
        let mut walker = PageWalker::new(&source, None, None, 10);
        for _ in 0..10 {
            assert!(walker.next_page().await.unwrap().is_some());
        }
        let err = walker.next_page().await.unwrap_err();
        assert!(matches!(err, SyncError::LoopDetected { pages: 10 }));
    }

    /// Fatal source errors abort the walk and keep the failing cursor visible.
    struct FailsSecondPage;

    #[async_trait::async_trait]
    impl PulseSource for FailsSecondPage {
        async fn fetch_page(
            &self,
            _since: Option<DateTime<Utc>>,
            cursor: Option<&str>,
        ) -> Result<Page> {
            match cursor {
                None => Ok(page_of(2, 0, Some("c1"))),
                Some(_) => Err(SyncError::Auth),
            }
        }

        fn name(&self) -> &'static str {
            "fails-second"
        }
    }

    #[tokio::test]
    async fn fatal_error_aborts_with_cursor_context() {
        let source = FailsSecondPage;
        let mut walker = PageWalker::new(&source, None, None, 100);
        assert!(walker.next_page().await.unwrap().is_some());
        let err = walker.next_page().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth));
        assert_eq!(walker.cursor(), Some("c1"));
        // Walk is over; no further fetches.
        assert!(walker.next_page().await.unwrap().is_none());
    }
}
