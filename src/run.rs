// src/run.rs
//! Run orchestrator: one incremental sync pass.
//!
//! Per page the run cycles FETCHING -> LOADING -> ADVANCING; the watermark is
//! persisted only after a page is durably loaded, so an abort at any point
//! leaves the on-disk checkpoint at the end of the last fully loaded page.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::{load_batch, DocumentStore};
use crate::transform::{enrich, observed_modified, RunStamp};
use crate::types::PulseSource;
use crate::walker::PageWalker;
use crate::watermark::{StartPoint, Watermark, WatermarkStore};

/// One-time metrics registration (so series carry descriptions).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("sync_runs_total", "Sync runs started.");
        describe_counter!("sync_pages_total", "Pages fetched and loaded.");
        describe_counter!(
            "sync_records_upserted_total",
            "Records upserted into the store."
        );
        describe_counter!(
            "sync_records_failed_total",
            "Records that failed to upsert."
        );
        describe_counter!(
            "sync_records_skipped_total",
            "Malformed records skipped during transform."
        );
        describe_counter!(
            "sync_fetch_retries_total",
            "Fetch attempts retried after a transient error."
        );
        describe_histogram!("sync_fetch_ms", "Page fetch time in milliseconds.");
        describe_gauge!("sync_last_run_ts", "Unix ts when the last run finished.");
    });
}

/// What one run did; `watermark` is the last persisted checkpoint.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub pages: u32,
    pub records_seen: usize,
    pub records_upserted: usize,
    pub records_failed: usize,
    pub records_skipped: usize,
    pub watermark: Watermark,
}

pub struct Runner<'a> {
    cfg: &'a SyncConfig,
    source: &'a dyn PulseSource,
    store: &'a dyn DocumentStore,
    watermarks: WatermarkStore,
}

impl<'a> Runner<'a> {
    pub fn new(
        cfg: &'a SyncConfig,
        source: &'a dyn PulseSource,
        store: &'a dyn DocumentStore,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            cfg,
            source,
            store,
            watermarks,
        }
    }

    /// Execute one incremental run to completion. On error the persisted
    /// watermark is untouched since the last fully loaded page, so a rerun
    /// resumes safely.
    pub async fn run(&self, start: StartPoint) -> Result<RunReport> {
        ensure_metrics_described();
        counter!("sync_runs_total").increment(1);

        // INIT: resolve the starting point once.
        let mut watermark = match start {
            StartPoint::FromExplicitSince(ts) => {
                tracing::info!(since = %ts, "explicit since override, persisted watermark ignored");
                Watermark {
                    since: Some(ts),
                    cursor: None,
                }
            }
            StartPoint::FromWatermark => match self.watermarks.load().await {
                Some(wm) => {
                    tracing::info!(since = ?wm.since, cursor = ?wm.cursor, "resuming from watermark");
                    wm
                }
                None => {
                    tracing::info!(
                        since = ?self.cfg.initial_since,
                        "no watermark, starting from configured initial since"
                    );
                    Watermark {
                        since: self.cfg.initial_since,
                        cursor: None,
                    }
                }
            },
        };

        let run_id = Uuid::new_v4().to_string();
        let mut walker = PageWalker::new(
            self.source,
            watermark.since,
            watermark.cursor.clone(),
            self.cfg.max_pages_per_run,
        );
        let mut report = RunReport {
            run_id: run_id.clone(),
            pages: 0,
            records_seen: 0,
            records_upserted: 0,
            records_failed: 0,
            records_skipped: 0,
            watermark: watermark.clone(),
        };

        loop {
            // FETCHING: end-of-pagination and empty results are not errors.
            let page = match walker.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        kind = e.kind(),
                        since = ?watermark.since,
                        cursor = ?walker.cursor(),
                        "run failed while fetching"
                    );
                    return Err(e);
                }
            };
            let page_no = walker.pages_fetched();
            report.records_seen += page.results.len();

            // LOADING: transform (skipping malformed records), then upsert.
            let now = Utc::now();
            let stamp = RunStamp {
                run_id: &run_id,
                page_no,
            };
            let mut docs = Vec::with_capacity(page.results.len());
            let mut batch_max: Option<DateTime<Utc>> = None;
            for raw in &page.results {
                match enrich(raw, stamp, now) {
                    Ok(doc) => {
                        if let Some(ts) = observed_modified(raw) {
                            if batch_max.is_none_or(|cur| ts > cur) {
                                batch_max = Some(ts);
                            }
                        }
                        docs.push(doc);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, page = page_no, "skipping malformed record");
                        counter!("sync_records_skipped_total").increment(1);
                        report.records_skipped += 1;
                    }
                }
            }

            let result = load_batch(self.store, &docs).await;
            report.records_upserted += result.succeeded;
            report.records_failed += result.failed_ids.len();
            counter!("sync_records_upserted_total").increment(result.succeeded as u64);
            counter!("sync_records_failed_total").increment(result.failed_ids.len() as u64);

            if !docs.is_empty() && result.all_failed() {
                let err = SyncError::SystemicWriteFailure {
                    failed: result.failed_ids.len(),
                };
                tracing::error!(
                    error = %err,
                    kind = err.kind(),
                    page = page_no,
                    target = %self.store.target(),
                    "run failed while loading"
                );
                return Err(err);
            }
            if !result.failed_ids.is_empty() {
                tracing::warn!(
                    failed = result.failed_ids.len(),
                    ids = ?result.failed_ids,
                    page = page_no,
                    "partial load failure, continuing"
                );
            }

            // ADVANCING: persist progress only now that the page is loaded.
            watermark.advance(batch_max, page.next_cursor.clone());
            if let Err(e) = self.watermarks.save(&watermark).await {
                tracing::error!(error = %e, kind = e.kind(), "run failed while persisting watermark");
                return Err(e);
            }
            counter!("sync_pages_total").increment(1);
            report.pages = page_no;
            report.watermark = watermark.clone();
            tracing::info!(
                page = page_no,
                fetched = page.results.len(),
                upserted = result.succeeded,
                more = page.has_more,
                "page loaded"
            );

            if self.cfg.page_pause_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.cfg.page_pause_ms)).await;
            }
        }

        // DONE
        gauge!("sync_last_run_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            run_id = %report.run_id,
            pages = report.pages,
            upserted = report.records_upserted,
            failed = report.records_failed,
            skipped = report.records_skipped,
            "sync run done"
        );
        Ok(report)
    }
}
