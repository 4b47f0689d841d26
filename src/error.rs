// src/error.rs
//! Error taxonomy for the sync pipeline.
//!
//! The orchestrator decides fatal-vs-continue purely on the variant, so the
//! classification lives here rather than at the call sites.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials rejected by the API (401/403). Never retried.
    #[error("authentication rejected by the pulse API")]
    Auth,

    /// Non-retryable 4xx other than auth/rate-limit.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    /// 429/5xx/timeout/connection failure. Retried per backoff policy.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Escalation after the retry budget for one page fetch is spent.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<SyncError> },

    /// Pagination stopped advancing (cursor ceiling hit).
    #[error("pagination did not terminate after {pages} pages")]
    LoopDetected { pages: u32 },

    /// Per-record defect; absorbed at the transform boundary by skipping.
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    /// Every record in a batch failed to upsert.
    #[error("all {failed} records in the batch failed to load")]
    SystemicWriteFailure { failed: usize },

    /// Watermark file could not be persisted.
    #[error("watermark persistence failed: {message}")]
    Watermark { message: String },
}

impl SyncError {
    /// Only transient transport failures qualify for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }

    /// Stable kind tag for operator-facing output and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth => "AuthError",
            SyncError::Client { .. } => "ClientError",
            SyncError::Transport { .. } => "RetryableTransportError",
            SyncError::RetryExhausted { .. } => "RetryExhaustedError",
            SyncError::LoopDetected { .. } => "LoopDetectedError",
            SyncError::MalformedRecord { .. } => "MalformedRecordError",
            SyncError::SystemicWriteFailure { .. } => "SystemicWriteFailure",
            SyncError::Watermark { .. } => "WatermarkError",
        }
    }
}
