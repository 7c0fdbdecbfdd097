use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::key::CompanyKey;
use crate::util::xorshift_below;

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    /// Active entries hold the per-key uniqueness slot.
    pub fn is_active(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Done | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(QueueStatus::Queued),
            "processing" => Ok(QueueStatus::Processing),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            _ => Err(format!("Unknown queue status: {s}")),
        }
    }
}

/// One unit of asynchronous stage work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub key: CompanyKey,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest instant at which the entry may be claimed.
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Outcome of an enqueue: either a fresh entry or a no-op because the key
/// already holds an active (queued/processing) entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued(i64),
    AlreadyActive,
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

/// Outcome of `fail_or_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to queued with back-off.
    Retried { next_available_in: Duration },
    /// Attempts exhausted; entry is failed for good.
    Dead,
    /// The entry was reclaimed by another worker; this update was ignored.
    NotOwned,
}

/// Batch enqueue result: which keys got a fresh entry, which were skipped.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEnqueueResult {
    pub enqueued: Vec<CompanyKey>,
    pub skipped: Vec<CompanyKey>,
}

/// Counts per status, plus the age of the oldest queued entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub queued: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    pub oldest_queued_age_seconds: Option<f64>,
}

/// Retry back-off: exponential with jitter, base 30 s, capped at 10 min.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: TimeDelta,
    pub cap: TimeDelta,
    /// Jitter fraction applied symmetrically (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: TimeDelta::seconds(30),
            cap: TimeDelta::minutes(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the attempts already made
    /// (1-indexed: after the first failure pass `1`).
    ///
    /// base × 2^(attempts−1), capped, then ±jitter.
    pub fn delay_for_attempt(&self, attempts: u32) -> TimeDelta {
        let exp = attempts.saturating_sub(1).min(20);
        let raw = self
            .base
            .checked_mul(1i32 << exp.min(20) as i32)
            .unwrap_or(self.cap);
        let capped = std::cmp::min(raw, self.cap);

        if self.jitter <= 0.0 {
            return capped;
        }
        let millis = capped.num_milliseconds().max(0) as u64;
        let spread = (millis as f64 * self.jitter) as u64;
        if spread == 0 {
            return capped;
        }
        // Uniform in [-spread, +spread].
        let offset = xorshift_below(spread * 2) as i64 - spread as i64;
        TimeDelta::milliseconds(millis as i64 + offset)
    }
}

/// Queue configuration shared by implementations.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    /// A processing lock older than this is reclaimable by any worker.
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Durable, append-only stage work list with atomic claim.
///
/// Implementations must make `claim` atomic and fair across workers
/// (`SELECT ... FOR UPDATE SKIP LOCKED` or equivalent), enforce at most
/// one active entry per company key, and treat locks older than the
/// visibility timeout as claimable.
pub trait WorkQueue: Send + Sync + Clone {
    /// Insert a new entry unless the key already has an active one.
    fn enqueue(
        &self,
        key: &CompanyKey,
    ) -> impl Future<Output = Result<EnqueueOutcome, AppError>> + Send;

    fn enqueue_batch(
        &self,
        keys: &[CompanyKey],
    ) -> impl Future<Output = Result<BatchEnqueueResult, AppError>> + Send;

    /// Atomically claim up to `batch` available entries for `owner`.
    ///
    /// Ordered by `available_at` then id; rows locked by a claim in flight
    /// are skipped, and locks past the visibility timeout are reclaimed.
    fn claim(
        &self,
        owner: &str,
        batch: usize,
    ) -> impl Future<Output = Result<Vec<QueueEntry>, AppError>> + Send;

    /// Mark done. A no-op if the entry has been reclaimed by another owner.
    fn complete(
        &self,
        entry_id: i64,
        owner: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failure: requeue with back-off while attempts remain,
    /// otherwise move to failed keeping `last_error`.
    fn fail_or_retry(
        &self,
        entry_id: i64,
        owner: &str,
        error: &str,
    ) -> impl Future<Output = Result<FailOutcome, AppError>> + Send;

    fn metrics(&self) -> impl Future<Output = Result<QueueMetrics, AppError>> + Send;
}
