//! Per-vendor pacing via token buckets.
//!
//! Downstream vendors (search API, language-model hosts) enforce their own
//! request-rate caps; pacing locally keeps their 429s out of our error
//! budget. One bucket per (vendor, resource) pair, refilled continuously
//! at a configured rate, with a burst capacity. Waiters are served in
//! arrival order: each acquire holds a per-bucket turnstile while it
//! sleeps, so a starved head-of-line waiter times out without reordering
//! the queue behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Identifies one bucket: vendor plus the resource being paced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateKey {
    pub vendor: String,
    pub resource: String,
}

impl GateKey {
    pub fn new(vendor: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            resource: resource.into(),
        }
    }
}

/// Refill rate and burst capacity for one bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub tokens_per_second: f64,
    pub burst: f64,
}

impl BucketConfig {
    pub fn per_minute(tokens_per_minute: f64, burst: f64) -> Self {
        Self {
            tokens_per_second: tokens_per_minute / 60.0,
            burst,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 1.0,
            burst: 10.0,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
    /// FIFO turnstile: tokio mutexes hand off in arrival order.
    turnstile: Mutex<()>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst,
                last_refill: Instant::now(),
            }),
            turnstile: Mutex::new(()),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.tokens_per_second)
            .min(self.config.burst);
        state.last_refill = now;
    }

    /// Seconds until `cost` tokens will be available, given current level.
    fn wait_for(&self, tokens: f64, cost: f64) -> f64 {
        if tokens >= cost {
            return 0.0;
        }
        (cost - tokens) / self.config.tokens_per_second
    }

    async fn acquire(&self, cost: f64, timeout: Duration) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;
        // Hold the turnstile for the whole wait: later arrivals queue
        // behind us, and our timeout does not consume their budget.
        let _turn = self.turnstile.lock().await;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= cost {
                    state.tokens -= cost;
                    return AcquireOutcome::Ok;
                }
                self.wait_for(state.tokens, cost)
            };

            let now = Instant::now();
            if now >= deadline {
                return AcquireOutcome::TimedOut;
            }
            let remaining = deadline.duration_since(now);
            let sleep = Duration::from_secs_f64(wait.min(1.0)).min(remaining);
            tokio::time::sleep(sleep.max(Duration::from_millis(5))).await;
        }
    }
}

/// Result of an acquire attempt. Timed-out acquires consume no tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ok,
    TimedOut,
}

impl AcquireOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, AcquireOutcome::Ok)
    }
}

/// Registry of token buckets, one per (vendor, resource).
///
/// Buckets are created lazily from registered configs; an unregistered
/// key falls back to a conservative default.
#[derive(Debug, Clone)]
pub struct RateGate {
    configs: Arc<std::sync::Mutex<HashMap<GateKey, BucketConfig>>>,
    buckets: Arc<Mutex<HashMap<GateKey, Arc<Bucket>>>>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            configs: Arc::new(std::sync::Mutex::new(HashMap::new())),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, key: GateKey, config: BucketConfig) {
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, config);
    }

    async fn bucket(&self, key: &GateKey) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(key) {
            return bucket.clone();
        }
        let config = self
            .configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
            .unwrap_or_default();
        let bucket = Arc::new(Bucket::new(config));
        buckets.insert(key.clone(), bucket.clone());
        bucket
    }

    /// Block until `cost` tokens are available or `timeout` elapses.
    pub async fn acquire(&self, key: &GateKey, cost: f64, timeout: Duration) -> AcquireOutcome {
        let bucket = self.bucket(key).await;
        let outcome = bucket.acquire(cost, timeout).await;
        if outcome == AcquireOutcome::TimedOut {
            tracing::warn!(
                vendor = %key.vendor,
                resource = %key.resource,
                cost,
                "rate gate acquire timed out"
            );
        }
        outcome
    }

    /// Current token level (post-refill), for metrics and tests.
    pub async fn available(&self, key: &GateKey) -> f64 {
        let bucket = self.bucket(key).await;
        let mut state = bucket.state.lock().await;
        bucket.refill(&mut state);
        state.tokens
    }
}
