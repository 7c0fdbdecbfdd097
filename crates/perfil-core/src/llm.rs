//! Structured-output calls to language-model vendors.
//!
//! One caller fronts every model consumer (discovery, link ranking,
//! profile extraction). It owns: per-vendor concurrency slots under a
//! global hard cap, pacing through the rate gate, an adaptive output
//! budget, schema enforcement, degeneration detection with immediate
//! sampling-adjusted retries, and health-weighted vendor fallback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use crate::error::AppError;
use crate::rate_gate::{AcquireOutcome, GateKey, RateGate};
use crate::util::{estimate_tokens, xorshift_below};

// ---------------------------------------------------------------------------
// Messages and sampling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Sampling controls sent to vendors that accept them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            presence_penalty: 0.3,
            frequency_penalty: 0.4,
        }
    }
}

impl SamplingParams {
    /// Anti-degeneration adjustment: more temperature, stronger penalties.
    pub fn escalated(&self) -> Self {
        Self {
            temperature: 0.2,
            presence_penalty: 0.6,
            frequency_penalty: 0.8,
        }
    }
}

/// Output-token cap derived from input size: small inputs get a tight cap
/// so a degenerate run on a tiny chunk cannot burn the vendor maximum.
pub fn output_budget(input_tokens: usize, vendor_max: u32) -> u32 {
    if input_tokens < 3_000 {
        1_200.min(vendor_max)
    } else if input_tokens <= 8_000 {
        2_000.min(vendor_max)
    } else {
        vendor_max
    }
}

// ---------------------------------------------------------------------------
// Degeneration detection
// ---------------------------------------------------------------------------

const NGRAM_SIZE: usize = 4;
const NGRAM_REPEAT_LIMIT: usize = 8;
const SUBSTRING_LEN: usize = 30;
const SUBSTRING_REPEAT_LIMIT: usize = 5;
const UNTERMINATED_MIN_LEN: usize = 3_000;

/// Scan an emitted string for runaway-decode patterns.
///
/// Three detectors: a whitespace-tokenized 4-gram repeated more than 8
/// times, any 30-char substring repeated more than 5 times, and a long
/// output that ends without its outermost closing brace.
pub fn detect_degeneration(output: &str) -> Option<String> {
    // (a) repeated 4-grams of whitespace tokens.
    let tokens: Vec<&str> = output.split_whitespace().collect();
    if tokens.len() >= NGRAM_SIZE {
        let mut counts: HashMap<[&str; NGRAM_SIZE], usize> = HashMap::new();
        for window in tokens.windows(NGRAM_SIZE) {
            let key = [window[0], window[1], window[2], window[3]];
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            if *count > NGRAM_REPEAT_LIMIT {
                return Some(format!("4-gram repeated more than {NGRAM_REPEAT_LIMIT} times: {key:?}"));
            }
        }
    }

    // (b) repeated 30-char substrings, counted over every char-aligned
    // window so repeats are caught regardless of period.
    let chars: Vec<char> = output.chars().collect();
    if chars.len() >= SUBSTRING_LEN {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for window in chars.windows(SUBSTRING_LEN) {
            let key: String = window.iter().collect();
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            if *count > SUBSTRING_REPEAT_LIMIT {
                return Some(format!(
                    "{SUBSTRING_LEN}-char substring repeated more than {SUBSTRING_REPEAT_LIMIT} times"
                ));
            }
        }
    }

    // (c) long output with an unterminated outer object.
    if chars.len() > UNTERMINATED_MIN_LEN {
        let trimmed = output.trim_end();
        if trimmed.starts_with('{') && !trimmed.ends_with('}') {
            return Some("output exceeds 3000 chars without closing brace".into());
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Vendors
// ---------------------------------------------------------------------------

/// What a vendor's API can accept.
#[derive(Debug, Clone, Copy, Default)]
pub struct VendorCapabilities {
    /// Accepts a JSON-schema structured-output directive.
    pub schema_directive: bool,
    /// Accepts temperature / penalty controls.
    pub sampling_controls: bool,
}

/// Static configuration of one vendor.
#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub name: String,
    pub model: String,
    pub max_concurrent: usize,
    pub max_output_tokens: u32,
    /// Higher wins when health scores tie.
    pub priority: u32,
    pub capabilities: VendorCapabilities,
}

/// One structured-output request, vendor-agnostic.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Schema directive: (name, JSON Schema). Passed to the vendor when
    /// supported; otherwise the caller falls back to schema-in-prompt.
    pub schema: Option<(String, serde_json::Value)>,
    pub sampling: SamplingParams,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub latency: Duration,
}

/// An opaque request/response channel to one model vendor.
pub trait LlmVendor: Send + Sync + Clone {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// Health monitoring
// ---------------------------------------------------------------------------

const HEALTH_WINDOW: usize = 50;
const LATENCY_IDEAL_MS: f64 = 2_000.0;
const LATENCY_WORST_MS: f64 = 30_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    RateLimit,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct CallSample {
    ok: bool,
    latency_ms: f64,
    rate_limited: bool,
}

#[derive(Debug, Default)]
struct VendorMetrics {
    window: std::collections::VecDeque<CallSample>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl VendorMetrics {
    fn push(&mut self, sample: CallSample) {
        if self.window.len() == HEALTH_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    /// Blended health score in [0, 100]: success rate 0.4, inverse
    /// latency 0.3, rate-limit fraction 0.2, recency of success 0.1.
    fn score(&self) -> u32 {
        if self.window.is_empty() {
            return 100;
        }
        let total = self.window.len() as f64;
        let successes = self.window.iter().filter(|s| s.ok).count() as f64;
        let success_score = successes / total * 100.0;

        let latencies: Vec<f64> = self
            .window
            .iter()
            .filter(|s| s.latency_ms > 0.0)
            .map(|s| s.latency_ms)
            .collect();
        let latency_score = if latencies.is_empty() {
            100.0
        } else {
            let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
            if avg <= LATENCY_IDEAL_MS {
                100.0
            } else if avg >= LATENCY_WORST_MS {
                0.0
            } else {
                100.0 * (1.0 - (avg - LATENCY_IDEAL_MS) / (LATENCY_WORST_MS - LATENCY_IDEAL_MS))
            }
        };

        let rate_limited = self.window.iter().filter(|s| s.rate_limited).count() as f64;
        // 20% rate-limit hits zero this component.
        let rate_limit_score = 100.0 * (1.0 - (rate_limited / total * 5.0).min(1.0));

        let recency_score = match self.last_failure {
            None => 100.0,
            Some(at) => {
                let since = at.elapsed().as_secs_f64();
                if since < 10.0 {
                    30.0
                } else if since < 60.0 {
                    60.0
                } else if since < 300.0 {
                    80.0
                } else {
                    100.0
                }
            }
        };

        let blended = success_score * 0.4
            + latency_score * 0.3
            + rate_limit_score * 0.2
            + recency_score * 0.1;
        blended.clamp(0.0, 100.0) as u32
    }
}

/// Per-vendor rolling health, shared by the caller and metrics endpoints.
#[derive(Clone, Default)]
pub struct HealthMonitor {
    metrics: Arc<Mutex<HashMap<String, VendorMetrics>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VendorMetrics>> {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record_success(&self, vendor: &str, latency: Duration) {
        let mut map = self.lock();
        let metrics = map.entry(vendor.to_string()).or_default();
        metrics.push(CallSample {
            ok: true,
            latency_ms: latency.as_secs_f64() * 1000.0,
            rate_limited: false,
        });
        metrics.last_success = Some(Instant::now());
    }

    pub fn record_failure(&self, vendor: &str, kind: FailureKind) {
        let mut map = self.lock();
        let metrics = map.entry(vendor.to_string()).or_default();
        metrics.push(CallSample {
            ok: false,
            latency_ms: 0.0,
            rate_limited: kind == FailureKind::RateLimit,
        });
        metrics.last_failure = Some(Instant::now());
    }

    pub fn score(&self, vendor: &str) -> u32 {
        self.lock().get(vendor).map_or(100, VendorMetrics::score)
    }
}

// ---------------------------------------------------------------------------
// Structured caller
// ---------------------------------------------------------------------------

/// Retry/fallback tuning.
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Attempts per vendor before falling through to the next.
    pub attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub gate_timeout: Duration,
    pub call_timeout: Duration,
    /// Vendors scoring below this are temporarily skipped.
    pub score_floor: u32,
    /// In-flight cap across all vendors in this process.
    pub global_concurrency_cap: usize,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            gate_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(120),
            score_floor: 20,
            global_concurrency_cap: 32,
        }
    }
}

struct VendorSlot<V> {
    config: VendorConfig,
    vendor: V,
    semaphore: Arc<Semaphore>,
}

/// Wraps all configured vendors behind one `call` entry point.
pub struct StructuredCaller<V: LlmVendor> {
    slots: Vec<Arc<VendorSlot<V>>>,
    gate: RateGate,
    health: HealthMonitor,
    config: CallerConfig,
    global: Arc<Semaphore>,
}

impl<V: LlmVendor> Clone for StructuredCaller<V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            gate: self.gate.clone(),
            health: self.health.clone(),
            config: self.config.clone(),
            global: self.global.clone(),
        }
    }
}

impl<V: LlmVendor> StructuredCaller<V> {
    pub fn new(vendors: Vec<(VendorConfig, V)>, gate: RateGate, config: CallerConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.global_concurrency_cap));
        let slots = vendors
            .into_iter()
            .map(|(vendor_config, vendor)| {
                Arc::new(VendorSlot {
                    semaphore: Arc::new(Semaphore::new(vendor_config.max_concurrent)),
                    config: vendor_config,
                    vendor,
                })
            })
            .collect();
        Self {
            slots,
            gate,
            health: HealthMonitor::new(),
            config,
            global,
        }
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn vendor_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.config.name.clone()).collect()
    }

    /// Vendors in call order: health-weighted priority, floor-filtered.
    fn ordered_slots(&self) -> Vec<Arc<VendorSlot<V>>> {
        let mut scored: Vec<(u64, Arc<VendorSlot<V>>)> = self
            .slots
            .iter()
            .filter(|slot| self.health.score(&slot.config.name) >= self.config.score_floor)
            .map(|slot| {
                let weight =
                    u64::from(self.health.score(&slot.config.name)) * u64::from(slot.config.priority);
                (weight, slot.clone())
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Run messages through the vendor chain and parse the result into `T`.
    ///
    /// `ctx` is a short label carried into logs (`profile c2/3`).
    pub async fn call<T: DeserializeOwned>(
        &self,
        messages: Vec<ChatMessage>,
        schema_name: &str,
        schema: serde_json::Value,
        ctx: &str,
    ) -> Result<T, AppError> {
        let ordered = self.ordered_slots();
        if ordered.is_empty() {
            return Err(AppError::Exhausted(
                "no vendor above the health floor".into(),
            ));
        }

        let input_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        let mut last_error: Option<AppError> = None;

        for slot in ordered {
            match self
                .call_vendor::<T>(&slot, &messages, schema_name, &schema, input_tokens, ctx)
                .await
            {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    tracing::warn!(
                        vendor = %slot.config.name,
                        ctx,
                        error = %e,
                        "vendor exhausted, falling through"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(AppError::Exhausted(format!(
            "all vendors failed: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn call_vendor<T: DeserializeOwned>(
        &self,
        slot: &VendorSlot<V>,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: &serde_json::Value,
        input_tokens: usize,
        ctx: &str,
    ) -> Result<T, AppError> {
        let vendor_name = &slot.config.name;
        let gate_key = GateKey::new(vendor_name.clone(), "requests");
        let mut sampling = SamplingParams::default();
        let mut last_error = AppError::Exhausted(format!("{vendor_name}: no attempts made"));

        for attempt in 0..self.config.attempts {
            let outcome = self
                .gate
                .acquire(&gate_key, 1.0, self.config.gate_timeout)
                .await;
            if outcome == AcquireOutcome::TimedOut {
                self.health.record_failure(vendor_name, FailureKind::RateLimit);
                last_error = AppError::RateLimited(format!("local gate for {vendor_name}"));
                self.backoff(attempt).await;
                continue;
            }

            let request = self.build_request(slot, messages, schema_name, schema, input_tokens, sampling);

            // Permits drop before any back-off sleep: a waiting call must
            // not occupy a vendor slot.
            let result = {
                let _global = self
                    .global
                    .acquire()
                    .await
                    .map_err(|_| AppError::Generic("global llm semaphore closed".into()))?;
                let _slot_permit = slot
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| AppError::Generic("vendor semaphore closed".into()))?;

                tokio::time::timeout(self.config.call_timeout, slot.vendor.complete(request))
                    .await
                    .unwrap_or_else(|_| Err(AppError::Timeout(self.config.call_timeout.as_secs())))
            };

            match result {
                Ok(response) => {
                    if let Some(reason) = detect_degeneration(&response.content) {
                        tracing::warn!(
                            vendor = %vendor_name,
                            ctx,
                            attempt,
                            %reason,
                            "degeneration detected, retrying with adjusted sampling"
                        );
                        self.health.record_failure(vendor_name, FailureKind::Error);
                        sampling = sampling.escalated();
                        last_error = AppError::Degeneration(reason);
                        // Immediate retry, no back-off.
                        continue;
                    }

                    match parse_structured::<T>(&response.content) {
                        Ok(parsed) => {
                            self.health.record_success(vendor_name, response.latency);
                            tracing::debug!(
                                vendor = %vendor_name,
                                ctx,
                                latency_ms = response.latency.as_millis() as u64,
                                "structured call ok"
                            );
                            return Ok(parsed);
                        }
                        Err(e) => {
                            tracing::warn!(
                                vendor = %vendor_name,
                                ctx,
                                attempt,
                                error = %e,
                                "schema violation, retrying with adjusted sampling"
                            );
                            self.health.record_failure(vendor_name, FailureKind::Error);
                            sampling = sampling.escalated();
                            last_error = e;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    let kind = match &e {
                        AppError::RateLimited(_) => FailureKind::RateLimit,
                        AppError::Timeout(_) => FailureKind::Timeout,
                        _ => FailureKind::Error,
                    };
                    self.health.record_failure(vendor_name, kind);
                    let retryable = e.is_retryable();
                    last_error = e;
                    if !retryable {
                        break;
                    }
                    self.backoff(attempt).await;
                }
            }
        }

        Err(last_error)
    }

    fn build_request(
        &self,
        slot: &VendorSlot<V>,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: &serde_json::Value,
        input_tokens: usize,
        sampling: SamplingParams,
    ) -> CompletionRequest {
        let capabilities = slot.config.capabilities;
        let mut messages = messages.to_vec();
        let schema_pair = if capabilities.schema_directive {
            Some((schema_name.to_string(), schema.clone()))
        } else {
            // Fallback for vendors without structured output: the schema
            // rides in the system message and post-parse validation does
            // the enforcement.
            if let Some(system) = messages.iter_mut().find(|m| m.role == "system") {
                system.content.push_str(&format!(
                    "\n\nRespond with a single JSON object conforming to this JSON Schema:\n{schema}"
                ));
            }
            None
        };

        CompletionRequest {
            messages,
            schema: schema_pair,
            sampling,
            max_output_tokens: output_budget(input_tokens, slot.config.max_output_tokens),
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.backoff_base.as_millis() as u64;
        let raw = base.saturating_mul(1 << attempt.min(10));
        let capped = raw.min(self.config.backoff_cap.as_millis() as u64);
        let jitter = xorshift_below(capped / 5 + 1);
        tokio::time::sleep(Duration::from_millis(capped + jitter)).await;
    }
}

/// Parse a model response into `T`, tolerating markdown fences and
/// leading/trailing prose around the outermost object.
pub fn parse_structured<T: DeserializeOwned>(content: &str) -> Result<T, AppError> {
    let trimmed = content.trim();
    if let Ok(parsed) = serde_json::from_str::<T>(trimmed) {
        return Ok(parsed);
    }

    let unfenced = strip_fences(trimmed);
    if let Ok(parsed) = serde_json::from_str::<T>(unfenced.trim()) {
        return Ok(parsed);
    }

    if let Some(object) = balanced_object(unfenced.trim())
        && let Ok(parsed) = serde_json::from_str::<T>(object)
    {
        return Ok(parsed);
    }

    Err(AppError::SchemaViolation(format!(
        "model output does not conform: {}",
        &trimmed.chars().take(200).collect::<String>()
    )))
}

fn strip_fences(content: &str) -> &str {
    let mut s = content;
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s
}

/// First balanced `{…}` object in the text, brace-counted outside strings.
fn balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in content[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
