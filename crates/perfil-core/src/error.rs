use thiserror::Error;

use crate::fetch::ProtectionKind;

/// Application-wide error taxonomy.
///
/// Variants map one-to-one onto the retry/propagation policy: stage
/// handlers translate these into queue transitions, the facade translates
/// them into HTTP statuses.
#[derive(Error, Debug)]
pub enum AppError {
    /// Connection refused, DNS failure, reset — retriable with back-off.
    #[error("transport: {0}")]
    Transport(String),

    /// An outbound call exceeded its deadline. Retriable.
    #[error("timeout after {0}s")]
    Timeout(u64),

    /// Vendor 429 or the local rate gate timed out. Retriable after waiting.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A fetch produced a challenge/WAF/CAPTCHA page instead of content.
    /// Not a transport success, but also not a breaker failure.
    #[error("protection detected: {0}")]
    ProtectionDetected(ProtectionKind),

    /// Upstream returned a non-success status that is genuine (not a
    /// recognized protection page).
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// LLM vendor call failed.
    #[error("llm error ({vendor}, HTTP {status_code}): {message}")]
    Llm {
        vendor: String,
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Model output parsed as JSON but does not conform to the expected
    /// record. Triggers one retry with adjusted sampling.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The degeneration detector tripped (repeated n-grams, repeated
    /// substrings, or an unterminated object). Triggers immediate retry.
    #[error("degeneration: {0}")]
    Degeneration(String),

    /// The previous stage's row is missing. 404 at the facade; not retried.
    #[error("unavailable input: {0}")]
    UnavailableInput(String),

    /// All retries across all vendors were consumed.
    #[error("exhausted: {0}")]
    Exhausted(String),

    /// HTML-to-text conversion failed.
    #[error("cleaner error: {0}")]
    Cleaner(String),

    /// Chunk construction violated the token budget.
    #[error("chunking error: {0}")]
    Chunking(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Missing secrets, bad environment, unreachable database at startup.
    /// Aborts the process.
    #[error("config error: {0}")]
    Config(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// True if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Transport(_) | AppError::Timeout(_) | AppError::RateLimited(_) => true,
            AppError::Llm { retryable, .. } => *retryable,
            AppError::Degeneration(_) | AppError::SchemaViolation(_) => true,
            AppError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// True if this error should advance a circuit breaker toward open.
    ///
    /// Protection pages are excluded: a protected origin is not a failing
    /// origin, and counting it would poison the origin's score.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::Transport(_) | AppError::Timeout(_) => true,
            AppError::Http { status, .. } => *status >= 400,
            AppError::Generic(msg) => msg.contains("insufficient content"),
            AppError::ProtectionDetected(_) => false,
            _ => false,
        }
    }

    /// Short machine-readable kind, used in queue `last_error` and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Transport(_) => "transport",
            AppError::Timeout(_) => "timeout",
            AppError::RateLimited(_) => "rate_limited",
            AppError::ProtectionDetected(_) => "protection_detected",
            AppError::Http { .. } => "http",
            AppError::Llm { .. } => "llm",
            AppError::SchemaViolation(_) => "schema_violation",
            AppError::Degeneration(_) => "degeneration",
            AppError::UnavailableInput(_) => "unavailable_input",
            AppError::Exhausted(_) => "exhausted",
            AppError::Cleaner(_) => "cleaner",
            AppError::Chunking(_) => "chunking",
            AppError::Serialization(_) => "serialization",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::Generic(_) => "generic",
        }
    }

    /// Queue-facing message: `kind: detail`, truncated to a sane length.
    pub fn queue_message(&self) -> String {
        let msg = format!("{}: {}", self.kind(), self);
        if msg.len() > 500 {
            let mut cut = 500;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg[..cut].to_string()
        } else {
            msg
        }
    }
}
