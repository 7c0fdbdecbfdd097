use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Ordered fetch strategies, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Direct request, short timeout.
    Fast,
    /// Via proxy, medium timeout.
    Standard,
    /// Proxy + user-agent rotation + retries.
    Robust,
    /// Proxy rotation + UA rotation, longest timeout.
    Aggressive,
}

impl FetchStrategy {
    pub const ALL: [FetchStrategy; 4] = [
        FetchStrategy::Fast,
        FetchStrategy::Standard,
        FetchStrategy::Robust,
        FetchStrategy::Aggressive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::Fast => "fast",
            FetchStrategy::Standard => "standard",
            FetchStrategy::Robust => "robust",
            FetchStrategy::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(FetchStrategy::Fast),
            "standard" => Some(FetchStrategy::Standard),
            "robust" => Some(FetchStrategy::Robust),
            "aggressive" => Some(FetchStrategy::Aggressive),
            _ => None,
        }
    }

    /// Execution parameters for this strategy.
    pub fn params(&self) -> StrategyParams {
        match self {
            FetchStrategy::Fast => StrategyParams {
                timeout: Duration::from_secs(10),
                use_proxy: false,
                rotate_user_agent: false,
                rotate_proxy: false,
                retries: 1,
                delay_between_requests: Duration::from_millis(100),
            },
            FetchStrategy::Standard => StrategyParams {
                timeout: Duration::from_secs(15),
                use_proxy: true,
                rotate_user_agent: false,
                rotate_proxy: false,
                retries: 2,
                delay_between_requests: Duration::from_millis(500),
            },
            FetchStrategy::Robust => StrategyParams {
                timeout: Duration::from_secs(20),
                use_proxy: true,
                rotate_user_agent: true,
                rotate_proxy: false,
                retries: 3,
                delay_between_requests: Duration::from_secs(1),
            },
            FetchStrategy::Aggressive => StrategyParams {
                timeout: Duration::from_secs(25),
                use_proxy: true,
                rotate_user_agent: true,
                rotate_proxy: true,
                retries: 3,
                delay_between_requests: Duration::from_secs(2),
            },
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named bundle of fetch parameters.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub timeout: Duration,
    pub use_proxy: bool,
    pub rotate_user_agent: bool,
    pub rotate_proxy: bool,
    pub retries: u32,
    pub delay_between_requests: Duration,
}

/// Category of a recognized non-content response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    BrowserChallenge,
    Waf,
    Captcha,
    RateLimit,
    BotDetection,
}

impl ProtectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionKind::BrowserChallenge => "browser-challenge",
            ProtectionKind::Waf => "waf",
            ProtectionKind::Captcha => "captcha",
            ProtectionKind::RateLimit => "rate-limit",
            ProtectionKind::BotDetection => "bot-detection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "browser-challenge" => Some(ProtectionKind::BrowserChallenge),
            "waf" => Some(ProtectionKind::Waf),
            "captcha" => Some(ProtectionKind::Captcha),
            "rate-limit" => Some(ProtectionKind::RateLimit),
            "bot-detection" => Some(ProtectionKind::BotDetection),
            _ => None,
        }
    }
}

impl fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Case-insensitive substrings identifying challenge pages. Matched against
// the lowercased body.
const BROWSER_CHALLENGE_SIGNATURES: &[&str] = &[
    "just a moment...",
    "cf-browser-verification",
    "challenge-running",
    "cf_chl_opt",
    "checking your browser",
    "ddos protection by",
];

const WAF_SIGNATURES: &[&str] = &[
    "request blocked",
    "access denied",
    "web application firewall",
    "mod_security",
    "incapsula incident",
    "request unsuccessful. incapsula",
];

const CAPTCHA_SIGNATURES: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "hcaptcha.com",
    "prove you are human",
    "verifique que você não é um robô",
];

const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "too many requests",
    "rate limit exceeded",
    "retry-after",
    "limite de requisições",
];

const BOT_DETECTION_SIGNATURES: &[&str] = &[
    "bot detected",
    "automated access",
    "unusual traffic",
    "perimeterx",
    "px-captcha",
];

// Soft-404 pages: real 200s whose body is an error page. Treated as
// insufficient content, which does count toward the breaker.
const ERROR_PAGE_SIGNATURES: &[&str] = &[
    "404 not found",
    "page not found",
    "página não encontrada",
    "erro 404",
    "não encontramos a página",
    "página inexistente",
    "error 404",
    "file not found",
];

/// Minimum body length (chars) for a fetch to count as content.
pub const MIN_CONTENT_LENGTH: usize = 200;

/// Scan a body for protection signatures.
pub fn detect_protection(body: &str) -> Option<ProtectionKind> {
    // Signatures live in page head/markup; scanning the whole body of a
    // large page wastes time for no extra signal.
    let haystack: String = body.chars().take(20_000).collect::<String>().to_lowercase();

    let groups: [(&[&str], ProtectionKind); 5] = [
        (BROWSER_CHALLENGE_SIGNATURES, ProtectionKind::BrowserChallenge),
        (CAPTCHA_SIGNATURES, ProtectionKind::Captcha),
        (WAF_SIGNATURES, ProtectionKind::Waf),
        (RATE_LIMIT_SIGNATURES, ProtectionKind::RateLimit),
        (BOT_DETECTION_SIGNATURES, ProtectionKind::BotDetection),
    ];
    for (signatures, kind) in groups {
        if signatures.iter().any(|sig| haystack.contains(sig)) {
            return Some(kind);
        }
    }
    None
}

/// True when a 200 body is actually an error page.
pub fn looks_like_error_page(body: &str) -> bool {
    let haystack: String = body.chars().take(5_000).collect::<String>().to_lowercase();
    ERROR_PAGE_SIGNATURES.iter().any(|sig| haystack.contains(sig))
}

/// A successfully fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub status: u16,
    pub strategy_used: FetchStrategy,
    pub elapsed: Duration,
}

/// Executes an HTTP fetch under a chosen strategy.
///
/// Implementations must scan the body after fetching and return
/// `AppError::ProtectionDetected` for recognized challenge pages, and
/// `AppError::Generic("insufficient content …")` for bodies below
/// [`MIN_CONTENT_LENGTH`] or matching a soft-404 signature.
pub trait PageFetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        strategy: FetchStrategy,
    ) -> impl Future<Output = Result<FetchedPage, AppError>> + Send;
}

/// Classify a fetched body, shared by fetcher implementations.
pub fn classify_body(url: &str, body: &str) -> Result<(), AppError> {
    if let Some(kind) = detect_protection(body) {
        return Err(AppError::ProtectionDetected(kind));
    }
    if body.chars().count() < MIN_CONTENT_LENGTH || looks_like_error_page(body) {
        return Err(AppError::Generic(format!("insufficient content for {url}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_are_ordered_by_cost() {
        let timeouts: Vec<_> = FetchStrategy::ALL
            .iter()
            .map(|s| s.params().timeout)
            .collect();
        for pair in timeouts.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(!FetchStrategy::Fast.params().use_proxy);
        assert!(FetchStrategy::Aggressive.params().rotate_proxy);
    }

    #[test]
    fn strategy_roundtrip() {
        for s in FetchStrategy::ALL {
            assert_eq!(FetchStrategy::parse(s.as_str()), Some(s));
        }
        assert_eq!(FetchStrategy::parse("turbo"), None);
    }

    #[test]
    fn detects_browser_challenge() {
        let body = "<html><title>Just a moment...</title><body>Checking your browser</body></html>";
        assert_eq!(
            detect_protection(body),
            Some(ProtectionKind::BrowserChallenge)
        );
    }

    #[test]
    fn detects_captcha_case_insensitive() {
        let body = "<div class=\"G-RECAPTCHA\" data-sitekey=\"x\"></div>";
        assert_eq!(detect_protection(body), Some(ProtectionKind::Captcha));
    }

    #[test]
    fn detects_rate_limit_page() {
        let body = "<h1>Too Many Requests</h1> slow down";
        assert_eq!(detect_protection(body), Some(ProtectionKind::RateLimit));
    }

    #[test]
    fn clean_body_has_no_protection() {
        let body = "<html><body><h1>Cabos e Conectores Ltda</h1><p>Catálogo completo</p></body></html>";
        assert_eq!(detect_protection(body), None);
    }

    #[test]
    fn soft_404_detected() {
        assert!(looks_like_error_page("<h1>Página não encontrada</h1>"));
        assert!(looks_like_error_page("<title>404 Not Found</title>"));
        assert!(!looks_like_error_page("<h1>Produtos</h1>"));
    }

    #[test]
    fn classify_body_rejects_short_and_protected() {
        let err = classify_body("https://x.com.br", "tiny").unwrap_err();
        assert!(matches!(err, AppError::Generic(_)));
        assert!(err.should_trip_circuit());

        let challenge = format!("Just a moment...{}", "x".repeat(500));
        let err = classify_body("https://x.com.br", &challenge).unwrap_err();
        assert!(matches!(err, AppError::ProtectionDetected(_)));
        assert!(!err.should_trip_circuit());

        let good = format!("<html>{}</html>", "conteúdo institucional ".repeat(30));
        assert!(classify_body("https://x.com.br", &good).is_ok());
    }
}
