use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::fetch::{FetchStrategy, ProtectionKind, detect_protection};
use crate::models::SiteKnowledge;

/// Rendering style of the target site, inferred from body features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteType {
    Static,
    Spa,
    Hybrid,
    Unknown,
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SiteType::Static => "static",
            SiteType::Spa => "spa",
            SiteType::Hybrid => "hybrid",
            SiteType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of probing one URL variant.
#[derive(Debug, Clone)]
pub struct ProbeHit {
    pub url: String,
    pub status: u16,
    pub latency: Duration,
}

/// What the prober learned about the chosen URL.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    /// Fastest reachable variant.
    pub url: String,
    pub latency: Duration,
    pub site_type: SiteType,
    pub protection: Option<ProtectionKind>,
    /// Strategies to try, best first.
    pub strategies: Vec<FetchStrategy>,
}

/// Probes URL variants and classifies the winner.
pub trait SiteProber: Send + Sync + Clone {
    /// Probe the four variants of `base_url` and return the fastest
    /// successful one with its classification.
    fn probe(
        &self,
        base_url: &str,
        knowledge: Option<&SiteKnowledge>,
    ) -> impl Future<Output = Result<SiteProfile, AppError>> + Send;
}

/// The four probe variants: {http, https} × {apex, www}, https/www first.
pub fn url_variants(base_url: &str) -> Vec<String> {
    let normalized = if base_url.starts_with("http://") || base_url.starts_with("https://") {
        base_url.to_string()
    } else {
        format!("https://{base_url}")
    };

    let Ok(parsed) = Url::parse(&normalized) else {
        return vec![normalized];
    };
    let Some(host) = parsed.host_str() else {
        return vec![normalized];
    };

    let apex = host.strip_prefix("www.").unwrap_or(host);
    let path = match parsed.path() {
        "/" | "" => "",
        p => p,
    };

    let mut variants = Vec::with_capacity(4);
    for scheme in ["https", "http"] {
        for prefix in ["www.", ""] {
            let url = format!("{scheme}://{prefix}{apex}{path}");
            if !variants.contains(&url) {
                variants.push(url);
            }
        }
    }
    variants
}

/// Origin key (scheme + host) used by breakers and site knowledge.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(format!("{}://{}", parsed.scheme(), host))
}

/// Classify a site's rendering style from its main-page body.
///
/// A page that is mostly script bootstrap with a bare mount div reads as a
/// SPA; script-heavy pages with real text are hybrid.
pub fn classify_site_type(body: &str) -> SiteType {
    if body.trim().is_empty() {
        return SiteType::Unknown;
    }
    let lower = body.to_lowercase();
    let script_count = lower.matches("<script").count();
    let has_mount = ["id=\"root\"", "id=\"app\"", "id=\"__next\"", "ng-app"]
        .iter()
        .any(|m| lower.contains(m));

    let text_len = visible_text_len(&lower);

    if has_mount && text_len < 500 {
        SiteType::Spa
    } else if script_count > 10 && text_len >= 500 {
        SiteType::Hybrid
    } else if script_count <= 10 && text_len >= 200 {
        SiteType::Static
    } else {
        SiteType::Unknown
    }
}

/// Rough visible-text length: body minus script blocks and tag content.
fn visible_text_len(lower_body: &str) -> usize {
    // Drop script blocks wholesale, then count non-tag characters.
    let mut stripped = String::with_capacity(lower_body.len());
    let mut rest = lower_body;
    loop {
        match rest.find("<script") {
            Some(start) => {
                stripped.push_str(&rest[..start]);
                match rest[start..].find("</script") {
                    Some(end) => rest = &rest[start + end + "</script".len()..],
                    None => break,
                }
            }
            None => {
                stripped.push_str(rest);
                break;
            }
        }
    }

    let mut len = 0usize;
    let mut in_tag = false;
    for c in stripped.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag && !c.is_whitespace() => len += 1,
            _ => {}
        }
    }
    len
}

/// Classify the protection guarding a body, if any.
pub fn classify_protection(body: &str) -> Option<ProtectionKind> {
    detect_protection(body)
}

/// Ordered strategy cascade for a probed site.
///
/// Protection dictates the order when present; otherwise the site type
/// does. Remaining strategies are appended so the cascade always covers
/// all four. Known-good strategies from SiteKnowledge are promoted to the
/// head.
pub fn select_strategies(
    site_type: SiteType,
    protection: Option<ProtectionKind>,
    latency: Duration,
    knowledge: Option<&SiteKnowledge>,
) -> Vec<FetchStrategy> {
    use FetchStrategy::{Aggressive, Fast, Robust, Standard};

    let mut order: Vec<FetchStrategy> = match protection {
        Some(ProtectionKind::BrowserChallenge) => vec![Aggressive, Robust, Standard],
        Some(ProtectionKind::Waf) => vec![Robust, Aggressive, Standard],
        Some(ProtectionKind::Captcha) => vec![Aggressive, Robust],
        Some(ProtectionKind::RateLimit) => vec![Standard, Robust],
        Some(ProtectionKind::BotDetection) => vec![Aggressive, Robust, Standard],
        None => match site_type {
            SiteType::Static => vec![Fast, Standard, Robust],
            SiteType::Spa => vec![Robust, Aggressive, Standard],
            SiteType::Hybrid => vec![Standard, Robust, Aggressive],
            SiteType::Unknown => vec![Standard, Fast, Robust, Aggressive],
        },
    };

    for strategy in FetchStrategy::ALL {
        if !order.contains(&strategy) {
            order.push(strategy);
        }
    }

    // Latency adjustments: very slow sites go straight to the patient
    // strategy, fast static sites to the cheap one.
    if latency > Duration::from_secs(5) {
        promote(&mut order, Robust);
    } else if latency < Duration::from_millis(500) && site_type == SiteType::Static {
        promote(&mut order, Fast);
    }

    // A previously successful strategy beats every heuristic.
    if let Some(k) = knowledge
        && k.total_successes > 0
    {
        promote(&mut order, k.best_strategy);
    }

    order
}

fn promote(order: &mut Vec<FetchStrategy>, strategy: FetchStrategy) {
    if let Some(pos) = order.iter().position(|s| *s == strategy) {
        order.remove(pos);
    }
    order.insert(0, strategy);
}

/// Fallback cascade for a subpage, given what worked on the main page.
pub fn subpage_strategies(main_strategy: FetchStrategy) -> Vec<FetchStrategy> {
    use FetchStrategy::{Aggressive, Fast, Robust, Standard};
    let mut order = vec![main_strategy];
    let tail: &[FetchStrategy] = match main_strategy {
        Fast => &[Standard, Robust],
        Standard => &[Fast, Robust],
        Robust => &[Standard, Aggressive],
        Aggressive => &[Robust, Standard],
    };
    order.extend_from_slice(tail);
    order
}
