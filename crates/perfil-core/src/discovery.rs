//! Site discovery: pick the official company site from search hits.
//!
//! The agent never fetches candidate sites; it decides from titles, URLs
//! and snippets alone. Aggregator/social/marketplace domains are filtered
//! out before the model sees the hits.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::llm::{ChatMessage, LlmVendor, StructuredCaller};
use crate::models::{DiscoveryStatus, SearchHit, SearchResult};

// Domains that can never be a company's official site.
const BLACKLIST_DOMAINS: &[&str] = &[
    // Company-data aggregators
    "econodata.com.br",
    "cnpj.biz",
    "cnpja.com",
    "cnpj.info",
    "casadosdados.com.br",
    "empresascnpj.com",
    "consultacnpj.com",
    "listamais.com.br",
    "solutudo.com.br",
    "telelistas.net",
    "apontador.com.br",
    "guiamais.com.br",
    "empresas.serasaexperian.com.br",
    "jusbrasil.com.br",
    // Social networks
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "youtube.com",
    "twitter.com",
    "x.com",
    "tiktok.com",
    "pinterest.com",
    "threads.net",
    // Marketplaces
    "mercadolivre.com.br",
    "shopee.com.br",
    "olx.com.br",
    "amazon.com.br",
    "magazineluiza.com.br",
    "americanas.com.br",
    // Misc
    "translate.google.com",
    "webcache.googleusercontent.com",
];

/// True when `url`'s domain (or a parent) is blacklisted.
pub fn is_blacklisted(url: &str) -> bool {
    let candidate = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    let Ok(parsed) = Url::parse(&candidate) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let mut domain = host.to_lowercase();
    for prefix in ["www.", "m.", "mobile."] {
        if let Some(rest) = domain.strip_prefix(prefix) {
            domain = rest.to_string();
            break;
        }
    }
    BLACKLIST_DOMAINS
        .iter()
        .any(|b| domain == *b || domain.ends_with(&format!(".{b}")))
}

/// Drop blacklisted and duplicate hits, preserving order.
pub fn filter_hits(hits: &[SearchHit]) -> Vec<SearchHit> {
    let mut seen = std::collections::HashSet::new();
    hits.iter()
        .filter(|hit| !hit.url.is_empty() && !is_blacklisted(&hit.url))
        .filter(|hit| seen.insert(hit.url.clone()))
        .cloned()
        .collect()
}

/// The model's decision, parsed against a small schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDecision {
    pub chosen_url: Option<String>,
    pub status: DiscoveryStatus,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

pub fn decision_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "chosen_url": {"type": ["string", "null"]},
            "status": {"type": "string", "enum": ["found", "not_found", "error"]},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "reasoning": {"type": ["string", "null"]}
        },
        "required": ["chosen_url", "status", "confidence"]
    })
}

const DISCOVERY_SYSTEM_PROMPT: &str = "\
Você identifica o site oficial de empresas brasileiras B2B a partir de resultados de busca.

Analise título, URL e trecho de cada resultado e escolha o site OFICIAL da empresa indicada. Diretórios de CNPJ, redes sociais, marketplaces e portais de notícias NUNCA são o site oficial.

Responda APENAS com um objeto JSON:
{ \"chosen_url\": string | null, \"status\": \"found\" | \"not_found\", \"confidence\": número entre 0 e 1, \"reasoning\": string curta }

Se nenhum resultado for o site oficial, use chosen_url: null e status: \"not_found\".";

/// Picks the official URL from a search row via the model.
pub struct DiscoveryAgent<V: LlmVendor> {
    caller: StructuredCaller<V>,
}

impl<V: LlmVendor> DiscoveryAgent<V> {
    pub fn new(caller: StructuredCaller<V>) -> Self {
        Self { caller }
    }

    /// Decide from a stored search row. An empty post-filter hit list
    /// short-circuits to `not_found` without a model call.
    pub async fn discover(&self, search: &SearchResult) -> Result<DiscoveryDecision, AppError> {
        let hits = filter_hits(&search.hits);
        if hits.is_empty() {
            return Ok(DiscoveryDecision {
                chosen_url: None,
                status: DiscoveryStatus::NotFound,
                confidence: 0.0,
                reasoning: Some("nenhum resultado de busca utilizável".into()),
            });
        }

        let mut listing = String::new();
        for (i, hit) in hits.iter().enumerate() {
            listing.push_str(&format!(
                "{}. {}\n   URL: {}\n   Trecho: {}\n",
                i + 1,
                hit.title,
                hit.url,
                hit.snippet
            ));
        }

        let messages = vec![
            ChatMessage::system(DISCOVERY_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Busca executada: \"{}\"\n\nResultados:\n{listing}\nQual é o site oficial?",
                search.query
            )),
        ];

        let mut decision: DiscoveryDecision = self
            .caller
            .call(
                messages,
                "site_discovery",
                decision_schema(),
                &format!("discovery {}", search.key),
            )
            .await?;

        decision.confidence = decision.confidence.clamp(0.0, 1.0);

        // The model must pick from the hits it was shown; anything else
        // (hallucinated or blacklisted) downgrades to not_found.
        if let Some(chosen) = &decision.chosen_url {
            let legitimate = hits.iter().any(|h| urls_match(&h.url, chosen));
            if !legitimate || is_blacklisted(chosen) {
                tracing::warn!(
                    key = %search.key,
                    chosen = %chosen,
                    "model chose a URL outside the candidate list"
                );
                decision.chosen_url = None;
                decision.status = DiscoveryStatus::NotFound;
                decision.confidence = 0.0;
            }
        } else if decision.status == DiscoveryStatus::Found {
            decision.status = DiscoveryStatus::NotFound;
        }

        Ok(decision)
    }
}

fn urls_match(a: &str, b: &str) -> bool {
    normalize_url(a) == normalize_url(b)
}

fn normalize_url(url: &str) -> String {
    let lower = url.trim().trim_end_matches('/').to_lowercase();
    lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .map(|rest| rest.strip_prefix("www.").unwrap_or(rest).to_string())
        .unwrap_or(lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CompanyKey;
    use crate::llm::{CallerConfig, VendorCapabilities, VendorConfig};
    use crate::rate_gate::RateGate;
    use crate::testutil::MockVendor;
    use chrono::Utc;

    fn hit(title: &str, url: &str) -> SearchHit {
        SearchHit {
            title: title.into(),
            url: url.into(),
            snippet: format!("trecho sobre {title}"),
        }
    }

    fn search_row(hits: Vec<SearchHit>) -> SearchResult {
        SearchResult {
            id: 1,
            key: CompanyKey::new("12345678").unwrap(),
            query: "example ltda são paulo site oficial".into(),
            hits,
            created_at: Utc::now(),
        }
    }

    fn agent(vendor: MockVendor) -> DiscoveryAgent<MockVendor> {
        let config = VendorConfig {
            name: "primary".into(),
            model: "test-model".into(),
            max_concurrent: 2,
            max_output_tokens: 2_048,
            priority: 50,
            capabilities: VendorCapabilities {
                schema_directive: true,
                sampling_controls: true,
            },
        };
        DiscoveryAgent::new(StructuredCaller::new(
            vec![(config, vendor)],
            RateGate::new(),
            CallerConfig {
                backoff_base: std::time::Duration::from_millis(1),
                backoff_cap: std::time::Duration::from_millis(2),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn blacklist_matches_subdomains_and_bare_domains() {
        assert!(is_blacklisted("https://www.facebook.com/empresa"));
        assert!(is_blacklisted("https://m.facebook.com/empresa"));
        assert!(is_blacklisted("https://empresa.jusbrasil.com.br/x"));
        assert!(is_blacklisted("econodata.com.br/empresa/12345678"));
        assert!(!is_blacklisted("https://www.example.com.br"));
        assert!(!is_blacklisted("https://notfacebook.com.br"));
    }

    #[test]
    fn filter_removes_blacklisted_and_duplicates() {
        let hits = vec![
            hit("Example Ltda", "https://www.example.com.br"),
            hit("Example no Facebook", "https://facebook.com/example"),
            hit("Example Ltda", "https://www.example.com.br"),
            hit("Example CNPJ", "https://cnpj.biz/12345678000199"),
        ];
        let filtered = filter_hits(&hits);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].url, "https://www.example.com.br");
    }

    #[tokio::test]
    async fn empty_hits_short_circuit_to_not_found() {
        let vendor = MockVendor::with_responses(vec![]);
        let agent = agent(vendor.clone());
        let search = search_row(vec![hit("Facebook", "https://facebook.com/x")]);

        let decision = agent.discover(&search).await.unwrap();
        assert_eq!(decision.status, DiscoveryStatus::NotFound);
        assert!(decision.chosen_url.is_none());
        // No model call was made.
        assert!(vendor.requests().is_empty());
    }

    #[tokio::test]
    async fn picks_url_from_candidates() {
        let response = serde_json::json!({
            "chosen_url": "https://www.example.com.br",
            "status": "found",
            "confidence": 0.92,
            "reasoning": "domínio próprio com nome da empresa"
        })
        .to_string();
        let agent = agent(MockVendor::with_responses(vec![Ok(response)]));
        let search = search_row(vec![
            hit("Example Ltda — Site Oficial", "https://www.example.com.br"),
            hit("Example em notícias", "https://portal.com.br/example"),
        ]);

        let decision = agent.discover(&search).await.unwrap();
        assert_eq!(decision.status, DiscoveryStatus::Found);
        assert_eq!(
            decision.chosen_url.as_deref(),
            Some("https://www.example.com.br")
        );
        assert!((decision.confidence - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hallucinated_url_downgrades_to_not_found() {
        let response = serde_json::json!({
            "chosen_url": "https://invented-site.com.br",
            "status": "found",
            "confidence": 0.8
        })
        .to_string();
        let agent = agent(MockVendor::with_responses(vec![Ok(response)]));
        let search = search_row(vec![hit("Example", "https://www.example.com.br")]);

        let decision = agent.discover(&search).await.unwrap();
        assert_eq!(decision.status, DiscoveryStatus::NotFound);
        assert!(decision.chosen_url.is_none());
        assert_eq!(decision.confidence, 0.0);
    }

    #[tokio::test]
    async fn confidence_is_clamped() {
        let response = serde_json::json!({
            "chosen_url": "https://www.example.com.br",
            "status": "found",
            "confidence": 3.5
        })
        .to_string();
        let agent = agent(MockVendor::with_responses(vec![Ok(response)]));
        let search = search_row(vec![hit("Example", "https://example.com.br")]);

        let decision = agent.discover(&search).await.unwrap();
        // www/https variants of a listed hit still count as a match.
        assert_eq!(decision.status, DiscoveryStatus::Found);
        assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
    }
}
