//! In-site link ranking for follow-up fetches.
//!
//! Heuristic pass first: drop non-HTML targets and asset paths, penalize
//! known low-value sections, favor high-signal corporate pages. Only when
//! the candidate pool still exceeds the budget is the model consulted for
//! a re-rank; an unavailable model or an unparseable ranking falls back to
//! the heuristic order.

use serde::{Deserialize, Serialize};
use url::Url;

/// Default number of links handed to the subpage fetcher.
pub const DEFAULT_LINK_BUDGET: usize = 30;

const EXCLUDED_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".ppt", ".pptx", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp",
    ".ico", ".bmp", ".tiff", ".zip", ".rar", ".tar", ".gz", ".xls", ".xlsx", ".csv", ".txt",
    ".xml", ".json", ".js", ".css", ".mp4", ".mp3", ".avi", ".mov", ".wmv", ".flv", ".webm",
    ".woff", ".woff2", ".ttf", ".eot", ".otf",
];

const ASSET_DIRECTORIES: &[&str] = &[
    "/wp-content/uploads/",
    "/assets/",
    "/images/",
    "/img/",
    "/static/",
    "/media/",
];

const HIGH_PRIORITY_KEYWORDS: &[&str] = &[
    "quem-somos",
    "sobre",
    "institucional",
    "portfolio",
    "produto",
    "servico",
    "solucoes",
    "atuacao",
    "tecnologia",
    "catalogo",
    "produtos",
    "servicos",
    "clientes",
    "cases",
    "projetos",
    "obras",
    "certificacoes",
    "premios",
    "parceiros",
    "equipe",
    "time",
    "lideranca",
    "contato",
    "fale-conosco",
    "unidades",
];

const LOW_PRIORITY_KEYWORDS: &[&str] = &[
    "login",
    "signin",
    "cart",
    "carrinho",
    "policy",
    "blog",
    "news",
    "noticias",
    "politica-privacidade",
    "termos",
];

/// A candidate link with its heuristic score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedLink {
    pub url: String,
    pub score: i32,
}

/// Model-produced re-rank: indexes into the candidate list, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRanking {
    pub ordered_indexes: Vec<usize>,
}

/// Normalize, filter and score raw hrefs from the main page.
///
/// Keeps only same-origin HTML pages; resolves relative links against
/// `base_url`; dedups; sorts by score descending (stable, so document
/// order breaks ties).
pub fn rank_links(base_url: &str, hrefs: &[String]) -> Vec<RankedLink> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let base_host = base.host_str().map(normalize_host);

    let mut seen = std::collections::HashSet::new();
    let mut ranked = Vec::new();

    for href in hrefs {
        let trimmed = href.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with("mailto:")
            || trimmed.starts_with("tel:")
            || trimmed.starts_with("javascript:")
        {
            continue;
        }
        let Ok(mut resolved) = base.join(trimmed) else {
            continue;
        };
        resolved.set_fragment(None);

        if resolved.host_str().map(normalize_host) != base_host {
            continue;
        }
        let path_lower = resolved.path().to_lowercase();
        if EXCLUDED_EXTENSIONS.iter().any(|ext| path_lower.ends_with(ext)) {
            continue;
        }
        if ASSET_DIRECTORIES.iter().any(|dir| path_lower.contains(dir)) {
            continue;
        }

        let url = resolved.to_string();
        if url.trim_end_matches('/') == base_url.trim_end_matches('/') {
            continue;
        }
        if !seen.insert(url.clone()) {
            continue;
        }

        ranked.push(RankedLink {
            score: score_path(&path_lower),
            url,
        });
    }

    ranked.sort_by_key(|l| -l.score);
    ranked
}

fn normalize_host(host: &str) -> String {
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

fn score_path(path_lower: &str) -> i32 {
    let mut score = 0i32;
    for keyword in HIGH_PRIORITY_KEYWORDS {
        if path_lower.contains(keyword) {
            score += 10;
        }
    }
    for keyword in LOW_PRIORITY_KEYWORDS {
        if path_lower.contains(keyword) {
            score -= 20;
        }
    }
    // Shallow paths first: a two-segment path usually carries the section
    // pages we want, deep paths tend to be articles.
    let depth = path_lower.matches('/').count() as i32;
    score -= depth;
    score
}

/// Apply a model re-rank to the heuristic candidates, falling back to the
/// heuristic order when the ranking is missing or unusable.
pub fn apply_ranking(
    candidates: &[RankedLink],
    ranking: Option<LinkRanking>,
    budget: usize,
) -> Vec<String> {
    let heuristic = || {
        candidates
            .iter()
            .take(budget)
            .map(|l| l.url.clone())
            .collect::<Vec<_>>()
    };

    let Some(ranking) = ranking else {
        return heuristic();
    };

    let mut ordered = Vec::new();
    let mut used = std::collections::HashSet::new();
    for idx in ranking.ordered_indexes {
        if idx < candidates.len() && used.insert(idx) {
            ordered.push(candidates[idx].url.clone());
        }
    }
    if ordered.is_empty() {
        return heuristic();
    }
    // The model may return a partial order; fill from the heuristic tail.
    for (idx, link) in candidates.iter().enumerate() {
        if ordered.len() >= budget {
            break;
        }
        if !used.contains(&idx) {
            ordered.push(link.url.clone());
        }
    }
    ordered.truncate(budget);
    ordered
}

/// Optional model re-rank of the heuristic candidates.
///
/// `None` means the ranker abstained (model unavailable, unparseable
/// answer); callers fall back to the heuristic order.
pub trait LinkRanker: Send + Sync + Clone {
    fn rank(
        &self,
        candidates: &[RankedLink],
    ) -> impl std::future::Future<Output = Option<LinkRanking>> + Send;
}

/// Ranker that always abstains; the heuristic order stands.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicOnlyRanker;

impl LinkRanker for HeuristicOnlyRanker {
    async fn rank(&self, _candidates: &[RankedLink]) -> Option<LinkRanking> {
        None
    }
}

/// Model-backed ranker used when candidates exceed the budget.
pub struct LlmLinkRanker<V: crate::llm::LlmVendor> {
    caller: crate::llm::StructuredCaller<V>,
}

impl<V: crate::llm::LlmVendor> Clone for LlmLinkRanker<V> {
    fn clone(&self) -> Self {
        Self {
            caller: self.caller.clone(),
        }
    }
}

impl<V: crate::llm::LlmVendor> LlmLinkRanker<V> {
    pub fn new(caller: crate::llm::StructuredCaller<V>) -> Self {
        Self { caller }
    }
}

const RANKING_SYSTEM_PROMPT: &str = "\
Você prioriza links internos de sites corporativos B2B para coleta de dados.

Receberá uma lista numerada de URLs. Ordene os índices do mais ao menos informativo para montar o perfil da empresa (institucional, produtos, serviços, clientes, contato primeiro; blog, notícias e páginas legais por último).

Responda APENAS com JSON: { \"ordered_indexes\": [números] } usando os índices mostrados (base 0).";

fn ranking_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "ordered_indexes": {
                "type": "array",
                "items": {"type": "integer", "minimum": 0}
            }
        },
        "required": ["ordered_indexes"]
    })
}

impl<V: crate::llm::LlmVendor> LinkRanker for LlmLinkRanker<V> {
    async fn rank(&self, candidates: &[RankedLink]) -> Option<LinkRanking> {
        let mut listing = String::new();
        for (i, link) in candidates.iter().enumerate() {
            listing.push_str(&format!("{i}. {}\n", link.url));
        }
        let messages = vec![
            crate::llm::ChatMessage::system(RANKING_SYSTEM_PROMPT),
            crate::llm::ChatMessage::user(listing),
        ];

        match self
            .caller
            .call::<LinkRanking>(messages, "link_ranking", ranking_schema(), "link-rank")
            .await
        {
            Ok(ranking) => Some(ranking),
            Err(e) => {
                tracing::warn!(error = %e, "link ranking model unavailable, using heuristics");
                None
            }
        }
    }
}
