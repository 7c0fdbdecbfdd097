//! Search-stage helpers: query construction and the vendor seam.

use std::future::Future;

use crate::error::AppError;
use crate::models::SearchHit;

// Legal suffixes stripped from corporate names before querying.
const LEGAL_SUFFIXES: &[&str] = &[" LTDA", " S.A.", " S/A", " EIRELI", " ME", " EPP"];

/// Build the search query for a company.
///
/// Trade name wins over the corporate name (it is what the company calls
/// itself on the web); the corporate name is stripped of legal suffixes.
/// City narrows the search when present; "site oficial" steers the engine
/// toward the company's own domain.
pub fn build_search_query(
    company_name: &str,
    trade_name: Option<&str>,
    city: Option<&str>,
) -> String {
    let city = city.map(str::trim).unwrap_or_default();

    let base = match trade_name.map(str::trim) {
        Some(tn) if !tn.is_empty() => tn.to_string(),
        _ => strip_legal_suffixes(company_name),
    };

    [base.as_str(), city, "site oficial"]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_legal_suffixes(name: &str) -> String {
    let mut chars: Vec<char> = name.trim().chars().collect();
    let mut changed = true;
    while changed {
        changed = false;
        for suffix in LEGAL_SUFFIXES {
            let suffix_chars: Vec<char> = suffix.chars().collect();
            if chars.len() < suffix_chars.len() {
                continue;
            }
            let tail = &chars[chars.len() - suffix_chars.len()..];
            let matches = tail
                .iter()
                .zip(&suffix_chars)
                .all(|(c, s)| c.to_uppercase().eq(s.to_uppercase()));
            if matches {
                chars.truncate(chars.len() - suffix_chars.len());
                while chars.last().is_some_and(|c| c.is_whitespace()) {
                    chars.pop();
                }
                changed = true;
            }
        }
    }
    chars.into_iter().collect()
}

/// Opaque channel to the search vendor.
pub trait SearchProvider: Send + Sync + Clone {
    fn search(
        &self,
        query: &str,
        num_results: usize,
    ) -> impl Future<Output = Result<Vec<SearchHit>, AppError>> + Send;
}
