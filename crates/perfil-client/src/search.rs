use std::time::Duration;

use perfil_core::error::AppError;
use perfil_core::models::SearchHit;
use perfil_core::rate_gate::{GateKey, RateGate};
use perfil_core::search::SearchProvider;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_ENDPOINT: &str = "https://google.serper.dev/search";

/// Serper-style search API client, paced through the rate gate.
#[derive(Debug, Clone)]
pub struct SerperClient {
    client: Client,
    endpoint: String,
    api_key: String,
    gate: RateGate,
    gate_key: GateKey,
}

impl SerperClient {
    pub fn new(api_key: &str, gate: RateGate) -> Result<Self, AppError> {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT, gate)
    }

    pub fn with_endpoint(api_key: &str, endpoint: &str, gate: RateGate) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::Config("SEARCH_KEY is empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Generic(format!("failed to build search client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            gate,
            gate_key: GateKey::new("serper", "search"),
        })
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    q: &'a str,
    gl: &'static str,
    hl: &'static str,
    num: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<OrganicHit>,
}

#[derive(Deserialize)]
struct OrganicHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

impl SearchProvider for SerperClient {
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<SearchHit>, AppError> {
        let acquired = self
            .gate
            .acquire(&self.gate_key, 1.0, Duration::from_secs(10))
            .await;
        if !acquired.is_ok() {
            return Err(AppError::RateLimited("local gate for serper".into()));
        }

        let body = SearchRequest {
            q: query,
            gl: "br",
            hl: "pt-br",
            num: num_results,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(30)
                } else if e.is_connect() {
                    AppError::Transport(format!("connection failed: {e}"))
                } else {
                    AppError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("search vendor 429".into()));
        }
        if !status.is_success() {
            return Err(AppError::Http {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("failed to parse search response: {e}")))?;

        Ok(parsed
            .organic
            .into_iter()
            .filter(|hit| !hit.link.is_empty())
            .map(|hit| SearchHit {
                title: hit.title,
                url: hit.link,
                snippet: hit.snippet,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_config_error() {
        let err = SerperClient::new("", RateGate::new()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn request_targets_brazilian_results() {
        let body = SearchRequest {
            q: "example cabos são paulo site oficial",
            gl: "br",
            hl: "pt-br",
            num: 10,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["gl"], "br");
        assert_eq!(json["hl"], "pt-br");
        assert_eq!(json["num"], 10);
    }

    #[test]
    fn response_tolerates_missing_fields() {
        let parsed: SearchResponse = serde_json::from_str(
            r#"{"organic": [{"title": "Example", "link": "https://example.com.br"}, {"link": ""}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.organic.len(), 2);
        assert_eq!(parsed.organic[0].snippet, "");

        let empty: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.organic.is_empty());
    }
}
