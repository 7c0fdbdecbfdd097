use std::time::{Duration, Instant};

use perfil_core::error::AppError;
use perfil_core::models::SiteKnowledge;
use perfil_core::probe::{
    ProbeHit, SiteProber, SiteProfile, classify_protection, classify_site_type, select_strategies,
    url_variants,
};
use reqwest::Client;

/// Probes the {http,https} × {apex,www} variants in parallel and
/// classifies the fastest reachable one.
#[derive(Clone)]
pub struct ReqwestProber {
    client: Client,
    probe_timeout: Duration,
}

impl ReqwestProber {
    pub fn new(probe_timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(probe_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .danger_accept_invalid_certs(true)
            .user_agent(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .build()
            .map_err(|e| AppError::Generic(format!("failed to build probe client: {e}")))?;
        Ok(Self {
            client,
            probe_timeout,
        })
    }

    async fn probe_one(&self, url: String) -> Option<(ProbeHit, String)> {
        let started = Instant::now();
        let response = self.client.get(&url).send().await.ok()?;
        let status = response.status().as_u16();
        let latency = started.elapsed();
        if status >= 400 {
            return None;
        }
        // The winner's body feeds classification; keep it.
        let body = response.text().await.unwrap_or_default();
        Some((
            ProbeHit {
                url,
                status,
                latency,
            },
            body,
        ))
    }
}

impl SiteProber for ReqwestProber {
    async fn probe(
        &self,
        base_url: &str,
        knowledge: Option<&SiteKnowledge>,
    ) -> Result<SiteProfile, AppError> {
        let variants = url_variants(base_url);
        let mut join_set = tokio::task::JoinSet::new();
        for variant in variants {
            let prober = self.clone();
            join_set.spawn(async move { prober.probe_one(variant).await });
        }

        let mut results: Vec<(ProbeHit, String)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(result)) = joined {
                results.push(result);
            }
        }

        // 2xx beats 3xx; latency breaks ties.
        results.sort_by_key(|(hit, _)| (hit.status >= 300, hit.latency));
        let Some((best, body)) = results.into_iter().next() else {
            return Err(AppError::Transport(format!(
                "no reachable variant of {base_url} within {}s",
                self.probe_timeout.as_secs()
            )));
        };

        let site_type = classify_site_type(&body);
        let protection = classify_protection(&body);
        let strategies = select_strategies(site_type, protection, best.latency, knowledge);

        tracing::debug!(
            url = %best.url,
            status = best.status,
            latency_ms = best.latency.as_millis() as u64,
            %site_type,
            ?protection,
            "probe winner"
        );

        Ok(SiteProfile {
            url: best.url,
            latency: best.latency,
            site_type,
            protection,
            strategies,
        })
    }
}
