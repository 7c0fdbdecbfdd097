use std::time::{Duration, Instant};

use perfil_core::error::AppError;
use perfil_core::fetch::{FetchStrategy, FetchedPage, PageFetcher, classify_body};
use perfil_core::util::xorshift_below;
use reqwest::Client;

// Browser-like user agents rotated by the ROBUST/AGGRESSIVE strategies.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

const ACCEPT_LANGUAGE: &str = "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7";

/// Proxy endpoints for strategies that route through proxies.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    urls: Vec<String>,
}

impl ProxyPool {
    /// Comma-separated list from `SCRAPER_PROXY_URLS`; empty means the
    /// proxy-bearing strategies run direct.
    pub fn from_env() -> Self {
        let urls = std::env::var("SCRAPER_PROXY_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self { urls }
    }

    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    fn pick(&self, rotate: bool) -> Option<&str> {
        if self.urls.is_empty() {
            return None;
        }
        let index = if rotate {
            xorshift_below(self.urls.len() as u64) as usize
        } else {
            0
        };
        self.urls.get(index).map(String::as_str)
    }
}

/// Reqwest-backed [`PageFetcher`] executing the strategy chosen by the
/// prober. Builds one client per strategy flavor up front; UA rotation
/// happens per attempt via request headers.
#[derive(Clone)]
pub struct ReqwestFetcher {
    proxies: ProxyPool,
}

impl ReqwestFetcher {
    pub fn new(proxies: ProxyPool) -> Self {
        Self { proxies }
    }

    fn client_for(&self, strategy: FetchStrategy) -> Result<Client, AppError> {
        let params = strategy.params();
        let mut builder = Client::builder()
            .timeout(params.timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .danger_accept_invalid_certs(true);

        if params.use_proxy
            && let Some(proxy_url) = self.proxies.pick(params.rotate_proxy)
        {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| AppError::Config(format!("invalid proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| AppError::Generic(format!("failed to build http client: {e}")))
    }

    fn user_agent(params_rotate: bool, attempt: u32) -> &'static str {
        if params_rotate {
            let base = xorshift_below(USER_AGENTS.len() as u64) as usize;
            USER_AGENTS[(base + attempt as usize) % USER_AGENTS.len()]
        } else {
            USER_AGENTS[0]
        }
    }

    async fn fetch_once(
        &self,
        client: &Client,
        url: &str,
        strategy: FetchStrategy,
        attempt: u32,
    ) -> Result<FetchedPage, AppError> {
        let params = strategy.params();
        let started = Instant::now();

        let response = client
            .get(url)
            .header("User-Agent", Self::user_agent(params.rotate_user_agent, attempt))
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", ACCEPT_LANGUAGE)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(params.timeout.as_secs())
                } else if e.is_connect() {
                    AppError::Transport(format!("connection failed: {e}"))
                } else {
                    AppError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Transport(format!("failed to read body: {e}")))?;

        if status == 429 {
            return Err(AppError::RateLimited(format!("HTTP 429 from {url}")));
        }
        if status >= 400 {
            // A blocked request often comes back 403 with a challenge
            // body; classify before treating it as a genuine HTTP error.
            if let Err(e @ AppError::ProtectionDetected(_)) = classify_body(url, &body) {
                return Err(e);
            }
            return Err(AppError::Http {
                status,
                url: url.to_string(),
            });
        }

        classify_body(url, &body)?;

        Ok(FetchedPage {
            url: url.to_string(),
            body,
            status,
            strategy_used: strategy,
            elapsed: started.elapsed(),
        })
    }
}

impl PageFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, strategy: FetchStrategy) -> Result<FetchedPage, AppError> {
        let params = strategy.params();
        let client = self.client_for(strategy)?;
        let mut last_error = AppError::Transport(format!("no attempt made for {url}"));

        for attempt in 0..params.retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(params.delay_between_requests).await;
            }
            match self.fetch_once(&client, url, strategy, attempt).await {
                Ok(page) => return Ok(page),
                Err(e) => {
                    // Protection pages never improve on retry within the
                    // same strategy; bail out so the cascade can escalate.
                    if matches!(e, AppError::ProtectionDetected(_)) {
                        return Err(e);
                    }
                    tracing::debug!(url, strategy = %strategy, attempt, error = %e, "fetch attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
