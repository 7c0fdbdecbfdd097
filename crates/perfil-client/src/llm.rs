use std::time::{Duration, Instant};

use perfil_core::error::AppError;
use perfil_core::llm::{CompletionRequest, CompletionResponse, LlmVendor};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// OpenAI-compatible chat-completions vendor.
///
/// Works against any host speaking the `/chat/completions` dialect:
/// OpenAI itself, SGLang/vLLM deployments, OpenRouter, or Gemini through
/// its compatibility layer. Whether the schema directive and sampling
/// controls are actually sent is decided by the caller via
/// `VendorCapabilities`; this client forwards whatever the request
/// carries.
#[derive(Clone)]
pub struct OpenAiCompatVendor {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatVendor {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Generic(format!("failed to build llm client: {e}")))?;
        Ok(Self {
            client,
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---- Wire types ----

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage<'a>],
    temperature: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl LlmVendor for OpenAiCompatVendor {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let messages: Vec<WireMessage<'_>> = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();

        let response_format = request.schema.map(|(name, schema)| ResponseFormat {
            format_type: "json_schema",
            json_schema: JsonSchemaWrapper {
                name,
                strict: true,
                schema,
            },
        });

        let body = ChatRequest {
            model: &self.model,
            messages: &messages,
            temperature: request.sampling.temperature,
            presence_penalty: request.sampling.presence_penalty,
            frequency_penalty: request.sampling.frequency_penalty,
            max_tokens: request.max_output_tokens,
            response_format,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(0)
                } else if e.is_connect() {
                    AppError::Transport(format!("connection failed: {e}"))
                } else {
                    AppError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {text}"));

            if status_code == 429 {
                return Err(AppError::RateLimited(format!("{}: {message}", self.name)));
            }
            return Err(AppError::Llm {
                vendor: self.name.clone(),
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("failed to parse llm response: {e}")))?;

        let content = chat
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::Llm {
                vendor: self.name.clone(),
                message: "empty response".into(),
                status_code: 200,
                retryable: true,
            })?;

        Ok(CompletionResponse {
            content,
            latency: started.elapsed(),
        })
    }
}
