//! Profile extraction: one model call per chunk, merged across chunks.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::llm::{ChatMessage, LlmVendor, StructuredCaller};
use crate::models::ScrapedChunk;
use crate::profile::{self, CompanyProfile};

/// Stable system prompt for profile extraction. The numeric limits here
/// are hints to the model; post-parse normalization enforces them.
pub const PROFILE_SYSTEM_PROMPT: &str = "\
Você é um extrator de dados B2B. Analise o texto fornecido e retorne UM ÚNICO objeto JSON válido com estas 6 chaves raiz (use null ou [] quando não houver dados):

- identity: { company_name, tax_id, description, founding_year, employee_range }
- classification: { industry, business_model, target_audience, geographic_coverage }
- offerings: { product_categories: [ { name, items: [] } ], services: [ { name, description } ] }
- reputation: { certifications: [], awards: [], partnerships: [], client_list: [], case_studies: [ { title, client_name, industry, challenge, solution, outcome } ] }
- contact: { emails: [], phones: [], linkedin_url, website_url, headquarters_address, locations: [] }
- sources: [ URLs das páginas analisadas ]

PRODUTO vs SERVIÇO:
- PRODUTO = item tangível de catálogo (cabo, disjuntor, equipamento). Vai em offerings.product_categories, agrupado por categoria (name) com a lista de itens (items). NUNCA crie uma categoria chamada \"Serviços\".
- SERVIÇO = atividade que a empresa realiza (consultoria, manutenção, instalação, treinamento). Vai em offerings.services com name e description. NUNCA coloque serviços como categoria de produtos.

CLIENTES: se houver seção de clientes, obras ou \"quem confia\", extraia TODOS os nomes para reputation.client_list.

ESTUDOS DE CASO: preencha reputation.case_studies SOMENTE quando houver cliente identificado, solução descrita e resultado descrito para o mesmo caso; caso contrário use [].

REGRAS:
1. IDIOMA: Português (Brasil); termos técnicos globais podem ficar em inglês.
2. DEDUPLICAÇÃO: cada produto ou serviço aparece NO MÁXIMO UMA VEZ em todo o JSON; entre variações, mantenha só a mais completa.
3. LIMITES: máx. 60 itens por categoria, 40 categorias, 50 serviços, 80 clientes, 50 parcerias, 50 certificações, 30 estudos de caso. PARE ao atingir qualquer limite.
4. ANTI-REPETIÇÃO: se 5 itens consecutivos de uma lista compartilham o mesmo prefixo, PARE a lista.
5. Não invente dados; use null ou [] quando não encontrar.

Saída: APENAS o objeto JSON, sem markdown, sem texto antes ou depois.";

/// JSON Schema for the profile document. The `maxItems`/`uniqueItems`
/// caps are advisory sizing hints; they are not load-bearing.
pub fn profile_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "identity": {
                "type": "object",
                "properties": {
                    "company_name": {"type": ["string", "null"]},
                    "tax_id": {"type": ["string", "null"]},
                    "description": {"type": ["string", "null"]},
                    "founding_year": {"type": ["integer", "null"]},
                    "employee_range": {"type": ["string", "null"]}
                }
            },
            "classification": {
                "type": "object",
                "properties": {
                    "industry": {"type": ["string", "null"]},
                    "business_model": {"type": ["string", "null"]},
                    "target_audience": {"type": ["string", "null"]},
                    "geographic_coverage": {"type": ["string", "null"]}
                }
            },
            "offerings": {
                "type": "object",
                "properties": {
                    "product_categories": {
                        "type": "array",
                        "maxItems": profile::MAX_CATEGORIES,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "items": {
                                    "type": "array",
                                    "maxItems": profile::MAX_ITEMS_PER_CATEGORY,
                                    "uniqueItems": true,
                                    "items": {"type": "string"}
                                }
                            },
                            "required": ["name"]
                        }
                    },
                    "services": {
                        "type": "array",
                        "maxItems": profile::MAX_SERVICES,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "description": {"type": ["string", "null"]}
                            },
                            "required": ["name"]
                        }
                    }
                }
            },
            "reputation": {
                "type": "object",
                "properties": {
                    "certifications": {"type": "array", "maxItems": profile::MAX_CERTIFICATIONS, "uniqueItems": true, "items": {"type": "string"}},
                    "awards": {"type": "array", "uniqueItems": true, "items": {"type": "string"}},
                    "partnerships": {"type": "array", "maxItems": profile::MAX_PARTNERSHIPS, "uniqueItems": true, "items": {"type": "string"}},
                    "client_list": {"type": "array", "maxItems": profile::MAX_CLIENTS, "uniqueItems": true, "items": {"type": "string"}},
                    "case_studies": {
                        "type": "array",
                        "maxItems": profile::MAX_CASE_STUDIES,
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": {"type": "string"},
                                "client_name": {"type": ["string", "null"]},
                                "industry": {"type": ["string", "null"]},
                                "challenge": {"type": ["string", "null"]},
                                "solution": {"type": ["string", "null"]},
                                "outcome": {"type": ["string", "null"]}
                            },
                            "required": ["title"]
                        }
                    }
                }
            },
            "contact": {
                "type": "object",
                "properties": {
                    "emails": {"type": "array", "uniqueItems": true, "items": {"type": "string"}},
                    "phones": {"type": "array", "uniqueItems": true, "items": {"type": "string"}},
                    "linkedin_url": {"type": ["string", "null"]},
                    "website_url": {"type": ["string", "null"]},
                    "headquarters_address": {"type": ["string", "null"]},
                    "locations": {"type": "array", "uniqueItems": true, "items": {"type": "string"}}
                }
            },
            "sources": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["identity", "classification", "offerings", "reputation", "contact"]
    })
}

/// Outcome grade for the profile stage, by fraction of chunks that
/// contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Partial,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Partial => "partial",
            StageStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(StageStatus::Success),
            "partial" => Some(StageStatus::Partial),
            "error" => Some(StageStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running every chunk through the model and merging.
#[derive(Debug, Clone)]
pub struct ProfileOutcome {
    pub profile: CompanyProfile,
    pub status: StageStatus,
    pub chunks_total: usize,
    pub chunks_contributed: usize,
}

/// Runs chunks through the structured caller and merges partial profiles.
pub struct ProfileExtractor<V: LlmVendor> {
    caller: StructuredCaller<V>,
    /// Deadline per chunk call, retries included.
    chunk_timeout: Duration,
}

impl<V: LlmVendor> ProfileExtractor<V> {
    pub fn new(caller: StructuredCaller<V>) -> Self {
        Self {
            caller,
            chunk_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Extract a partial profile from one chunk. Normalization runs here
    /// so every partial obeys the caps before the merge sees it.
    pub async fn extract_chunk(&self, chunk: &ScrapedChunk) -> Result<CompanyProfile, AppError> {
        let messages = vec![
            ChatMessage::system(PROFILE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Analise este conteúdo e extraia os dados em Português:\n\n{}",
                chunk.content
            )),
        ];
        let ctx = format!("profile c{}/{}", chunk.chunk_index + 1, chunk.chunk_total);

        let mut profile: CompanyProfile = tokio::time::timeout(
            self.chunk_timeout,
            self.caller
                .call(messages, "company_profile", profile_schema(), &ctx),
        )
        .await
        .unwrap_or_else(|_| Err(AppError::Timeout(self.chunk_timeout.as_secs())))?;

        for url in &chunk.source_urls {
            if !profile.sources.contains(url) {
                profile.sources.push(url.clone());
            }
        }
        profile::normalize(&mut profile);
        Ok(profile)
    }

    /// Process chunks sequentially (merge determinism) and merge whatever
    /// contributed. A terminally failed chunk is skipped, not fatal.
    pub async fn build(&self, chunks: &[ScrapedChunk]) -> Result<ProfileOutcome, AppError> {
        if chunks.is_empty() {
            return Err(AppError::UnavailableInput("no chunks to process".into()));
        }

        let mut partials = Vec::with_capacity(chunks.len());
        let mut contributed = 0usize;

        for chunk in chunks {
            match self.extract_chunk(chunk).await {
                Ok(partial) => {
                    contributed += 1;
                    partials.push(partial);
                }
                Err(e) => {
                    tracing::warn!(
                        key = %chunk.key,
                        chunk = chunk.chunk_index + 1,
                        total = chunk.chunk_total,
                        error = %e,
                        "chunk skipped after terminal failure"
                    );
                }
            }
        }

        let status = if contributed == chunks.len() {
            StageStatus::Success
        } else if contributed > 0 {
            StageStatus::Partial
        } else {
            StageStatus::Error
        };

        Ok(ProfileOutcome {
            profile: profile::merge_profiles(partials),
            status,
            chunks_total: chunks.len(),
            chunks_contributed: contributed,
        })
    }
}
