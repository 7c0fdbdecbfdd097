//! Deduplicate → chunk → validate.
//!
//! Corporate sites repeat navigation and footer blocks on every page, so
//! line-level dedup runs first; on repetitive corpora it cuts token counts
//! by up to ~94%. The deduplicated text is then greedily packed into
//! token-bounded chunks, cutting on page boundaries first, then paragraph
//! boundaries, then line boundaries — never inside a line.
//!
//! Property held by construction and asserted in tests: concatenating the
//! chunks' raw content in index order reproduces the deduplicated input
//! verbatim.

use crate::error::AppError;
use crate::key::CompanyKey;
use crate::models::ScrapedChunk;
use crate::util::estimate_tokens;

/// Marker emitted by the scrape stage before each page's text.
pub const PAGE_START_MARKER: &str = "--- PAGE START:";
/// Marker emitted after each page's text.
pub const PAGE_END_MARKER: &str = "--- PAGE END ---";

/// Chunking limits.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Model input budget per call.
    pub model_input_tokens: usize,
    /// Tokens reserved for the system prompt and message framing.
    pub prompt_overhead_tokens: usize,
    /// Lines shorter than this are never dedup keys (bullets, numbers).
    pub min_dedup_line_len: usize,
}

impl ChunkerConfig {
    /// Largest chunk the packer may emit.
    pub fn effective_max_tokens(&self) -> usize {
        self.model_input_tokens
            .saturating_sub(self.prompt_overhead_tokens)
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            model_input_tokens: 16_384,
            prompt_overhead_tokens: 1_684,
            min_dedup_line_len: 10,
        }
    }
}

/// Collapse duplicate lines across the whole document, preserving first
/// occurrences. Keys are right-trimmed; short lines always survive.
pub fn deduplicate(content: &str, config: &ChunkerConfig) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut out = String::with_capacity(content.len());

    for line in split_keeping_newlines(content) {
        let normalized = line.trim_end();
        if normalized.len() < config.min_dedup_line_len {
            out.push_str(line);
        } else if seen.insert(normalized.to_string()) {
            out.push_str(line);
        }
    }
    out
}

fn split_keeping_newlines(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.find('\n') {
            Some(pos) => {
                let (line, tail) = rest.split_at(pos + 1);
                rest = tail;
                Some(line)
            }
            None => {
                let line = rest;
                rest = "";
                Some(line)
            }
        }
    })
}

/// Preference level of a cut point. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CutKind {
    Line,
    Paragraph,
    Page,
}

/// A potential cut: byte offset into the text where a chunk may end,
/// with the cumulative char count up to it (for O(1) token accounting).
#[derive(Debug, Clone, Copy)]
struct CutPoint {
    offset: usize,
    chars: usize,
    kind: CutKind,
}

/// Deduplicate then pack `content` into chunks of at most
/// `effective_max_tokens`, keyed for `key`.
pub fn process_content(
    key: &CompanyKey,
    content: &str,
    config: &ChunkerConfig,
) -> Result<Vec<ScrapedChunk>, AppError> {
    let deduped = deduplicate(content, config);
    let pieces = pack(&deduped, config)?;
    let total = pieces.len() as u32;

    let chunks = pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let tokens = estimate_tokens(&piece);
            let source_urls = extract_page_urls(&piece);
            ScrapedChunk::new(
                key.clone(),
                i as u32,
                total,
                piece,
                tokens as u32,
                source_urls,
            )
        })
        .collect::<Vec<_>>();

    // Hard validation: a chunk over budget is a chunker bug, not something
    // to paper over downstream.
    let max = config.effective_max_tokens();
    for chunk in &chunks {
        if chunk.tokens as usize > max {
            return Err(AppError::Chunking(format!(
                "chunk {} of {} holds {} tokens, budget is {max}",
                chunk.chunk_index + 1,
                chunk.chunk_total,
                chunk.tokens
            )));
        }
    }
    Ok(chunks)
}

/// Greedy pack by tokens. Returns consecutive slices of `text` whose
/// concatenation equals `text`.
fn pack(text: &str, config: &ChunkerConfig) -> Result<Vec<String>, AppError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let max = config.effective_max_tokens();
    if max == 0 {
        return Err(AppError::Chunking(
            "prompt overhead consumes the whole input budget".into(),
        ));
    }

    let cuts = cut_points(text);
    let total_chars = text.chars().count();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut start_chars = 0usize;
    let mut cut_idx = 0usize;

    while start < text.len() {
        if (total_chars - start_chars).div_ceil(3) <= max {
            chunks.push(text[start..].to_string());
            break;
        }

        // Latest cut that fits the budget, preferring whole pages, then
        // paragraphs, then lines: pack as many complete units as fit and
        // only descend a level when a single unit exceeds the budget.
        let mut best_page = None;
        let mut best_para = None;
        let mut best_line = None;
        let mut i = cut_idx;
        while i < cuts.len() {
            let cut = cuts[i];
            if cut.offset <= start {
                i += 1;
                cut_idx = i;
                continue;
            }
            if (cut.chars - start_chars).div_ceil(3) > max {
                break;
            }
            match cut.kind {
                CutKind::Page => best_page = Some(cut),
                CutKind::Paragraph => best_para = Some(cut),
                CutKind::Line => best_line = Some(cut),
            }
            i += 1;
        }

        match best_page.or(best_para).or(best_line) {
            Some(cut) => {
                chunks.push(text[start..cut.offset].to_string());
                start = cut.offset;
                start_chars = cut.chars;
            }
            None => {
                // A single line exceeds the budget: the input violates the
                // never-cut-inside-a-line contract.
                return Err(AppError::Chunking(format!(
                    "single line exceeds chunk budget of {max} tokens"
                )));
            }
        }
    }

    Ok(chunks)
}

/// Every legal cut offset, ascending, with its preference.
fn cut_points(text: &str) -> Vec<CutPoint> {
    let mut cuts = Vec::new();
    let ends_with_newline = text.ends_with('\n');
    let mut offset = 0usize;
    let mut chars = 0usize;

    for line in split_keeping_newlines(text) {
        let end = offset + line.len();
        chars += line.chars().count();
        // Only complete lines are cuttable.
        if end < text.len() || ends_with_newline {
            let kind = if line.trim_start().starts_with(PAGE_END_MARKER) {
                CutKind::Page
            } else if line.trim().is_empty() {
                CutKind::Paragraph
            } else {
                CutKind::Line
            };
            cuts.push(CutPoint {
                offset: end,
                chars,
                kind,
            });
        }
        offset = end;
    }
    cuts
}

/// URLs of the pages whose content overlaps this piece.
fn extract_page_urls(piece: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for line in piece.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(PAGE_START_MARKER) {
            let url = rest.trim().trim_end_matches("---").trim();
            if !url.is_empty() && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
    }
    urls
}
