use std::sync::Arc;

use htmd::HtmlToMarkdown;
use perfil_core::error::AppError;
use perfil_core::stores::Cleaner;
use scraper::{Html, Selector};

/// HTML cleaner: htmd for text, scraper for link harvesting.
///
/// Strips non-content elements (script, style, nav, footer, …) so the
/// chunker and the model see prose, not markup.
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for HtmdCleaner {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
            ])
            .build();
        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for HtmdCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        self.converter
            .convert(html)
            .map_err(|e| AppError::Cleaner(e.to_string()))
    }

    fn extract_links(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        document
            .select(&selector)
            .filter_map(|element| element.value().attr("href"))
            .map(String::from)
            .collect()
    }
}
