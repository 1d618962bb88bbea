use std::{path::Path, sync::LazyLock};

use regex::Regex;
use tracing::{info, warn};

const TRUNCATION_MARKER: &str = "\n...(conteúdo truncado)...";

static BLANK_LINES_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").ok());

/// Catalog text injected into the system prompt.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    content: String,
    max_chars: usize,
}

impl KnowledgeBase {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_text(raw: &str, max_chars: usize) -> Self {
        let content = match BLANK_LINES_RE.as_ref() {
            Some(re) => re.replace_all(raw, "\n").trim().to_string(),
            None => raw.trim().to_string(),
        };
        Self { content, max_chars }
    }

    /// Missing or unreadable files yield an empty base.
    pub async fn load(path: Option<&Path>, max_chars: usize) -> Self {
        let Some(path) = path else {
            return Self::empty();
        };
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let base = Self::from_text(&raw, max_chars);
                info!(path = %path.display(), chars = base.content.chars().count(), "knowledge base loaded");
                base
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "knowledge base not loaded");
                Self::empty()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.content.is_empty()
    }

    pub fn context(&self) -> String {
        if self.max_chars == 0 || self.content.chars().count() <= self.max_chars {
            return self.content.clone();
        }
        let mut excerpt = self.content.chars().take(self.max_chars).collect::<String>();
        excerpt.push_str(TRUNCATION_MARKER);
        excerpt
    }
}
