//! Source-text retrieval: turns a `"<file>:page<N>:line<M>"` citation
//! into a short excerpt of the underlying policy markdown, using the
//! page index the ingestion stage (component R) wrote alongside it.

use std::collections::HashMap;

use async_trait::async_trait;
use refund_core::graph::{Citation, PageIndexEntry};
use refund_error::{Classify, ErrorCode};

const CONTEXT_LINES: usize = 5;
const MAX_EXCERPT_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum PolicyDocError {
    #[error("policy document unavailable: {0}")]
    Unavailable(String),
    #[error("policy document not found: {0}")]
    NotFound(String),
}

impl Classify for PolicyDocError {
    fn code(&self) -> ErrorCode {
        match self {
            PolicyDocError::Unavailable(_) => ErrorCode::ToolUnreachable,
            PolicyDocError::NotFound(_) => ErrorCode::OrderNotFound,
        }
    }
}

/// Supplies the compiled markdown and the shared page index the
/// adjudicator slices citation excerpts out of. Backed by
/// `refund-blob-store` in the daemon; kept as a narrow trait here so
/// this crate doesn't need to depend on a specific storage adapter.
#[async_trait]
pub trait PolicyDocSource: Send + Sync {
    async fn load_markdown(&self, filename: &str) -> Result<String, PolicyDocError>;
    async fn load_page_index(&self) -> Result<Vec<PageIndexEntry>, PolicyDocError>;
}

/// Resolves citation strings to excerpts, caching loaded markdown per
/// filename for the lifetime of one adjudication call.
pub struct CitationResolver<'a> {
    source: &'a dyn PolicyDocSource,
    index: Vec<PageIndexEntry>,
    markdown_cache: HashMap<String, String>,
}

impl<'a> CitationResolver<'a> {
    pub async fn new(source: &'a dyn PolicyDocSource) -> Result<CitationResolver<'a>, PolicyDocError> {
        let index = source.load_page_index().await?;
        Ok(CitationResolver { source, index, markdown_cache: HashMap::new() })
    }

    /// Returns a truncated excerpt of the source text around the cited
    /// line, or `None` if the citation doesn't parse or resolve.
    pub async fn resolve(&mut self, raw_citation: &str) -> Option<String> {
        let citation = Citation::parse(raw_citation)?;
        if !self.markdown_cache.contains_key(&citation.filename) {
            let markdown = self.source.load_markdown(&citation.filename).await.ok()?;
            self.markdown_cache.insert(citation.filename.clone(), markdown);
        }
        let markdown = self.markdown_cache.get(&citation.filename)?;
        slice_citation_context(markdown, &self.index, &citation)
    }
}

/// Pure slicing logic, split out for direct testing without a store.
fn slice_citation_context(markdown: &str, index: &[PageIndexEntry], citation: &Citation) -> Option<String> {
    let entry = index
        .iter()
        .find(|e| e.filename == citation.filename && e.page == citation.page)?;

    let lines: Vec<&str> = markdown.lines().collect();
    let target_line = entry.start_line.saturating_add(citation.line).min(lines.len() as u32) as usize;
    let start = target_line.saturating_sub(CONTEXT_LINES);
    let end = (target_line + CONTEXT_LINES).min(lines.len());
    if start >= end {
        return None;
    }

    let excerpt = lines[start..end].join("\n");
    Some(truncate_chars(&excerpt, MAX_EXCERPT_CHARS))
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_markdown() -> String {
        (0..30).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    fn sample_index() -> Vec<PageIndexEntry> {
        vec![PageIndexEntry { filename: "return-policy.pdf".into(), page: 1, start_line: 0, end_line: 30 }]
    }

    #[test]
    fn slices_a_window_of_lines_around_the_citation() {
        let markdown = sample_markdown();
        let index = sample_index();
        let citation = Citation { filename: "return-policy.pdf".into(), page: 1, line: 10 };
        let excerpt = slice_citation_context(&markdown, &index, &citation).unwrap();
        assert!(excerpt.contains("line 10"));
        assert!(excerpt.contains("line 5"));
        assert!(excerpt.contains("line 15"));
    }

    #[test]
    fn unknown_file_or_page_resolves_to_none() {
        let markdown = sample_markdown();
        let index = sample_index();
        let citation = Citation { filename: "unrelated.pdf".into(), page: 1, line: 10 };
        assert!(slice_citation_context(&markdown, &index, &citation).is_none());
    }

    #[test]
    fn excerpt_is_truncated_to_max_chars() {
        let long_line = "x".repeat(1000);
        let markdown = format!("before\n{long_line}\nafter");
        let index = vec![PageIndexEntry { filename: "f.pdf".into(), page: 1, start_line: 0, end_line: 3 }];
        let citation = Citation { filename: "f.pdf".into(), page: 1, line: 1 };
        let excerpt = slice_citation_context(&markdown, &index, &citation).unwrap();
        assert!(excerpt.chars().count() <= MAX_EXCERPT_CHARS);
    }
}
