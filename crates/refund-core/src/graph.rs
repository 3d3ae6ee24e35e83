//! §3.4/§3.5 knowledge-graph and policy-artifact entities that flow
//! between the compiler and the adjudicator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A policy citation of shape `"<filename>:page<N>:line<M>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub filename: String,
    pub page: u32,
    pub line: u32,
}

impl Citation {
    pub fn parse(raw: &str) -> Option<Citation> {
        let (filename, rest) = raw.rsplit_once(":page")?;
        let (page_str, line_str) = rest.split_once(":line")?;
        let page = page_str.parse().ok()?;
        let line = line_str.parse().ok()?;
        Some(Citation {
            filename: filename.to_string(),
            page,
            line,
        })
    }
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:page{}:line{}", self.filename, self.page, self.line)
    }
}

/// An entry from `combined_policy_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageIndexEntry {
    pub filename: String,
    pub page: u32,
    pub start_line: u32,
    pub end_line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_roundtrips_through_display_and_parse() {
        let citation = Citation {
            filename: "return-policy.pdf".into(),
            page: 3,
            line: 42,
        };
        let rendered = citation.to_string();
        assert_eq!(rendered, "return-policy.pdf:page3:line42");
        assert_eq!(Citation::parse(&rendered), Some(citation));
    }

    #[test]
    fn citation_parse_rejects_malformed_input() {
        assert_eq!(Citation::parse("not-a-citation"), None);
        assert_eq!(Citation::parse("file.pdf:page3"), None);
    }
}
