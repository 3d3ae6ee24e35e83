//! Splits combined policy markdown back into pages along the
//! `<!-- PAGE:file:page:start:end -->` markers component R wrote.

#[derive(Debug, Clone)]
pub struct Page {
    pub filename: String,
    pub page: u32,
    pub start_line: u32,
    pub text: String,
}

const MARKER_PREFIX: &str = "<!-- PAGE:";

pub fn split_pages(combined_markdown: &str) -> Vec<Page> {
    let lines: Vec<&str> = combined_markdown.lines().collect();
    let mut pages = Vec::new();
    let mut current: Option<(String, u32, u32, Vec<&str>)> = None;

    for line in &lines {
        if let Some(marker) = parse_marker(line) {
            if let Some((filename, page, start_line, body)) = current.take() {
                pages.push(Page { filename, page, start_line, text: body.join("\n") });
            }
            current = Some((marker.0, marker.1, marker.2, Vec::new()));
        } else if let Some((_, _, _, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((filename, page, start_line, body)) = current {
        pages.push(Page { filename, page, start_line, text: body.join("\n") });
    }
    pages
}

fn parse_marker(line: &str) -> Option<(String, u32, u32)> {
    let trimmed = line.trim();
    if !trimmed.starts_with(MARKER_PREFIX) {
        return None;
    }
    let inner = trimmed.strip_prefix(MARKER_PREFIX)?.strip_suffix("-->")?.trim();
    let mut parts = inner.split(':');
    let filename = parts.next()?.to_string();
    let page: u32 = parts.next()?.parse().ok()?;
    let start_line: u32 = parts.next()?.parse().ok()?;
    let _end_line: u32 = parts.next()?.parse().ok()?;
    Some((filename, page, start_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_two_pages_across_one_file() {
        let markdown = "<!-- PAGE:a.pdf:1:8:9 -->\nfirst page body\n\n<!-- PAGE:a.pdf:2:11:12 -->\nsecond page body";
        let pages = split_pages(markdown);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].filename, "a.pdf");
        assert_eq!(pages[0].page, 1);
        assert!(pages[0].text.contains("first page body"));
        assert_eq!(pages[1].page, 2);
        assert!(pages[1].text.contains("second page body"));
    }

    #[test]
    fn text_before_first_marker_is_dropped() {
        let markdown = "# Combined Policy Documents\nheader stuff\n\n<!-- PAGE:a.pdf:1:4:5 -->\nbody";
        let pages = split_pages(markdown);
        assert_eq!(pages.len(), 1);
        assert!(!pages[0].text.contains("header stuff"));
    }
}
