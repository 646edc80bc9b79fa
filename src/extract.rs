//! HTML-to-text extraction capability.
//!
//! The pipeline depends on the [`Extractor`] trait only. [`HtmlExtractor`]
//! is the default `scraper`-based implementation: it keeps the document's
//! block structure so the categorizer can see it, emitting headings as
//! `#`-prefixed lines, list items as `- ` lines and `<pre>` blocks as fenced
//! code. Extraction never panics; malformed markup yields whatever text the
//! parser recovered.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

use crate::error::CrawlError;

/// Title, main text and outbound links (raw `href` values, document order).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub title: Option<String>,
    pub main_text: String,
    pub links: Vec<String>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, html: &str) -> Result<Extraction, CrawlError>;
}

/// Elements whose text forms one block of main text.
const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "pre", "blockquote", "dt", "dd",
];

/// Page furniture excluded from the main text.
const SKIPPED_TAGS: &[&str] = &[
    "nav", "header", "footer", "aside", "script", "style", "noscript", "form",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlExtractor;

#[async_trait]
impl Extractor for HtmlExtractor {
    async fn extract(&self, html: &str) -> Result<Extraction, CrawlError> {
        Ok(extract_html(html))
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

pub fn extract_html(html: &str) -> Extraction {
    let document = Html::parse_document(html);

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            selector("h1")
                .and_then(|s| document.select(&s).next())
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .filter(|t| !t.is_empty())
        });

    let root = ["main", "article", "[role=main]", "body"]
        .iter()
        .filter_map(|css| selector(css))
        .find_map(|s| document.select(&s).next());

    let mut blocks: Vec<String> = Vec::new();
    if let (Some(root), Some(block_selector)) = (root, selector(&BLOCK_TAGS.join(", "))) {
        for el in root.select(&block_selector) {
            if has_excluded_ancestor(&el) {
                continue;
            }
            if let Some(block) = render_block(&el) {
                blocks.push(block);
            }
        }
    }

    let mut links = Vec::new();
    let mut seen = HashSet::new();
    if let Some(anchor) = selector("a[href]") {
        for el in document.select(&anchor) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            let lower = href.to_ascii_lowercase();
            if href.is_empty()
                || href.starts_with('#')
                || lower.starts_with("javascript:")
                || lower.starts_with("mailto:")
                || lower.starts_with("tel:")
            {
                continue;
            }
            if seen.insert(href.to_string()) {
                links.push(href.to_string());
            }
        }
    }

    Extraction {
        title,
        main_text: blocks.join("\n\n"),
        links,
    }
}

/// Nested blocks (a `<p>` inside an `<li>`) are rendered by their outermost block.
fn has_excluded_ancestor(el: &ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| {
            let name = a.value().name();
            BLOCK_TAGS.contains(&name) || SKIPPED_TAGS.contains(&name)
        })
}

fn render_block(el: &ElementRef<'_>) -> Option<String> {
    let name = el.value().name();
    let raw: String = el.text().collect();

    if name == "pre" {
        let code = raw.trim_matches('\n').trim_end();
        if code.trim().is_empty() {
            return None;
        }
        return Some(format!("```\n{}\n```", code));
    }

    let text = collapse_whitespace(&raw);
    if text.is_empty() {
        return None;
    }

    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level: usize = name[1..].parse().unwrap_or(1);
            Some(format!("{} {}", "#".repeat(level), text))
        }
        "li" => Some(format!("- {}", text)),
        _ => Some(text),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<html>
  <head><title> Async   Rust Guide </title><script>var x = 1;</script></head>
  <body>
    <nav><a href="/home">Home</a> navigation text</nav>
    <main>
      <h2>Tasks</h2>
      <p>Use async for I/O-bound tasks.</p>
      <ul><li><p>Spawn with tokio::spawn</p></li></ul>
      <pre>let x = 1;
let y = 2;</pre>
      <a href="/docs#top">Docs</a>
      <a href="/docs#top">Docs again</a>
      <a href="mailto:a@b.c">Mail</a>
      <a href="javascript:void(0)">JS</a>
    </main>
  </body>
</html>"#;

    #[test]
    fn test_extracts_structure_and_links() {
        let out = extract_html(PAGE);
        assert_eq!(out.title.as_deref(), Some("Async Rust Guide"));
        assert_eq!(
            out.main_text,
            "## Tasks\n\nUse async for I/O-bound tasks.\n\n- Spawn with tokio::spawn\n\n```\nlet x = 1;\nlet y = 2;\n```"
        );
        assert_eq!(out.links, vec!["/home", "/docs#top"]);
    }

    #[test]
    fn test_empty_document() {
        let out = extract_html("");
        assert!(out.main_text.is_empty());
        assert!(out.links.is_empty());
        assert!(out.title.is_none());
    }

    #[test]
    fn test_title_falls_back_to_h1() {
        let out = extract_html("<body><h1>Ownership</h1><p>Every value has an owner.</p></body>");
        assert_eq!(out.title.as_deref(), Some("Ownership"));
        assert!(out.main_text.starts_with("# Ownership"));
    }
}
