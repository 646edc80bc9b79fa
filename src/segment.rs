//! Block-boundary text segmenter.
//!
//! Splits extracted page text into [`Segment`]s, the units the categorizer
//! classifies. Splitting occurs on blank lines, except inside fenced code
//! blocks. Headings are not segments themselves: they become the context
//! of the segments beneath them. Consecutive list items merge into one
//! segment, and a code block joins the prose segment right before it.

/// One classifiable unit of page text.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: usize,
    /// Byte offset of the segment's first block in the page text.
    pub position: usize,
    pub text: String,
    pub heading: Option<String>,
    /// First segment directly under a heading.
    pub follows_heading: bool,
    pub has_code: bool,
    pub is_list: bool,
}

#[derive(Debug, PartialEq)]
enum BlockKind {
    Heading,
    Code,
    List,
    Prose,
}

struct Block {
    offset: usize,
    text: String,
    kind: BlockKind,
}

fn flush(current: &mut String, start: usize, blocks: &mut Vec<Block>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        let kind = if trimmed.starts_with("```") {
            BlockKind::Code
        } else if trimmed.starts_with('#') {
            BlockKind::Heading
        } else if trimmed.starts_with("- ") || starts_numbered(trimmed) {
            BlockKind::List
        } else {
            BlockKind::Prose
        };
        blocks.push(Block {
            offset: start,
            text: trimmed.to_string(),
            kind,
        });
    }
    current.clear();
}

fn split_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    let mut in_fence = false;
    let mut offset = 0;

    for line in text.split('\n') {
        let line_start = offset;
        offset += line.len() + 1;

        if line.trim_start().starts_with("```") {
            if !in_fence {
                flush(&mut current, start, &mut blocks);
                start = line_start;
            }
            in_fence = !in_fence;
            current.push_str(line);
            current.push('\n');
            if !in_fence {
                flush(&mut current, start, &mut blocks);
            }
            continue;
        }

        if !in_fence && line.trim().is_empty() {
            flush(&mut current, start, &mut blocks);
            continue;
        }

        if current.is_empty() {
            start = line_start;
        }
        current.push_str(line);
        current.push('\n');
    }
    flush(&mut current, start, &mut blocks);

    blocks
}

fn starts_numbered(s: &str) -> bool {
    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && s[digits..].starts_with(". ")
}

/// Split text into segments. Returns segments with contiguous indices
/// starting at 0; empty or heading-only text yields no segments.
pub fn segment_text(text: &str) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut heading: Option<String> = None;
    let mut under_fresh_heading = false;
    let mut last_kind: Option<BlockKind> = None;

    for block in split_blocks(text) {
        match block.kind {
            BlockKind::Heading => {
                heading = Some(block.text.trim_start_matches('#').trim().to_string());
                under_fresh_heading = true;
                last_kind = Some(BlockKind::Heading);
                continue;
            }
            BlockKind::Code => {
                let after_text = matches!(last_kind, Some(BlockKind::Prose | BlockKind::List));
                if let Some(prev) = segments.last_mut().filter(|_| after_text) {
                    prev.text.push_str("\n\n");
                    prev.text.push_str(&block.text);
                    prev.has_code = true;
                    last_kind = Some(BlockKind::Code);
                    continue;
                }
            }
            BlockKind::List => {
                let after_list = matches!(last_kind, Some(BlockKind::List));
                if let Some(prev) = segments.last_mut().filter(|_| after_list) {
                    prev.text.push('\n');
                    prev.text.push_str(&block.text);
                    continue;
                }
            }
            BlockKind::Prose => {}
        }

        segments.push(Segment {
            index: segments.len(),
            position: block.offset,
            has_code: block.kind == BlockKind::Code,
            is_list: block.kind == BlockKind::List,
            text: block.text,
            heading: heading.clone(),
            follows_heading: under_fresh_heading,
        });
        under_fresh_heading = false;
        last_kind = Some(block.kind);
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_paragraph() {
        let segs = segment_text("Hello, world!");
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].index, 0);
        assert_eq!(segs[0].position, 0);
        assert_eq!(segs[0].text, "Hello, world!");
        assert!(segs[0].heading.is_none());
    }

    #[test]
    fn test_empty_and_heading_only() {
        assert!(segment_text("").is_empty());
        assert!(segment_text("# Title").is_empty());
    }

    #[test]
    fn test_heading_becomes_context() {
        let text = "# Ownership\n\nEvery value has an owner.\n\nOwners drop values.";
        let segs = segment_text(text);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].heading.as_deref(), Some("Ownership"));
        assert!(segs[0].follows_heading);
        assert!(!segs[1].follows_heading);
        assert_eq!(segs[1].position, text.find("Owners drop").unwrap());
    }

    #[test]
    fn test_code_block_joins_previous_prose_and_keeps_blank_lines() {
        let text = "For example:\n\n```\nfn main() {\n\n    run();\n}\n```\n\nAfter.";
        let segs = segment_text(text);
        assert_eq!(segs.len(), 2);
        assert!(segs[0].has_code);
        assert!(segs[0].text.contains("run();"));
        assert_eq!(segs[1].text, "After.");
    }

    #[test]
    fn test_list_items_merge() {
        let text = "- Install rustup\n\n- Run cargo new\n\n- Build it\n\nDone.";
        let segs = segment_text(text);
        assert_eq!(segs.len(), 2);
        assert!(segs[0].is_list);
        assert_eq!(segs[0].text.lines().count(), 3);
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        for (i, s) in segment_text(&text).iter().enumerate() {
            assert_eq!(s.index, i);
        }
    }
}
