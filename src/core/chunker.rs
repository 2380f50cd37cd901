//! Document chunker.
//!
//! Splits a parsed document into line ranges that cover the whole file
//! without gaps or overlaps:
//! - Sections start at line 1 and at every H2/H3 heading
//! - Adjacent sections are packed while they fit the token target
//! - An oversize section is split at blank-line paragraph boundaries,
//!   never inside a code fence
//!
//! Pure function of the document; parse failures surface earlier from
//! `Document::parse`.

use serde::{Deserialize, Serialize};

use crate::domain::{Document, Fingerprint};

/// Rough characters per token for budget estimates
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate tokens for a piece of text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// A fenced block attached to a chunk, referenced from its placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAttachment {
    /// 1-based index of the fence within the document
    pub id: usize,
    pub lang: Option<String>,
    pub start_line: usize,
    pub body: String,
}

/// A line-bounded slice of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub document: String,
    pub index: usize,
    pub start_line: usize,
    pub end_line: usize,

    /// Raw text of the range
    pub text: String,

    /// Line-numbered text with code fences collapsed to placeholders
    pub rendered: String,

    pub token_estimate: usize,

    /// Enclosing headings, outermost first
    pub heading_path: Vec<String>,

    pub code_blocks: Vec<CodeAttachment>,

    pub fingerprint: Fingerprint,
}

impl Chunk {
    pub fn contains_line(&self, line: usize) -> bool {
        line >= self.start_line && line <= self.end_line
    }
}

/// Splits documents into chunks near a token target
#[derive(Debug, Clone)]
pub struct Chunker {
    target_tokens: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(2000)
    }
}

impl Chunker {
    pub fn new(target_tokens: usize) -> Self {
        Self {
            target_tokens: target_tokens.max(1),
        }
    }

    /// Chunk a parsed document
    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        let total = doc.line_count();
        if total == 0 {
            return Vec::new();
        }

        // Prefix sums of characters per line, counting the newline
        let mut prefix = vec![0usize; total + 1];
        for (idx, line) in doc.lines.iter().enumerate() {
            prefix[idx + 1] = prefix[idx] + line.chars().count() + 1;
        }
        let tokens = |start: usize, end: usize| (prefix[end] - prefix[start - 1]).div_ceil(CHARS_PER_TOKEN);

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for (start, end) in sections(doc) {
            if let Some((cur_start, _)) = current {
                if tokens(cur_start, end) <= self.target_tokens {
                    current = Some((cur_start, end));
                    continue;
                }
                ranges.push((cur_start, start - 1));
                current = None;
            }

            if tokens(start, end) > self.target_tokens {
                ranges.extend(self.split_section(doc, start, end, &tokens));
            } else {
                current = Some((start, end));
            }
        }
        if let Some(range) = current {
            ranges.push(range);
        }

        ranges
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| build_chunk(doc, index, start, end, tokens(start, end)))
            .collect()
    }

    fn split_section<F>(&self, doc: &Document, start: usize, end: usize, tokens: &F) -> Vec<(usize, usize)>
    where
        F: Fn(usize, usize) -> usize,
    {
        let mut units = Vec::new();
        let mut unit_start = start;
        let mut line = start;

        while line <= end {
            if let Some(fence) = doc.fence_at(line) {
                line = fence.end_line.min(end) + 1;
                continue;
            }
            if doc.lines[line - 1].trim().is_empty() {
                units.push((unit_start, line));
                unit_start = line + 1;
            }
            line += 1;
        }
        if unit_start <= end {
            units.push((unit_start, end));
        }

        let mut pieces = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        for (u_start, u_end) in units {
            current = match current {
                Some((c_start, _)) if tokens(c_start, u_end) <= self.target_tokens => Some((c_start, u_end)),
                Some(piece) => {
                    pieces.push(piece);
                    Some((u_start, u_end))
                }
                None => Some((u_start, u_end)),
            };
        }
        if let Some(piece) = current {
            pieces.push(piece);
        }
        pieces
    }
}

/// Section ranges split at H2/H3 headings
fn sections(doc: &Document) -> Vec<(usize, usize)> {
    let mut starts: Vec<usize> = std::iter::once(1)
        .chain(
            doc.structure
                .headings
                .iter()
                .filter(|h| h.level == 2 || h.level == 3)
                .map(|h| h.line),
        )
        .collect();
    starts.sort_unstable();
    starts.dedup();

    let total = doc.line_count();
    starts
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let end = starts.get(i + 1).map(|next| next - 1).unwrap_or(total);
            (s, end)
        })
        .collect()
}

fn build_chunk(doc: &Document, index: usize, start: usize, end: usize, token_estimate: usize) -> Chunk {
    let mut rendered = Vec::new();
    let mut code_blocks = Vec::new();

    for line in start..=end {
        match doc
            .structure
            .code_fences
            .iter()
            .enumerate()
            .find(|(_, f)| f.contains(line))
        {
            Some((idx, fence)) if fence.start_line == line => {
                let lang = fence.lang.clone().unwrap_or_else(|| "text".to_string());
                rendered.push(format!("{:>5}| [CODE BLOCK {}: {}]", line, idx + 1, lang));
                code_blocks.push(CodeAttachment {
                    id: idx + 1,
                    lang: fence.lang.clone(),
                    start_line: fence.start_line,
                    body: fence.body.join("\n"),
                });
            }
            Some(_) => {}
            None => rendered.push(format!("{:>5}| {}", line, doc.lines[line - 1])),
        }
    }

    Chunk {
        document: doc.path.clone(),
        index,
        start_line: start,
        end_line: end,
        text: doc.text(start, end),
        rendered: rendered.join("\n"),
        token_estimate,
        heading_path: heading_path(doc, start),
        code_blocks,
        fingerprint: Fingerprint::new(doc.blob_hash.clone(), start, end),
    }
}

fn heading_path(doc: &Document, line: usize) -> Vec<String> {
    let mut stack: Vec<(u8, String)> = Vec::new();
    for heading in doc.structure.headings.iter().take_while(|h| h.line <= line) {
        while stack.last().is_some_and(|(level, _)| *level >= heading.level) {
            stack.pop();
        }
        stack.push((heading.level, heading.text.clone()));
    }
    stack.into_iter().map(|(_, text)| text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(doc: &Document, chunks: &[Chunk]) {
        assert_eq!(chunks.first().unwrap().start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, doc.line_count());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_line + 1, pair[1].start_line);
        }
    }

    #[test]
    fn test_small_document_is_one_chunk() {
        let doc = Document::parse("a.md", "# Title\n\nIntro.\n\n## Setup\n\nSteps.\n").unwrap();
        let chunks = Chunker::new(2000).chunk(&doc);

        assert_eq!(chunks.len(), 1);
        assert_covers(&doc, &chunks);
    }

    #[test]
    fn test_splits_at_section_boundaries() {
        let body = "word ".repeat(60);
        let content = format!("# T\n\n{body}\n\n## One\n\n{body}\n\n## Two\n\n{body}\n\n### Three\n\n{body}\n");
        let doc = Document::parse("a.md", &content).unwrap();
        let chunks = Chunker::new(100).chunk(&doc);

        assert_eq!(chunks.len(), 4);
        assert_covers(&doc, &chunks);
        assert_eq!(chunks[1].start_line, 5);
        assert_eq!(chunks[3].heading_path, vec!["T", "Two", "Three"]);
    }

    #[test]
    fn test_never_splits_inside_fence() {
        let para = "text ".repeat(30);
        let code: String = (0..40).map(|i| format!("print({i})\n")).collect();
        let content = format!("# T\n\n{para}\n\n```python\n{code}```\n\n{para}\n");
        let doc = Document::parse("a.md", &content).unwrap();
        let fence = doc.structure.code_fences[0].clone();

        let chunks = Chunker::new(40).chunk(&doc);
        assert_covers(&doc, &chunks);
        assert!(chunks
            .iter()
            .any(|c| c.start_line <= fence.start_line && c.end_line >= fence.end_line));
    }

    #[test]
    fn test_rendered_uses_placeholders() {
        let doc = Document::parse("a.md", "# T\n\n```bash\nwandb login\n```\n").unwrap();
        let chunk = &Chunker::default().chunk(&doc)[0];

        assert!(chunk.rendered.contains("[CODE BLOCK 1: bash]"));
        assert!(!chunk.rendered.contains("wandb login"));
        assert_eq!(chunk.code_blocks[0].body, "wandb login");
        assert_eq!(chunk.fingerprint, Fingerprint::new(doc.blob_hash.clone(), 1, 5));
    }

    #[test]
    fn test_empty_document() {
        let doc = Document::parse("empty.md", "").unwrap();
        assert!(Chunker::default().chunk(&doc).is_empty());
    }
}
