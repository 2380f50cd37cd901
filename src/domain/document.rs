//! Parsed markdown documents.
//!
//! A document is identified by its path and content hash. Parsing records
//! the structural elements the analyzers and the patch verifier look at:
//! - Headings (ATX style, outside code fences)
//! - Code fences (``` or ~~~, with language)
//! - Markdown links and bare URLs
//! - Images
//! - Inline code spans
//!
//! A document is immutable once parsed; a content change produces a new
//! blob hash and therefore a new `Document`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Structural parse failures. These are never repaired silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unbalanced code fence opened at line {line}")]
    UnbalancedFence { line: usize },
}

/// A parsed markdown document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Repository-relative path
    pub path: String,

    /// SHA-256 hex of the raw content
    pub blob_hash: String,

    /// Title from front matter, or the first H1
    pub title: Option<String>,

    /// Raw lines (line N is `lines[N - 1]`)
    pub lines: Vec<String>,

    /// Last line of the YAML front matter block, 0 if there is none
    pub front_matter_end: usize,

    /// Structural elements of the body
    pub structure: Structure,
}

impl Document {
    /// Parse a document from raw content
    pub fn parse(path: impl Into<String>, content: &str) -> Result<Self, ParseError> {
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let front_matter_end = front_matter_end(&lines);
        let body = &lines[front_matter_end..];
        let structure = Structure::scan(body, front_matter_end + 1)?;

        let title = front_matter_title(&lines[..front_matter_end]).or_else(|| {
            structure
                .headings
                .iter()
                .find(|h| h.level == 1)
                .map(|h| h.text.clone())
        });

        Ok(Self {
            path: path.into(),
            blob_hash: blob_hash(content),
            title,
            lines,
            front_matter_end,
            structure,
        })
    }

    /// Number of lines in the document
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Get a single line (1-indexed)
    pub fn line(&self, line: usize) -> Option<&str> {
        line.checked_sub(1)
            .and_then(|idx| self.lines.get(idx))
            .map(String::as_str)
    }

    /// Get an inclusive 1-indexed line range, clamped to the document
    pub fn slice(&self, start: usize, end: usize) -> &[String] {
        let start = start.max(1).min(self.lines.len() + 1);
        let end = end.min(self.lines.len());
        if start > end {
            return &[];
        }
        &self.lines[start - 1..end]
    }

    /// Join an inclusive line range into text
    pub fn text(&self, start: usize, end: usize) -> String {
        self.slice(start, end).join("\n")
    }

    /// The code fence containing a line, if any
    pub fn fence_at(&self, line: usize) -> Option<&CodeFence> {
        self.structure.code_fences.iter().find(|f| f.contains(line))
    }

    /// Whether a line sits inside front matter or a code fence
    pub fn is_code_line(&self, line: usize) -> bool {
        line <= self.front_matter_end || self.fence_at(line).is_some()
    }
}

/// SHA-256 hex of document content
pub fn blob_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn front_matter_end(lines: &[String]) -> usize {
    if lines.first().map(|l| l.trim_end()) != Some("---") {
        return 0;
    }
    lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, l)| matches!(l.trim_end(), "---" | "..."))
        .map(|(idx, _)| idx + 1)
        .unwrap_or(0)
}

fn front_matter_title(lines: &[String]) -> Option<String> {
    if lines.len() < 2 {
        return None;
    }
    let yaml = lines[1..lines.len() - 1].join("\n");
    let value: serde_yaml::Value = serde_yaml::from_str(&yaml).ok()?;
    value.get("title")?.as_str().map(str::to_string)
}

/// Cache key for a chunk: document hash plus line range
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint {
    pub blob_hash: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl Fingerprint {
    pub fn new(blob_hash: impl Into<String>, start_line: usize, end_line: usize) -> Self {
        Self {
            blob_hash: blob_hash.into(),
            start_line,
            end_line,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.blob_hash, self.start_line, self.end_line)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (hash, range) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid fingerprint: {}", value))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| format!("Invalid fingerprint range: {}", value))?;
        let start_line = start
            .parse()
            .map_err(|_| format!("Invalid fingerprint start: {}", value))?;
        let end_line = end
            .parse()
            .map_err(|_| format!("Invalid fingerprint end: {}", value))?;
        Ok(Self::new(hash, start_line, end_line))
    }
}

/// An ATX heading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub line: usize,
}

/// A fenced code block, open and close lines inclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFence {
    pub lang: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub body: Vec<String>,
}

impl CodeFence {
    pub fn contains(&self, line: usize) -> bool {
        line >= self.start_line && line <= self.end_line
    }

    /// Line number of a body line by its index in `body`
    pub fn body_line(&self, idx: usize) -> usize {
        self.start_line + 1 + idx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// `[text](url)`
    Markdown,
    /// A URL in running text
    Bare,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub text: String,
    pub url: String,
    pub line: usize,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub alt: String,
    pub src: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineCode {
    pub code: String,
    pub line: usize,
}

/// Structural elements found in a run of lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub headings: Vec<Heading>,
    pub code_fences: Vec<CodeFence>,
    pub links: Vec<Link>,
    pub images: Vec<Image>,
    pub inline_code: Vec<InlineCode>,
}

struct OpenFence {
    marker: char,
    width: usize,
    lang: Option<String>,
    start_line: usize,
    body: Vec<String>,
}

impl Structure {
    /// Scan lines whose first element is line `first_line`.
    ///
    /// Works on whole documents and on snippets alike; the verifier uses it
    /// to compare original and proposed text.
    pub fn scan<S: AsRef<str>>(lines: &[S], first_line: usize) -> Result<Self, ParseError> {
        let mut structure = Self::default();
        let mut open: Option<OpenFence> = None;

        for (idx, raw) in lines.iter().enumerate() {
            let line_no = first_line + idx;
            let line = raw.as_ref();

            if let Some(fence) = open.as_mut() {
                if closes_fence(line, fence.marker, fence.width) {
                    if let Some(fence) = open.take() {
                        structure.code_fences.push(CodeFence {
                            lang: fence.lang,
                            start_line: fence.start_line,
                            end_line: line_no,
                            body: fence.body,
                        });
                    }
                } else {
                    fence.body.push(line.to_string());
                }
                continue;
            }

            if let Some((marker, width, lang)) = opens_fence(line) {
                open = Some(OpenFence {
                    marker,
                    width,
                    lang,
                    start_line: line_no,
                    body: Vec::new(),
                });
                continue;
            }

            if let Some(caps) = heading_re().captures(line) {
                let text = caps[2].trim_end_matches('#').trim_end().to_string();
                structure.headings.push(Heading {
                    level: caps[1].len() as u8,
                    text,
                    line: line_no,
                });
            }

            structure.scan_inline(line, line_no);
        }

        match open {
            Some(fence) => Err(ParseError::UnbalancedFence {
                line: fence.start_line,
            }),
            None => Ok(structure),
        }
    }

    fn scan_inline(&mut self, line: &str, line_no: usize) {
        let mut masked = line.to_string();

        for m in inline_code_re().captures_iter(line) {
            if let Some(code) = m.get(1) {
                self.inline_code.push(InlineCode {
                    code: code.as_str().to_string(),
                    line: line_no,
                });
            }
            if let Some(whole) = m.get(0) {
                mask(&mut masked, whole.start(), whole.end());
            }
        }

        let snapshot = masked.clone();
        for caps in markdown_link_re().captures_iter(&snapshot) {
            let Some(whole) = caps.get(0) else { continue };
            let is_image = !caps[1].is_empty();
            let text = caps[2].to_string();
            let target = caps[3].to_string();
            if is_image {
                self.images.push(Image {
                    alt: text,
                    src: target,
                    line: line_no,
                });
            } else {
                self.links.push(Link {
                    text,
                    url: target,
                    line: line_no,
                    kind: LinkKind::Markdown,
                });
            }
            mask(&mut masked, whole.start(), whole.end());
        }

        for m in bare_url_re().find_iter(&masked) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
            self.links.push(Link {
                text: String::new(),
                url: url.to_string(),
                line: line_no,
                kind: LinkKind::Bare,
            });
        }
    }

    /// All link targets, markdown and bare, in document order
    pub fn link_targets(&self) -> Vec<&str> {
        let mut links: Vec<&Link> = self.links.iter().collect();
        links.sort_by_key(|l| l.line);
        links.into_iter().map(|l| l.url.as_str()).collect()
    }
}

fn mask(s: &mut String, start: usize, end: usize) {
    s.replace_range(start..end, &" ".repeat(end - start));
}

fn opens_fence(line: &str) -> Option<(char, usize, Option<String>)> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let width = trimmed.chars().take_while(|c| *c == marker).count();
    if width < 3 {
        return None;
    }
    let info = trimmed[width..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    let lang = info.split_whitespace().next().map(str::to_string);
    Some((marker, width, lang))
}

fn closes_fence(line: &str, marker: char, width: usize) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed.chars().all(|c| c == marker)
        && trimmed.chars().count() >= width
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.+?)[ \t]*$").expect("heading regex is valid"))
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`]+)`").expect("inline code regex is valid"))
}

fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(!?)\[([^\]]*)\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#)
            .expect("markdown link regex is valid")
    })
}

/// Bare http(s) URL in running text
pub fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).expect("url regex is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "---\ntitle: Quickstart\n---\n# Quickstart\n\nSee [docs](https://docs.example.com/guide) and https://example.com/raw.\n\n![diagram](img/arch.png)\n\n```python\nimport wandb\n# not a heading\n```\n\n## Install\n\nRun `wandb login` first.\n";

    #[test]
    fn test_parse_structure() {
        let doc = Document::parse("docs/quickstart.md", SAMPLE).unwrap();

        assert_eq!(doc.title.as_deref(), Some("Quickstart"));
        assert_eq!(doc.front_matter_end, 3);
        assert_eq!(doc.structure.headings.len(), 2);
        assert_eq!(doc.structure.headings[0].line, 4);
        assert_eq!(doc.structure.headings[1].level, 2);

        let fence = &doc.structure.code_fences[0];
        assert_eq!(fence.lang.as_deref(), Some("python"));
        assert_eq!((fence.start_line, fence.end_line), (10, 13));
        assert!(doc.is_code_line(12));

        let urls = doc.structure.link_targets();
        assert_eq!(urls, vec!["https://docs.example.com/guide", "https://example.com/raw"]);
        assert_eq!(doc.structure.images[0].alt, "diagram");
        assert_eq!(doc.structure.inline_code[0].code, "wandb login");
    }

    #[test]
    fn test_unbalanced_fence_is_error() {
        let result = Document::parse("bad.md", "# T\n\n```bash\necho hi\n");
        assert_eq!(result.unwrap_err(), ParseError::UnbalancedFence { line: 3 });
    }

    #[test]
    fn test_longer_fence_needs_matching_close() {
        let content = "````\n```\ninner\n```\n````\n";
        let doc = Document::parse("nested.md", content).unwrap();
        assert_eq!(doc.structure.code_fences.len(), 1);
        assert_eq!(doc.structure.code_fences[0].body.len(), 3);
    }

    #[test]
    fn test_fingerprint_string_form() {
        let fp = Fingerprint::new("abc123", 4, 19);
        let s: String = fp.clone().into();
        assert_eq!(s, "abc123:4-19");
        assert_eq!(Fingerprint::try_from(s).unwrap(), fp);
    }

    #[test]
    fn test_blob_hash_changes_with_content() {
        assert_ne!(blob_hash("a"), blob_hash("b"));
        assert_eq!(blob_hash("a").len(), 64);
    }
}
