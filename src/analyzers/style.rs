//! Style and terminology checks.
//!
//! Structural rules look at the parsed document; terminology runs over
//! prose lines only, with inline code, link targets and URLs masked out.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::config::{StyleConfig, TerminologyConfig};
use crate::domain::{bare_url_re, Document, Location, RuleCode, Severity, Suggestion, SuggestionKind};

/// A canonical term and the variants that should be replaced by it
#[derive(Debug, Clone)]
pub struct TermRule {
    pub preferred: String,
    pub variants: Vec<String>,
    pattern: Regex,
}

impl TermRule {
    /// Parse `"Preferred|variant|variant"`; the first entry is canonical
    pub fn parse(entry: &str) -> Option<Self> {
        let mut forms: Vec<String> = entry
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if forms.is_empty() {
            return None;
        }
        let preferred = forms.remove(0);

        let mut alternatives: Vec<&String> = std::iter::once(&preferred).chain(forms.iter()).collect();
        alternatives.sort_by_key(|term| std::cmp::Reverse(term.len()));
        let source = alternatives
            .iter()
            .map(|term| bounded(term))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&source).case_insensitive(true).build().ok()?;

        Some(Self {
            preferred,
            variants: forms,
            pattern,
        })
    }

    /// Non-canonical occurrences in a (masked) line: byte offset and text
    pub fn find<'a>(&self, line: &'a str) -> Vec<(usize, &'a str)> {
        self.pattern
            .find_iter(line)
            .filter(|m| m.as_str() != self.preferred)
            .map(|m| (m.start(), m.as_str()))
            .collect()
    }
}

/// Escaped term with word boundaries where the term edge is a word character
fn bounded(term: &str) -> String {
    let is_word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
    let mut out = String::new();
    if is_word(term.chars().next()) {
        out.push_str(r"\b");
    }
    out.push_str(&regex::escape(term));
    if is_word(term.chars().last()) {
        out.push_str(r"\b");
    }
    out
}

pub fn parse_terms(settings: &TerminologyConfig) -> Vec<TermRule> {
    settings.canonical.iter().filter_map(|e| TermRule::parse(e)).collect()
}

fn link_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\]\([^)]*\)").expect("link target regex is valid"))
}

fn inline_code_span_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`[^`]*`").expect("inline code regex is valid"))
}

/// Blank out spans that are not prose, keeping byte offsets stable
fn mask_non_prose(line: &str) -> String {
    let mut masked = line.to_string();
    for re in [inline_code_span_re(), link_target_re(), bare_url_re()] {
        let ranges: Vec<_> = re.find_iter(&masked).map(|m| m.range()).collect();
        for range in ranges {
            let blank = " ".repeat(range.len());
            masked.replace_range(range, &blank);
        }
    }
    masked
}

/// Guess a fence language from its body
pub fn infer_language(body: &[String]) -> Option<&'static str> {
    let content = body.join("\n");
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let first = lower.lines().next().unwrap_or_default().trim();

    if lower.contains("import ") || lower.contains("def ") || lower.contains("print(") {
        Some("python")
    } else if first.starts_with("#!/bin/")
        || first.starts_with('$')
        || ["pip ", "conda ", "wandb ", "export ", "cd ", "git "]
            .iter()
            .any(|p| first.starts_with(p))
    {
        Some("bash")
    } else if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']') && trimmed.contains('"'))
    {
        Some("json")
    } else if lower.contains("const ") || lower.contains("npm ") || lower.contains("yarn ") {
        Some("javascript")
    } else if trimmed.lines().all(looks_like_yaml) {
        Some("yaml")
    } else {
        None
    }
}

fn looks_like_yaml(line: &str) -> bool {
    let line = line.trim();
    line.is_empty()
        || line.starts_with('#')
        || line.starts_with("- ")
        || line.contains(": ")
        || line.ends_with(':')
}

/// Run every style check enabled in the settings
pub fn analyze(doc: &Document, settings: &StyleConfig, terms: &[TermRule]) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    if settings.require_one_h1 {
        suggestions.extend(check_h1(doc));
    }
    if settings.require_img_alt {
        suggestions.extend(check_image_alt(doc));
    }
    suggestions.extend(check_terminology(doc, terms));
    suggestions.extend(check_code_lang(doc));
    suggestions
}

fn check_h1(doc: &Document) -> Vec<Suggestion> {
    let h1s: Vec<_> = doc.structure.headings.iter().filter(|h| h.level == 1).collect();
    let front_matter_title = doc.front_matter_end > 0 && doc.title.is_some();

    if h1s.is_empty() && !front_matter_title {
        let first = doc.front_matter_end + 1;
        return vec![Suggestion::rule(
            doc.path.clone(),
            RuleCode::StyleNoH1,
            Severity::Medium,
            "Missing H1 heading",
            "Document should have exactly one top-level heading.",
            Location::new(first, first),
            doc.line(first).unwrap_or_default(),
        )
        .with_evidence("h1_count", "0")];
    }

    h1s.iter()
        .skip(1)
        .map(|heading| {
            Suggestion::rule(
                doc.path.clone(),
                RuleCode::StyleMultipleH1,
                Severity::Low,
                format!("Extra H1 heading: {}", heading.text),
                format!(
                    "Document has {} top-level headings; use H2 for '{}'.",
                    h1s.len(),
                    heading.text
                ),
                Location::new(heading.line, heading.line),
                doc.line(heading.line).unwrap_or_default(),
            )
            .with_evidence("heading_text", heading.text.clone())
            .with_evidence("h1_count", h1s.len().to_string())
        })
        .collect()
}

fn check_image_alt(doc: &Document) -> Vec<Suggestion> {
    doc.structure
        .images
        .iter()
        .filter(|img| img.alt.trim().is_empty())
        .map(|img| {
            Suggestion::rule(
                doc.path.clone(),
                RuleCode::StyleImgNoAlt,
                Severity::Medium,
                format!("Image missing alt text: {}", img.src),
                format!("Image '{}' has no alt text.", img.src),
                Location::new(img.line, img.line),
                doc.line(img.line).unwrap_or_default(),
            )
            .with_evidence("image_url", img.src.clone())
        })
        .collect()
}

fn check_terminology(doc: &Document, terms: &[TermRule]) -> Vec<Suggestion> {
    if terms.is_empty() {
        return Vec::new();
    }

    let mut suggestions = Vec::new();
    for (idx, line) in doc.lines.iter().enumerate() {
        let line_no = idx + 1;
        if doc.is_code_line(line_no) {
            continue;
        }
        let masked = mask_non_prose(line);
        for term in terms {
            for (column, found) in term.find(&masked) {
                suggestions.push(
                    Suggestion::rule(
                        doc.path.clone(),
                        RuleCode::StyleTerminology,
                        Severity::Low,
                        format!("Use '{}' instead of '{}'", term.preferred, found),
                        format!(
                            "Use the canonical term '{}' instead of '{}'.",
                            term.preferred, found
                        ),
                        Location::new(line_no, line_no),
                        line.clone(),
                    )
                    .with_evidence("found_term", found)
                    .with_evidence("preferred_term", term.preferred.clone())
                    .with_evidence("column", column.to_string()),
                );
            }
        }
    }
    suggestions
}

fn check_code_lang(doc: &Document) -> Vec<Suggestion> {
    doc.structure
        .code_fences
        .iter()
        .filter(|fence| fence.lang.is_none())
        .filter_map(|fence| {
            let lang = infer_language(&fence.body)?;
            Some(
                Suggestion::rule(
                    doc.path.clone(),
                    RuleCode::StyleCodeNoLang,
                    Severity::Low,
                    "Code block missing language",
                    format!("Code block has no language tag; its content looks like {}.", lang),
                    Location::new(fence.start_line, fence.start_line),
                    doc.line(fence.start_line).unwrap_or_default(),
                )
                .with_kind(SuggestionKind::CodeEdit)
                .with_evidence("inferred_lang", lang),
            )
        })
        .collect()
}
