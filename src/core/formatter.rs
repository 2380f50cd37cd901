//! Proposed text for rule findings, and patch construction.
//!
//! Analyzers only report. This module turns a rule suggestion into a new
//! suggestion carrying a proposed snippet where the fix is mechanical:
//! - Version pins bumped to the latest release
//! - Deprecated symbols replaced by their catalog replacement
//! - Extra H1 headings demoted to H2
//! - Non-canonical terms replaced by the preferred form
//! - Unlabelled code fences given their inferred language
//!
//! `build_patch` anchors a finding's snippet pair in the document and
//! derives the minimal `Patch`.

use crate::domain::{Document, Finding, Patch, Provenance, RuleCode, Suggestion, SuggestionKind};

/// Return a copy of a rule suggestion with proposed text, when one is mechanical
pub fn format(suggestion: Suggestion) -> Suggestion {
    if suggestion.provenance != Provenance::Rule || suggestion.proposed_snippet.is_some() {
        return suggestion;
    }
    match proposed_text(&suggestion) {
        Some(proposed) if proposed != suggestion.original_snippet => suggestion.with_proposed(proposed),
        _ => suggestion,
    }
}

fn proposed_text(s: &Suggestion) -> Option<String> {
    let line = s.original_snippet.as_str();
    let evidence = |key: &str| s.evidence.get(key).map(String::as_str);
    let column = evidence("column").and_then(|c| c.parse::<usize>().ok());

    match s.rule_code {
        RuleCode::SdkverMajor | RuleCode::SdkverMinor => {
            replace_at(line, column, evidence("found_version")?, evidence("latest_version")?)
        }
        RuleCode::ApiDeprecated | RuleCode::CliDeprecated => {
            replace_at(line, None, evidence("symbol")?, evidence("replacement")?)
        }
        RuleCode::StyleMultipleH1 => {
            let hashes = line.find('#')?;
            let mut demoted = line.to_string();
            demoted.insert(hashes, '#');
            Some(demoted)
        }
        RuleCode::StyleTerminology => {
            replace_at(line, column, evidence("found_term")?, evidence("preferred_term")?)
        }
        RuleCode::StyleCodeNoLang => {
            let lang = evidence("inferred_lang")?;
            let trimmed = line.trim_end();
            let marker = trimmed.chars().last()?;
            if marker != '`' && marker != '~' {
                return None;
            }
            Some(format!("{}{}", trimmed, lang))
        }
        _ => None,
    }
}

/// Replace `from` with `to`, at `column` when the text there matches,
/// otherwise at the first occurrence
fn replace_at(line: &str, column: Option<usize>, from: &str, to: &str) -> Option<String> {
    if let Some(col) = column {
        if line.get(col..col + from.len()) == Some(from) {
            return Some(format!("{}{}{}", &line[..col], to, &line[col + from.len()..]));
        }
    }
    line.contains(from).then(|| line.replacen(from, to, 1))
}

/// Derive the patch for a finding, or `None` when it has no usable edit.
///
/// The original snippet is located at `line_start` first, then at the
/// nearest exact occurrence in the document, then (for one-line snippets)
/// as a substring of a line inside the finding's range.
pub fn build_patch(finding: &Finding, doc: &Document) -> Option<Patch> {
    if finding.kind == SuggestionKind::Question {
        return None;
    }
    let proposed_text = finding.proposed_snippet.as_ref()?;
    let line_start = finding.key.line_start;
    let line_end = finding.line_end;
    let proposed: Vec<String> = proposed_text.lines().map(str::to_string).collect();

    if finding.original_snippet.trim().is_empty() {
        // Pure insertion before line_start
        let patch = Patch::between(doc.path.clone(), line_start, line_end, line_start, Vec::new(), proposed);
        return (!patch.is_empty()).then_some(patch);
    }

    let original: Vec<String> = finding.original_snippet.lines().map(str::to_string).collect();
    let patch = match find_anchor(doc, &original, line_start) {
        Some(anchor) => {
            let actual = doc.slice(anchor, anchor + original.len() - 1).to_vec();
            Patch::between(doc.path.clone(), line_start, line_end, anchor, actual, proposed)
        }
        None => {
            let (line_no, line) = substring_line(doc, &finding.original_snippet, line_start, line_end)?;
            if proposed.len() > 1 {
                return None;
            }
            let replaced = line.replacen(finding.original_snippet.as_str(), proposed_text, 1);
            Patch::between(doc.path.clone(), line_start, line_end, line_no, vec![line.to_string()], vec![replaced])
        }
    };
    (!patch.is_empty()).then_some(patch)
}

fn find_anchor(doc: &Document, original: &[String], line_start: usize) -> Option<usize> {
    let n = original.len();
    if n == 0 || n > doc.line_count() {
        return None;
    }
    let matches_at = |anchor: usize, exact: bool| {
        doc.slice(anchor, anchor + n - 1)
            .iter()
            .zip(original)
            .all(|(a, b)| if exact { a == b } else { a.trim() == b.trim() })
    };

    for exact in [true, false] {
        if line_start >= 1 && line_start + n - 1 <= doc.line_count() && matches_at(line_start, exact) {
            return Some(line_start);
        }
        let nearest = (1..=doc.line_count() + 1 - n)
            .filter(|&anchor| matches_at(anchor, exact))
            .min_by_key(|&anchor| anchor.abs_diff(line_start));
        if nearest.is_some() {
            return nearest;
        }
    }
    None
}

fn substring_line<'a>(doc: &'a Document, snippet: &str, line_start: usize, line_end: usize) -> Option<(usize, &'a str)> {
    if snippet.contains('\n') {
        return None;
    }
    (line_start..=line_end)
        .filter_map(|n| doc.line(n).map(|line| (n, line)))
        .find(|(_, line)| line.contains(snippet))
}
