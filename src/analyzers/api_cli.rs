//! API and CLI reference validation.
//!
//! - API: `pkg.symbol` usages in code fences and inline code, looked up by
//!   the longest dotted prefix present in the API catalog
//! - CLI: `pkg <command>` at the start of shell lines in code fences
//!
//! Unknown references are only reported when the matching catalog has
//! entries; deprecation is reported whenever the entry says so.

use std::collections::BTreeSet;

use regex::Regex;

use crate::catalog::{CatalogKind, Catalogs};
use crate::domain::{CodeFence, Document, Location, RuleCode, Severity, Suggestion, SuggestionKind};

const SHELL_LANGS: &[&str] = &["bash", "sh", "shell", "console", "zsh", "shell-session", "terminal"];

/// How many similar catalog keys to offer for an unknown reference
const MAX_SIMILAR: usize = 3;

/// Package-specific reference patterns
#[derive(Debug, Clone)]
pub struct ReferenceMatcher {
    package: String,
    api_re: Regex,
    cli_re: Regex,
}

/// A reference found in a document
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub line: usize,
    pub kind: CatalogKind,
    /// Dotted symbol or `pkg command`
    pub text: String,
    pub in_fence: bool,
}

impl ReferenceMatcher {
    pub fn new(package: &str) -> Result<Self, regex::Error> {
        let pkg = regex::escape(package);
        Ok(Self {
            package: package.to_string(),
            api_re: Regex::new(&format!(r"(?:^|[^\w/.\-@:])({pkg}(?:\.[A-Za-z_]\w*)+)"))?,
            cli_re: Regex::new(&format!(r"^\s*(?:[$>]\s*)?({pkg}\s+[a-z][\w-]*)"))?,
        })
    }

    /// Dotted API symbols on a line
    pub fn api_symbols<'a>(&self, line: &'a str) -> Vec<&'a str> {
        self.api_re
            .captures_iter(line)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .collect()
    }

    /// `pkg command` at the start of a shell line
    pub fn cli_command(&self, line: &str) -> Option<String> {
        let caps = self.cli_re.captures(line)?;
        let text = caps.get(1)?.as_str();
        let command = text[self.package.len()..].trim();
        Some(format!("{} {}", self.package, command))
    }

    /// Every API and CLI reference in a document
    pub fn references(&self, doc: &Document) -> Vec<Reference> {
        let mut found = BTreeSet::new();

        for fence in &doc.structure.code_fences {
            let shell = is_shell(fence);
            for (idx, line) in fence.body.iter().enumerate() {
                let line_no = fence.body_line(idx);
                if shell || fence.lang.is_none() {
                    if let Some(command) = self.cli_command(line) {
                        found.insert(Reference {
                            line: line_no,
                            kind: CatalogKind::Cli,
                            text: command,
                            in_fence: true,
                        });
                        continue;
                    }
                }
                if shell {
                    continue;
                }
                for symbol in self.api_symbols(line) {
                    found.insert(Reference {
                        line: line_no,
                        kind: CatalogKind::Api,
                        text: symbol.to_string(),
                        in_fence: true,
                    });
                }
            }
        }

        for span in &doc.structure.inline_code {
            for symbol in self.api_symbols(&span.code) {
                found.insert(Reference {
                    line: span.line,
                    kind: CatalogKind::Api,
                    text: symbol.to_string(),
                    in_fence: false,
                });
            }
        }

        found.into_iter().collect()
    }
}

fn is_shell(fence: &CodeFence) -> bool {
    fence
        .lang
        .as_deref()
        .is_some_and(|lang| SHELL_LANGS.contains(&lang.to_ascii_lowercase().as_str()))
}

/// Longest dotted prefix of `symbol` present in the API catalog
fn catalog_key(catalogs: &Catalogs, symbol: &str) -> Option<String> {
    let parts: Vec<&str> = symbol.split('.').collect();
    (2..=parts.len())
        .rev()
        .map(|n| parts[..n].join("."))
        .find(|key| catalogs.lookup(CatalogKind::Api, key).is_some())
}

/// Catalog key a reference resolves to, if the catalog knows it
pub fn resolve_key(catalogs: &Catalogs, reference: &Reference) -> Option<String> {
    match reference.kind {
        CatalogKind::Api => catalog_key(catalogs, &reference.text),
        CatalogKind::Cli => catalogs
            .lookup(CatalogKind::Cli, &reference.text)
            .map(|_| reference.text.clone()),
    }
}

/// Report unknown and deprecated references
pub fn analyze(doc: &Document, matcher: &ReferenceMatcher, catalogs: &Catalogs) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();

    for reference in matcher.references(doc) {
        let key = resolve_key(catalogs, &reference);
        let (unknown_code, deprecated_code) = match reference.kind {
            CatalogKind::Api => (RuleCode::ApiUnknown, RuleCode::ApiDeprecated),
            CatalogKind::Cli => (RuleCode::CliUnknown, RuleCode::CliDeprecated),
        };
        let kind = if reference.in_fence {
            SuggestionKind::CodeEdit
        } else {
            SuggestionKind::TextEdit
        };
        let location = Location::new(reference.line, reference.line);
        let line_text = doc.line(reference.line).unwrap_or_default();

        match key {
            Some(key) => {
                let Some(entry) = catalogs.lookup(reference.kind, &key) else {
                    continue;
                };
                if !entry.deprecated {
                    continue;
                }
                let mut description = format!("{} `{}` is deprecated", reference.kind, key);
                if let Some(since) = &entry.deprecated_since {
                    description.push_str(&format!(" since {}", since));
                }
                if let Some(reason) = &entry.deprecation_reason {
                    description.push_str(&format!(": {}", reason));
                }
                description.push('.');
                if let Some(replacement) = &entry.replacement {
                    description.push_str(&format!(" Use `{}` instead.", replacement));
                }

                let mut suggestion = Suggestion::rule(
                    doc.path.clone(),
                    deprecated_code,
                    Severity::High,
                    format!("Deprecated {} {}", reference.kind, key),
                    description,
                    location,
                    line_text,
                )
                .with_kind(kind)
                .with_evidence("symbol", key.clone());
                if let Some(citation) = catalogs.citation(reference.kind, &key) {
                    suggestion = suggestion.with_citation(citation);
                }
                if let Some(replacement) = &entry.replacement {
                    suggestion = suggestion.with_evidence("replacement", replacement.clone());
                }
                suggestions.push(suggestion);
            }
            None if catalogs.is_loaded(reference.kind) => {
                let unknown = match reference.kind {
                    CatalogKind::Api => reference.text.split('.').take(2).collect::<Vec<_>>().join("."),
                    CatalogKind::Cli => reference.text.clone(),
                };
                let similar = catalogs.find_similar(reference.kind, &unknown, MAX_SIMILAR);
                let mut description = format!("{} `{}` is not in the {} catalog.", reference.kind, unknown, reference.kind);
                if !similar.is_empty() {
                    description.push_str(&format!(" Did you mean: {}?", similar.join(", ")));
                }

                let mut suggestion = Suggestion::rule(
                    doc.path.clone(),
                    unknown_code,
                    Severity::Medium,
                    format!("Unknown {} {}", reference.kind, unknown),
                    description,
                    location,
                    line_text,
                )
                .with_kind(kind)
                .with_evidence("symbol", unknown);
                if !similar.is_empty() {
                    suggestion = suggestion.with_evidence("did_you_mean", similar.join(", "));
                }
                suggestions.push(suggestion);
            }
            None => {}
        }
    }

    suggestions
}
