//! Suggestions, findings and durable issues.
//!
//! - `Suggestion`: one candidate edit from a rule analyzer or the LLM.
//!   Never mutated once handed to the merger.
//! - `Finding`: the merged content for one `IssueKey` in one run.
//! - `Issue`: the durable record reviewers see, carrying lifecycle state,
//!   run bookkeeping, the current patch and its verdict.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::patch::{Patch, VerifierVerdict};

/// Issue severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Closed set of rule codes produced by analyzers and the LLM engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleCode {
    LinkBroken,
    LinkUnreachable,
    LinkTimeout,
    SdkverMajor,
    SdkverMinor,
    ApiUnknown,
    ApiDeprecated,
    CliUnknown,
    CliDeprecated,
    StyleNoH1,
    StyleMultipleH1,
    StyleImgNoAlt,
    StyleTerminology,
    StyleCodeNoLang,
    LlmSpell,
    LlmGrammar,
    LlmClarity,
    LlmAccuracy,
    LlmConsistency,
    LlmUnsure,
}

impl RuleCode {
    /// Codes the LLM engine may emit
    pub const LLM: [RuleCode; 6] = [
        RuleCode::LlmSpell,
        RuleCode::LlmGrammar,
        RuleCode::LlmClarity,
        RuleCode::LlmAccuracy,
        RuleCode::LlmConsistency,
        RuleCode::LlmUnsure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinkBroken => "LINK_BROKEN",
            Self::LinkUnreachable => "LINK_UNREACHABLE",
            Self::LinkTimeout => "LINK_TIMEOUT",
            Self::SdkverMajor => "SDKVER_MAJOR",
            Self::SdkverMinor => "SDKVER_MINOR",
            Self::ApiUnknown => "API_UNKNOWN",
            Self::ApiDeprecated => "API_DEPRECATED",
            Self::CliUnknown => "CLI_UNKNOWN",
            Self::CliDeprecated => "CLI_DEPRECATED",
            Self::StyleNoH1 => "STYLE_NO_H1",
            Self::StyleMultipleH1 => "STYLE_MULTIPLE_H1",
            Self::StyleImgNoAlt => "STYLE_IMG_NO_ALT",
            Self::StyleTerminology => "STYLE_TERMINOLOGY",
            Self::StyleCodeNoLang => "STYLE_CODE_NO_LANG",
            Self::LlmSpell => "LLM_SPELL",
            Self::LlmGrammar => "LLM_GRAMMAR",
            Self::LlmClarity => "LLM_CLARITY",
            Self::LlmAccuracy => "LLM_ACCURACY",
            Self::LlmConsistency => "LLM_CONSISTENCY",
            Self::LlmUnsure => "LLM_UNSURE",
        }
    }

    /// Parse the wire form (`LLM_SPELL`, ...)
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    pub fn is_llm(&self) -> bool {
        Self::LLM.contains(self)
    }

    pub fn is_link(&self) -> bool {
        matches!(
            self,
            Self::LinkBroken | Self::LinkUnreachable | Self::LinkTimeout
        )
    }

    pub fn category(&self) -> IssueCategory {
        match self {
            Self::LinkBroken | Self::LinkUnreachable | Self::LinkTimeout => IssueCategory::Links,
            Self::SdkverMajor | Self::SdkverMinor => IssueCategory::Versions,
            Self::ApiUnknown | Self::ApiDeprecated | Self::CliUnknown | Self::CliDeprecated => {
                IssueCategory::References
            }
            Self::StyleNoH1
            | Self::StyleMultipleH1
            | Self::StyleImgNoAlt
            | Self::StyleTerminology
            | Self::StyleCodeNoLang
            | Self::LlmConsistency => IssueCategory::Style,
            Self::LlmSpell | Self::LlmGrammar | Self::LlmClarity => IssueCategory::Language,
            Self::LlmAccuracy | Self::LlmUnsure => IssueCategory::Accuracy,
        }
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping of rule codes, used for opt-in cross-provenance merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Links,
    Versions,
    References,
    Style,
    Language,
    Accuracy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationKind {
    /// A line range in a repository document
    Document,
    /// An entry in the API/CLI catalog
    Catalog,
    /// An external fact such as the latest released version
    Fact,
}

/// Reference to a fact backing a claim
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Citation {
    pub kind: CitationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Citation {
    pub fn document(path: impl Into<String>, line_start: usize, line_end: usize) -> Self {
        Self {
            kind: CitationKind::Document,
            path: Some(path.into()),
            line_start: Some(line_start),
            line_end: Some(line_end),
            source: None,
            key: None,
            value: None,
        }
    }

    pub fn catalog(source: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: CitationKind::Catalog,
            path: None,
            line_start: None,
            line_end: None,
            source: Some(source.into()),
            key: Some(key.into()),
            value: Some(value.into()),
        }
    }

    pub fn fact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: CitationKind::Fact,
            path: None,
            line_start: None,
            line_end: None,
            source: None,
            key: Some(key.into()),
            value: Some(value.into()),
        }
    }

    /// Whether the citation carries enough locator data to be checked
    pub fn is_checkable(&self) -> bool {
        match self.kind {
            CitationKind::Document => {
                self.path.is_some()
                    && matches!((self.line_start, self.line_end), (Some(s), Some(e)) if s >= 1 && s <= e)
            }
            CitationKind::Catalog | CitationKind::Fact => self.key.is_some() && self.value.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    TextEdit,
    CodeEdit,
    Delete,
    Insert,
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Rule,
    Llm,
}

/// Inclusive, 1-indexed line range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line_start: usize,
    pub line_end: usize,
}

impl Location {
    pub fn new(line_start: usize, line_end: usize) -> Self {
        Self {
            line_start,
            line_end: line_end.max(line_start),
        }
    }

    pub fn overlaps(&self, other: &Location) -> bool {
        self.line_start <= other.line_end && other.line_start <= self.line_end
    }
}

/// A candidate edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub document: String,
    pub kind: SuggestionKind,
    pub rule_code: RuleCode,
    pub severity: Severity,
    pub confidence: f64,
    pub title: String,
    pub description: String,
    pub location: Location,
    pub original_snippet: String,
    pub proposed_snippet: Option<String>,
    pub citations: Vec<Citation>,
    pub tags: Vec<String>,
    pub provenance: Provenance,
    pub evidence: BTreeMap<String, String>,
}

impl Suggestion {
    /// A rule finding with no proposed text yet
    pub fn rule(
        document: impl Into<String>,
        rule_code: RuleCode,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        location: Location,
        original_snippet: impl Into<String>,
    ) -> Self {
        Self {
            document: document.into(),
            kind: SuggestionKind::TextEdit,
            rule_code,
            severity,
            confidence: 1.0,
            title: title.into(),
            description: description.into(),
            location,
            original_snippet: original_snippet.into(),
            proposed_snippet: None,
            citations: Vec::new(),
            tags: Vec::new(),
            provenance: Provenance::Rule,
            evidence: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: SuggestionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_citation(mut self, citation: Citation) -> Self {
        self.citations.push(citation);
        self
    }

    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.evidence.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_proposed(mut self, proposed: impl Into<String>) -> Self {
        self.proposed_snippet = Some(proposed.into());
        self
    }

    pub fn key(&self) -> IssueKey {
        IssueKey {
            document: self.document.clone(),
            rule_code: self.rule_code,
            line_start: self.location.line_start,
            title: self.title.clone(),
        }
    }
}

/// Identity of an issue: (document, rule code, first line, title)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueKey {
    pub document: String,
    pub rule_code: RuleCode,
    pub line_start: usize,
    pub title: String,
}

impl IssueKey {
    /// Short display handle for the CLI. Identity comparisons use the key itself.
    pub fn short_id(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.document.as_str(),
            self.rule_code.as_str(),
            &self.line_start.to_string(),
            self.title.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..6])
    }
}

/// Merged content for one issue key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub key: IssueKey,
    pub kind: SuggestionKind,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
    pub line_end: usize,
    pub original_snippet: String,
    pub proposed_snippet: Option<String>,
    pub citations: BTreeSet<Citation>,
    pub tags: BTreeSet<String>,
    pub provenance: BTreeSet<Provenance>,
    pub evidence: BTreeMap<String, String>,
}

impl Finding {
    pub fn location(&self) -> Location {
        Location::new(self.key.line_start, self.line_end)
    }

    pub fn has_catalog_citation(&self) -> bool {
        self.citations.iter().any(|c| c.kind == CitationKind::Catalog)
    }

    /// Same snippet pair as another finding
    pub fn same_edit(&self, other: &Finding) -> bool {
        self.original_snippet == other.original_snippet
            && self.proposed_snippet == other.proposed_snippet
            && self.line_end == other.line_end
    }
}

/// Reviewer-facing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Acknowledged,
    Ignored,
    Resolved,
}

impl IssueState {
    pub fn can_transition_to(&self, to: IssueState) -> bool {
        use IssueState::*;
        matches!(
            (self, to),
            (Open, Acknowledged)
                | (Open, Ignored)
                | (Open, Resolved)
                | (Acknowledged, Ignored)
                | (Acknowledged, Resolved)
                | (Ignored, Open)
        )
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Ignored => "ignored",
            Self::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// Pull request state of the issue's patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    #[default]
    None,
    Opened,
    Merged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssueError {
    #[error("Invalid issue transition: {from} -> {to}")]
    InvalidTransition { from: IssueState, to: IssueState },
}

/// Durable issue record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(flatten)]
    pub finding: Finding,

    pub state: IssueState,
    #[serde(default)]
    pub pr_state: PrState,
    #[serde(default)]
    pub pr_url: Option<String>,

    pub patch: Option<Patch>,
    pub verdict: Option<VerifierVerdict>,

    pub first_seen_run: Uuid,
    pub last_seen_run: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    /// A new open issue first observed in `run_id`
    pub fn open(finding: Finding, run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            finding,
            state: IssueState::Open,
            pr_state: PrState::None,
            pr_url: None,
            patch: None,
            verdict: None,
            first_seen_run: run_id,
            last_seen_run: run_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> &IssueKey {
        &self.finding.key
    }

    pub fn id(&self) -> String {
        self.finding.key.short_id()
    }

    /// Fold a finding for the same key from a later run.
    ///
    /// Citations and tags are unioned and severity takes the maximum. The
    /// snippet pair is replaced by the newer one; when it changes, the
    /// patch and verdict are dropped so they get recomputed.
    pub fn absorb(&mut self, newer: Finding, run_id: Uuid) {
        let edit_changed = !self.finding.same_edit(&newer);

        let mut merged = newer;
        merged.severity = merged.severity.max(self.finding.severity);
        merged.confidence = merged.confidence.max(self.finding.confidence);
        merged.citations.extend(self.finding.citations.iter().cloned());
        merged.tags.extend(self.finding.tags.iter().cloned());
        merged.provenance.extend(self.finding.provenance.iter().copied());

        self.finding = merged;
        self.last_seen_run = run_id;
        self.updated_at = Utc::now();

        if edit_changed {
            self.patch = None;
            self.verdict = None;
        }
    }

    pub fn transition(&mut self, to: IssueState) -> Result<(), IssueError> {
        if !self.state.can_transition_to(to) {
            return Err(IssueError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether the issue still needs attention
    pub fn is_active(&self) -> bool {
        matches!(self.state, IssueState::Open | IssueState::Acknowledged)
    }

    pub fn can_auto_apply(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.can_auto_apply)
    }

    /// Description with the verifier's review note appended when blocked
    pub fn full_description(&self) -> String {
        match self.verdict.as_ref().and_then(|v| v.review_note()) {
            Some(note) => format!("{}\n\n{}", self.finding.description, note),
            None => self.finding.description.clone(),
        }
    }
}

/// Entry handed to the PR collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrEntry {
    pub issue_id: String,
    pub patch: Patch,
    pub can_auto_apply: bool,
}

/// Patches and verdicts for every active issue that has a patch
pub fn pr_batch(issues: &[Issue]) -> Vec<PrEntry> {
    issues
        .iter()
        .filter(|i| i.is_active())
        .filter_map(|i| {
            i.patch.as_ref().map(|patch| PrEntry {
                issue_id: i.id(),
                patch: patch.clone(),
                can_auto_apply: i.can_auto_apply(),
            })
        })
        .collect()
}
