//! Domain types for docsqa.
//!
//! - Document: parsed markdown with structural elements
//! - Suggestion / Finding / Issue: candidate edits and the durable ledger
//! - Patch / VerifierVerdict: minimal diffs and their safety outcome
//! - AnalysisRun / RunEvent: pipeline executions, rebuilt from events

pub mod document;
pub mod events;
pub mod issue;
pub mod patch;
pub mod run;

pub use document::{
    bare_url_re, blob_hash, CodeFence, Document, Fingerprint, Heading, Image, InlineCode, Link, LinkKind,
    ParseError, Structure,
};
pub use events::{RunEvent, RunEventType};
pub use issue::{
    pr_batch, Citation, CitationKind, Finding, Issue, IssueCategory, IssueError, IssueKey,
    IssueState, Location, PrEntry, PrState, Provenance, RuleCode, Severity, Suggestion,
    SuggestionKind,
};
pub use patch::{GuardName, Hunk, Patch, PatchError, VerifierVerdict};
pub use run::{AnalysisRun, RunSource, RunStage, RunStats, RunStatus};
