//! docsqa - Documentation QA pipeline
//!
//! Analyzes a documentation repository for broken links, version drift,
//! stale API/CLI references, style problems and LLM-reported issues, and
//! turns every finding into a minimal patch with a safety verdict.
//!
//! # Architecture
//!
//! One analysis run moves changed documents through a fixed pipeline:
//! - Documents are chunked and checked by the rule analyzers
//! - Chunks get retrieval context and go to the LLM engine
//! - Candidates merge into issues keyed by (document, rule, line, title)
//! - Each issue's patch passes six independent guards before auto-apply
//!
//! Run state is event-sourced: every stage boundary is an event in an
//! append-only log and the run summary is rebuilt by replaying it.
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits and default implementations
//! - `analyzers`: Rule Analyzer Set (links, versions, API/CLI, style)
//! - `catalog`: API/CLI catalogs and the latest-version fact
//! - `core`: Chunker, retrieval, merger, verifier, orchestrator
//! - `domain`: Data structures (Document, Issue, Patch, AnalysisRun)
//! - `llm`: Response schema, prompts, suggestion engine
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Analyze the documentation tree
//! docsqa run
//!
//! # Review what was found
//! docsqa issues --state open
//! ```

pub mod adapters;
pub mod analyzers;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod llm;

// Re-export main types at crate root for convenience
pub use core::{CancelToken, Orchestrator, RunRequest};
pub use domain::{AnalysisRun, Document, Issue, IssueKey, Patch, RunEvent, RunEventType, VerifierVerdict};
