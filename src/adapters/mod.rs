//! Interfaces for external collaborators.
//!
//! The pipeline consumes every outside system through a trait here:
//! - `RepoSync`: changed documents at a commit
//! - `Embedder` + `VectorIndex`: nearest-neighbor lookup over chunks
//! - `LlmProvider`: prompt in, raw text out (validation happens in `llm`)
//! - `LinkResolver`: one HTTP probe per call
//! - `IssueStore`: documents, issues and runs
//! - `PrPublisher`: hands verified patches to a PR workflow
//!
//! Default implementations live in the submodules.

pub mod file_store;
pub mod fs_repo;
pub mod http_links;
pub mod memory_index;
pub mod openai;
pub mod pr_export;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AnalysisRun, Fingerprint, Issue, IssueKey, IssueState, PrEntry};

pub use file_store::FileStore;
pub use fs_repo::FsRepoSync;
pub use http_links::HttpLinkResolver;
pub use memory_index::{HashingEmbedder, InMemoryVectorIndex};
pub use openai::OpenAiProvider;
pub use pr_export::JsonPrExporter;

/// A document reported by repository sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedDocument {
    pub path: String,
    pub content: String,
    pub blob_hash: String,
}

#[async_trait]
pub trait RepoSync: Send + Sync {
    /// Documents changed since a commit (all documents when `None`)
    async fn changed_documents(&self, since_commit: Option<&str>) -> Result<Vec<ChangedDocument>>;

    /// Identifier of the state being analyzed
    async fn head_commit(&self) -> Result<Option<String>>;
}

/// What the index stores about a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub fingerprint: Fingerprint,
    pub document: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Leading text of the chunk
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub chunk: ChunkRef,
    pub score: f32,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, chunk: ChunkRef, vector: Vec<f32>) -> Result<()>;

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Write pending state to durable storage, if the index has any
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Raw completion plus usage as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Provider request failed: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_schema: &serde_json::Value,
    ) -> Result<Completion, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Request timed out")]
    Timeout,

    #[error("Host unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Fetch a URL and return the final HTTP status
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError>;
}

/// Stored state of one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: String,
    pub blob_hash: String,
    pub title: Option<String>,
    pub last_commit: Option<String>,
    /// Chunk fingerprints analyzed for this hash
    #[serde(default)]
    pub chunks: Vec<Fingerprint>,
    /// Set when the document needs manual attention (e.g. parse failure)
    #[serde(default)]
    pub needs_attention: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub document: Option<String>,
    pub state: Option<IssueState>,
    pub auto_apply_only: bool,
}

impl IssueFilter {
    pub fn matches(&self, issue: &Issue) -> bool {
        self.document
            .as_ref()
            .map_or(true, |d| &issue.finding.key.document == d)
            && self.state.map_or(true, |s| issue.state == s)
            && (!self.auto_apply_only || issue.can_auto_apply())
    }
}

/// Everything a successful stage of persistence writes at once
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub issues: Vec<Issue>,
    pub documents: Vec<DocumentRecord>,
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn document(&self, path: &str) -> Result<Option<DocumentRecord>>;

    /// Mark a document for manual attention without touching its hash
    async fn flag_document(&self, path: &str, reason: String) -> Result<()>;

    async fn issue(&self, key: &IssueKey) -> Result<Option<Issue>>;

    /// Look up by the short display id
    async fn find_issue(&self, id: &str) -> Result<Option<Issue>>;

    async fn issues_for_document(&self, path: &str) -> Result<Vec<Issue>>;

    async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>>;

    /// Persist a run's issues and document records atomically
    async fn commit(&self, batch: CommitBatch) -> Result<()>;

    async fn update_issue(&self, issue: Issue) -> Result<()>;

    async fn save_run(&self, run: &AnalysisRun) -> Result<()>;

    /// Most recent first
    async fn runs(&self, limit: usize) -> Result<Vec<AnalysisRun>>;

    async fn last_successful_run(&self) -> Result<Option<AnalysisRun>>;
}

#[async_trait]
pub trait PrPublisher: Send + Sync {
    /// Hand over patches and verdicts; returns a URL for the result
    async fn publish(&self, entries: &[PrEntry]) -> Result<String>;
}
