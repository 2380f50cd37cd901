//! Core analysis logic.
//!
//! This module contains:
//! - Chunker: line-bounded document slices
//! - ContextBuilder: retrieval context per chunk
//! - IssueMerger: one finding per issue key
//! - formatter: mechanical proposed text and patch construction
//! - PatchVerifier: the six guards behind auto-apply
//! - BudgetTracker / RetryPolicy: run budget and transient retries
//! - RunLog: append-only run events
//! - Orchestrator: main execution engine

pub mod budget;
pub mod chunker;
pub mod event_store;
pub mod formatter;
pub mod merger;
pub mod orchestrator;
pub mod retrieval;
pub mod retry;
pub mod verifier;

// Re-export commonly used types
pub use budget::{BudgetLimits, BudgetTracker, BudgetViolation};
pub use chunker::{Chunk, Chunker};
pub use event_store::RunLog;
pub use merger::IssueMerger;
pub use orchestrator::{CancelToken, Collaborators, Orchestrator, RunRequest};
pub use retrieval::{ContextBuilder, ContextPacket};
pub use retry::RetryPolicy;
pub use verifier::PatchVerifier;
