//! Run events for the analysis log.
//!
//! Every state change of an analysis run is recorded as an immutable event
//! in an append-only log; the run itself is rebuilt by replaying them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{RunSource, RunStage, RunStats};

/// A single event in a run's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Pipeline stage, if the event is stage-scoped
    pub stage: Option<RunStage>,

    /// Type of event
    pub event_type: RunEventType,

    /// Human-readable summary (NO document content)
    pub summary: String,

    /// Document path for document-scoped events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,

    /// Input commit, recorded on `RunStarted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Trigger, recorded on `RunStarted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RunSource>,

    /// Stats snapshot at this point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,

    /// Time taken in milliseconds (for completed stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl RunEvent {
    /// Create a new event with the current timestamp
    pub fn new(run_id: Uuid, stage: Option<RunStage>, event_type: RunEventType, summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage,
            event_type,
            summary,
            document: None,
            commit: None,
            source: None,
            stats: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    pub fn with_trigger(mut self, commit: Option<String>, source: RunSource) -> Self {
        self.commit = commit;
        self.source = Some(source);
        self
    }

    pub fn with_stats(mut self, stats: RunStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during an analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    RunCompleted,
    RunFailed,

    StageStarted,
    StageCompleted,

    /// A document could not be parsed and was flagged
    DocumentSkipped,

    /// A chunk was dropped after an LLM schema or provider failure
    ChunkSkipped,

    /// The vector index was unavailable; neighbors were empty
    RetrievalDegraded,

    /// Link-check failure rate crossed the abort threshold
    LinkAbort,

    /// Token or request budget ran out; remaining LLM work was not dispatched
    BudgetExhausted,

    /// Cancellation was requested
    Cancelled,
}
