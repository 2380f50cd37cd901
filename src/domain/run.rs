//! Analysis run state and reconstruction from events.
//!
//! An `AnalysisRun` is one pipeline execution over a commit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{RunEvent, RunEventType};

/// What triggered a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    #[default]
    Manual,
    Scheduled,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Sync,
    Chunk,
    Rules,
    Retrieval,
    Llm,
    Merge,
    Verify,
    Persist,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sync => "sync",
            Self::Chunk => "chunk",
            Self::Rules => "rules",
            Self::Retrieval => "retrieval",
            Self::Llm => "llm",
            Self::Merge => "merge",
            Self::Verify => "verify",
            Self::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// Aggregate counters for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub files_analyzed: u64,
    pub files_unchanged: u64,
    pub files_failed: u64,
    pub chunks_total: u64,
    pub chunks_llm: u64,
    pub chunks_skipped: u64,
    pub issues_found: u64,
    pub issues_new: u64,
    pub issues_resolved: u64,
    pub link_checks: u64,
    pub link_failures: u64,
    pub llm_requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// One analysis pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub commit: Option<String>,
    pub source: RunSource,
    pub status: RunStatus,

    /// Last stage entered; for a failed run, where it stopped
    pub stage: Option<RunStage>,

    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    /// Link-based issues were suppressed for this run
    #[serde(default)]
    pub link_abort: bool,
}

impl AnalysisRun {
    pub fn new(id: Uuid, commit: Option<String>, source: RunSource) -> Self {
        Self {
            id,
            commit,
            source,
            status: RunStatus::Running,
            stage: None,
            stats: RunStats::default(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            link_abort: false,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[RunEvent]) -> Option<Self> {
        let first_event = events.first()?;
        let mut run = Self::new(first_event.run_id, None, RunSource::Manual);
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &RunEvent) {
        if let Some(ref stats) = event.stats {
            self.stats = stats.clone();
        }

        match event.event_type {
            RunEventType::RunStarted => {
                self.status = RunStatus::Running;
                self.started_at = event.timestamp;
                self.commit = event.commit.clone();
                if let Some(source) = event.source {
                    self.source = source;
                }
            }
            RunEventType::StageStarted => {
                self.stage = event.stage;
            }
            RunEventType::LinkAbort => {
                self.link_abort = true;
            }
            RunEventType::RunCompleted => {
                self.status = RunStatus::Success;
                self.completed_at = Some(event.timestamp);
            }
            RunEventType::RunFailed => {
                self.status = RunStatus::Failed;
                self.error = event.error.clone();
                self.completed_at = Some(event.timestamp);
            }
            RunEventType::StageCompleted
            | RunEventType::DocumentSkipped
            | RunEventType::ChunkSkipped
            | RunEventType::RetrievalDegraded
            | RunEventType::BudgetExhausted
            | RunEventType::Cancelled => {}
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}
