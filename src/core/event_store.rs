//! Append-only run log with file-based persistence.
//!
//! Each run writes its events to `<runs_dir>/<run-id>/events.jsonl`, one
//! JSON object per line, so a run can be inspected with ordinary tools and
//! rebuilt with `AnalysisRun::from_events`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{AnalysisRun, RunEvent, RunEventType};

const EVENTS_FILE: &str = "events.jsonl";

/// Event log of one analysis run
pub struct RunLog {
    run_dir: PathBuf,
    events_path: PathBuf,
}

impl RunLog {
    /// Create or open the log for a run under `base_dir`
    pub async fn open(base_dir: impl AsRef<Path>, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.as_ref().join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self {
            events_path: run_dir.join(EVENTS_FILE),
            run_dir,
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &RunEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<RunEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent =
                serde_json::from_str(&line).with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Rebuild the run from its events
    pub async fn run(&self) -> Result<Option<AnalysisRun>> {
        Ok(AnalysisRun::from_events(&self.replay().await?))
    }

    /// Events of one type, in order
    pub async fn events_of_type(&self, event_type: RunEventType) -> Result<Vec<RunEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(|e| e.event_type == event_type).collect())
    }

    /// Run ids with a log under `base_dir`
    pub async fn list_runs(base_dir: impl AsRef<Path>) -> Result<Vec<Uuid>> {
        let base_dir = base_dir.as_ref();
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(uuid) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                    runs.push(uuid);
                }
            }
        }

        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunSource, RunStage, RunStats, RunStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let log = RunLog::open(temp.path(), run_id).await.unwrap();

        let started = RunEvent::new(run_id, None, RunEventType::RunStarted, "Run started".to_string())
            .with_trigger(Some("abc123".to_string()), RunSource::Webhook);
        let stage = RunEvent::new(run_id, Some(RunStage::Sync), RunEventType::StageStarted, "sync".to_string());

        log.append(&started).await.unwrap();
        log.append(&stage).await.unwrap();

        let events = log.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, RunEventType::RunStarted);
        assert_eq!(events[1].stage, Some(RunStage::Sync));
        assert!(log.events_path().ends_with("events.jsonl"));
    }

    #[tokio::test]
    async fn test_replay_order_and_filter() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let log = RunLog::open(temp.path(), run_id).await.unwrap();

        for i in 0..5 {
            let event = RunEvent::new(run_id, Some(RunStage::Llm), RunEventType::ChunkSkipped, format!("chunk {}", i))
                .with_document(format!("doc{}.md", i));
            log.append(&event).await.unwrap();
        }

        let skipped = log.events_of_type(RunEventType::ChunkSkipped).await.unwrap();
        assert_eq!(skipped.len(), 5);
        for (i, event) in skipped.iter().enumerate() {
            assert_eq!(event.document, Some(format!("doc{}.md", i)));
        }
        assert!(log.events_of_type(RunEventType::LinkAbort).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_rebuilt_from_log() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let log = RunLog::open(temp.path(), run_id).await.unwrap();

        log.append(&RunEvent::new(run_id, None, RunEventType::RunStarted, "start".to_string()))
            .await
            .unwrap();
        log.append(&RunEvent::new(run_id, Some(RunStage::Merge), RunEventType::StageStarted, "merge".to_string()))
            .await
            .unwrap();
        log.append(
            &RunEvent::new(run_id, None, RunEventType::RunCompleted, "done".to_string()).with_stats(RunStats {
                issues_found: 4,
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let run = log.run().await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.stage, Some(RunStage::Merge));
        assert_eq!(run.stats.issues_found, 4);
    }

    #[tokio::test]
    async fn test_list_runs() {
        let temp = TempDir::new().unwrap();
        assert!(RunLog::list_runs(temp.path().join("missing")).await.unwrap().is_empty());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        RunLog::open(temp.path(), a).await.unwrap();
        RunLog::open(temp.path(), b).await.unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();

        let runs = RunLog::list_runs(temp.path()).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.contains(&a) && runs.contains(&b));
    }
}
