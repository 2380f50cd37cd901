//! JSON file issue store.
//!
//! One `state.json` holds documents, issues and runs. Every write goes to a
//! temp file that is renamed over the old state while an exclusive lock is
//! held on `state.json.lock`, so a crashed or concurrent writer never
//! leaves a half-written ledger. In-memory state only changes after the
//! write succeeds.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CommitBatch, DocumentRecord, IssueFilter, IssueStore};
use crate::domain::{AnalysisRun, Issue, IssueKey, RunStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    documents: BTreeMap<String, DocumentRecord>,
    #[serde(default)]
    issues: Vec<Issue>,
    #[serde(default)]
    runs: Vec<AnalysisRun>,
}

impl StoreState {
    fn upsert_issue(&mut self, issue: Issue) {
        match self.issues.iter_mut().find(|i| i.key() == issue.key()) {
            Some(existing) => *existing = issue,
            None => self.issues.push(issue),
        }
    }
}

pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open a store, creating an empty one when the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse issue store: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read issue store: {}", path.display()));
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `next` to disk, then make it the live state
    async fn replace(&self, current: &mut StoreState, next: StoreState) -> Result<()> {
        let path = self.path.clone();
        let json = serde_json::to_string_pretty(&next).context("Failed to serialize issue store")?;
        tokio::task::spawn_blocking(move || write_locked(&path, &json))
            .await
            .context("Issue store writer panicked")??;
        *current = next;
        Ok(())
    }
}

fn write_locked(path: &Path, json: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
    }

    let lock_path = path.with_extension("json.lock");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
    lock.lock_exclusive()
        .context("Failed to acquire issue store lock")?;

    let tmp = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
    file.write_all(json.as_bytes()).context("Failed to write issue store")?;
    file.sync_all().context("Failed to flush issue store")?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace issue store: {}", path.display()))?;

    // Lock is released when `lock` is dropped
    Ok(())
}

#[async_trait]
impl IssueStore for FileStore {
    async fn document(&self, path: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.state.lock().await.documents.get(path).cloned())
    }

    async fn flag_document(&self, path: &str, reason: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let record = next.documents.entry(path.to_string()).or_insert_with(|| DocumentRecord {
            path: path.to_string(),
            blob_hash: String::new(),
            title: None,
            last_commit: None,
            chunks: Vec::new(),
            needs_attention: None,
            updated_at: Utc::now(),
        });
        record.needs_attention = Some(reason);
        record.updated_at = Utc::now();
        self.replace(&mut state, next).await
    }

    async fn issue(&self, key: &IssueKey) -> Result<Option<Issue>> {
        let state = self.state.lock().await;
        Ok(state.issues.iter().find(|i| i.key() == key).cloned())
    }

    async fn find_issue(&self, id: &str) -> Result<Option<Issue>> {
        let state = self.state.lock().await;
        let matches: Vec<&Issue> = state.issues.iter().filter(|i| i.id().starts_with(id)).collect();
        match matches.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some((*one).clone())),
            many => match many.iter().find(|i| i.id() == id) {
                Some(exact) => Ok(Some((*exact).clone())),
                None => anyhow::bail!("Issue id '{}' is ambiguous ({} matches)", id, many.len()),
            },
        }
    }

    async fn issues_for_document(&self, path: &str) -> Result<Vec<Issue>> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .iter()
            .filter(|i| i.key().document == path)
            .cloned()
            .collect())
    }

    async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let state = self.state.lock().await;
        let mut issues: Vec<Issue> = state.issues.iter().filter(|i| filter.matches(i)).cloned().collect();
        issues.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(issues)
    }

    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let (issues, documents) = (batch.issues.len(), batch.documents.len());
        for issue in batch.issues {
            next.upsert_issue(issue);
        }
        for record in batch.documents {
            next.documents.insert(record.path.clone(), record);
        }
        self.replace(&mut state, next).await?;
        debug!(issues, documents, "Committed batch");
        Ok(())
    }

    async fn update_issue(&self, issue: Issue) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.upsert_issue(issue);
        self.replace(&mut state, next).await
    }

    async fn save_run(&self, run: &AnalysisRun) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        match next.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => next.runs.push(run.clone()),
        }
        self.replace(&mut state, next).await
    }

    async fn runs(&self, limit: usize) -> Result<Vec<AnalysisRun>> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn last_successful_run(&self) -> Result<Option<AnalysisRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .max_by_key(|r| r.started_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Finding, IssueState, Provenance, RuleCode, RunSource, Severity, SuggestionKind};
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn issue(line: usize) -> Issue {
        Issue::open(
            Finding {
                key: IssueKey {
                    document: "a.md".to_string(),
                    rule_code: RuleCode::LinkBroken,
                    line_start: line,
                    title: format!("Broken link {}", line),
                },
                kind: SuggestionKind::TextEdit,
                severity: Severity::Medium,
                confidence: 1.0,
                description: String::new(),
                line_end: line,
                original_snippet: String::new(),
                proposed_snippet: None,
                citations: BTreeSet::new(),
                tags: BTreeSet::new(),
                provenance: [Provenance::Rule].into_iter().collect(),
                evidence: BTreeMap::new(),
            },
            Uuid::new_v4(),
        )
    }

    fn record(path: &str, hash: &str) -> DocumentRecord {
        DocumentRecord {
            path: path.to_string(),
            blob_hash: hash.to_string(),
            title: None,
            last_commit: None,
            chunks: Vec::new(),
            needs_attention: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::open(&path).await.unwrap();
        store
            .commit(CommitBatch {
                issues: vec![issue(3), issue(7)],
                documents: vec![record("a.md", "h1")],
            })
            .await
            .unwrap();

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.issues_for_document("a.md").await.unwrap().len(), 2);
        assert_eq!(reopened.document("a.md").await.unwrap().unwrap().blob_hash, "h1");
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_update_replaces_by_key() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("state.json")).await.unwrap();
        let mut first = issue(3);
        store.update_issue(first.clone()).await.unwrap();

        first.transition(IssueState::Ignored).unwrap();
        store.update_issue(first.clone()).await.unwrap();

        let all = store.list_issues(&IssueFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, IssueState::Ignored);

        let found = store.find_issue(&first.id()[..6]).await.unwrap().unwrap();
        assert_eq!(found.key(), first.key());
    }

    #[tokio::test]
    async fn test_flag_keeps_hash() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("state.json")).await.unwrap();
        store
            .commit(CommitBatch {
                issues: Vec::new(),
                documents: vec![record("a.md", "h1")],
            })
            .await
            .unwrap();

        store.flag_document("a.md", "unclosed fence".to_string()).await.unwrap();
        let doc = store.document("a.md").await.unwrap().unwrap();
        assert_eq!(doc.blob_hash, "h1");
        assert_eq!(doc.needs_attention.as_deref(), Some("unclosed fence"));
    }

    #[tokio::test]
    async fn test_runs_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("state.json")).await.unwrap();

        let mut older = AnalysisRun::new(Uuid::new_v4(), None, RunSource::Manual);
        older.started_at = Utc::now() - chrono::Duration::minutes(5);
        older.status = RunStatus::Success;
        let newer = AnalysisRun::new(Uuid::new_v4(), None, RunSource::Manual);
        store.save_run(&older).await.unwrap();
        store.save_run(&newer).await.unwrap();

        let runs = store.runs(10).await.unwrap();
        assert_eq!(runs[0].id, newer.id);
        assert_eq!(store.last_successful_run().await.unwrap().unwrap().id, older.id);
    }
}
