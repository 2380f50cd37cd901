//! Pipeline Integration Tests
//!
//! End-to-end runs through the orchestrator with in-memory collaborators.

mod common;

use common::{all_issues, harness, harness_with, MemoryRepo, ScriptedLlm};
use docsqa::adapters::IssueStore;
use docsqa::config::DocsqaConfig;
use docsqa::core::RunLog;
use docsqa::domain::{GuardName, RuleCode, RunEventType, RunStatus, Severity, SuggestionKind};
use docsqa::{CancelToken, RunRequest};
use serde_json::json;

const INSTALL_DOC: &str = "# Install\n\n```bash\npip install wandb==0.10.0\n```\n";

#[tokio::test]
async fn test_version_drift_becomes_verified_issue() {
    let h = harness(MemoryRepo::with(&[("install.md", INSTALL_DOC)]), None).await;

    let run = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.commit.as_deref(), Some("c0ffee"));
    assert_eq!(run.stats.files_analyzed, 1);
    assert_eq!(run.stats.issues_new, 1);

    let issues = all_issues(&h.store).await;
    assert_eq!(issues.len(), 1);
    let issue = &issues[0];
    assert_eq!(issue.key().rule_code, RuleCode::SdkverMinor);
    assert_eq!(issue.key().line_start, 4);
    assert_eq!(issue.finding.severity, Severity::High);
    assert_eq!(issue.finding.kind, SuggestionKind::CodeEdit);
    assert_eq!(issue.finding.evidence.get("latest_version").map(String::as_str), Some("0.19.0"));
    assert!(issue.finding.has_catalog_citation());

    let patch = issue.patch.as_ref().unwrap();
    assert_eq!(patch.proposed, vec!["pip install wandb==0.19.0".to_string()]);
    assert!(issue.can_auto_apply(), "{:?}", issue.verdict);
}

#[tokio::test]
async fn test_uncited_llm_code_edit_is_kept_but_not_auto_applied() {
    let doc = "# Quickstart\n\nStart a run:\n\n```python\nrun = wandb.init(project=\"demo\")\n```\n";
    let reply = json!({
        "suggestions": [{
            "type": "code_edit",
            "rule_code": "LLM_ACCURACY",
            "severity": "medium",
            "confidence": 0.8,
            "title": "Missing job type",
            "description": "Runs in this guide are training runs.",
            "location": { "line_start": 6, "line_end": 6 },
            "original_snippet": "run = wandb.init(project=\"demo\")",
            "proposed_snippet": "run = wandb.init(project=\"demo\", job_type=\"train\")",
            "citations": [{ "type": "document", "path": "quickstart.md", "line_start": 5, "line_end": 7 }],
            "tags": ["accuracy"]
        }]
    });
    let llm = ScriptedLlm::replying(reply.to_string());
    let h = harness(MemoryRepo::with(&[("quickstart.md", doc)]), Some(llm.clone())).await;

    let run = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.stats.chunks_llm, 1);
    assert_eq!(run.stats.llm_requests, 1);
    assert_eq!(run.stats.tokens_in, 100);
    assert_eq!(llm.calls(), 1);

    let issues = all_issues(&h.store).await;
    assert_eq!(issues.len(), 1);
    let issue = &issues[0];
    assert_eq!(issue.key().rule_code, RuleCode::LlmAccuracy);
    assert!(issue.patch.is_some());
    assert!(!issue.can_auto_apply());
    let verdict = issue.verdict.as_ref().unwrap();
    assert!(verdict.failed_guards.contains(&GuardName::Catalog));
}

#[tokio::test]
async fn test_link_outage_fails_run_without_link_issues() {
    let mut doc = String::from("# Links\n\n");
    for i in 0..50 {
        let kind = if i < 20 { "broken" } else { "ok" };
        doc.push_str(&format!("- [page {i}](https://docs.example.com/{kind}/{i})\n"));
    }
    doc.push_str("\n```bash\npip install wandb==0.10.0\n```\n");

    let h = harness(MemoryRepo::with(&[("links.md", doc.as_str())]), None).await;
    let run = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.link_abort);
    assert_eq!(run.stats.link_checks, 50);
    assert_eq!(run.stats.link_failures, 20);
    assert!(run.error.as_deref().unwrap().contains("Link-check failure rate"));

    let issues = all_issues(&h.store).await;
    assert!(issues.iter().all(|i| !i.key().rule_code.is_link()));
    assert!(issues.iter().any(|i| i.key().rule_code == RuleCode::SdkverMinor));

    // Hash is not recorded, so the next run analyses the document again
    assert!(h.store.document("links.md").await.unwrap().is_none());

    let log = RunLog::open(h.dir.path().join("runs"), run.id).await.unwrap();
    assert_eq!(log.events_of_type(RunEventType::LinkAbort).await.unwrap().len(), 1);
    let stored = h.store.runs(1).await.unwrap();
    assert_eq!(stored[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_few_broken_links_are_reported() {
    let doc = "# Links\n\nSee [the docs](https://docs.example.com/broken/1) and [home](https://example.com/).\n";
    let h = harness(MemoryRepo::with(&[("links.md", doc)]), None).await;

    let run = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(!run.link_abort);
    assert_eq!(run.stats.link_checks, 2);

    let issues = all_issues(&h.store).await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].key().rule_code, RuleCode::LinkBroken);
    assert_eq!(issues[0].key().line_start, 3);
}

#[tokio::test]
async fn test_unchanged_rerun_is_a_no_op() {
    let llm = ScriptedLlm::silent();
    let h = harness(MemoryRepo::with(&[("install.md", INSTALL_DOC)]), Some(llm.clone())).await;

    let first = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.stats.issues_new, 1);
    let calls_after_first = llm.calls();
    assert_eq!(calls_after_first, 1);
    let before = all_issues(&h.store).await;

    let second = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.stats.files_unchanged, 1);
    assert_eq!(second.stats.files_analyzed, 0);
    assert_eq!(second.stats.issues_new, 0);
    assert_eq!(llm.calls(), calls_after_first);

    let after = all_issues(&h.store).await;
    assert_eq!(after.len(), before.len());
    assert_eq!(after[0].id(), before[0].id());
    assert_eq!(h.store.runs(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_disabling_llm_skips_provider() {
    let llm = ScriptedLlm::silent();
    let h = harness(MemoryRepo::with(&[("install.md", INSTALL_DOC)]), Some(llm.clone())).await;
    assert!(h.orchestrator.llm_available());

    let request = RunRequest {
        llm_enabled: false,
        ..Default::default()
    };
    let run = h.orchestrator.run(request, CancelToken::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(llm.calls(), 0);
    assert_eq!(run.stats.llm_requests, 0);
}

#[tokio::test]
async fn test_unparseable_document_is_flagged_and_skipped() {
    let broken = "# Broken\n\n```python\nprint('never closed')\n";
    let h = harness(
        MemoryRepo::with(&[("broken.md", broken), ("install.md", INSTALL_DOC)]),
        None,
    )
    .await;

    let run = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.stats.files_failed, 1);
    assert_eq!(run.stats.files_analyzed, 1);

    let flagged = h.store.document("broken.md").await.unwrap().unwrap();
    assert!(flagged.needs_attention.unwrap().contains("line 3"));
    assert!(h.store.issues_for_document("broken.md").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_persists_nothing() {
    let h = harness(MemoryRepo::with(&[("install.md", INSTALL_DOC)]), None).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let run = h.orchestrator.run(RunRequest::default(), cancel).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(all_issues(&h.store).await.is_empty());
    assert!(h.store.document("install.md").await.unwrap().is_none());

    let log = RunLog::open(h.dir.path().join("runs"), run.id).await.unwrap();
    assert_eq!(log.events_of_type(RunEventType::Cancelled).await.unwrap().len(), 1);
    let replayed = log.run().await.unwrap().unwrap();
    assert_eq!(replayed.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_cancel_during_link_checks_stops_requests() {
    let mut doc = String::from("# Links\n\n");
    for i in 0..50 {
        doc.push_str(&format!("- [site {i}](https://site{i}.example.com/)\n"));
    }

    let mut settings = DocsqaConfig::default();
    settings.links.concurrency = 1;
    let h = harness_with(MemoryRepo::with(&[("links.md", doc.as_str())]), None, settings).await;
    let cancel = CancelToken::new();
    h.links.cancel_on_first_request(cancel.clone());

    let run = h.orchestrator.run(RunRequest::default(), cancel).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(h.links.requests(), 1);
    assert!(all_issues(&h.store).await.is_empty());
    assert!(h.store.document("links.md").await.unwrap().is_none());

    let log = RunLog::open(h.dir.path().join("runs"), run.id).await.unwrap();
    assert_eq!(log.events_of_type(RunEventType::Cancelled).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_log_replays_to_returned_run() {
    let h = harness(MemoryRepo::with(&[("install.md", INSTALL_DOC)]), None).await;
    let run = h.orchestrator.run(RunRequest::default(), CancelToken::new()).await.unwrap();

    let runs = RunLog::list_runs(h.dir.path().join("runs")).await.unwrap();
    assert_eq!(runs, vec![run.id]);

    let log = RunLog::open(h.dir.path().join("runs"), run.id).await.unwrap();
    let replayed = log.run().await.unwrap().unwrap();
    assert_eq!(replayed.status, RunStatus::Success);
    assert_eq!(replayed.stats, run.stats);

    let stages: Vec<String> = log
        .events_of_type(RunEventType::StageStarted)
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.stage.map(|s| s.to_string()))
        .collect();
    assert_eq!(stages, vec!["sync", "chunk", "rules", "retrieval", "merge", "verify", "persist"]);
}
