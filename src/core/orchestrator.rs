//! Analysis run orchestrator.
//!
//! Sequences one `AnalysisRun`:
//! - sync: changed documents, skipping unchanged blob hashes
//! - chunk: line-bounded chunks per parsed document
//! - rules: every enabled analyzer, then mechanical proposed text
//! - retrieval: index refresh for new chunk fingerprints
//! - llm: one request per chunk under the run budget
//! - merge: one finding per issue key, folded into stored issues
//! - verify: a patch and verdict for every detected issue
//! - persist: one atomic commit of issues and document records
//!
//! Every state change is an event in the run log; the stored run summary
//! is rebuilt from the same events. A cancelled run persists nothing and is
//! recorded as failed. A link-check outage suppresses link issues, skips the
//! document records and fails the run, but the other issues are kept.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    CommitBatch, DocumentRecord, Embedder, FileStore, FsRepoSync, HashingEmbedder, HttpLinkResolver,
    InMemoryVectorIndex, IssueStore, LinkResolver, LlmProvider, OpenAiProvider, RepoSync, VectorIndex,
};
use crate::analyzers::{AnalyzerSet, LinkChecker, ReferenceMatcher, RuleServices, VersionMatcher};
use crate::catalog::Catalogs;
use crate::config::{DocsqaConfig, ResolvedConfig};
use crate::domain::{
    AnalysisRun, Document, Issue, IssueKey, IssueState, PrState, RunEvent, RunEventType, RunSource, RunStage,
    Suggestion,
};
use crate::llm::{EngineError, SuggestionEngine, Usage};

use super::budget::{BudgetLimits, BudgetTracker};
use super::chunker::{Chunk, Chunker};
use super::event_store::RunLog;
use super::formatter;
use super::merger::IssueMerger;
use super::retrieval::ContextBuilder;
use super::verifier::PatchVerifier;

/// Vector index file inside the retrieval cache directory
const VECTOR_FILE: &str = "vectors.json";

/// Cloneable run cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching new work; in-flight requests finish or time out
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
#[error("Run cancelled")]
struct Cancelled;

/// Parameters of one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Commit to record; read from the repository when `None`
    pub commit: Option<String>,
    pub source: RunSource,
    /// Run the LLM stage (also requires a configured provider)
    pub llm_enabled: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            commit: None,
            source: RunSource::Manual,
            llm_enabled: true,
        }
    }
}

/// External systems the orchestrator drives
pub struct Collaborators {
    pub repo: Arc<dyn RepoSync>,
    pub store: Arc<dyn IssueStore>,
    pub links: Arc<dyn LinkResolver>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub llm: Option<Arc<dyn LlmProvider>>,
}

/// Run log plus the run state rebuilt from it
struct RunContext {
    log: RunLog,
    run: AnalysisRun,
}

impl RunContext {
    fn event(&self, stage: Option<RunStage>, event_type: RunEventType, summary: impl Into<String>) -> RunEvent {
        RunEvent::new(self.run.id, stage, event_type, summary.into())
    }

    async fn emit(&mut self, event: RunEvent) -> Result<()> {
        self.log.append(&event).await?;
        self.run.apply_event(&event);
        Ok(())
    }

    async fn begin(&mut self, stage: RunStage) -> Result<Instant> {
        info!(%stage, "Stage started");
        let event = self.event(Some(stage), RunEventType::StageStarted, format!("Stage '{}' started", stage));
        self.emit(event).await?;
        Ok(Instant::now())
    }

    async fn finish(&mut self, stage: RunStage, started: Instant, summary: String) -> Result<()> {
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(%stage, duration_ms, "{}", summary);
        let event = self
            .event(Some(stage), RunEventType::StageCompleted, summary)
            .with_stats(self.run.stats.clone())
            .with_duration(duration_ms);
        self.emit(event).await
    }
}

/// A document that passed sync and parsing
struct Analyzed {
    doc: Document,
    chunks: Vec<Chunk>,
    /// Rule suggestions, already formatted
    rules: Vec<Suggestion>,
}

/// Run-scoped services that share one link checker
struct RunServices {
    links: Arc<LinkChecker>,
    analyzers: AnalyzerSet,
    verifier: PatchVerifier,
}

enum ChunkOutcome {
    Suggested { suggestions: Vec<Suggestion>, usage: Usage, degraded: bool },
    Failed { error: EngineError, degraded: bool },
    BudgetExhausted,
    Cancelled,
}

/// Main analysis orchestrator
pub struct Orchestrator {
    settings: DocsqaConfig,
    runs_dir: PathBuf,
    catalogs: Arc<Catalogs>,
    repo: Arc<dyn RepoSync>,
    store: Arc<dyn IssueStore>,
    links: Arc<dyn LinkResolver>,
    retrieval: ContextBuilder,
    engine: Option<SuggestionEngine>,
    chunker: Chunker,
    merger: IssueMerger,
}

impl Orchestrator {
    pub fn new(
        settings: DocsqaConfig,
        catalogs: Arc<Catalogs>,
        runs_dir: impl Into<PathBuf>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let references =
            ReferenceMatcher::new(&settings.versions.package).context("Invalid versions.package")?;
        let retrieval = ContextBuilder::new(
            collaborators.embedder,
            collaborators.index,
            catalogs.clone(),
            references,
            &settings.retrieval,
        );
        let engine = collaborators
            .llm
            .filter(|_| settings.llm.enabled)
            .map(|provider| SuggestionEngine::new(provider, &settings.llm));

        Ok(Self {
            runs_dir: runs_dir.into(),
            catalogs,
            repo: collaborators.repo,
            store: collaborators.store,
            links: collaborators.links,
            retrieval,
            engine,
            chunker: Chunker::new(settings.chunking.target_tokens),
            merger: IssueMerger::new(&settings.merge),
            settings,
        })
    }

    /// Keep retrieval context between runs in `dir`
    pub async fn with_retrieval_cache(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        self.retrieval = self.retrieval.with_cache_dir(dir).await?;
        Ok(self)
    }

    /// Wire the default collaborators from configuration
    pub async fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let settings = config.settings.clone();
        let catalogs = Catalogs::load(
            &settings.versions.package,
            settings.versions.latest.clone(),
            config.api_catalog_path().as_deref(),
            config.cli_catalog_path().as_deref(),
        )
        .await?;

        let llm: Option<Arc<dyn LlmProvider>> = match config.llm_api_key() {
            Some(key) if settings.llm.enabled => Some(Arc::new(OpenAiProvider::new(&settings.llm, key)?)),
            _ => {
                if settings.llm.enabled {
                    warn!(env = %settings.llm.api_key_env, "No LLM API key found, LLM stage disabled");
                }
                None
            }
        };

        let cache_dir = config.retrieval_cache_dir();
        let collaborators = Collaborators {
            repo: Arc::new(FsRepoSync::new(config.repo_root(), &settings.repo)),
            store: Arc::new(FileStore::open(config.state_path()).await?),
            links: Arc::new(HttpLinkResolver::new()?),
            embedder: Arc::new(HashingEmbedder::new(settings.retrieval.embedding_dims)),
            index: Arc::new(InMemoryVectorIndex::open(cache_dir.join(VECTOR_FILE)).await?),
            llm,
        };

        Self::new(settings, Arc::new(catalogs), config.runs_dir(), collaborators)?
            .with_retrieval_cache(cache_dir)
            .await
    }

    pub fn store(&self) -> Arc<dyn IssueStore> {
        self.store.clone()
    }

    pub fn llm_available(&self) -> bool {
        self.engine.is_some()
    }

    /// Execute one analysis run. Pipeline failures are recorded on the
    /// returned run; `Err` means the run log or store itself failed.
    #[instrument(skip(self, request, cancel), fields(source = ?request.source))]
    pub async fn run(&self, request: RunRequest, cancel: CancelToken) -> Result<AnalysisRun> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "Starting analysis run");

        let commit = match request.commit.clone() {
            Some(commit) => Some(commit),
            None => self.repo.head_commit().await.unwrap_or_else(|e| {
                warn!(error = %e, "Could not read head commit");
                None
            }),
        };

        let log = RunLog::open(&self.runs_dir, run_id).await?;
        let mut ctx = RunContext {
            log,
            run: AnalysisRun::new(run_id, commit.clone(), request.source),
        };
        let start = ctx
            .event(None, RunEventType::RunStarted, format!("Analysis started at {}", commit.as_deref().unwrap_or("working tree")))
            .with_trigger(commit, request.source);
        ctx.emit(start).await?;
        self.store.save_run(&ctx.run).await?;

        match self.execute(&mut ctx, &request, &cancel).await {
            Ok(()) if ctx.run.link_abort => {
                let stats = ctx.run.stats.clone();
                let reason = format!(
                    "Link-check failure rate {}/{} exceeded {:.0}%",
                    stats.link_failures,
                    stats.link_checks,
                    self.settings.links.abort_failure_rate * 100.0
                );
                self.fail_run(&mut ctx, reason).await
            }
            Ok(()) => self.complete_run(&mut ctx).await,
            Err(e) => {
                if e.is::<Cancelled>() {
                    let event = ctx.event(ctx.run.stage, RunEventType::Cancelled, "Cancellation requested");
                    ctx.emit(event).await?;
                }
                self.fail_run(&mut ctx, format!("{:#}", e)).await
            }
        }
    }

    async fn execute(&self, ctx: &mut RunContext, request: &RunRequest, cancel: &CancelToken) -> Result<()> {
        let services = self.run_services(cancel)?;

        let documents = self.sync_stage(ctx, cancel).await?;
        let mut analyzed = self.chunk_stage(ctx, documents, cancel).await?;
        self.rules_stage(ctx, &services, &mut analyzed, cancel).await?;
        self.retrieval_stage(ctx, &analyzed, cancel).await?;

        let mut candidates: Vec<Suggestion> = analyzed.iter().flat_map(|a| a.rules.iter().cloned()).collect();
        if request.llm_enabled {
            if let Some(engine) = &self.engine {
                candidates.extend(self.llm_stage(ctx, engine, &analyzed, cancel).await?);
            }
        }

        let (detected, resolved) = self.merge_stage(ctx, &analyzed, candidates, cancel).await?;
        let detected = self.verify_stage(ctx, &services, &analyzed, detected, cancel).await?;

        let mut issues = detected;
        issues.extend(resolved);
        self.persist_stage(ctx, &analyzed, issues, cancel).await?;

        if let Err(e) = self.retrieval.save().await {
            warn!(error = %e, "Failed to save retrieval cache");
        }
        Ok(())
    }

    fn run_services(&self, cancel: &CancelToken) -> Result<RunServices> {
        let links = Arc::new(LinkChecker::new(self.links.clone(), &self.settings.links).with_cancel(cancel.clone()));
        let rules = RuleServices::new(&self.settings, self.catalogs.clone(), links.clone())
            .context("Invalid analyzer settings")?;
        let versions = VersionMatcher::new(&self.settings.versions.package).context("Invalid versions.package")?;
        Ok(RunServices {
            analyzers: AnalyzerSet::new(&self.settings, rules),
            verifier: PatchVerifier::new(
                self.settings.guardrails.clone(),
                self.catalogs.clone(),
                links.clone(),
                versions,
            ),
            links,
        })
    }

    async fn sync_stage(&self, ctx: &mut RunContext, cancel: &CancelToken) -> Result<Vec<Document>> {
        let started = ctx.begin(RunStage::Sync).await?;
        check_cancel(cancel)?;

        let since = self.store.last_successful_run().await?.and_then(|r| r.commit);
        let changed = self
            .repo
            .changed_documents(since.as_deref())
            .await
            .context("Repository sync failed")?;

        let mut documents = Vec::new();
        for incoming in changed {
            let stored = self.store.document(&incoming.path).await?;
            if stored.is_some_and(|record| record.blob_hash == incoming.blob_hash) {
                debug!(document = %incoming.path, "Unchanged, skipping");
                ctx.run.stats.files_unchanged += 1;
                continue;
            }

            match Document::parse(incoming.path.clone(), &incoming.content) {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    warn!(document = %incoming.path, error = %e, "Document skipped");
                    self.store.flag_document(&incoming.path, e.to_string()).await?;
                    ctx.run.stats.files_failed += 1;
                    let event = ctx
                        .event(Some(RunStage::Sync), RunEventType::DocumentSkipped, format!("Parse failed: {}", e))
                        .with_document(incoming.path.clone())
                        .with_error(e.to_string());
                    ctx.emit(event).await?;
                }
            }
        }
        ctx.run.stats.files_analyzed = documents.len() as u64;

        let summary = format!(
            "{} changed, {} unchanged, {} failed",
            documents.len(),
            ctx.run.stats.files_unchanged,
            ctx.run.stats.files_failed
        );
        ctx.finish(RunStage::Sync, started, summary).await?;
        Ok(documents)
    }

    async fn chunk_stage(
        &self,
        ctx: &mut RunContext,
        documents: Vec<Document>,
        cancel: &CancelToken,
    ) -> Result<Vec<Analyzed>> {
        let started = ctx.begin(RunStage::Chunk).await?;
        check_cancel(cancel)?;

        let analyzed: Vec<Analyzed> = documents
            .into_iter()
            .map(|doc| Analyzed {
                chunks: self.chunker.chunk(&doc),
                doc,
                rules: Vec::new(),
            })
            .collect();
        ctx.run.stats.chunks_total = analyzed.iter().map(|a| a.chunks.len() as u64).sum();

        let summary = format!("{} chunks", ctx.run.stats.chunks_total);
        ctx.finish(RunStage::Chunk, started, summary).await?;
        Ok(analyzed)
    }

    async fn rules_stage(
        &self,
        ctx: &mut RunContext,
        services: &RunServices,
        analyzed: &mut [Analyzed],
        cancel: &CancelToken,
    ) -> Result<()> {
        let started = ctx.begin(RunStage::Rules).await?;
        check_cancel(cancel)?;

        let found = join_all(analyzed.iter().map(|a| services.analyzers.analyze(&a.doc))).await;
        // Link checks cut short by cancellation are not findings
        check_cancel(cancel)?;
        for (entry, suggestions) in analyzed.iter_mut().zip(found) {
            entry.rules = suggestions.into_iter().map(formatter::format).collect();
        }

        let link_stats = services.links.stats();
        ctx.run.stats.link_checks = link_stats.attempts;
        ctx.run.stats.link_failures = link_stats.failures;

        if link_stats.exceeds(&self.settings.links) {
            let summary = format!(
                "{} of {} link checks failed ({:.0}%), suppressing link issues",
                link_stats.failures,
                link_stats.attempts,
                link_stats.failure_rate() * 100.0
            );
            error!(failures = link_stats.failures, attempts = link_stats.attempts, "Suspected link-check outage");
            let event = ctx.event(Some(RunStage::Rules), RunEventType::LinkAbort, summary);
            ctx.emit(event).await?;
            for entry in analyzed.iter_mut() {
                entry.rules.retain(|s| !s.rule_code.is_link());
            }
        }

        let total: usize = analyzed.iter().map(|a| a.rules.len()).sum();
        let summary = format!("{} rule findings, {} link checks", total, link_stats.attempts);
        ctx.finish(RunStage::Rules, started, summary).await
    }

    async fn retrieval_stage(&self, ctx: &mut RunContext, analyzed: &[Analyzed], cancel: &CancelToken) -> Result<()> {
        let started = ctx.begin(RunStage::Retrieval).await?;
        check_cancel(cancel)?;

        let chunks: Vec<Chunk> = analyzed.iter().flat_map(|a| a.chunks.iter().cloned()).collect();
        let outcome = self.retrieval.refresh(&chunks).await;
        if outcome.failed > 0 {
            let event = ctx.event(
                Some(RunStage::Retrieval),
                RunEventType::RetrievalDegraded,
                format!("{} chunks could not be indexed", outcome.failed),
            );
            ctx.emit(event).await?;
        }

        let summary = format!(
            "{} indexed, {} unchanged, {} failed",
            outcome.indexed, outcome.unchanged, outcome.failed
        );
        ctx.finish(RunStage::Retrieval, started, summary).await
    }

    async fn llm_stage(
        &self,
        ctx: &mut RunContext,
        engine: &SuggestionEngine,
        analyzed: &[Analyzed],
        cancel: &CancelToken,
    ) -> Result<Vec<Suggestion>> {
        let started = ctx.begin(RunStage::Llm).await?;
        check_cancel(cancel)?;

        let budget = BudgetTracker::new(BudgetLimits::from(&self.settings.llm));
        let permits = Semaphore::new(self.settings.llm.concurrency.max(1));
        let exhausted = AtomicBool::new(false);

        let work = analyzed.iter().flat_map(|a| a.chunks.iter().map(move |chunk| (a, chunk)));
        let outcomes = join_all(work.map(|(entry, chunk)| {
            let facts = rule_facts(&entry.rules, chunk);
            let (budget, permits, exhausted) = (&budget, &permits, &exhausted);
            async move {
                let outcome = self
                    .suggest_chunk(engine, budget, permits, exhausted, cancel, &entry.doc, chunk, facts)
                    .await;
                (chunk, outcome)
            }
        }))
        .await;

        let mut suggestions = Vec::new();
        let mut degraded = 0usize;
        let mut budget_skipped = 0usize;
        for (chunk, outcome) in outcomes {
            match outcome {
                ChunkOutcome::Suggested {
                    suggestions: found,
                    usage,
                    degraded: was_degraded,
                } => {
                    ctx.run.stats.chunks_llm += 1;
                    record_usage(ctx, usage);
                    degraded += usize::from(was_degraded);
                    suggestions.extend(found);
                }
                ChunkOutcome::Failed { error, degraded: was_degraded } => {
                    warn!(chunk = %chunk.fingerprint, error = %error, "Chunk skipped");
                    ctx.run.stats.chunks_skipped += 1;
                    record_usage(ctx, error.usage());
                    degraded += usize::from(was_degraded);
                    let event = ctx
                        .event(Some(RunStage::Llm), RunEventType::ChunkSkipped, format!("Chunk {} skipped", chunk.fingerprint))
                        .with_document(chunk.document.clone())
                        .with_error(error.to_string());
                    ctx.emit(event).await?;
                }
                ChunkOutcome::BudgetExhausted => {
                    ctx.run.stats.chunks_skipped += 1;
                    budget_skipped += 1;
                }
                ChunkOutcome::Cancelled => {
                    ctx.run.stats.chunks_skipped += 1;
                }
            }
        }

        if degraded > 0 {
            let event = ctx.event(
                Some(RunStage::Llm),
                RunEventType::RetrievalDegraded,
                format!("{} chunks analyzed without neighbors", degraded),
            );
            ctx.emit(event).await?;
        }
        if budget_skipped > 0 {
            warn!(skipped = budget_skipped, tokens = budget.tokens_used(), "LLM budget exhausted");
            let event = ctx.event(
                Some(RunStage::Llm),
                RunEventType::BudgetExhausted,
                format!("{} chunks not sent after the token budget ran out", budget_skipped),
            );
            ctx.emit(event).await?;
        }
        check_cancel(cancel)?;

        let summary = format!(
            "{} chunks analyzed, {} skipped, {} suggestions",
            ctx.run.stats.chunks_llm,
            ctx.run.stats.chunks_skipped,
            suggestions.len()
        );
        ctx.finish(RunStage::Llm, started, summary).await?;
        Ok(suggestions)
    }

    #[allow(clippy::too_many_arguments)]
    async fn suggest_chunk(
        &self,
        engine: &SuggestionEngine,
        budget: &BudgetTracker,
        permits: &Semaphore,
        exhausted: &AtomicBool,
        cancel: &CancelToken,
        doc: &Document,
        chunk: &Chunk,
        facts: Vec<String>,
    ) -> ChunkOutcome {
        let Ok(_permit) = permits.acquire().await else {
            return ChunkOutcome::Cancelled;
        };
        if cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }
        if exhausted.load(Ordering::SeqCst) {
            return ChunkOutcome::BudgetExhausted;
        }

        let packet = self.retrieval.build(chunk, doc, facts).await;
        let reservation = match budget.reserve(engine.estimate(&packet)) {
            Ok(reservation) => reservation,
            Err(violation) => {
                debug!(chunk = %chunk.fingerprint, %violation, "Budget refused chunk");
                exhausted.store(true, Ordering::SeqCst);
                return ChunkOutcome::BudgetExhausted;
            }
        };
        let result = engine.suggest(&packet, budget).await;
        let usage = match &result {
            Ok(output) => output.usage,
            Err(e) => e.usage(),
        };
        budget.settle(reservation, usage.total_tokens());

        match result {
            Ok(output) => ChunkOutcome::Suggested {
                suggestions: output.suggestions,
                usage,
                degraded: packet.degraded,
            },
            Err(error) => ChunkOutcome::Failed {
                error,
                degraded: packet.degraded,
            },
        }
    }

    /// Returns (detected issues, issues resolved by a merged PR)
    async fn merge_stage(
        &self,
        ctx: &mut RunContext,
        analyzed: &[Analyzed],
        candidates: Vec<Suggestion>,
        cancel: &CancelToken,
    ) -> Result<(Vec<Issue>, Vec<Issue>)> {
        let started = ctx.begin(RunStage::Merge).await?;
        check_cancel(cancel)?;

        let findings = self.merger.merge(candidates);
        ctx.run.stats.issues_found = findings.len() as u64;

        let mut detected = Vec::with_capacity(findings.len());
        for finding in findings {
            match self.store.issue(&finding.key).await? {
                Some(mut issue) => {
                    issue.absorb(finding, ctx.run.id);
                    detected.push(issue);
                }
                None => {
                    ctx.run.stats.issues_new += 1;
                    detected.push(Issue::open(finding, ctx.run.id));
                }
            }
        }

        let seen: BTreeSet<&IssueKey> = detected.iter().map(|i| i.key()).collect();
        let mut resolved = Vec::new();
        for entry in analyzed {
            for mut issue in self.store.issues_for_document(&entry.doc.path).await? {
                if seen.contains(issue.key()) || !issue.is_active() || issue.pr_state != PrState::Merged {
                    continue;
                }
                // Link rules did not report this run, so absence proves nothing
                if ctx.run.link_abort && issue.key().rule_code.is_link() {
                    continue;
                }
                issue.transition(IssueState::Resolved)?;
                issue.last_seen_run = ctx.run.id;
                resolved.push(issue);
            }
        }
        ctx.run.stats.issues_resolved = resolved.len() as u64;

        let summary = format!(
            "{} issues ({} new), {} resolved",
            detected.len(),
            ctx.run.stats.issues_new,
            resolved.len()
        );
        ctx.finish(RunStage::Merge, started, summary).await?;
        Ok((detected, resolved))
    }

    async fn verify_stage(
        &self,
        ctx: &mut RunContext,
        services: &RunServices,
        analyzed: &[Analyzed],
        issues: Vec<Issue>,
        cancel: &CancelToken,
    ) -> Result<Vec<Issue>> {
        let started = ctx.begin(RunStage::Verify).await?;
        check_cancel(cancel)?;

        let documents: BTreeMap<&str, &Document> = analyzed.iter().map(|a| (a.doc.path.as_str(), &a.doc)).collect();
        let verified = join_all(issues.into_iter().map(|mut issue| {
            let doc = documents.get(issue.key().document.as_str()).copied();
            let verifier = &services.verifier;
            async move {
                let patch = doc.and_then(|doc| formatter::build_patch(&issue.finding, doc));
                issue.verdict = match &patch {
                    Some(patch) => Some(verifier.verify_cached(patch, &issue.finding, issue.verdict.as_ref()).await),
                    None => None,
                };
                issue.patch = patch;
                issue
            }
        }))
        .await;
        check_cancel(cancel)?;

        let patched = verified.iter().filter(|i| i.patch.is_some()).count();
        let auto = verified.iter().filter(|i| i.can_auto_apply()).count();
        let summary = format!("{} patches, {} auto-applicable", patched, auto);
        ctx.finish(RunStage::Verify, started, summary).await?;
        Ok(verified)
    }

    async fn persist_stage(
        &self,
        ctx: &mut RunContext,
        analyzed: &[Analyzed],
        issues: Vec<Issue>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let started = ctx.begin(RunStage::Persist).await?;
        check_cancel(cancel)?;

        // A failed run leaves document hashes alone so the next run re-analyses them
        let documents = if ctx.run.link_abort {
            Vec::new()
        } else {
            analyzed
                .iter()
                .map(|a| DocumentRecord {
                    path: a.doc.path.clone(),
                    blob_hash: a.doc.blob_hash.clone(),
                    title: a.doc.title.clone(),
                    last_commit: ctx.run.commit.clone(),
                    chunks: a.chunks.iter().map(|c| c.fingerprint.clone()).collect(),
                    needs_attention: None,
                    updated_at: Utc::now(),
                })
                .collect()
        };

        let summary = format!("{} issues, {} documents committed", issues.len(), documents.len());
        self.store.commit(CommitBatch { issues, documents }).await?;
        ctx.finish(RunStage::Persist, started, summary).await
    }

    async fn complete_run(&self, ctx: &mut RunContext) -> Result<AnalysisRun> {
        info!(run_id = %ctx.run.id, "Run completed successfully");
        let event = ctx
            .event(None, RunEventType::RunCompleted, "Analysis completed")
            .with_stats(ctx.run.stats.clone());
        ctx.emit(event).await?;
        self.store.save_run(&ctx.run).await?;
        Ok(ctx.run.clone())
    }

    async fn fail_run(&self, ctx: &mut RunContext, error_msg: String) -> Result<AnalysisRun> {
        error!(run_id = %ctx.run.id, stage = ?ctx.run.stage, %error_msg, "Run failed");
        let event = ctx
            .event(ctx.run.stage, RunEventType::RunFailed, format!("Run failed: {}", error_msg))
            .with_stats(ctx.run.stats.clone())
            .with_error(error_msg);
        ctx.emit(event).await?;
        self.store.save_run(&ctx.run).await?;
        Ok(ctx.run.clone())
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(())
}

fn record_usage(ctx: &mut RunContext, usage: Usage) {
    ctx.run.stats.llm_requests += usage.requests;
    ctx.run.stats.tokens_in += usage.tokens_in;
    ctx.run.stats.tokens_out += usage.tokens_out;
}

/// One line per rule finding inside the chunk, for the LLM packet
fn rule_facts(rules: &[Suggestion], chunk: &Chunk) -> Vec<String> {
    rules
        .iter()
        .filter(|s| chunk.contains_line(s.location.line_start))
        .map(|s| format!("{} (line {}): {}", s.rule_code, s.location.line_start, s.title))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Location, RuleCode, Severity};

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(check_cancel(&clone).unwrap_err().is::<Cancelled>());
    }

    #[test]
    fn test_run_request_defaults_to_llm() {
        let request = RunRequest::default();
        assert!(request.llm_enabled);
        assert_eq!(request.source, RunSource::Manual);
    }

    #[test]
    fn test_rule_facts_limited_to_chunk() {
        let doc = Document::parse("a.md", "# T\n\nline\n\nmore\n").unwrap();
        let chunk = Chunker::new(2000).chunk(&doc).remove(0);
        let inside = Suggestion::rule("a.md", RuleCode::LinkBroken, Severity::Medium, "Broken link: x", "", Location::new(3, 3), "line");
        let outside = Suggestion::rule("a.md", RuleCode::LinkBroken, Severity::Medium, "Broken link: y", "", Location::new(40, 40), "");

        let facts = rule_facts(&[inside, outside], &chunk);
        assert_eq!(facts, vec![format!("{} (line 3): Broken link: x", RuleCode::LinkBroken)]);
    }
}
