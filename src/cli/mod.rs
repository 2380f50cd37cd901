//! Command-line interface for docsqa.
//!
//! Provides commands for running an analysis, inspecting runs, reviewing
//! issues and handing verified patches to a PR workflow.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{FileStore, IssueFilter, IssueStore, JsonPrExporter, PrPublisher};
use crate::config::{load_config_from, ResolvedConfig};
use crate::core::{CancelToken, Chunker, Orchestrator, RunLog, RunRequest};
use crate::domain::{pr_batch, AnalysisRun, Document, Issue, IssueState, PrState, RunSource, RunStatus};

/// docsqa - Documentation QA pipeline
#[derive(Parser, Debug)]
#[command(name = "docsqa")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: search for .docsqa/config.yaml)
    #[arg(long, global = true, env = "DOCSQA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze changed documents
    Run {
        /// What triggered the run
        #[arg(long, value_enum, default_value = "manual")]
        source: RunSource,

        /// Commit to record (read from the repository if omitted)
        #[arg(long)]
        commit: Option<String>,

        /// Skip the LLM stage
        #[arg(long)]
        no_llm: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List issues
    Issues {
        /// Only issues in this document
        #[arg(short, long)]
        document: Option<String>,

        /// Only issues in this state
        #[arg(short, long, value_enum)]
        state: Option<StateArg>,

        /// Only issues whose patch may be applied automatically
        #[arg(long)]
        auto_apply: bool,
    },

    /// Acknowledge an issue
    Ack { issue_id: String },

    /// Ignore an issue
    Ignore { issue_id: String },

    /// Reopen an ignored issue
    Reopen { issue_id: String },

    /// Record that an issue's pull request was merged
    PrMerged { issue_id: String },

    /// Write the PR batch for active issues to a JSON file
    Export {
        /// Output file
        out: PathBuf,
    },

    /// Hand the PR batch to the PR exporter and mark issues as opened
    Publish {
        /// Export directory (default: <home>/prs)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Show how a document is chunked
    Chunk {
        /// Markdown file
        file: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Issue state for CLI (maps to IssueState)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Open,
    Acknowledged,
    Ignored,
    Resolved,
}

impl From<StateArg> for IssueState {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Open => IssueState::Open,
            StateArg::Acknowledged => IssueState::Acknowledged,
            StateArg::Ignored => IssueState::Ignored,
            StateArg::Resolved => IssueState::Resolved,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = load_config_from(self.config.as_deref())?;

        match self.command {
            Commands::Run { source, commit, no_llm } => run_analysis(&cfg, source, commit, no_llm).await,
            Commands::Status { run_id } => show_status(&cfg, &run_id).await,
            Commands::Runs { limit } => list_runs(&cfg, limit).await,
            Commands::Issues {
                document,
                state,
                auto_apply,
            } => {
                let filter = IssueFilter {
                    document,
                    state: state.map(IssueState::from),
                    auto_apply_only: auto_apply,
                };
                list_issues(&cfg, &filter).await
            }
            Commands::Ack { issue_id } => transition_issue(&cfg, &issue_id, IssueState::Acknowledged).await,
            Commands::Ignore { issue_id } => transition_issue(&cfg, &issue_id, IssueState::Ignored).await,
            Commands::Reopen { issue_id } => transition_issue(&cfg, &issue_id, IssueState::Open).await,
            Commands::PrMerged { issue_id } => mark_pr_merged(&cfg, &issue_id).await,
            Commands::Export { out } => export_batch(&cfg, &out).await,
            Commands::Publish { dir } => publish_batch(&cfg, dir).await,
            Commands::Chunk { file } => show_chunks(&cfg, &file).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

async fn open_store(cfg: &ResolvedConfig) -> Result<FileStore> {
    FileStore::open(cfg.state_path()).await
}

/// Run one analysis; Ctrl-C cancels it
async fn run_analysis(cfg: &ResolvedConfig, source: RunSource, commit: Option<String>, no_llm: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(cfg).await?;
    if !no_llm && !orchestrator.llm_available() {
        eprintln!("LLM stage disabled (no provider configured)");
    }

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let request = RunRequest {
        commit,
        source,
        llm_enabled: !no_llm,
    };
    let run = orchestrator.run(request, cancel).await?;
    print_run(&run);

    if run.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_run(run: &AnalysisRun) {
    let stats = &run.stats;
    println!("Run ID: {}", run.id);
    println!("Status: {}", run.status);
    if let Some(commit) = &run.commit {
        println!("Commit: {}", commit);
    }
    if let Some(stage) = run.stage {
        println!("Stage: {}", stage);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }
    if run.link_abort {
        println!("Link issues suppressed (suspected link-check outage)");
    }
    println!();
    println!(
        "Files:  {} analyzed, {} unchanged, {} failed",
        stats.files_analyzed, stats.files_unchanged, stats.files_failed
    );
    println!(
        "Chunks: {} total, {} sent to LLM, {} skipped",
        stats.chunks_total, stats.chunks_llm, stats.chunks_skipped
    );
    println!(
        "Issues: {} found, {} new, {} resolved",
        stats.issues_found, stats.issues_new, stats.issues_resolved
    );
    println!("Links:  {} checked, {} failed", stats.link_checks, stats.link_failures);
    println!(
        "LLM:    {} requests, {} tokens in, {} tokens out",
        stats.llm_requests, stats.tokens_in, stats.tokens_out
    );
}

/// Show the status of a run
async fn show_status(cfg: &ResolvedConfig, run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let log = RunLog::open(cfg.runs_dir(), run_id).await?;
    let run = log
        .run()
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;
    print_run(&run);

    println!("\nEvents:");
    for event in log.replay().await? {
        let document = event.document.as_deref().map(|d| format!(" [{}]", d)).unwrap_or_default();
        println!("  {} {:?}{} {}", event.timestamp.format("%H:%M:%S"), event.event_type, document, event.summary);
    }
    Ok(())
}

/// List recent runs
async fn list_runs(cfg: &ResolvedConfig, limit: usize) -> Result<()> {
    let runs_dir = cfg.runs_dir();
    let mut runs = Vec::new();
    for run_id in RunLog::list_runs(&runs_dir).await? {
        let log = RunLog::open(&runs_dir, run_id).await?;
        if let Ok(Some(run)) = log.run().await {
            runs.push(run);
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<10} {:<8} {:<8}", "RUN ID", "STATUS", "STAGE", "FILES", "ISSUES");
    println!("{}", "-".repeat(78));
    for run in runs {
        let stage = run.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<10} {:<10} {:<8} {:<8}",
            run.id,
            run.status.to_string(),
            stage,
            run.stats.files_analyzed,
            run.stats.issues_found
        );
    }
    Ok(())
}

async fn list_issues(cfg: &ResolvedConfig, filter: &IssueFilter) -> Result<()> {
    let store = open_store(cfg).await?;
    let issues = store.list_issues(filter).await?;

    if issues.is_empty() {
        println!("No issues found");
        return Ok(());
    }

    println!("{:<13} {:<13} {:<9} {:<20} {:<5} {}", "ID", "STATE", "SEVERITY", "RULE", "AUTO", "LOCATION");
    println!("{}", "-".repeat(90));
    for issue in &issues {
        let key = issue.key();
        println!(
            "{:<13} {:<13} {:<9} {:<20} {:<5} {}:{}",
            issue.id(),
            issue.state.to_string(),
            issue.finding.severity.to_string(),
            key.rule_code.as_str(),
            if issue.can_auto_apply() { "yes" } else { "no" },
            key.document,
            key.line_start
        );
        println!("    {}", key.title);
    }
    println!("\n{} issues", issues.len());
    Ok(())
}

async fn find_issue(store: &FileStore, issue_id: &str) -> Result<Issue> {
    store
        .find_issue(issue_id)
        .await?
        .with_context(|| format!("Issue not found: {}", issue_id))
}

async fn transition_issue(cfg: &ResolvedConfig, issue_id: &str, to: IssueState) -> Result<()> {
    let store = open_store(cfg).await?;
    let mut issue = find_issue(&store, issue_id).await?;
    issue.transition(to)?;
    let id = issue.id();
    store.update_issue(issue).await?;
    println!("Issue {} is now {}", id, to);
    Ok(())
}

async fn mark_pr_merged(cfg: &ResolvedConfig, issue_id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let mut issue = find_issue(&store, issue_id).await?;
    issue.pr_state = PrState::Merged;
    issue.updated_at = chrono::Utc::now();
    let id = issue.id();
    store.update_issue(issue).await?;
    println!("Issue {} PR marked merged; it resolves once the next run no longer detects it", id);
    Ok(())
}

async fn export_batch(cfg: &ResolvedConfig, out: &Path) -> Result<()> {
    let store = open_store(cfg).await?;
    let issues = store.list_issues(&IssueFilter::default()).await?;
    let batch = pr_batch(&issues);

    let json = serde_json::to_string_pretty(&batch).context("Failed to serialize PR batch")?;
    tokio::fs::write(out, json)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;

    let auto = batch.iter().filter(|e| e.can_auto_apply).count();
    println!("Exported {} patches ({} auto-applicable) to {}", batch.len(), auto, out.display());
    Ok(())
}

async fn publish_batch(cfg: &ResolvedConfig, dir: Option<PathBuf>) -> Result<()> {
    let store = open_store(cfg).await?;
    let issues: Vec<Issue> = store
        .list_issues(&IssueFilter::default())
        .await?
        .into_iter()
        .filter(|i| i.pr_state == PrState::None)
        .collect();
    let batch = pr_batch(&issues);
    if batch.is_empty() {
        println!("Nothing to publish");
        return Ok(());
    }

    let exporter = JsonPrExporter::new(dir.unwrap_or_else(|| cfg.home.join("prs")));
    let url = exporter.publish(&batch).await?;

    for mut issue in issues.into_iter().filter(|i| batch.iter().any(|e| e.issue_id == i.id())) {
        issue.pr_state = PrState::Opened;
        issue.pr_url = Some(url.clone());
        issue.updated_at = chrono::Utc::now();
        store.update_issue(issue).await?;
    }
    println!("Published {} patches: {}", batch.len(), url);
    Ok(())
}

async fn show_chunks(cfg: &ResolvedConfig, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let doc = Document::parse(file.display().to_string(), &content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;
    let chunks = Chunker::new(cfg.settings.chunking.target_tokens).chunk(&doc);

    println!("{} lines, {} chunks", doc.line_count(), chunks.len());
    for chunk in &chunks {
        println!(
            "#{:<3} lines {:>4}-{:<4} ~{:>5} tokens  {}",
            chunk.index,
            chunk.start_line,
            chunk.end_line,
            chunk.token_estimate,
            chunk.heading_path.join(" > ")
        );
        println!("     {}", chunk.fingerprint);
    }
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("docsqa configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Project root:     {}", cfg.project_root.display());
    println!("  Docs root:        {}", cfg.repo_root().display());
    println!("  Home (state):     {}", cfg.home.display());
    println!("  Runs:             {}", cfg.runs_dir().display());
    println!("  Issue store:      {}", cfg.state_path().display());
    println!("  Retrieval cache:  {}", cfg.retrieval_cache_dir().display());
    println!();
    println!(
        "LLM API key ({}): {}",
        cfg.settings.llm.api_key_env,
        if cfg.llm_api_key().is_some() { "set" } else { "not set" }
    );
    println!();
    println!("Settings:");
    let yaml = serde_yaml::to_string(&cfg.settings).context("Failed to render settings")?;
    for line in yaml.lines() {
        println!("  {}", line);
    }
    Ok(())
}
