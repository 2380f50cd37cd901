//! Configuration for docsqa.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DOCSQA_HOME, DOCSQA_CONFIG, API key variables)
//! 2. Config file (.docsqa/config.yaml)
//! 3. Defaults (~/.docsqa, every analysis setting has a default)
//!
//! Config file discovery:
//! - Searches current directory and parents for .docsqa/config.yaml
//! - Relative paths are resolved against the project root (the parent of .docsqa/)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::IssueCategory;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocsqaConfig {
    pub paths: PathsConfig,
    pub repo: RepoConfig,
    pub links: LinksConfig,
    pub versions: VersionsConfig,
    pub style: StyleConfig,
    pub terminology: TerminologyConfig,
    pub analyzers: AnalyzerToggles,
    pub catalogs: CatalogPaths,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
    pub guardrails: GuardrailsConfig,
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the project root)
    pub home: Option<String>,
}

/// Which documents to analyze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Documentation root (relative to the project root)
    #[serde(default = "default_repo_root")]
    pub root: String,

    #[serde(default = "default_include")]
    pub include: Vec<String>,

    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

fn default_repo_root() -> String {
    ".".to_string()
}
fn default_include() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.mdx".to_string()]
}
fn default_exclude() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/.git/**".to_string(),
        "**/.docsqa/**".to_string(),
    ]
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            root: default_repo_root(),
            include: default_include(),
            exclude: default_exclude(),
        }
    }
}

/// Link checker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinksConfig {
    /// Per-request timeout (default: 4000ms)
    #[serde(default = "default_link_timeout")]
    pub timeout_ms: u64,

    /// Concurrent checks across all hosts (default: 8)
    #[serde(default = "default_link_concurrency")]
    pub concurrency: usize,

    /// Concurrent checks against one host (default: 2)
    #[serde(default = "default_per_host_limit")]
    pub per_host_limit: usize,

    /// Attempts per URL including the first (default: 2)
    #[serde(default = "default_link_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry (default: 500ms)
    #[serde(default = "default_link_retry_delay")]
    pub retry_delay_ms: u64,

    /// Base URL for resolving relative links; relative links are skipped without it
    #[serde(default)]
    pub base_url: Option<String>,

    /// Failure rate above which the run is aborted (default: 0.30)
    #[serde(default = "default_abort_failure_rate")]
    pub abort_failure_rate: f64,

    /// Attempts needed before the failure rate is trusted (default: 10)
    #[serde(default = "default_abort_min_attempts")]
    pub abort_min_attempts: u64,
}

fn default_link_timeout() -> u64 {
    4000
}
fn default_link_concurrency() -> usize {
    8
}
fn default_per_host_limit() -> usize {
    2
}
fn default_link_attempts() -> u32 {
    2
}
fn default_link_retry_delay() -> u64 {
    500
}
fn default_abort_failure_rate() -> f64 {
    0.30
}
fn default_abort_min_attempts() -> u64 {
    10
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_link_timeout(),
            concurrency: default_link_concurrency(),
            per_host_limit: default_per_host_limit(),
            max_attempts: default_link_attempts(),
            retry_delay_ms: default_link_retry_delay(),
            base_url: None,
            abort_failure_rate: default_abort_failure_rate(),
            abort_min_attempts: default_abort_min_attempts(),
        }
    }
}

/// Version drift settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionsConfig {
    /// Package whose pinned versions are checked
    #[serde(default = "default_package")]
    pub package: String,

    #[serde(default)]
    pub allow_majors_behind: u64,

    #[serde(default = "default_minors_behind")]
    pub allow_minors_behind: u64,

    /// Latest released version, if known
    #[serde(default)]
    pub latest: Option<String>,
}

fn default_package() -> String {
    "wandb".to_string()
}
fn default_minors_behind() -> u64 {
    1
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            package: default_package(),
            allow_majors_behind: 0,
            allow_minors_behind: default_minors_behind(),
            latest: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleConfig {
    #[serde(default = "default_true")]
    pub require_one_h1: bool,

    #[serde(default = "default_true")]
    pub require_img_alt: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            require_one_h1: true,
            require_img_alt: true,
        }
    }
}

/// Canonical terms: `"Preferred|variant|variant"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminologyConfig {
    #[serde(default = "default_canonical_terms")]
    pub canonical: Vec<String>,
}

fn default_canonical_terms() -> Vec<String> {
    Vec::new()
}

impl Default for TerminologyConfig {
    fn default() -> Self {
        Self {
            canonical: default_canonical_terms(),
        }
    }
}

/// Per-analyzer enable switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerToggles {
    #[serde(default = "default_true")]
    pub links: bool,
    #[serde(default = "default_true")]
    pub versions: bool,
    #[serde(default = "default_true")]
    pub api_cli: bool,
    #[serde(default = "default_true")]
    pub style: bool,
}

impl Default for AnalyzerToggles {
    fn default() -> Self {
        Self {
            links: true,
            versions: true,
            api_cli: true,
            style: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogPaths {
    /// JSON object of API symbol -> entry
    pub api_path: Option<String>,
    /// JSON object of CLI command -> entry
    pub cli_path: Option<String>,
}

/// LLM engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_model")]
    pub model: String,

    /// OpenAI-compatible API base
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Concurrent LLM requests (default: 4)
    #[serde(default = "default_llm_concurrency")]
    pub concurrency: usize,

    /// Stricter re-asks after a schema violation (default: 1)
    #[serde(default = "default_schema_retries")]
    pub schema_retries: u32,

    /// Attempts for transient provider failures (default: 3)
    #[serde(default = "default_llm_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub rate_limits: RateLimits,

    #[serde(default)]
    pub budgets: TokenBudgets,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f64 {
    0.1
}
fn default_max_output_tokens() -> u32 {
    1200
}
fn default_llm_concurrency() -> usize {
    4
}
fn default_schema_retries() -> u32 {
    1
}
fn default_llm_attempts() -> u32 {
    3
}
fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            base_url: default_llm_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            concurrency: default_llm_concurrency(),
            schema_retries: default_schema_retries(),
            max_attempts: default_llm_attempts(),
            timeout_seconds: default_llm_timeout(),
            rate_limits: RateLimits::default(),
            budgets: TokenBudgets::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    /// Requests per minute (default: 200)
    #[serde(default = "default_rpm")]
    pub rpm: u32,
}

fn default_rpm() -> u32 {
    200
}

impl Default for RateLimits {
    fn default() -> Self {
        Self { rpm: default_rpm() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgets {
    /// Prompt + completion tokens per run (default: 2,000,000)
    #[serde(default = "default_tokens_per_run")]
    pub tokens_per_run: u64,
}

fn default_tokens_per_run() -> u64 {
    2_000_000
}

impl Default for TokenBudgets {
    fn default() -> Self {
        Self {
            tokens_per_run: default_tokens_per_run(),
        }
    }
}

/// Retrieval context settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_k_neighbors")]
    pub k_neighbors: usize,

    /// Lines of surrounding text on each side of a chunk
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Embedding/context cache directory (default: <home>/retrieval)
    #[serde(default)]
    pub cache_path: Option<String>,

    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,

    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
}

fn default_k_neighbors() -> usize {
    5
}
fn default_context_lines() -> usize {
    20
}
fn default_query_concurrency() -> usize {
    4
}
fn default_embedding_dims() -> usize {
    256
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_neighbors: default_k_neighbors(),
            context_lines: default_context_lines(),
            cache_path: None,
            query_concurrency: default_query_concurrency(),
            embedding_dims: default_embedding_dims(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in estimated tokens (default: 2000)
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
}

fn default_target_tokens() -> usize {
    2000
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
        }
    }
}

/// Patch verifier thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Accuracy findings need at least one citation
    #[serde(default = "default_true")]
    pub require_citations: bool,

    /// Whitespace-only line changes tolerated per patch (default: 3)
    #[serde(default = "default_whitespace_delta")]
    pub max_whitespace_delta_lines: usize,
}

fn default_whitespace_delta() -> usize {
    3
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            require_citations: true,
            max_whitespace_delta_lines: default_whitespace_delta(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Categories where overlapping rule and LLM findings become one issue
    #[serde(default)]
    pub by_category: Vec<IssueCategory>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to docsqa home (engine state)
    pub home: PathBuf,
    /// Project root that relative paths resolve against
    pub project_root: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Analysis settings
    pub settings: DocsqaConfig,
}

impl ResolvedConfig {
    /// Build from settings without touching the environment
    pub fn from_settings(settings: DocsqaConfig, project_root: PathBuf, home: PathBuf) -> Self {
        Self {
            home,
            project_root,
            config_file: None,
            settings,
        }
    }

    /// Documentation root
    pub fn repo_root(&self) -> PathBuf {
        resolve_path(&self.project_root, &self.settings.repo.root)
    }

    /// Run logs directory ($DOCSQA_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Issue store file ($DOCSQA_HOME/state.json)
    pub fn state_path(&self) -> PathBuf {
        self.home.join("state.json")
    }

    /// Retrieval cache directory
    pub fn retrieval_cache_dir(&self) -> PathBuf {
        match self.settings.retrieval.cache_path {
            Some(ref path) => resolve_path(&self.project_root, path),
            None => self.home.join("retrieval"),
        }
    }

    pub fn api_catalog_path(&self) -> Option<PathBuf> {
        self.settings
            .catalogs
            .api_path
            .as_ref()
            .map(|p| resolve_path(&self.project_root, p))
    }

    pub fn cli_catalog_path(&self) -> Option<PathBuf> {
        self.settings
            .catalogs
            .cli_path
            .as_ref()
            .map(|p| resolve_path(&self.project_root, p))
    }

    /// API key from the configured environment variable, then DOCSQA_LLM_API_KEY
    pub fn llm_api_key(&self) -> Option<String> {
        std::env::var(&self.settings.llm.api_key_env)
            .or_else(|_| std::env::var("DOCSQA_LLM_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("DOCSQA_CONFIG") {
        return Some(PathBuf::from(explicit));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".docsqa").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<DocsqaConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse YAML settings; an empty document yields defaults
pub fn parse_config(content: &str) -> Result<DocsqaConfig> {
    if content.trim().is_empty() {
        return Ok(DocsqaConfig::default());
    }
    serde_yaml::from_str(content).context("Invalid docsqa configuration")
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from a specific file, or by discovery when `None`
pub fn load_config_from(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".docsqa");

    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };

    let (settings, project_root) = match config_file {
        Some(ref config_path) => {
            let settings = load_config_file(config_path)?;
            // .docsqa/config.yaml -> project root
            let project_root = config_path
                .parent()
                .and_then(|p| p.parent())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (settings, project_root)
        }
        None => {
            let cwd = std::env::current_dir().context("Failed to determine current directory")?;
            (DocsqaConfig::default(), cwd)
        }
    };

    let home = if let Ok(env_home) = std::env::var("DOCSQA_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = settings.paths.home {
        resolve_path(&project_root, home_path)
    } else {
        default_home
    };

    Ok(ResolvedConfig {
        home,
        project_root,
        config_file,
        settings,
    })
}
