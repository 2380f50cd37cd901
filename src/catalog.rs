//! API and CLI catalogs plus the latest-version fact.
//!
//! Catalogs are JSON objects keyed by the full symbol (`wandb.init`) or
//! command (`wandb login`). They are loaded once per run and read-only
//! afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::domain::Citation;

/// Citation source for the package's release catalog
pub const VERSION_SOURCE: &str = "version_catalog";

/// Which catalog a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Api,
    Cli,
}

impl CatalogKind {
    /// Citation source name
    pub fn source(&self) -> &'static str {
        match self {
            Self::Api => "api_catalog",
            Self::Cli => "cli_catalog",
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => f.write_str("API"),
            Self::Cli => f.write_str("CLI"),
        }
    }
}

/// One catalog entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogEntry {
    pub description: Option<String>,
    pub deprecated: bool,
    pub deprecation_reason: Option<String>,
    pub replacement: Option<String>,
    pub deprecated_since: Option<String>,
    pub parameters: Vec<String>,
    pub examples: Vec<String>,
}

impl CatalogEntry {
    /// Short status used as the citation value
    pub fn status(&self) -> String {
        match (self.deprecated, &self.replacement) {
            (true, Some(replacement)) => format!("deprecated; use {}", replacement),
            (true, None) => "deprecated".to_string(),
            (false, _) => "current".to_string(),
        }
    }
}

/// Read-only reference data for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalogs {
    /// Package name used as the symbol prefix
    pub package: String,

    /// Latest released version of the package, if known
    pub latest_version: Option<String>,

    pub api: BTreeMap<String, CatalogEntry>,
    pub cli: BTreeMap<String, CatalogEntry>,
}

impl Catalogs {
    /// Empty catalogs for a package
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            ..Default::default()
        }
    }

    pub fn with_latest_version(mut self, version: Option<String>) -> Self {
        self.latest_version = version;
        self
    }

    pub fn with_entry(mut self, kind: CatalogKind, key: impl Into<String>, entry: CatalogEntry) -> Self {
        self.map_mut(kind).insert(key.into(), entry);
        self
    }

    /// Load catalogs from disk. A missing file leaves that catalog empty.
    pub async fn load(
        package: &str,
        latest_version: Option<String>,
        api_path: Option<&Path>,
        cli_path: Option<&Path>,
    ) -> Result<Self> {
        let mut catalogs = Self::new(package).with_latest_version(latest_version);

        if let Some(path) = api_path {
            catalogs.api = load_catalog_file(path).await?;
            info!(entries = catalogs.api.len(), "Loaded API catalog");
        }
        if let Some(path) = cli_path {
            catalogs.cli = load_catalog_file(path).await?;
            info!(entries = catalogs.cli.len(), "Loaded CLI catalog");
        }

        Ok(catalogs)
    }

    fn map(&self, kind: CatalogKind) -> &BTreeMap<String, CatalogEntry> {
        match kind {
            CatalogKind::Api => &self.api,
            CatalogKind::Cli => &self.cli,
        }
    }

    fn map_mut(&mut self, kind: CatalogKind) -> &mut BTreeMap<String, CatalogEntry> {
        match kind {
            CatalogKind::Api => &mut self.api,
            CatalogKind::Cli => &mut self.cli,
        }
    }

    /// Whether a catalog has any entries (an empty catalog cannot judge membership)
    pub fn is_loaded(&self, kind: CatalogKind) -> bool {
        !self.map(kind).is_empty()
    }

    pub fn lookup(&self, kind: CatalogKind, key: &str) -> Option<&CatalogEntry> {
        self.map(kind).get(key)
    }

    /// Citation for a catalog entry, if the key exists
    pub fn citation(&self, kind: CatalogKind, key: &str) -> Option<Citation> {
        self.lookup(kind, key)
            .map(|entry| Citation::catalog(kind.source(), key, entry.status()))
    }

    /// Citation for the latest-version entry of the package
    pub fn version_citation(&self) -> Option<Citation> {
        self.latest_version
            .as_ref()
            .map(|latest| Citation::catalog(VERSION_SOURCE, self.package.clone(), latest.clone()))
    }

    /// Whether a catalog citation points at a real entry
    pub fn backs_citation(&self, citation: &Citation) -> bool {
        let Some(key) = citation.key.as_deref() else {
            return false;
        };
        match citation.source.as_deref() {
            Some("api_catalog") => self.api.contains_key(key),
            Some("cli_catalog") => self.cli.contains_key(key),
            Some(VERSION_SOURCE) => {
                key == self.package && citation.value.is_some() && citation.value == self.latest_version
            }
            _ => self.api.contains_key(key) || self.cli.contains_key(key),
        }
    }

    /// Similar keys: shared substring or a common 4-character prefix
    pub fn find_similar(&self, kind: CatalogKind, key: &str, max_results: usize) -> Vec<String> {
        let needle = key.to_lowercase();
        let needle_tail = needle.rsplit(['.', ' ']).next().unwrap_or(&needle).to_string();

        let mut exact = Vec::new();
        let mut similar = Vec::new();
        for candidate in self.map(kind).keys() {
            let lower = candidate.to_lowercase();
            let tail = lower.rsplit(['.', ' ']).next().unwrap_or(&lower);
            if lower == needle {
                exact.push(candidate.clone());
            } else if tail.contains(needle_tail.as_str()) || needle_tail.contains(tail) {
                similar.push(candidate.clone());
            } else if needle_tail.chars().count() > 3
                && tail.chars().count() > 3
                && tail.chars().take(4).eq(needle_tail.chars().take(4))
            {
                similar.push(candidate.clone());
            }
        }

        exact.extend(similar);
        exact.truncate(max_results);
        exact
    }

    /// Catalog keys, API first, up to `limit`
    pub fn keys(&self, limit: usize) -> Vec<String> {
        self.api.keys().chain(self.cli.keys()).take(limit).cloned().collect()
    }
}

async fn load_catalog_file(path: &Path) -> Result<BTreeMap<String, CatalogEntry>> {
    if !path.exists() {
        warn!(path = %path.display(), "Catalog file not found, using empty catalog");
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read catalog: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse catalog JSON: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Catalogs {
        Catalogs::new("wandb")
            .with_entry(CatalogKind::Api, "wandb.init", CatalogEntry::default())
            .with_entry(CatalogKind::Api, "wandb.log", CatalogEntry::default())
            .with_entry(
                CatalogKind::Api,
                "wandb.log_artifact_v0",
                CatalogEntry {
                    deprecated: true,
                    replacement: Some("wandb.log_artifact".to_string()),
                    ..Default::default()
                },
            )
            .with_entry(CatalogKind::Cli, "wandb login", CatalogEntry::default())
    }

    #[test]
    fn test_lookup_and_citation() {
        let catalogs = sample();

        assert!(catalogs.lookup(CatalogKind::Api, "wandb.init").is_some());
        assert!(catalogs.lookup(CatalogKind::Api, "wandb.nope").is_none());

        let citation = catalogs
            .citation(CatalogKind::Api, "wandb.log_artifact_v0")
            .unwrap();
        assert_eq!(citation.value.as_deref(), Some("deprecated; use wandb.log_artifact"));
        assert!(catalogs.backs_citation(&citation));
        assert!(!catalogs.backs_citation(&Citation::catalog("api_catalog", "wandb.fake", "x")));
    }

    #[test]
    fn test_version_citation() {
        let catalogs = sample().with_latest_version(Some("0.19.0".to_string()));
        let citation = catalogs.version_citation().unwrap();

        assert_eq!(citation.key.as_deref(), Some("wandb"));
        assert!(catalogs.backs_citation(&citation));
        assert!(!catalogs.backs_citation(&Citation::catalog(VERSION_SOURCE, "wandb", "0.18.0")));
        assert!(sample().version_citation().is_none());
    }

    #[test]
    fn test_find_similar() {
        let catalogs = sample();
        let similar = catalogs.find_similar(CatalogKind::Api, "wandb.logg", 5);
        assert!(similar.contains(&"wandb.log".to_string()));
        assert!(!similar.contains(&"wandb.init".to_string()));
    }

    #[tokio::test]
    async fn test_load_from_files() {
        let temp = TempDir::new().unwrap();
        let api_path = temp.path().join("api.json");
        std::fs::write(
            &api_path,
            r#"{"wandb.init": {"description": "Start a run"}, "wandb.watch": {"deprecated": true}}"#,
        )
        .unwrap();

        let catalogs = Catalogs::load(
            "wandb",
            Some("0.19.0".to_string()),
            Some(&api_path),
            Some(&temp.path().join("missing.json")),
        )
        .await
        .unwrap();

        assert_eq!(catalogs.api.len(), 2);
        assert!(catalogs.cli.is_empty());
        assert!(catalogs.api["wandb.watch"].deprecated);
        assert_eq!(catalogs.latest_version.as_deref(), Some("0.19.0"));
    }
}
