//! Rule Analyzer Set.
//!
//! A closed set of heuristic analyzers dispatched from a static table:
//! - `Links`: URL resolution through the shared `LinkChecker`
//! - `Versions`: pinned package versions against the latest-version fact
//! - `ApiCli`: symbol and command usage against the catalogs
//! - `Style`: heading structure, image alt text, terminology, fence languages
//!
//! Analyzers only report. Every suggestion they produce carries rule
//! provenance and no proposed text; patches come from `core::formatter`.

pub mod api_cli;
pub mod links;
pub mod style;
pub mod versions;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::catalog::Catalogs;
use crate::config::{AnalyzerToggles, DocsqaConfig, StyleConfig, VersionsConfig};
use crate::domain::{Document, Suggestion};

pub use api_cli::{Reference, ReferenceMatcher};
pub use links::{LinkChecker, LinkOutcome, LinkStats};
pub use style::TermRule;
pub use versions::{Drift, Version, VersionMatcher};

/// Documents analyzed at once by the CPU-only analyzers
const LOCAL_ANALYZER_CONCURRENCY: usize = 16;

/// Documents whose links are checked at once. Outbound requests are
/// bounded separately by `links.concurrency` and `links.per_host_limit`.
const LINK_ANALYZER_CONCURRENCY: usize = 4;

/// One rule family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Links,
    Versions,
    ApiCli,
    Style,
}

/// Every analyzer, in dispatch order
pub const ANALYZERS: [AnalyzerKind; 4] = [
    AnalyzerKind::Links,
    AnalyzerKind::Versions,
    AnalyzerKind::ApiCli,
    AnalyzerKind::Style,
];

impl AnalyzerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Links => "links",
            Self::Versions => "versions",
            Self::ApiCli => "api_cli",
            Self::Style => "style",
        }
    }

    pub fn is_enabled(&self, toggles: &AnalyzerToggles) -> bool {
        match self {
            Self::Links => toggles.links,
            Self::Versions => toggles.versions,
            Self::ApiCli => toggles.api_cli,
            Self::Style => toggles.style,
        }
    }

    /// Documents this analyzer may process concurrently
    fn concurrency(&self) -> usize {
        match self {
            Self::Links => LINK_ANALYZER_CONCURRENCY,
            _ => LOCAL_ANALYZER_CONCURRENCY,
        }
    }

    /// Run this analyzer on one document
    pub async fn run(&self, doc: &Document, services: &RuleServices) -> Vec<Suggestion> {
        match self {
            Self::Links => links::analyze(doc, &services.links).await,
            Self::Versions => versions::analyze(doc, &services.versions, &services.catalogs, &services.version_settings),
            Self::ApiCli => api_cli::analyze(doc, &services.references, &services.catalogs),
            Self::Style => style::analyze(doc, &services.style_settings, &services.terms),
        }
    }
}

/// Run-scoped lookups the analyzers consume. Read-only once built.
pub struct RuleServices {
    pub catalogs: Arc<Catalogs>,
    pub links: Arc<LinkChecker>,
    versions: VersionMatcher,
    references: ReferenceMatcher,
    terms: Vec<TermRule>,
    version_settings: VersionsConfig,
    style_settings: StyleConfig,
}

impl RuleServices {
    pub fn new(settings: &DocsqaConfig, catalogs: Arc<Catalogs>, links: Arc<LinkChecker>) -> Result<Self, regex::Error> {
        let package = &settings.versions.package;
        Ok(Self {
            versions: VersionMatcher::new(package)?,
            references: ReferenceMatcher::new(package)?,
            terms: style::parse_terms(&settings.terminology),
            version_settings: settings.versions.clone(),
            style_settings: settings.style.clone(),
            catalogs,
            links,
        })
    }
}

/// The enabled analyzers with a concurrency bound per kind
pub struct AnalyzerSet {
    services: RuleServices,
    permits: BTreeMap<AnalyzerKind, Semaphore>,
}

impl AnalyzerSet {
    pub fn new(settings: &DocsqaConfig, services: RuleServices) -> Self {
        let permits = ANALYZERS
            .iter()
            .filter(|kind| kind.is_enabled(&settings.analyzers))
            .map(|kind| (*kind, Semaphore::new(kind.concurrency())))
            .collect();
        Self { services, permits }
    }

    pub fn enabled(&self) -> Vec<AnalyzerKind> {
        self.permits.keys().copied().collect()
    }

    pub fn services(&self) -> &RuleServices {
        &self.services
    }

    /// Run every enabled analyzer on a document; output is in table order
    pub async fn analyze(&self, doc: &Document) -> Vec<Suggestion> {
        let runs = self.permits.iter().map(|(kind, permits)| async move {
            let Ok(_permit) = permits.acquire().await else {
                return Vec::new();
            };
            let found = kind.run(doc, &self.services).await;
            debug!(analyzer = kind.name(), document = %doc.path, found = found.len(), "Analyzer finished");
            found
        });
        join_all(runs).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LinkResolver, ProbeError};
    use crate::domain::RuleCode;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysNotFound;

    #[async_trait]
    impl LinkResolver for AlwaysNotFound {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
            Ok(404)
        }
    }

    fn analyzer_set(settings: &DocsqaConfig) -> AnalyzerSet {
        let catalogs = Arc::new(Catalogs::new("wandb").with_latest_version(Some("0.19.0".to_string())));
        let links = Arc::new(LinkChecker::new(Arc::new(AlwaysNotFound), &settings.links));
        AnalyzerSet::new(settings, RuleServices::new(settings, catalogs, links).unwrap())
    }

    const DOC: &str = "Intro with [link](https://example.com/x).\n\n```bash\npip install wandb==0.10.0\n```\n";

    #[tokio::test]
    async fn test_all_analyzers_run_in_table_order() {
        let settings = DocsqaConfig::default();
        let set = analyzer_set(&settings);
        let doc = Document::parse("a.md", DOC).unwrap();

        let codes: Vec<RuleCode> = set.analyze(&doc).await.iter().map(|s| s.rule_code).collect();
        assert_eq!(codes, vec![RuleCode::LinkBroken, RuleCode::SdkverMinor, RuleCode::StyleNoH1]);
    }

    #[tokio::test]
    async fn test_disabled_analyzer_leaves_others_untouched() {
        let mut settings = DocsqaConfig::default();
        settings.analyzers.links = false;
        let set = analyzer_set(&settings);
        let doc = Document::parse("a.md", DOC).unwrap();

        assert_eq!(set.enabled(), vec![AnalyzerKind::Versions, AnalyzerKind::ApiCli, AnalyzerKind::Style]);
        let codes: Vec<RuleCode> = set.analyze(&doc).await.iter().map(|s| s.rule_code).collect();
        assert_eq!(codes, vec![RuleCode::SdkverMinor, RuleCode::StyleNoH1]);
    }

    #[test]
    fn test_document_fanout_ignores_url_limit() {
        let mut settings = DocsqaConfig::default();
        settings.links.concurrency = 1;
        let set = analyzer_set(&settings);

        assert_eq!(set.permits[&AnalyzerKind::Links].available_permits(), LINK_ANALYZER_CONCURRENCY);
        assert_eq!(set.permits[&AnalyzerKind::Style].available_permits(), LOCAL_ANALYZER_CONCURRENCY);
    }
}
