//! Link validation.
//!
//! `LinkChecker` is shared by the link analyzer and the verifier's link
//! guard. It bounds concurrency globally and per host, retries transient
//! failures, caches one outcome per URL for the run and counts attempts
//! and failures for the run-level abort check. Once the run is cancelled
//! no further probe is sent; pending checks resolve to `Skipped`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use reqwest::Url;
use serde::Serialize;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::adapters::{LinkResolver, ProbeError};
use crate::config::LinksConfig;
use crate::core::{CancelToken, RetryPolicy};
use crate::domain::{Document, Location, RuleCode, Severity, Suggestion};

/// Classified result of checking one URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkOutcome {
    Ok { status: u16 },
    Broken { status: u16 },
    Unreachable { reason: String },
    Timeout,
    /// Not checked: mailto, fragment-only, relative without a base URL,
    /// or the run was cancelled first
    Skipped,
}

impl LinkOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Broken { .. } | Self::Unreachable { .. } | Self::Timeout
        )
    }

    /// Worth another attempt
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Unreachable { .. } => true,
            Self::Broken { status } => *status == 429 || *status >= 500,
            Self::Ok { .. } | Self::Skipped => false,
        }
    }

    pub fn rule_code(&self) -> Option<RuleCode> {
        match self {
            Self::Broken { .. } => Some(RuleCode::LinkBroken),
            Self::Unreachable { .. } => Some(RuleCode::LinkUnreachable),
            Self::Timeout => Some(RuleCode::LinkTimeout),
            Self::Ok { .. } | Self::Skipped => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Timeout => Severity::Medium,
            _ => Severity::High,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Ok { status } => format!("HTTP {}", status),
            Self::Broken { status } => format!("HTTP {}", status),
            Self::Unreachable { reason } => format!("unreachable ({})", reason),
            Self::Timeout => "timed out".to_string(),
            Self::Skipped => "not checked".to_string(),
        }
    }
}

/// Attempt counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Distinct URLs checked
    pub attempts: u64,
    /// Distinct URLs whose final outcome was a failure
    pub failures: u64,
}

impl LinkStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.failures as f64 / self.attempts as f64
    }

    /// Whether the failure rate signals an outage rather than broken docs
    pub fn exceeds(&self, settings: &LinksConfig) -> bool {
        self.attempts >= settings.abort_min_attempts && self.failure_rate() > settings.abort_failure_rate
    }
}

/// Run-scoped link checker
pub struct LinkChecker {
    resolver: Arc<dyn LinkResolver>,
    timeout: Duration,
    base_url: Option<Url>,
    retry: RetryPolicy,
    global: Semaphore,
    per_host_limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    cache: Mutex<HashMap<String, Arc<OnceCell<LinkOutcome>>>>,
    cancel: CancelToken,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl LinkChecker {
    pub fn new(resolver: Arc<dyn LinkResolver>, settings: &LinksConfig) -> Self {
        let base_url = settings.base_url.as_deref().and_then(|raw| match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(base_url = raw, error = %e, "Ignoring invalid links.base_url");
                None
            }
        });

        Self {
            resolver,
            timeout: Duration::from_millis(settings.timeout_ms),
            base_url,
            retry: RetryPolicy::new(settings.max_attempts, settings.retry_delay_ms),
            global: Semaphore::new(settings.concurrency.max(1)),
            per_host_limit: settings.per_host_limit.max(1),
            hosts: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cancel: CancelToken::new(),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Stop probing when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            attempts: self.attempts.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    /// Absolute, fragment-free URL to check, or `None` to skip
    pub fn resolve_target(&self, raw: &str) -> Option<Url> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }
        let lower = raw.to_ascii_lowercase();
        if ["mailto:", "tel:", "javascript:", "data:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            return None;
        }

        let mut url = match Url::parse(raw) {
            Ok(url) => url,
            Err(_) => self.base_url.as_ref()?.join(raw).ok()?,
        };
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.set_fragment(None);
        Some(url)
    }

    /// Check one link target, reusing any earlier outcome for the same URL
    pub async fn check(&self, raw: &str) -> LinkOutcome {
        let Some(url) = self.resolve_target(raw) else {
            return LinkOutcome::Skipped;
        };

        let cell = match self.cache.lock() {
            Ok(mut cache) => cache.entry(url.to_string()).or_default().clone(),
            Err(_) => Arc::new(OnceCell::new()),
        };
        cell.get_or_init(|| self.check_uncached(&url)).await.clone()
    }

    async fn check_uncached(&self, url: &Url) -> LinkOutcome {
        let outcome = self.probe_with_retry(url).await;
        if outcome == LinkOutcome::Skipped {
            debug!(url = %url, "Link check cancelled");
            return outcome;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        if outcome.is_failure() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        debug!(url = %url, outcome = %outcome.describe(), "Checked link");
        outcome
    }

    async fn probe_with_retry(&self, url: &Url) -> LinkOutcome {
        let host_limit = self.host_semaphore(url.host_str().unwrap_or_default());
        let mut attempt = 1;

        loop {
            let outcome = {
                let (Ok(_host), Ok(_global)) = (host_limit.acquire().await, self.global.acquire().await) else {
                    return LinkOutcome::Unreachable {
                        reason: "link checker closed".to_string(),
                    };
                };
                if self.cancel.is_cancelled() {
                    return LinkOutcome::Skipped;
                }
                self.probe_once(url).await
            };

            if !outcome.is_transient() || !self.retry.should_retry(attempt) {
                return outcome;
            }
            debug!(url = %url, attempt, outcome = %outcome.describe(), "Retrying link");
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    async fn probe_once(&self, url: &Url) -> LinkOutcome {
        match tokio::time::timeout(self.timeout, self.resolver.probe(url.as_str(), self.timeout)).await {
            Err(_) | Ok(Err(ProbeError::Timeout)) => LinkOutcome::Timeout,
            Ok(Err(ProbeError::Unreachable(reason))) => LinkOutcome::Unreachable { reason },
            Ok(Ok(status)) if status < 400 => LinkOutcome::Ok { status },
            Ok(Ok(status)) => LinkOutcome::Broken { status },
        }
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        match self.hosts.lock() {
            Ok(mut hosts) => hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
                .clone(),
            Err(_) => Arc::new(Semaphore::new(self.per_host_limit)),
        }
    }
}

/// Check every link in a document and report failures
pub async fn analyze(doc: &Document, checker: &LinkChecker) -> Vec<Suggestion> {
    let outcomes = join_all(doc.structure.links.iter().map(|link| async move {
        (link, checker.check(&link.url).await)
    }))
    .await;

    outcomes
        .into_iter()
        .filter_map(|(link, outcome)| {
            let code = outcome.rule_code()?;
            let title = match code {
                RuleCode::LinkTimeout => format!("Link timed out: {}", link.url),
                RuleCode::LinkUnreachable => format!("Unreachable link: {}", link.url),
                _ => format!("Broken link: {}", link.url),
            };
            let mut suggestion = Suggestion::rule(
                doc.path.clone(),
                code,
                outcome.severity(),
                title,
                format!("Link check for {} returned {}.", link.url, outcome.describe()),
                Location::new(link.line, link.line),
                doc.line(link.line).unwrap_or_default(),
            )
            .with_evidence("url", link.url.clone())
            .with_evidence("outcome", outcome.describe());
            if let LinkOutcome::Broken { status } = outcome {
                suggestion = suggestion.with_evidence("status", status.to_string());
            }
            Some(suggestion)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Resolver answering from a fixed table; unknown URLs are 200
    struct TableResolver {
        table: HashMap<String, Vec<Result<u16, ProbeError>>>,
        calls: AtomicUsize,
    }

    impl TableResolver {
        fn new(entries: Vec<(&str, Vec<Result<u16, ProbeError>>)>) -> Self {
            Self {
                table: entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LinkResolver for TableResolver {
        async fn probe(&self, url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.table.get(url) {
                Some(answers) => answers[n.min(answers.len() - 1)].clone(),
                None => Ok(200),
            }
        }
    }

    fn settings() -> LinksConfig {
        LinksConfig {
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_classifies_outcomes() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("https://example.com/missing", vec![Ok(404)]),
            ("https://down.example.com/", vec![Err(ProbeError::Unreachable("dns".into()))]),
            ("https://slow.example.com/", vec![Err(ProbeError::Timeout)]),
        ]));
        let checker = LinkChecker::new(resolver, &settings());

        assert_eq!(checker.check("https://example.com/ok").await, LinkOutcome::Ok { status: 200 });
        assert_eq!(
            checker.check("https://example.com/missing#part").await,
            LinkOutcome::Broken { status: 404 }
        );
        assert!(matches!(
            checker.check("https://down.example.com/").await,
            LinkOutcome::Unreachable { .. }
        ));
        assert_eq!(checker.check("https://slow.example.com/").await, LinkOutcome::Timeout);

        let stats = checker.stats();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.failures, 3);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let resolver = Arc::new(TableResolver::new(vec![(
            "https://flaky.example.com/",
            vec![Ok(503), Ok(200)],
        )]));
        let checker = LinkChecker::new(resolver.clone(), &settings());

        assert_eq!(checker.check("https://flaky.example.com/").await, LinkOutcome::Ok { status: 200 });
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(checker.stats().failures, 0);
    }

    #[tokio::test]
    async fn test_outcome_cached_per_url() {
        let resolver = Arc::new(TableResolver::new(vec![]));
        let checker = LinkChecker::new(resolver.clone(), &settings());

        checker.check("https://example.com/a#one").await;
        checker.check("https://example.com/a#two").await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(checker.stats().attempts, 1);
    }

    #[tokio::test]
    async fn test_skips_uncheckable_targets() {
        let checker = LinkChecker::new(Arc::new(TableResolver::new(vec![])), &settings());

        for target in ["mailto:a@b.c", "#section", "../guide.md", "tel:123"] {
            assert_eq!(checker.check(target).await, LinkOutcome::Skipped, "{}", target);
        }
        assert_eq!(checker.stats().attempts, 0);
    }

    #[tokio::test]
    async fn test_relative_links_use_base_url() {
        let checker = LinkChecker::new(
            Arc::new(TableResolver::new(vec![])),
            &LinksConfig {
                base_url: Some("https://docs.example.com/guides/".to_string()),
                ..settings()
            },
        );

        let url = checker.resolve_target("setup.md#install").unwrap();
        assert_eq!(url.as_str(), "https://docs.example.com/guides/setup.md");
    }

    #[tokio::test]
    async fn test_analyze_reports_failures() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("https://example.com/gone", vec![Ok(410)]),
            ("https://slow.example.com/", vec![Err(ProbeError::Timeout)]),
        ]));
        let checker = LinkChecker::new(resolver, &settings());
        let doc = Document::parse(
            "a.md",
            "# T\n\nSee [gone](https://example.com/gone).\n\nAlso https://slow.example.com/ and https://example.com/fine\n",
        )
        .unwrap();

        let suggestions = analyze(&doc, &checker).await;
        assert_eq!(suggestions.len(), 2);

        let broken = suggestions.iter().find(|s| s.rule_code == RuleCode::LinkBroken).unwrap();
        assert_eq!(broken.severity, Severity::High);
        assert_eq!(broken.location.line_start, 3);
        assert_eq!(broken.evidence["status"], "410");

        let timeout = suggestions.iter().find(|s| s.rule_code == RuleCode::LinkTimeout).unwrap();
        assert_eq!(timeout.severity, Severity::Medium);
    }

    /// Resolver recording peak in-flight probes, per host and overall
    #[derive(Default)]
    struct GaugeResolver {
        in_flight: Mutex<HashMap<String, usize>>,
        peak_per_host: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        peak_total: AtomicUsize,
    }

    #[async_trait]
    impl LinkResolver for GaugeResolver {
        async fn probe(&self, url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
            let host = Url::parse(url).unwrap().host_str().unwrap().to_string();
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let now = in_flight.entry(host.clone()).or_default();
                *now += 1;
                let mut peaks = self.peak_per_host.lock().unwrap();
                let peak = peaks.entry(host.clone()).or_default();
                *peak = (*peak).max(*now);
            }
            let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_total.fetch_max(total, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.total.fetch_sub(1, Ordering::SeqCst);
            *self.in_flight.lock().unwrap().get_mut(&host).unwrap() -= 1;
            Ok(200)
        }
    }

    #[tokio::test]
    async fn test_per_host_limit_caps_one_host_only() {
        let resolver = Arc::new(GaugeResolver::default());
        let checker = LinkChecker::new(
            resolver.clone(),
            &LinksConfig {
                concurrency: 8,
                per_host_limit: 1,
                ..settings()
            },
        );

        let mut urls: Vec<String> = (0..4).map(|i| format!("https://busy.example.com/page/{i}")).collect();
        urls.extend((0..4).map(|i| format!("https://host{i}.example.org/")));
        let outcomes = join_all(urls.iter().map(|url| checker.check(url))).await;

        assert!(outcomes.iter().all(LinkOutcome::is_ok));
        assert_eq!(checker.stats().attempts, 8);
        let peaks = resolver.peak_per_host.lock().unwrap();
        assert_eq!(peaks["busy.example.com"], 1);
        assert!(resolver.peak_total.load(Ordering::SeqCst) >= 2);
    }

    /// Resolver that cancels the run on its first request
    struct CancellingResolver {
        cancel: CancelToken,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LinkResolver for CancellingResolver {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(200)
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_further_requests() {
        let cancel = CancelToken::new();
        let resolver = Arc::new(CancellingResolver {
            cancel: cancel.clone(),
            calls: AtomicUsize::new(0),
        });
        let checker = LinkChecker::new(
            resolver.clone(),
            &LinksConfig {
                concurrency: 1,
                ..settings()
            },
        )
        .with_cancel(cancel);

        let urls: Vec<String> = (0..10).map(|i| format!("https://host{i}.example.com/")).collect();
        let outcomes = join_all(urls.iter().map(|url| checker.check(url))).await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == LinkOutcome::Skipped).count(), 9);
        assert_eq!(checker.stats().attempts, 1);
    }

    #[test]
    fn test_abort_threshold() {
        let settings = LinksConfig::default();
        assert!(LinkStats { attempts: 50, failures: 20 }.exceeds(&settings));
        assert!(!LinkStats { attempts: 50, failures: 15 }.exceeds(&settings));
        assert!(!LinkStats { attempts: 3, failures: 3 }.exceeds(&settings));
    }
}
