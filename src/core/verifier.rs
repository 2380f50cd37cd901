//! Patch verifier.
//!
//! Runs six ordered guards over a patch and its finding. Every guard runs
//! even after a failure so the rationale is complete:
//! 1. Scope: changed lines stay inside the finding's range
//! 2. Structural: non-code edits leave fences, heading levels, link
//!    targets and images alone
//! 3. Whitespace churn: bounded number of whitespace-only line changes
//! 4. Catalog: code edits cite a real catalog entry
//! 5. Link: introduced URLs pass the link checker
//! 6. Version: introduced version literals equal the latest release
//!
//! Verdicts carry a fingerprint of the guard configuration; a stored
//! verdict is reused only while that fingerprint and the patch digest match.

use std::collections::BTreeSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::analyzers::{LinkChecker, Version, VersionMatcher};
use crate::catalog::Catalogs;
use crate::config::GuardrailsConfig;
use crate::domain::{
    CitationKind, Finding, GuardName, Patch, RuleCode, Structure, SuggestionKind, VerifierVerdict,
};

/// Failure reason from one guard
type GuardResult = Result<(), String>;

pub struct PatchVerifier {
    guardrails: GuardrailsConfig,
    catalogs: Arc<Catalogs>,
    links: Arc<LinkChecker>,
    versions: VersionMatcher,
    config_fingerprint: String,
}

impl PatchVerifier {
    pub fn new(
        guardrails: GuardrailsConfig,
        catalogs: Arc<Catalogs>,
        links: Arc<LinkChecker>,
        versions: VersionMatcher,
    ) -> Self {
        let config_fingerprint = config_fingerprint(&guardrails, catalogs.latest_version.as_deref());
        Self {
            guardrails,
            catalogs,
            links,
            versions,
            config_fingerprint,
        }
    }

    pub fn config_fingerprint(&self) -> &str {
        &self.config_fingerprint
    }

    /// Reuse `previous` when it was produced for this patch under this configuration
    pub async fn verify_cached(
        &self,
        patch: &Patch,
        finding: &Finding,
        previous: Option<&VerifierVerdict>,
    ) -> VerifierVerdict {
        match previous {
            Some(verdict) if verdict.is_current(&self.config_fingerprint, patch) => verdict.clone(),
            _ => self.verify(patch, finding).await,
        }
    }

    /// Run every guard and collect the failures
    pub async fn verify(&self, patch: &Patch, finding: &Finding) -> VerifierVerdict {
        let mut failed_guards = Vec::new();
        let mut rationale = Vec::new();

        for guard in GuardName::ALL {
            let result = match guard {
                GuardName::Scope => self.scope_guard(patch, finding),
                GuardName::Structural => self.structural_guard(patch, finding),
                GuardName::WhitespaceChurn => self.whitespace_guard(patch),
                GuardName::Catalog => self.catalog_guard(finding),
                GuardName::Link => self.link_guard(patch).await,
                GuardName::Version => self.version_guard(patch),
            };
            if let Err(reason) = result {
                debug!(guard = %guard, issue = %finding.key.short_id(), reason = %reason, "Guard failed");
                failed_guards.push(guard);
                rationale.push(format!("{}: {}", guard, reason));
            }
        }

        VerifierVerdict {
            can_auto_apply: failed_guards.is_empty(),
            failed_guards,
            rationale,
            config_fingerprint: self.config_fingerprint.clone(),
            patch_digest: patch.digest.clone(),
        }
    }

    fn scope_guard(&self, patch: &Patch, finding: &Finding) -> GuardResult {
        if patch.document != finding.key.document {
            return Err(format!("patch targets {} instead of {}", patch.document, finding.key.document));
        }
        let (start, end) = (finding.key.line_start, finding.line_end);

        for hunk in &patch.hunks {
            let outside: Vec<usize> = if hunk.removed.is_empty() {
                // Insertion before original_start; appending right after the range is allowed
                let at = hunk.original_start;
                if at >= start && at <= end + 1 {
                    Vec::new()
                } else {
                    vec![at]
                }
            } else {
                hunk.touched_lines()
                    .into_iter()
                    .filter(|line| *line < start || *line > end)
                    .collect()
            };
            if let Some(line) = outside.first() {
                return Err(format!("line {} changed outside declared range {}-{}", line, start, end));
            }
        }
        Ok(())
    }

    fn structural_guard(&self, patch: &Patch, finding: &Finding) -> GuardResult {
        let before = Structure::scan(&patch.original, patch.anchor)
            .map_err(|e| format!("original snippet does not parse: {}", e))?;
        let after = Structure::scan(&patch.proposed, patch.anchor)
            .map_err(|e| format!("proposed snippet does not parse: {}", e))?;

        if finding.kind == SuggestionKind::CodeEdit {
            return Ok(());
        }

        let fences = |s: &Structure| {
            s.code_fences
                .iter()
                .map(|f| (f.lang.clone(), f.body.clone()))
                .collect::<Vec<_>>()
        };
        if fences(&before) != fences(&after) {
            return Err("code fence changed by a non-code edit".to_string());
        }

        let levels = |s: &Structure| s.headings.iter().map(|h| h.level).collect::<Vec<_>>();
        if levels(&before) != levels(&after) {
            return Err("heading structure changed".to_string());
        }

        let targets = |s: &Structure| s.link_targets().into_iter().map(str::to_string).collect::<BTreeSet<_>>();
        if targets(&before) != targets(&after) {
            return Err("link targets changed".to_string());
        }

        let images = |s: &Structure| s.images.iter().map(|i| i.src.clone()).collect::<BTreeSet<_>>();
        if images(&before) != images(&after) {
            return Err("image sources changed".to_string());
        }
        Ok(())
    }

    fn whitespace_guard(&self, patch: &Patch) -> GuardResult {
        let mut churn = 0usize;
        for hunk in &patch.hunks {
            let paired = hunk.removed.len().min(hunk.added.len());
            churn += hunk
                .removed
                .iter()
                .zip(&hunk.added)
                .filter(|(old, new)| old != new && old.split_whitespace().eq(new.split_whitespace()))
                .count();
            churn += hunk.removed[paired..]
                .iter()
                .chain(&hunk.added[paired..])
                .filter(|line| line.trim().is_empty())
                .count();
        }

        if churn > self.guardrails.max_whitespace_delta_lines {
            return Err(format!(
                "{} whitespace-only line changes (limit {})",
                churn, self.guardrails.max_whitespace_delta_lines
            ));
        }
        Ok(())
    }

    fn catalog_guard(&self, finding: &Finding) -> GuardResult {
        let catalog_citations: Vec<_> = finding
            .citations
            .iter()
            .filter(|c| c.kind == CitationKind::Catalog)
            .collect();

        if let Some(unbacked) = catalog_citations.iter().find(|c| !self.catalogs.backs_citation(c)) {
            return Err(format!(
                "catalog citation {} is not in the catalog",
                unbacked.key.as_deref().unwrap_or("<missing key>")
            ));
        }
        if finding.kind == SuggestionKind::CodeEdit && catalog_citations.is_empty() {
            return Err("code edit has no catalog citation".to_string());
        }
        if self.guardrails.require_citations
            && finding.key.rule_code == RuleCode::LlmAccuracy
            && finding.citations.is_empty()
        {
            return Err("accuracy claim has no citation".to_string());
        }
        Ok(())
    }

    async fn link_guard(&self, patch: &Patch) -> GuardResult {
        let before = Structure::scan(&patch.original, patch.anchor).unwrap_or_default();
        let after = Structure::scan(&patch.proposed, patch.anchor).unwrap_or_default();
        let existing: BTreeSet<&str> = before.link_targets().into_iter().collect();
        let introduced: BTreeSet<&str> = after
            .link_targets()
            .into_iter()
            .filter(|url| !existing.contains(url))
            .collect();

        for url in introduced {
            let outcome = self.links.check(url).await;
            if !outcome.is_ok() {
                return Err(format!("introduced link {} is {}", url, outcome.describe()));
            }
        }
        Ok(())
    }

    fn version_guard(&self, patch: &Patch) -> GuardResult {
        let versions = |lines: &[String]| {
            lines
                .iter()
                .flat_map(|line| self.versions.find(line))
                .map(|m| m.version)
                .collect::<BTreeSet<_>>()
        };
        let existing = versions(patch.original.as_slice());
        let introduced: Vec<String> = versions(patch.proposed.as_slice())
            .into_iter()
            .filter(|v| !existing.contains(v))
            .collect();
        if introduced.is_empty() {
            return Ok(());
        }

        let latest_text = self.catalogs.latest_version.as_deref();
        let latest = latest_text.and_then(Version::parse);
        for version in introduced {
            if latest.is_none() || Version::parse(&version) != latest {
                return Err(format!(
                    "introduced version {} does not match latest {}",
                    version,
                    latest_text.unwrap_or("(unknown)")
                ));
            }
        }
        Ok(())
    }
}

/// SHA-256 over the guard configuration and the facts guards compare against
pub fn config_fingerprint(guardrails: &GuardrailsConfig, latest_version: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(guardrails).unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(latest_version.unwrap_or_default().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
