//! Issue merger.
//!
//! Reconciles the candidate suggestions of one run into one `Finding` per
//! `IssueKey`. Candidates are put in a total order first (key, then stage,
//! then production sequence) so the result never depends on task timing:
//! - Citations, tags and provenance are unioned
//! - Severity and confidence take the maximum
//! - The snippet pair, kind, description and range come from the last
//!   candidate in that order
//!
//! Rule and LLM findings with different rule codes stay separate unless
//! their category is listed in `merge.by_category`.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::MergeConfig;
use crate::domain::{Finding, IssueCategory, IssueKey, Provenance, Suggestion};

#[derive(Debug, Clone, Default)]
pub struct IssueMerger {
    by_category: BTreeSet<IssueCategory>,
}

impl IssueMerger {
    pub fn new(settings: &MergeConfig) -> Self {
        Self {
            by_category: settings.by_category.iter().copied().collect(),
        }
    }

    /// Merge a run's candidates; output is ordered by key
    pub fn merge(&self, candidates: Vec<Suggestion>) -> Vec<Finding> {
        let mut ordered: Vec<(usize, Suggestion)> = candidates.into_iter().enumerate().collect();
        ordered.sort_by(|(seq_a, a), (seq_b, b)| {
            a.key()
                .cmp(&b.key())
                .then(a.provenance.cmp(&b.provenance))
                .then(seq_a.cmp(seq_b))
        });

        let mut grouped: BTreeMap<IssueKey, Finding> = BTreeMap::new();
        for (_, suggestion) in ordered {
            let key = suggestion.key();
            match grouped.remove(&key) {
                Some(existing) => {
                    grouped.insert(key, fold(existing, finding_from(suggestion)));
                }
                None => {
                    grouped.insert(key, finding_from(suggestion));
                }
            }
        }

        if self.by_category.is_empty() {
            return grouped.into_values().collect();
        }
        self.fold_by_category(grouped)
    }

    fn fold_by_category(&self, grouped: BTreeMap<IssueKey, Finding>) -> Vec<Finding> {
        let (mut rule_findings, llm_findings): (Vec<Finding>, Vec<Finding>) = grouped
            .into_values()
            .partition(|f| f.provenance.contains(&Provenance::Rule));

        let mut kept = Vec::new();
        for llm in llm_findings {
            let category = llm.key.rule_code.category();
            let target = if self.by_category.contains(&category) {
                rule_findings.iter_mut().find(|rule| {
                    rule.key.document == llm.key.document
                        && rule.key.rule_code.category() == category
                        && rule.location().overlaps(&llm.location())
                })
            } else {
                None
            };

            match target {
                Some(rule) => absorb_llm(rule, llm),
                None => kept.push(llm),
            }
        }

        rule_findings.extend(kept);
        rule_findings.sort_by(|a, b| a.key.cmp(&b.key));
        rule_findings
    }
}

fn finding_from(s: Suggestion) -> Finding {
    Finding {
        key: s.key(),
        kind: s.kind,
        severity: s.severity,
        confidence: s.confidence,
        description: s.description,
        line_end: s.location.line_end,
        original_snippet: s.original_snippet,
        proposed_snippet: s.proposed_snippet,
        citations: s.citations.into_iter().collect(),
        tags: s.tags.into_iter().collect(),
        provenance: [s.provenance].into_iter().collect(),
        evidence: s.evidence,
    }
}

/// Fold a later candidate for the same key into the accumulated finding
fn fold(earlier: Finding, later: Finding) -> Finding {
    let mut merged = later;
    merged.severity = merged.severity.max(earlier.severity);
    merged.confidence = merged.confidence.max(earlier.confidence);
    merged.citations.extend(earlier.citations);
    merged.tags.extend(earlier.tags);
    merged.provenance.extend(earlier.provenance);
    for (k, v) in earlier.evidence {
        merged.evidence.entry(k).or_insert(v);
    }
    merged
}

/// Fold an LLM finding into an overlapping rule finding of the same category
fn absorb_llm(rule: &mut Finding, llm: Finding) {
    rule.severity = rule.severity.max(llm.severity);
    rule.citations.extend(llm.citations);
    rule.tags.extend(llm.tags);
    rule.tags.insert(format!("merged:{}", llm.key.rule_code));
    rule.provenance.insert(Provenance::Llm);
    if rule.proposed_snippet.is_none() && llm.proposed_snippet.is_some() {
        rule.original_snippet = llm.original_snippet;
        rule.proposed_snippet = llm.proposed_snippet;
        rule.line_end = rule.line_end.max(llm.line_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Citation, Location, RuleCode, Severity};

    fn suggestion(code: RuleCode, line: usize, severity: Severity) -> Suggestion {
        Suggestion::rule("a.md", code, severity, "Title", "desc", Location::new(line, line), "old")
    }

    fn llm(code: RuleCode, line: usize) -> Suggestion {
        let mut s = suggestion(code, line, Severity::Low).with_proposed("new");
        s.provenance = Provenance::Llm;
        s.confidence = 0.7;
        s
    }

    #[test]
    fn test_same_key_unions_citations_and_takes_max_severity() {
        let a = suggestion(RuleCode::StyleTerminology, 3, Severity::Low)
            .with_citation(Citation::document("a.md", 3, 3));
        let b = suggestion(RuleCode::StyleTerminology, 3, Severity::High)
            .with_citation(Citation::fact("style_guide", "W&B"));

        let findings = IssueMerger::default().merge(vec![a, b]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].citations.len(), 2);
    }

    #[test]
    fn test_latest_snippet_wins() {
        let first = llm(RuleCode::LlmGrammar, 4).with_proposed("first");
        let second = llm(RuleCode::LlmGrammar, 4).with_proposed("second");

        let findings = IssueMerger::default().merge(vec![first, second]);
        assert_eq!(findings[0].proposed_snippet.as_deref(), Some("second"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let candidates = vec![
            llm(RuleCode::LlmClarity, 5),
            suggestion(RuleCode::StyleImgNoAlt, 2, Severity::Medium),
            llm(RuleCode::LlmSpell, 5),
            suggestion(RuleCode::StyleImgNoAlt, 2, Severity::Low),
        ];

        let merger = IssueMerger::default();
        let once = merger.merge(candidates.clone());
        let twice = merger.merge(candidates);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_rule_and_llm_stay_separate_by_default() {
        let candidates = vec![
            suggestion(RuleCode::StyleTerminology, 3, Severity::Low),
            llm(RuleCode::LlmConsistency, 3),
        ];
        assert_eq!(IssueMerger::default().merge(candidates).len(), 2);
    }

    #[test]
    fn test_merge_by_category() {
        let merger = IssueMerger::new(&MergeConfig {
            by_category: vec![IssueCategory::Style],
        });
        let candidates = vec![
            suggestion(RuleCode::StyleTerminology, 3, Severity::Low),
            llm(RuleCode::LlmConsistency, 3),
            llm(RuleCode::LlmGrammar, 3),
        ];

        let findings = merger.merge(candidates);
        assert_eq!(findings.len(), 2);

        let style = findings
            .iter()
            .find(|f| f.key.rule_code == RuleCode::StyleTerminology)
            .unwrap();
        assert!(style.provenance.contains(&Provenance::Rule));
        assert!(style.provenance.contains(&Provenance::Llm));
        assert!(style.tags.contains("merged:LLM_CONSISTENCY"));
    }
}
