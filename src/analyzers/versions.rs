//! Version drift detection.
//!
//! Finds pinned versions of the configured package (`pip install pkg==X`,
//! `pkg==X`, `"pkg": "^X"`, `conda install pkg=X`, `pkg version X`) and
//! compares them with the latest-version fact.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;

use regex::{Regex, RegexBuilder};

use crate::catalog::Catalogs;
use crate::config::VersionsConfig;
use crate::domain::{Document, Location, RuleCode, Severity, Suggestion, SuggestionKind};

/// Minor drift beyond this is reported as high severity
const HIGH_MINOR_DRIFT: u64 = 3;

/// A `major.minor[.patch]` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().trim_start_matches('v').split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How far a pinned version trails the latest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    Current,
    Major { behind: u64 },
    Minor { behind: u64 },
}

impl Drift {
    pub fn between(found: Version, latest: Version) -> Self {
        if found >= latest {
            return Self::Current;
        }
        match found.major.cmp(&latest.major) {
            Ordering::Less => Self::Major {
                behind: latest.major - found.major,
            },
            _ => Self::Minor {
                behind: latest.minor.saturating_sub(found.minor),
            },
        }
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::Major { behind } => write!(f, "{} major behind", behind),
            Self::Minor { behind } => write!(f, "{} minor behind", behind),
        }
    }
}

/// One version literal found on a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMatch {
    /// Byte range of the version text within the line
    pub span: Range<usize>,
    pub version: String,
}

/// Package-specific version literal patterns
#[derive(Debug, Clone)]
pub struct VersionMatcher {
    package: String,
    patterns: Vec<Regex>,
}

impl VersionMatcher {
    pub fn new(package: &str) -> Result<Self, regex::Error> {
        let pkg = regex::escape(package);
        let ver = r"v?(\d+\.\d+(?:\.\d+)?)";
        let sources = [
            format!(r"\b{pkg}\s*={{1,2}}\s*{ver}"),
            format!(r#"["']{pkg}["']\s*[:=]\s*["'][\^~=>]*{ver}["']"#),
            format!(r"\b{pkg}\s+version\s+{ver}"),
        ];

        let patterns = sources
            .iter()
            .map(|src| RegexBuilder::new(src).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            package: package.to_string(),
            patterns,
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// Version literals on a line, in position order, without duplicates
    pub fn find(&self, line: &str) -> Vec<VersionMatch> {
        let mut found: Vec<VersionMatch> = self
            .patterns
            .iter()
            .flat_map(|re| re.captures_iter(line))
            .filter_map(|caps| caps.get(1))
            .map(|m| VersionMatch {
                span: m.range(),
                version: m.as_str().to_string(),
            })
            .collect();
        found.sort_by_key(|m| m.span.start);
        found.dedup_by_key(|m| m.span.start);
        found
    }
}

/// Report pinned versions trailing the latest version fact
pub fn analyze(
    doc: &Document,
    matcher: &VersionMatcher,
    catalogs: &Catalogs,
    settings: &VersionsConfig,
) -> Vec<Suggestion> {
    let Some(latest_text) = catalogs.latest_version.as_deref() else {
        return Vec::new();
    };
    let Some(latest) = Version::parse(latest_text) else {
        return Vec::new();
    };

    let mut suggestions = Vec::new();
    for (idx, line) in doc.lines.iter().enumerate().skip(doc.front_matter_end) {
        let line_no = idx + 1;
        for m in matcher.find(line) {
            let Some(found) = Version::parse(&m.version) else {
                continue;
            };
            let drift = Drift::between(found, latest);
            let (code, severity) = match drift {
                Drift::Major { behind } if behind > settings.allow_majors_behind => {
                    (RuleCode::SdkverMajor, Severity::High)
                }
                Drift::Minor { behind } if behind > settings.allow_minors_behind => {
                    let severity = if behind > HIGH_MINOR_DRIFT {
                        Severity::High
                    } else {
                        Severity::Medium
                    };
                    (RuleCode::SdkverMinor, severity)
                }
                _ => continue,
            };

            let kind = if doc.fence_at(line_no).is_some() {
                SuggestionKind::CodeEdit
            } else {
                SuggestionKind::TextEdit
            };
            let mut suggestion = Suggestion::rule(
                doc.path.clone(),
                code,
                severity,
                format!("Outdated {} version {}", matcher.package(), m.version),
                format!(
                    "Pinned {} version {} is {}; the latest release is {}.",
                    matcher.package(),
                    m.version,
                    drift,
                    latest_text
                ),
                Location::new(line_no, line_no),
                line.clone(),
            )
            .with_kind(kind)
            .with_evidence("found_version", m.version.clone())
            .with_evidence("latest_version", latest_text)
            .with_evidence("drift", drift.to_string())
            .with_evidence("column", m.span.start.to_string());
            if let Some(citation) = catalogs.version_citation() {
                suggestion = suggestion.with_citation(citation);
            }
            suggestions.push(suggestion);
        }
    }
    suggestions
}
