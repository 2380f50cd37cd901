//! Minimal line patches and verifier verdicts.
//!
//! A patch is derived from an (original, proposed) snippet pair anchored at
//! a document line. It records the declared range of the owning issue and
//! the hunks a line-level diff produces; the verifier checks the hunks
//! against the declared range.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Diff tables larger than this fall back to a single replace hunk
const MAX_DIFF_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("Patch does not apply at line {line}: expected {expected:?}, found {found:?}")]
    Mismatch {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("Patch hunk at line {line} is past the end of the document")]
    OutOfBounds { line: usize },
}

/// One contiguous change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// First removed original line, or for a pure insertion the original
    /// line the new text is inserted before
    pub original_start: usize,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl Hunk {
    /// Original line numbers this hunk touches
    pub fn touched_lines(&self) -> Vec<usize> {
        if self.removed.is_empty() {
            vec![self.original_start]
        } else {
            (self.original_start..self.original_start + self.removed.len()).collect()
        }
    }
}

/// A minimal diff owned by an issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub document: String,

    /// Declared range of the owning issue
    pub line_start: usize,
    pub line_end: usize,

    /// Document line of `original[0]`
    pub anchor: usize,

    pub original: Vec<String>,
    pub proposed: Vec<String>,
    pub hunks: Vec<Hunk>,

    /// Content digest, used to match cached verdicts
    pub digest: String,
}

impl Patch {
    /// Build a patch from a snippet pair
    pub fn between(
        document: impl Into<String>,
        line_start: usize,
        line_end: usize,
        anchor: usize,
        original: Vec<String>,
        proposed: Vec<String>,
    ) -> Self {
        let document = document.into();
        let hunks = diff_lines(&original, &proposed, anchor);
        let digest = patch_digest(&document, line_start, line_end, anchor, &original, &proposed);
        Self {
            document,
            line_start,
            line_end,
            anchor,
            original,
            proposed,
            hunks,
            digest,
        }
    }

    /// True when the snippets are identical
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Every original line touched by any hunk, ascending
    pub fn changed_lines(&self) -> Vec<usize> {
        let mut lines: Vec<usize> = self.hunks.iter().flat_map(|h| h.touched_lines()).collect();
        lines.sort_unstable();
        lines.dedup();
        lines
    }

    /// Apply to a full document, returning the new lines
    pub fn apply(&self, lines: &[String]) -> Result<Vec<String>, PatchError> {
        let mut out = Vec::with_capacity(lines.len());
        let mut cursor = 1;

        for hunk in &self.hunks {
            if hunk.original_start > lines.len() + 1 {
                return Err(PatchError::OutOfBounds {
                    line: hunk.original_start,
                });
            }
            while cursor < hunk.original_start {
                out.push(lines[cursor - 1].clone());
                cursor += 1;
            }
            for (offset, expected) in hunk.removed.iter().enumerate() {
                let line = hunk.original_start + offset;
                let found = lines
                    .get(line - 1)
                    .ok_or(PatchError::OutOfBounds { line })?;
                if found != expected {
                    return Err(PatchError::Mismatch {
                        line,
                        expected: expected.clone(),
                        found: found.clone(),
                    });
                }
            }
            out.extend(hunk.added.iter().cloned());
            cursor += hunk.removed.len();
        }

        while cursor <= lines.len() {
            out.push(lines[cursor - 1].clone());
            cursor += 1;
        }
        Ok(out)
    }

    /// Render as a unified diff
    pub fn unified_diff(&self) -> String {
        let mut out = format!("--- a/{}\n+++ b/{}\n", self.document, self.document);
        let mut shift: isize = 0;
        for hunk in &self.hunks {
            let old_start = if hunk.removed.is_empty() {
                hunk.original_start.saturating_sub(1)
            } else {
                hunk.original_start
            };
            let new_start = (old_start as isize + shift).max(0);
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                old_start,
                hunk.removed.len(),
                new_start,
                hunk.added.len()
            ));
            for line in &hunk.removed {
                out.push_str(&format!("-{}\n", line));
            }
            for line in &hunk.added {
                out.push_str(&format!("+{}\n", line));
            }
            shift += hunk.added.len() as isize - hunk.removed.len() as isize;
        }
        out
    }
}

fn patch_digest(
    document: &str,
    line_start: usize,
    line_end: usize,
    anchor: usize,
    original: &[String],
    proposed: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}\0{}\0{}\0{}\0", document, line_start, line_end, anchor).as_bytes());
    hasher.update(original.join("\n").as_bytes());
    hasher.update(b"\0");
    hasher.update(proposed.join("\n").as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Keep,
    Remove,
    Add,
}

/// Line-level LCS diff grouped into hunks
fn diff_lines(original: &[String], proposed: &[String], anchor: usize) -> Vec<Hunk> {
    let ops = if original.len().saturating_mul(proposed.len()) > MAX_DIFF_CELLS {
        let mut ops = vec![Op::Remove; original.len()];
        ops.extend(std::iter::repeat(Op::Add).take(proposed.len()));
        ops
    } else {
        lcs_ops(original, proposed)
    };

    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let (mut i, mut j) = (0usize, 0usize);

    for op in ops {
        match op {
            Op::Keep => {
                if let Some(h) = current.take() {
                    hunks.push(h);
                }
                i += 1;
                j += 1;
            }
            Op::Remove => {
                let hunk = current.get_or_insert_with(|| Hunk {
                    original_start: anchor + i,
                    removed: Vec::new(),
                    added: Vec::new(),
                });
                hunk.removed.push(original[i].clone());
                i += 1;
            }
            Op::Add => {
                let hunk = current.get_or_insert_with(|| Hunk {
                    original_start: anchor + i,
                    removed: Vec::new(),
                    added: Vec::new(),
                });
                hunk.added.push(proposed[j].clone());
                j += 1;
            }
        }
    }
    if let Some(h) = current {
        hunks.push(h);
    }
    hunks
}

fn lcs_ops(a: &[String], b: &[String]) -> Vec<Op> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if a[i] == b[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(Op::Keep);
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            ops.push(Op::Remove);
            i += 1;
        } else {
            ops.push(Op::Add);
            j += 1;
        }
    }
    ops.extend(std::iter::repeat(Op::Remove).take(n - i));
    ops.extend(std::iter::repeat(Op::Add).take(m - j));
    ops
}

/// Guards of the patch verifier, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardName {
    Scope,
    Structural,
    WhitespaceChurn,
    Catalog,
    Link,
    Version,
}

impl GuardName {
    pub const ALL: [GuardName; 6] = [
        GuardName::Scope,
        GuardName::Structural,
        GuardName::WhitespaceChurn,
        GuardName::Catalog,
        GuardName::Link,
        GuardName::Version,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scope => "scope",
            Self::Structural => "structural",
            Self::WhitespaceChurn => "whitespace_churn",
            Self::Catalog => "catalog",
            Self::Link => "link",
            Self::Version => "version",
        }
    }
}

impl fmt::Display for GuardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running every guard on a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierVerdict {
    pub can_auto_apply: bool,

    /// Failed guards, in evaluation order
    pub failed_guards: Vec<GuardName>,

    /// One line per failed guard
    pub rationale: Vec<String>,

    /// Fingerprint of the guard configuration that produced this verdict
    pub config_fingerprint: String,

    /// Digest of the verified patch
    pub patch_digest: String,
}

impl VerifierVerdict {
    /// Whether this verdict can be reused for a patch under a configuration
    pub fn is_current(&self, config_fingerprint: &str, patch: &Patch) -> bool {
        self.config_fingerprint == config_fingerprint && self.patch_digest == patch.digest
    }

    /// Note appended to the issue description when auto-apply is blocked
    pub fn review_note(&self) -> Option<String> {
        if self.can_auto_apply {
            return None;
        }
        Some(format!("Review required: {}", self.rationale.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(s: &[&str]) -> Vec<String> {
        s.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_single_line_change() {
        let patch = Patch::between(
            "a.md",
            10,
            12,
            10,
            lines(&["one", "two", "three"]),
            lines(&["one", "TWO", "three"]),
        );

        assert_eq!(patch.hunks.len(), 1);
        assert_eq!(patch.hunks[0].original_start, 11);
        assert_eq!(patch.changed_lines(), vec![11]);
    }

    #[test]
    fn test_identical_snippets_produce_empty_patch() {
        let patch = Patch::between("a.md", 1, 1, 1, lines(&["x"]), lines(&["x"]));
        assert!(patch.is_empty());
    }

    #[test]
    fn test_apply_replaces_and_inserts() {
        let doc = lines(&["a", "b", "c", "d"]);
        let patch = Patch::between(
            "a.md",
            2,
            3,
            2,
            lines(&["b", "c"]),
            lines(&["B", "c", "c2"]),
        );

        let applied = patch.apply(&doc).unwrap();
        assert_eq!(applied, lines(&["a", "B", "c", "c2", "d"]));
    }

    #[test]
    fn test_apply_detects_mismatch() {
        let doc = lines(&["a", "changed", "c"]);
        let patch = Patch::between("a.md", 2, 2, 2, lines(&["b"]), lines(&["B"]));
        assert!(matches!(patch.apply(&doc), Err(PatchError::Mismatch { line: 2, .. })));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = Patch::between("a.md", 1, 1, 1, lines(&["x"]), lines(&["y"]));
        let b = Patch::between("a.md", 1, 1, 1, lines(&["x"]), lines(&["z"]));
        let c = Patch::between("a.md", 1, 1, 1, lines(&["x"]), lines(&["y"]));
        assert_ne!(a.digest, b.digest);
        assert_eq!(a.digest, c.digest);
    }

    #[test]
    fn test_unified_diff_render() {
        let patch = Patch::between("docs/a.md", 3, 3, 3, lines(&["old"]), lines(&["new"]));
        let diff = patch.unified_diff();
        assert!(diff.starts_with("--- a/docs/a.md\n+++ b/docs/a.md\n"));
        assert!(diff.contains("@@ -3,1 +3,1 @@\n-old\n+new\n"));
    }
}
