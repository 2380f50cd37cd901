//! Working-tree repository sync.
//!
//! Reads documents matching the include globs under the documentation
//! root. There is no diffing against a commit here: every matching
//! document is returned and the orchestrator skips unchanged hashes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::Pattern;
use tracing::{debug, warn};

use super::{ChangedDocument, RepoSync};
use crate::config::RepoConfig;
use crate::domain::blob_hash;

pub struct FsRepoSync {
    root: PathBuf,
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl FsRepoSync {
    pub fn new(root: impl Into<PathBuf>, settings: &RepoConfig) -> Self {
        let exclude = settings
            .exclude
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();
        Self {
            root: root.into(),
            include: settings.include.clone(),
            exclude,
        }
    }

    /// Relative paths of every matching document, sorted
    pub fn document_paths(&self) -> Result<Vec<String>> {
        let mut found = BTreeSet::new();
        for pattern in &self.include {
            let full = self.root.join(pattern);
            let full = full.to_string_lossy();
            let entries = glob::glob(&full).with_context(|| format!("Invalid include pattern: {}", pattern))?;
            for entry in entries.flatten() {
                if !entry.is_file() {
                    continue;
                }
                let Ok(relative) = entry.strip_prefix(&self.root) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                if self.exclude.iter().any(|p| p.matches(&relative)) {
                    continue;
                }
                found.insert(relative);
            }
        }
        Ok(found.into_iter().collect())
    }
}

#[async_trait]
impl RepoSync for FsRepoSync {
    async fn changed_documents(&self, since_commit: Option<&str>) -> Result<Vec<ChangedDocument>> {
        let paths = self.document_paths()?;
        debug!(count = paths.len(), since = ?since_commit, "Listing documents");

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let full = self.root.join(&path);
            let content = match tokio::fs::read_to_string(&full).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping unreadable document");
                    continue;
                }
            };
            documents.push(ChangedDocument {
                blob_hash: blob_hash(&content),
                path,
                content,
            });
        }
        Ok(documents)
    }

    async fn head_commit(&self) -> Result<Option<String>> {
        Ok(read_head(&self.root).await)
    }
}

/// Commit at HEAD of the nearest enclosing git checkout
async fn read_head(start: &Path) -> Option<String> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let git = current.join(".git");
        if let Ok(head) = tokio::fs::read_to_string(git.join("HEAD")).await {
            let head = head.trim();
            return match head.strip_prefix("ref: ") {
                Some(reference) => tokio::fs::read_to_string(git.join(reference))
                    .await
                    .ok()
                    .map(|c| c.trim().to_string()),
                None => Some(head.to_string()),
            };
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_lists_matching_documents() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "guide/intro.md", "# Intro\n");
        write(dir.path(), "ref.mdx", "# Ref\n");
        write(dir.path(), "notes.txt", "skip");
        write(dir.path(), "node_modules/pkg/readme.md", "# Vendored\n");

        let repo = FsRepoSync::new(dir.path(), &RepoConfig::default());
        let docs = repo.changed_documents(None).await.unwrap();

        let paths: Vec<&str> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["guide/intro.md", "ref.mdx"]);
        assert_eq!(docs[0].blob_hash, blob_hash("# Intro\n"));
    }

    #[tokio::test]
    async fn test_head_commit_follows_ref() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".git/HEAD", "ref: refs/heads/main\n");
        write(dir.path(), ".git/refs/heads/main", "abc123\n");
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();

        let repo = FsRepoSync::new(dir.path().join("docs"), &RepoConfig::default());
        assert_eq!(repo.head_commit().await.unwrap().as_deref(), Some("abc123"));
    }
}
