//! PR batch exporter.
//!
//! Writes `[{issue_id, patch, can_auto_apply}]` as JSON for an external PR
//! workflow to pick up, and returns a `file://` URL to the batch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::PrPublisher;
use crate::domain::PrEntry;

pub struct JsonPrExporter {
    dir: PathBuf,
}

impl JsonPrExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PrPublisher for JsonPrExporter {
    async fn publish(&self, entries: &[PrEntry]) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create export directory: {}", self.dir.display()))?;

        let path = self
            .dir
            .join(format!("pr-batch-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let json = serde_json::to_string_pretty(entries).context("Failed to serialize PR batch")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write PR batch: {}", path.display()))?;

        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Patch;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_writes_batch() {
        let dir = TempDir::new().unwrap();
        let exporter = JsonPrExporter::new(dir.path().join("prs"));
        let entries = vec![PrEntry {
            issue_id: "abc123".to_string(),
            patch: Patch::between("a.md", 1, 1, 1, vec!["x".to_string()], vec!["y".to_string()]),
            can_auto_apply: true,
        }];

        let url = exporter.publish(&entries).await.unwrap();
        let path = url.strip_prefix("file://").unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written[0]["issue_id"], "abc123");
        assert_eq!(written[0]["can_auto_apply"], true);
    }
}
