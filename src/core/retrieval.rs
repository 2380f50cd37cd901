//! Retrieval context builder.
//!
//! Assembles the packet the LLM stage sees for one chunk: its rendered
//! text, the surrounding lines, the nearest chunks from the vector index,
//! catalog facts for referenced symbols and the rule findings already made
//! on the chunk.
//!
//! The fingerprint-keyed part is cached across runs in
//! `<cache_path>/context.json` along with the fingerprints already upserted
//! to the index. An unavailable index degrades a packet to no neighbors;
//! degraded packets are never cached.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::adapters::{ChunkRef, Embedder, Neighbor, VectorIndex};
use crate::analyzers::{api_cli, ReferenceMatcher};
use crate::catalog::Catalogs;
use crate::config::RetrievalConfig;
use crate::core::chunker::{Chunk, CodeAttachment};
use crate::domain::{Citation, Document, Fingerprint};

const CACHE_FILE: &str = "context.json";

/// Characters of chunk text stored as the index preview
const PREVIEW_CHARS: usize = 160;

/// The part of a packet that depends only on the chunk fingerprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedContext {
    /// Lines immediately before the chunk
    pub before: Vec<String>,
    /// Lines immediately after the chunk
    pub after: Vec<String>,
    pub neighbors: Vec<Neighbor>,
    /// Catalog and version facts for symbols referenced in the chunk
    pub facts: Vec<Citation>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextCache {
    #[serde(default)]
    indexed: BTreeSet<Fingerprint>,
    #[serde(default)]
    contexts: BTreeMap<Fingerprint, CachedContext>,
}

/// Everything the suggestion engine receives for one chunk
#[derive(Debug, Clone)]
pub struct ContextPacket {
    pub fingerprint: Fingerprint,
    pub document: String,
    pub title: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub heading_path: Vec<String>,
    pub rendered: String,
    pub code_blocks: Vec<CodeAttachment>,
    pub context: CachedContext,
    /// One line per rule finding inside the chunk
    pub rule_facts: Vec<String>,
    /// Built without neighbors because the index was unavailable
    pub degraded: bool,
}

/// Outcome of pushing chunks into the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub indexed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct ContextBuilder {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    catalogs: Arc<Catalogs>,
    references: ReferenceMatcher,
    settings: RetrievalConfig,
    cache_file: Option<PathBuf>,
    cache: Mutex<ContextCache>,
    permits: Semaphore,
}

impl ContextBuilder {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        catalogs: Arc<Catalogs>,
        references: ReferenceMatcher,
        settings: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            catalogs,
            references,
            permits: Semaphore::new(settings.query_concurrency.max(1)),
            settings: settings.clone(),
            cache_file: None,
            cache: Mutex::new(ContextCache::default()),
        }
    }

    /// Persist the cache under `dir`, loading what a previous run left there
    pub async fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CACHE_FILE);
        if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read retrieval cache: {}", path.display()))?;
            match serde_json::from_str::<ContextCache>(&raw) {
                Ok(cache) => self.cache = Mutex::new(cache),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable retrieval cache"),
            }
        }
        self.cache_file = Some(path);
        Ok(self)
    }

    /// Whether a fingerprint's context is already cached
    pub async fn is_cached(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.lock().await.contexts.contains_key(fingerprint)
    }

    /// Upsert chunks the index has not seen yet
    pub async fn refresh(&self, chunks: &[Chunk]) -> RefreshOutcome {
        let pending: Vec<&Chunk> = {
            let cache = self.cache.lock().await;
            chunks
                .iter()
                .filter(|c| !cache.indexed.contains(&c.fingerprint))
                .collect()
        };
        let unchanged = chunks.len() - pending.len();

        let upserts = pending.into_iter().map(|chunk| async move {
            let Ok(_permit) = self.permits.acquire().await else {
                return (chunk.fingerprint.clone(), false);
            };
            let result = async {
                let vector = self.embedder.embed(&chunk.text).await?;
                self.index.upsert(chunk_ref(chunk), vector).await
            }
            .await;
            if let Err(e) = &result {
                warn!(chunk = %chunk.fingerprint, error = %e, "Vector index upsert failed");
            }
            (chunk.fingerprint.clone(), result.is_ok())
        });
        let results = join_all(upserts).await;

        let mut outcome = RefreshOutcome {
            unchanged,
            ..Default::default()
        };
        let mut cache = self.cache.lock().await;
        for (fingerprint, ok) in results {
            if ok {
                cache.indexed.insert(fingerprint);
                outcome.indexed += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }

    /// Build the packet for a chunk, reusing the cached part when present
    pub async fn build(&self, chunk: &Chunk, doc: &Document, rule_facts: Vec<String>) -> ContextPacket {
        let cached = self.cache.lock().await.contexts.get(&chunk.fingerprint).cloned();

        let (context, degraded) = match cached {
            Some(context) => {
                debug!(chunk = %chunk.fingerprint, "Retrieval cache hit");
                (context, false)
            }
            None => {
                let (neighbors, degraded) = match self.neighbors(chunk).await {
                    Ok(neighbors) => (neighbors, false),
                    Err(e) => {
                        warn!(chunk = %chunk.fingerprint, error = %e, "Vector index unavailable, continuing without neighbors");
                        (Vec::new(), true)
                    }
                };
                let context = CachedContext {
                    before: doc
                        .slice(chunk.start_line.saturating_sub(self.settings.context_lines), chunk.start_line - 1)
                        .to_vec(),
                    after: doc
                        .slice(chunk.end_line + 1, chunk.end_line + self.settings.context_lines)
                        .to_vec(),
                    neighbors,
                    facts: self.facts(chunk, doc),
                };
                if !degraded {
                    self.cache
                        .lock()
                        .await
                        .contexts
                        .insert(chunk.fingerprint.clone(), context.clone());
                }
                (context, degraded)
            }
        };

        ContextPacket {
            fingerprint: chunk.fingerprint.clone(),
            document: doc.path.clone(),
            title: doc.title.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            heading_path: chunk.heading_path.clone(),
            rendered: chunk.rendered.clone(),
            code_blocks: chunk.code_blocks.clone(),
            context,
            rule_facts,
            degraded,
        }
    }

    async fn neighbors(&self, chunk: &Chunk) -> Result<Vec<Neighbor>> {
        let _permit = self.permits.acquire().await.context("Retrieval closed")?;
        let vector = self.embedder.embed(&chunk.text).await?;
        let found = self.index.query(&vector, self.settings.k_neighbors + 1).await?;
        Ok(found
            .into_iter()
            .filter(|n| n.chunk.fingerprint != chunk.fingerprint)
            .take(self.settings.k_neighbors)
            .collect())
    }

    fn facts(&self, chunk: &Chunk, doc: &Document) -> Vec<Citation> {
        let mut facts: BTreeSet<Citation> = self
            .references
            .references(doc)
            .iter()
            .filter(|r| chunk.contains_line(r.line))
            .filter_map(|r| {
                let key = api_cli::resolve_key(&self.catalogs, r)?;
                self.catalogs.citation(r.kind, &key)
            })
            .collect();

        let package = self.catalogs.package.to_lowercase();
        if chunk.text.to_lowercase().contains(&package) {
            facts.extend(self.catalogs.version_citation());
        }
        facts.into_iter().collect()
    }

    /// Flush the index and write the cache file, if one is configured
    pub async fn save(&self) -> Result<()> {
        self.index.flush().await.context("Failed to flush vector index")?;
        let Some(path) = &self.cache_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create retrieval cache directory: {}", parent.display()))?;
        }

        let json = {
            let cache = self.cache.lock().await;
            serde_json::to_string(&*cache).context("Failed to serialize retrieval cache")?
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write retrieval cache: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace retrieval cache: {}", path.display()))?;
        Ok(())
    }
}

fn chunk_ref(chunk: &Chunk) -> ChunkRef {
    ChunkRef {
        fingerprint: chunk.fingerprint.clone(),
        document: chunk.document.clone(),
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        preview: chunk.text.chars().take(PREVIEW_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HashingEmbedder, InMemoryVectorIndex};
    use crate::catalog::{CatalogEntry, CatalogKind};
    use crate::core::chunker::Chunker;
    use crate::domain::CitationKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Index that fails every call and counts them
    #[derive(Default)]
    struct DownIndex {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for DownIndex {
        async fn upsert(&self, _chunk: ChunkRef, _vector: Vec<f32>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("index offline")
        }

        async fn query(&self, _vector: &[f32], _k: usize) -> Result<Vec<Neighbor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("index offline")
        }
    }

    const DOC: &str = "# Guide\n\nCall `wandb.init` before logging.\n\n## Next\n\nPin wandb==0.10.0 here.\n";

    fn catalogs() -> Arc<Catalogs> {
        Arc::new(
            Catalogs::new("wandb")
                .with_latest_version(Some("0.19.0".to_string()))
                .with_entry(CatalogKind::Api, "wandb.init", CatalogEntry::default()),
        )
    }

    fn settings() -> RetrievalConfig {
        RetrievalConfig {
            k_neighbors: 2,
            context_lines: 2,
            ..Default::default()
        }
    }

    fn builder(index: Arc<dyn VectorIndex>) -> ContextBuilder {
        ContextBuilder::new(
            Arc::new(HashingEmbedder::new(64)),
            index,
            catalogs(),
            ReferenceMatcher::new("wandb").unwrap(),
            &settings(),
        )
    }

    fn chunks(doc: &Document) -> Vec<Chunk> {
        Chunker::new(12).chunk(doc)
    }

    #[tokio::test]
    async fn test_packet_has_window_facts_and_neighbors() {
        let doc = Document::parse("guide.md", DOC).unwrap();
        let chunks = chunks(&doc);
        assert_eq!(chunks.len(), 2);

        let builder = builder(Arc::new(InMemoryVectorIndex::new()));
        let outcome = builder.refresh(&chunks).await;
        assert_eq!(outcome.indexed, 2);

        let packet = builder.build(&chunks[0], &doc, vec!["rule fact".to_string()]).await;
        assert!(!packet.degraded);
        assert_eq!(packet.context.after, vec!["## Next".to_string(), String::new()]);
        assert!(packet.context.before.is_empty());
        assert_eq!(packet.context.neighbors.len(), 1);
        assert_eq!(packet.context.neighbors[0].chunk.fingerprint, chunks[1].fingerprint);
        assert!(packet
            .context
            .facts
            .iter()
            .any(|c| c.kind == CitationKind::Catalog && c.key.as_deref() == Some("wandb.init")));
        assert_eq!(packet.rule_facts, vec!["rule fact"]);
    }

    #[tokio::test]
    async fn test_refresh_skips_indexed_fingerprints() {
        let doc = Document::parse("guide.md", DOC).unwrap();
        let chunks = chunks(&doc);
        let builder = builder(Arc::new(InMemoryVectorIndex::new()));

        builder.refresh(&chunks).await;
        let second = builder.refresh(&chunks).await;
        assert_eq!(second, RefreshOutcome { indexed: 0, unchanged: 2, failed: 0 });
    }

    #[tokio::test]
    async fn test_index_outage_degrades_without_caching() {
        let doc = Document::parse("guide.md", DOC).unwrap();
        let chunks = chunks(&doc);
        let index = Arc::new(DownIndex::default());
        let builder = builder(index.clone());

        assert_eq!(builder.refresh(&chunks).await.failed, 2);

        let packet = builder.build(&chunks[1], &doc, Vec::new()).await;
        assert!(packet.degraded);
        assert!(packet.context.neighbors.is_empty());
        assert!(!builder.is_cached(&chunks[1].fingerprint).await);
        assert!(packet.context.facts.iter().any(|c| c.value.as_deref() == Some("0.19.0")));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_index_and_survives_reload() {
        let dir = TempDir::new().unwrap();
        let doc = Document::parse("guide.md", DOC).unwrap();
        let chunks = chunks(&doc);

        let first = builder(Arc::new(InMemoryVectorIndex::new()))
            .with_cache_dir(dir.path())
            .await
            .unwrap();
        first.refresh(&chunks).await;
        let built = first.build(&chunks[0], &doc, Vec::new()).await;
        first.save().await.unwrap();

        let index = Arc::new(DownIndex::default());
        let second = builder(index.clone()).with_cache_dir(dir.path()).await.unwrap();
        assert_eq!(second.refresh(&chunks).await.unchanged, 2);

        let reused = second.build(&chunks[0], &doc, Vec::new()).await;
        assert!(!reused.degraded);
        assert_eq!(reused.context, built.context);
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
    }
}
