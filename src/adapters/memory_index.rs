//! Default embedding and vector-index collaborators.
//!
//! `HashingEmbedder` maps text to a feature-hashed bag of words, which is
//! deterministic and needs no model. `InMemoryVectorIndex` does brute-force
//! cosine search and can persist itself as JSON between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{ChunkRef, Embedder, Neighbor, VectorIndex};
use crate::domain::Fingerprint;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Feature-hashing embedder over lowercase word tokens
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 1)
            .map(str::to_lowercase);

        for token in tokens {
            let hash = fnv1a(token.as_bytes());
            let slot = (hash % self.dims as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    chunk: ChunkRef,
    vector: Vec<f32>,
}

/// Brute-force cosine index
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    vectors: RwLock<BTreeMap<Fingerprint, StoredVector>>,
    file: Option<PathBuf>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index backed by a JSON file, loaded now and written by `save`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let vectors = if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read vector index: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse vector index: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            vectors: RwLock::new(vectors),
            file: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string(&*self.vectors.read().await)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write vector index: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, chunk: ChunkRef, vector: Vec<f32>) -> Result<()> {
        let mut vectors = self.vectors.write().await;
        // A document's new hash supersedes every chunk of its old one
        vectors.retain(|fp, stored| stored.chunk.document != chunk.document || fp.blob_hash == chunk.fingerprint.blob_hash);
        vectors.insert(chunk.fingerprint.clone(), StoredVector { chunk, vector });
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let vectors = self.vectors.read().await;
        let mut scored: Vec<Neighbor> = vectors
            .values()
            .map(|stored| Neighbor {
                chunk: stored.chunk.clone(),
                score: cosine_similarity(vector, &stored.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.fingerprint.cmp(&b.chunk.fingerprint))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn flush(&self) -> Result<()> {
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk_ref(doc: &str, hash: &str, start: usize) -> ChunkRef {
        ChunkRef {
            fingerprint: Fingerprint::new(hash, start, start + 1),
            document: doc.to_string(),
            start_line: start,
            end_line: start + 1,
            preview: String::new(),
        }
    }

    #[test]
    fn test_embedding_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(32);
        let a = embedder.embed_sync("Install the SDK with pip");
        let b = embedder.embed_sync("install the sdk with PIP");
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(embedder.embed_sync("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity() {
        let embedder = HashingEmbedder::new(64);
        let index = InMemoryVectorIndex::new();
        index
            .upsert(chunk_ref("a.md", "h1", 1), embedder.embed_sync("logging metrics with charts"))
            .await
            .unwrap();
        index
            .upsert(chunk_ref("b.md", "h2", 1), embedder.embed_sync("installing the python package"))
            .await
            .unwrap();

        let found = index.query(&embedder.embed_sync("install python package"), 1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].chunk.document, "b.md");
    }

    #[tokio::test]
    async fn test_new_hash_replaces_old_chunks() {
        let index = InMemoryVectorIndex::new();
        index.upsert(chunk_ref("a.md", "old", 1), vec![1.0]).await.unwrap();
        index.upsert(chunk_ref("a.md", "old", 5), vec![1.0]).await.unwrap();
        index.upsert(chunk_ref("a.md", "new", 1), vec![1.0]).await.unwrap();
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_persists_between_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let index = InMemoryVectorIndex::open(&path).await.unwrap();
        index.upsert(chunk_ref("a.md", "h", 1), vec![0.5, 0.5]).await.unwrap();
        index.save().await.unwrap();

        let reopened = InMemoryVectorIndex::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
    }
}
