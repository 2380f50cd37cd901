//! Shared fixtures for pipeline tests.
//!
//! In-memory stand-ins for the repository, link resolver and LLM provider,
//! wired with the real file store and hashing embedder in a temp directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use docsqa::adapters::{
    ChangedDocument, Completion, FileStore, HashingEmbedder, InMemoryVectorIndex, IssueStore, LinkResolver,
    LlmProvider, ProbeError, ProviderError, RepoSync,
};
use docsqa::catalog::Catalogs;
use docsqa::config::DocsqaConfig;
use docsqa::core::{Collaborators, Orchestrator};
use docsqa::domain::blob_hash;
use docsqa::CancelToken;
use tempfile::TempDir;

/// Repository whose documents are set by the test
#[derive(Default)]
pub struct MemoryRepo {
    documents: Mutex<BTreeMap<String, String>>,
}

impl MemoryRepo {
    pub fn with(documents: &[(&str, &str)]) -> Arc<Self> {
        let repo = Self::default();
        for (path, content) in documents {
            repo.put(path, content);
        }
        Arc::new(repo)
    }

    pub fn put(&self, path: &str, content: &str) {
        self.documents
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }
}

#[async_trait]
impl RepoSync for MemoryRepo {
    async fn changed_documents(&self, _since_commit: Option<&str>) -> Result<Vec<ChangedDocument>> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .map(|(path, content)| ChangedDocument {
                path: path.clone(),
                content: content.clone(),
                blob_hash: blob_hash(content),
            })
            .collect())
    }

    async fn head_commit(&self) -> Result<Option<String>> {
        Ok(Some("c0ffee".to_string()))
    }
}

/// Answers 404 for any URL containing `/broken/`, 200 otherwise
#[derive(Default)]
pub struct TableLinks {
    pub probes: AtomicUsize,
    cancel_on_request: Mutex<Option<CancelToken>>,
}

impl TableLinks {
    /// Cancel `token` from inside the first request
    pub fn cancel_on_first_request(&self, token: CancelToken) {
        *self.cancel_on_request.lock().unwrap() = Some(token);
    }

    pub fn requests(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkResolver for TableLinks {
    async fn probe(&self, url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_request.lock().unwrap().take() {
            token.cancel();
        }
        if url.contains("/broken/") {
            Ok(404)
        } else {
            Ok(200)
        }
    }
}

/// Replies with the same text to every request and counts calls
pub struct ScriptedLlm {
    reply: String,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn replying(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn silent() -> Arc<Self> {
        Self::replying(r#"{"suggestions": []}"#)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _json_schema: &serde_json::Value,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: self.reply.clone(),
            tokens_in: Some(100),
            tokens_out: Some(20),
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<FileStore>,
    pub links: Arc<TableLinks>,
    pub orchestrator: Orchestrator,
}

/// Orchestrator over `repo` with catalogs for wandb at 0.19.0
pub async fn harness(repo: Arc<MemoryRepo>, llm: Option<Arc<ScriptedLlm>>) -> Harness {
    harness_with(repo, llm, DocsqaConfig::default()).await
}

pub async fn harness_with(repo: Arc<MemoryRepo>, llm: Option<Arc<ScriptedLlm>>, settings: DocsqaConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::open(dir.path().join("state.json")).await.unwrap());
    let links = Arc::new(TableLinks::default());
    let catalogs = Catalogs::new("wandb").with_latest_version(Some("0.19.0".to_string()));

    let collaborators = Collaborators {
        repo,
        store: store.clone(),
        links: links.clone(),
        embedder: Arc::new(HashingEmbedder::new(settings.retrieval.embedding_dims)),
        index: Arc::new(InMemoryVectorIndex::new()),
        llm: llm.map(|provider| provider as Arc<dyn LlmProvider>),
    };
    let orchestrator =
        Orchestrator::new(settings, Arc::new(catalogs), dir.path().join("runs"), collaborators).unwrap();

    Harness {
        dir,
        store,
        links,
        orchestrator,
    }
}

pub async fn all_issues(store: &FileStore) -> Vec<docsqa::domain::Issue> {
    store.list_issues(&Default::default()).await.unwrap()
}
