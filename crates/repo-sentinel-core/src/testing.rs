//! In-memory test doubles for the source and provider seams. Kept in the
//! library so integration tests and downstream harnesses can drive the
//! pipeline without network access.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, SentinelError};
use crate::llm::{Classification, LlmProvider};
use crate::manifest::{FileCategory, SecurityRelevance};
use crate::source::{FileMeta, RepoHead, RepoSource};

/// A repository held entirely in memory.
pub struct InMemorySource {
    head: RepoHead,
    files: Vec<FileMeta>,
    blobs: HashMap<String, Vec<u8>>,
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self {
            head: RepoHead {
                default_branch: "main".to_string(),
                commit_sha: "c0ffee".to_string(),
            },
            files: Vec::new(),
            blobs: HashMap::new(),
        }
    }
}

impl InMemorySource {
    /// Blob-only source; enough for analyzers that already hold a manifest.
    pub fn with_blobs(blobs: &[(&str, &str)]) -> Self {
        let mut source = Self::default();
        source.blobs = blobs
            .iter()
            .map(|(id, content)| (id.to_string(), content.as_bytes().to_vec()))
            .collect();
        source
    }

    /// Full repository: each (path, content) pair becomes a listed file with
    /// blob id `blob-<path>`.
    pub fn with_tree(commit_sha: &str, tree: &[(&str, &str)]) -> Self {
        let mut files: Vec<FileMeta> = tree
            .iter()
            .map(|(path, content)| FileMeta {
                path: path.to_string(),
                blob_id: format!("blob-{path}"),
                size: content.len() as u64,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            head: RepoHead {
                default_branch: "main".to_string(),
                commit_sha: commit_sha.to_string(),
            },
            files,
            blobs: tree
                .iter()
                .map(|(path, content)| (format!("blob-{path}"), content.as_bytes().to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl RepoSource for InMemorySource {
    async fn resolve(&self) -> Result<RepoHead> {
        Ok(self.head.clone())
    }

    async fn list_files(&self, _commit_sha: &str) -> Result<Vec<FileMeta>> {
        Ok(self.files.clone())
    }

    async fn fetch_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(blob_id)
            .cloned()
            .ok_or_else(|| SentinelError::SourceUnavailable(format!("unknown blob {blob_id}")))
    }

    async fn clone_at(&self, _commit_sha: &str, dest: &Path) -> Result<()> {
        for file in &self.files {
            let target = dest.join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = self.blobs.get(&file.blob_id).cloned().unwrap_or_default();
            std::fs::write(target, bytes)?;
        }
        Ok(())
    }
}

/// Provider returning deterministic classifications, with optional per-path
/// failure injection and a call counter.
pub struct ScriptedProvider {
    malformed_paths: Vec<String>,
    usage: Option<(u64, u64)>,
    classify_fn: Option<fn(&str) -> Classification>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedProvider {
    pub fn always_ok() -> Self {
        Self {
            malformed_paths: Vec::new(),
            usage: None,
            classify_fn: None,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn always_ok_with_usage(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            usage: Some((input_tokens, output_tokens)),
            ..Self::always_ok()
        }
    }

    /// Replies with malformed output for the given path, healthy otherwise.
    pub fn malformed_for(path: &str) -> Self {
        Self {
            malformed_paths: vec![path.to_string()],
            ..Self::always_ok()
        }
    }

    /// Use a custom classification function keyed on path.
    pub fn with_fn(classify_fn: fn(&str) -> Classification) -> Self {
        Self {
            classify_fn: Some(classify_fn),
            ..Self::always_ok()
        }
    }

    pub fn calls_for(&self, path: &str) -> u32 {
        self.calls
            .lock()
            .expect("call counter poisoned")
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn classify(
        &self,
        path: &str,
        _extension: &str,
        _content: &str,
    ) -> Result<Classification> {
        *self
            .calls
            .lock()
            .expect("call counter poisoned")
            .entry(path.to_string())
            .or_default() += 1;

        if self.malformed_paths.iter().any(|p| p == path) {
            return Err(SentinelError::MalformedResponse(
                "scripted malformed reply".to_string(),
            ));
        }
        if let Some(classify_fn) = self.classify_fn {
            return Ok(classify_fn(path));
        }
        let mut classification = Classification {
            purpose: format!("Scripted classification of {path}"),
            category: FileCategory::Other,
            confidence: 0.8,
            security_relevance: SecurityRelevance::Low,
            reasoning: "scripted".to_string(),
            provider: "scripted".to_string(),
            model: "scripted-1".to_string(),
            input_tokens: None,
            output_tokens: None,
        };
        if let Some((input, output)) = self.usage {
            classification.input_tokens = Some(input);
            classification.output_tokens = Some(output);
        }
        Ok(classification)
    }
}

/// Provider that fails every call the same way.
pub struct FailingProvider {
    name: String,
}

impl FailingProvider {
    pub fn rate_limited(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "unreachable"
    }

    async fn test_connection(&self) -> Result<()> {
        Err(SentinelError::RateLimited {
            service: self.name.clone(),
        })
    }

    async fn classify(
        &self,
        _path: &str,
        _extension: &str,
        _content: &str,
    ) -> Result<Classification> {
        Err(SentinelError::RateLimited {
            service: self.name.clone(),
        })
    }
}
