use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::Result;

pub mod github;

pub use github::GithubSource;

/// Branch/commit identity resolved once per run; all later fetches are
/// pinned to `commit_sha`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHead {
    pub default_branch: String,
    pub commit_sha: String,
}

/// One file listed under a pinned commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: String,
    pub blob_id: String,
    pub size: u64,
}

/// Read access to a repository at a pinned revision. Implementations must be
/// safe for concurrent use; classification workers fetch blobs in parallel.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Resolve the default branch and its head commit.
    async fn resolve(&self) -> Result<RepoHead>;

    /// Recursive file listing at the commit, lexicographic by path,
    /// excluding submodules and symlinks.
    async fn list_files(&self, commit_sha: &str) -> Result<Vec<FileMeta>>;

    /// Raw blob bytes by content identity.
    async fn fetch_blob(&self, blob_id: &str) -> Result<Vec<u8>>;

    /// Materialize a working tree at exactly `commit_sha` under `dest`.
    async fn clone_at(&self, commit_sha: &str, dest: &Path) -> Result<()>;
}

/// Exponential backoff schedule with jitter for transient host errors.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    /// Fractional jitter applied symmetrically, e.g. 0.25 for ±25%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt) as f64;
        let nominal = self.base.as_secs_f64() * exp;
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(nominal * (1.0 + spread))
    }
}

/// Split a repo-relative path into its lowercased extension (with leading
/// dot), or empty when there is none.
pub fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_grow_within_jitter() {
        let backoff = Backoff::default();
        for attempt in 0..4 {
            let nominal = 1u64 << attempt;
            let delay = backoff.delay(attempt).as_secs_f64();
            let low = nominal as f64 * 0.75;
            let high = nominal as f64 * 1.25;
            assert!(
                (low..=high).contains(&delay),
                "attempt {attempt}: {delay} outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(extension_of("src/Main.RS"), ".rs");
        assert_eq!(extension_of("a/b/c.tar.gz"), ".gz");
        assert_eq!(extension_of("Makefile"), "");
        assert_eq!(extension_of(".gitignore"), "");
        assert_eq!(extension_of("dir.with.dots/readme"), "");
    }
}
