use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::Manifest;
use crate::error::{Result, SentinelError};

/// Loads and saves the manifest document. Saves go through a sibling temp
/// file, fsync, then rename, so a crash never leaves a torn manifest.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Manifest> {
        if !self.path.exists() {
            return Err(SentinelError::NotFound(self.path.clone()));
        }
        let raw = fs::read_to_string(&self.path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| SentinelError::CorruptManifest(err.to_string()))?;
        for key in ["repository", "files"] {
            if value.get(key).is_none() {
                return Err(SentinelError::SchemaMismatch(key.to_string()));
            }
        }
        serde_json::from_value(value).map_err(|err| SentinelError::CorruptManifest(err.to_string()))
    }

    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|err| SentinelError::CorruptManifest(err.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;

        debug!(path = %self.path.display(), files = manifest.files.len(), "manifest saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{InventoryRecord, RepositoryInfo};

    fn sample_manifest() -> Manifest {
        let mut manifest = Manifest::new(RepositoryInfo {
            url: "https://github.com/acme/widgets".into(),
            default_branch: "main".into(),
            commit_sha: "deadbeef".into(),
            analysis_timestamp: "2025-01-01T00:00:00Z".into(),
        });
        manifest.merge_inventory(vec![InventoryRecord {
            path: "src/app.py".into(),
            blob_id: "b1".into(),
            size: 42,
            extension: ".py".into(),
        }]);
        manifest
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let manifest = sample_manifest();

        store.save(&manifest).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.repository.commit_sha, "deadbeef");
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].path, "src/app.py");
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("missing.json"));
        assert!(matches!(store.load(), Err(SentinelError::NotFound(_))));
    }

    #[test]
    fn load_invalid_json_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, "{ not json").unwrap();
        let store = ManifestStore::new(&path);
        assert!(matches!(
            store.load(),
            Err(SentinelError::CorruptManifest(_))
        ));
    }

    #[test]
    fn load_missing_top_level_key_is_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, r#"{"repository": {}}"#).unwrap();
        let store = ManifestStore::new(&path);
        match store.load() {
            Err(SentinelError::SchemaMismatch(key)) => assert_eq!(key, "files"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let mut manifest = sample_manifest();
        store.save(&manifest).unwrap();

        manifest.merge_inventory(vec![InventoryRecord {
            path: "src/new.py".into(),
            blob_id: "b2".into(),
            size: 7,
            extension: ".py".into(),
        }]);
        store.save(&manifest).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.files.len(), 2);
        // no stray temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "manifest.json")
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
    }
}
