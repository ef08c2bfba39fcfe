use crate::clock::timestamp_now;
use crate::WaymarkError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const DEFAULT_FILE_BACKING_THRESHOLD_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub size_bytes: usize,
    pub stored_at: String,
    pub file_backed: bool,
}

#[derive(Clone, Debug)]
enum Backing {
    Inline(Vec<u8>),
    File(PathBuf),
}

#[derive(Clone, Debug)]
struct ArtifactEntry {
    info: ArtifactInfo,
    backing: Backing,
}

/// Named byte blobs scoped to one run. Small payloads stay in memory; larger
/// ones spill to `<base_dir>/artifacts/` when a base directory is configured.
#[derive(Clone)]
pub struct ArtifactStore {
    base_dir: Option<PathBuf>,
    threshold_bytes: usize,
    entries: Arc<RwLock<BTreeMap<String, ArtifactEntry>>>,
}

impl ArtifactStore {
    pub fn new(base_dir: Option<PathBuf>, threshold_bytes: usize) -> Result<Self, WaymarkError> {
        let threshold = if threshold_bytes == 0 {
            DEFAULT_FILE_BACKING_THRESHOLD_BYTES
        } else {
            threshold_bytes
        };

        if let Some(root) = base_dir.as_ref() {
            fs::create_dir_all(Self::artifacts_dir(root)).map_err(|error| {
                WaymarkError::Runtime(format!(
                    "failed to create artifact directory '{}': {}",
                    Self::artifacts_dir(root).display(),
                    error
                ))
            })?;
        }

        Ok(Self {
            base_dir,
            threshold_bytes: threshold,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            base_dir: None,
            threshold_bytes: DEFAULT_FILE_BACKING_THRESHOLD_BYTES,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn store(&self, name: impl Into<String>, bytes: &[u8]) -> Result<ArtifactInfo, WaymarkError> {
        let name = name.into();
        validate_artifact_name(&name)?;

        let size_bytes = bytes.len();
        let file_backed = self.base_dir.is_some() && size_bytes > self.threshold_bytes;

        let backing = if file_backed {
            let path = self.file_path_for(&name)?;
            fs::write(&path, bytes).map_err(|error| {
                WaymarkError::Runtime(format!(
                    "failed writing artifact '{}' to '{}': {}",
                    name,
                    path.display(),
                    error
                ))
            })?;
            Backing::File(path)
        } else {
            Backing::Inline(bytes.to_vec())
        };

        let info = ArtifactInfo {
            name: name.clone(),
            size_bytes,
            stored_at: timestamp_now(),
            file_backed,
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|_| WaymarkError::Runtime("artifact write lock poisoned".to_string()))?;
        entries.insert(
            name,
            ArtifactEntry {
                info: info.clone(),
                backing,
            },
        );

        Ok(info)
    }

    pub fn store_text(
        &self,
        name: impl Into<String>,
        text: &str,
    ) -> Result<ArtifactInfo, WaymarkError> {
        self.store(name, text.as_bytes())
    }

    pub fn retrieve(&self, name: &str) -> Result<Vec<u8>, WaymarkError> {
        let entry = {
            let entries = self
                .entries
                .read()
                .map_err(|_| WaymarkError::Runtime("artifact read lock poisoned".to_string()))?;
            entries.get(name).cloned()
        }
        .ok_or_else(|| WaymarkError::Runtime(format!("artifact '{}' not found", name)))?;

        match entry.backing {
            Backing::Inline(bytes) => Ok(bytes),
            Backing::File(path) => fs::read(&path).map_err(|error| {
                WaymarkError::Runtime(format!(
                    "failed reading artifact '{}' from '{}': {}",
                    name,
                    path.display(),
                    error
                ))
            }),
        }
    }

    pub fn retrieve_text(&self, name: &str) -> Result<String, WaymarkError> {
        let bytes = self.retrieve(name)?;
        String::from_utf8(bytes).map_err(|_| {
            WaymarkError::Runtime(format!("artifact '{}' is not valid UTF-8", name))
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(name))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Result<Vec<ArtifactInfo>, WaymarkError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| WaymarkError::Runtime("artifact read lock poisoned".to_string()))?;
        Ok(entries.values().map(|entry| entry.info.clone()).collect())
    }

    pub fn remove(&self, name: &str) -> Result<(), WaymarkError> {
        let removed = {
            let mut entries = self
                .entries
                .write()
                .map_err(|_| WaymarkError::Runtime("artifact write lock poisoned".to_string()))?;
            entries.remove(name)
        };

        if let Some(entry) = removed {
            if let Backing::File(path) = entry.backing {
                if path.exists() {
                    fs::remove_file(&path).map_err(|error| {
                        WaymarkError::Runtime(format!(
                            "failed to remove artifact file '{}': {}",
                            path.display(),
                            error
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }

    fn artifacts_dir(root: &Path) -> PathBuf {
        root.join("artifacts")
    }

    fn file_path_for(&self, name: &str) -> Result<PathBuf, WaymarkError> {
        let Some(root) = self.base_dir.as_ref() else {
            return Err(WaymarkError::Runtime(
                "artifact base_dir is not configured".to_string(),
            ));
        };
        Ok(Self::artifacts_dir(root).join(name))
    }
}

fn validate_artifact_name(name: &str) -> Result<(), WaymarkError> {
    if name.is_empty() {
        return Err(WaymarkError::Runtime(
            "artifact name cannot be empty".to_string(),
        ));
    }
    if name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
    {
        return Err(WaymarkError::Runtime(format!(
            "artifact name '{}' contains unsupported characters",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn small_artifact_stays_in_memory() {
        let store = ArtifactStore::new(None, 1024).expect("store should initialize");

        let info = store
            .store_text("summary.txt", "all green")
            .expect("store should succeed");

        assert!(!info.file_backed);
        assert_eq!(
            store
                .retrieve_text("summary.txt")
                .expect("retrieve should succeed"),
            "all green"
        );
    }

    #[test]
    fn large_artifact_spills_to_disk() {
        let temp = TempDir::new().expect("temp dir should create");
        let store =
            ArtifactStore::new(Some(temp.path().to_path_buf()), 64).expect("store should initialize");
        let payload = "x".repeat(512);

        let info = store
            .store_text("plan.md", &payload)
            .expect("store should succeed");

        assert!(info.file_backed);
        assert!(temp.path().join("artifacts/plan.md").exists());
        assert_eq!(
            store.retrieve_text("plan.md").expect("retrieve should succeed"),
            payload
        );
    }

    #[test]
    fn remove_cleans_up_file_backed_payload() {
        let temp = TempDir::new().expect("temp dir should create");
        let store =
            ArtifactStore::new(Some(temp.path().to_path_buf()), 1).expect("store should initialize");
        store
            .store_text("out.log", "abc")
            .expect("store should succeed");

        let path = temp.path().join("artifacts/out.log");
        assert!(path.exists());

        store.remove("out.log").expect("remove should succeed");
        assert!(!path.exists());
        assert!(!store.has("out.log"));
    }

    #[test]
    fn concurrent_store_and_list_do_not_race() {
        let store = ArtifactStore::in_memory();
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .store_text(format!("artifact-{index}"), "payload")
                        .expect("store should succeed");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread should finish");
        }
        assert_eq!(store.list().expect("list should succeed").len(), 8);
    }

    #[test]
    fn reject_invalid_artifact_name() {
        let store = ArtifactStore::in_memory();
        let error = store
            .store_text("bad name", "x")
            .expect_err("invalid name should fail");
        assert!(
            matches!(error, WaymarkError::Runtime(message) if message.contains("unsupported characters"))
        );
    }
}
