use crate::checkpoint::CHECKPOINT_FILE_NAME;
use crate::WaymarkError;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROGRESS_FILE_NAME: &str = "progress.ndjson";
pub const LIVE_FILE_NAME: &str = "live.json";
pub const NODES_DIR_NAME: &str = "nodes";

/// Per-run filesystem layout under `<artifacts_base>/<run_id>/`:
/// `checkpoint.json`, `progress.ndjson`, `live.json`, `nodes/<node_id>/*`.
#[derive(Clone, Debug)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    pub fn create(artifacts_base: &Path, run_id: &str) -> Result<Self, WaymarkError> {
        let root = artifacts_base.join(run_id);
        fs::create_dir_all(root.join(NODES_DIR_NAME)).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to create run directory '{}': {}",
                root.display(),
                error
            ))
        })?;
        Ok(Self { root })
    }

    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE_NAME)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.root.join(PROGRESS_FILE_NAME)
    }

    pub fn live_path(&self) -> PathBuf {
        self.root.join(LIVE_FILE_NAME)
    }

    pub fn node_dir(&self, node_id: &str) -> Result<PathBuf, WaymarkError> {
        let dir = self.root.join(NODES_DIR_NAME).join(node_id);
        fs::create_dir_all(&dir).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed to create node directory '{}': {}",
                dir.display(),
                error
            ))
        })?;
        Ok(dir)
    }

    /// Write a handler artifact like `prompt.md` or `response.md` into the
    /// node's directory.
    pub fn write_node_file(
        &self,
        node_id: &str,
        file_name: &str,
        contents: &str,
    ) -> Result<PathBuf, WaymarkError> {
        let path = self.node_dir(node_id)?.join(file_name);
        fs::write(&path, contents).map_err(|error| {
            WaymarkError::Runtime(format!(
                "failed writing node file '{}': {}",
                path.display(),
                error
            ))
        })?;
        Ok(path)
    }
}
