//! JSON file persistence for the tree manager snapshot.

use std::io::Write;
use std::path::{Path, PathBuf};

use courier_tree::ManagerSnapshot;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::StoreError;

/// Snapshot file on disk.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so a crash mid-write leaves the previous snapshot intact.
#[derive(Clone, Debug)]
pub struct JsonTreeStore {
    path: PathBuf,
}

impl JsonTreeStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot; `None` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<ManagerSnapshot>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Atomically replace the snapshot file.
    pub fn save(&self, snapshot: &ManagerSnapshot) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        let _ = tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), trees = snapshot.trees.len(), "snapshot saved");
        Ok(())
    }
}
