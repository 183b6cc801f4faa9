//! JSON snapshot files.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use vt_core::{SNAPSHOT_VERSION, Snapshot, SnapshotError, SnapshotStore};

/// A snapshot kept in a single JSON file.
///
/// Saves write a `.tmp` sibling and rename it over the target, so a crash
/// mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl SnapshotStore for SnapshotFile {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.tmp_path();
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        tracing::debug!(
            path = %self.path.display(),
            sessions = snapshot.contents.sessions.len(),
            "wrote snapshot"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let header: Header = serde_json::from_slice(&content)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(header.version));
        }
        Ok(Some(serde_json::from_slice(&content)?))
    }
}
