//! Locating the state document and etcd backup inside an extracted snapshot

use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Suffix of RKE cluster state documents
pub const STATE_FILE_SUFFIX: &str = ".rkestate";

/// Prefix of per-run extraction directories
pub const EXTRACT_DIR_PREFIX: &str = "snapshot-";

/// The two payloads of a snapshot bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFiles {
    /// Cluster state document
    pub state_path: PathBuf,
    /// etcd backup handed to the restore step
    pub backup_path: PathBuf,
}

/// True if `path` names an RKE state document
pub fn is_state_file(path: &Path) -> bool {
    path.to_string_lossy().ends_with(STATE_FILE_SUFFIX)
}

/// Fresh extraction directory under `work_dir`, named after the current time
pub fn extraction_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(format!(
        "{}{}",
        EXTRACT_DIR_PREFIX,
        chrono::Utc::now().timestamp_millis()
    ))
}

/// Find the state document and backup under `dir`.
///
/// The tree is walked in file-name order. Bundles are expected to hold exactly
/// one of each; when there are more, the first one in walk order is used.
pub fn locate(dir: &Path) -> Result<SnapshotFiles> {
    let entries = list_tree(dir)?;

    let state_path = entries
        .iter()
        .find(|(path, _)| is_state_file(path))
        .map(|(path, _)| path.clone())
        .ok_or_else(|| Error::StateFileNotFound {
            dir: dir.to_path_buf(),
        })?;

    let backup_path = entries
        .iter()
        .find(|(path, is_dir)| !is_dir && !is_state_file(path))
        .map(|(path, _)| path.clone())
        .ok_or_else(|| Error::BackupFileNotFound {
            dir: dir.to_path_buf(),
        })?;

    info!(
        state = %state_path.display(),
        backup = %backup_path.display(),
        "Located snapshot contents"
    );
    Ok(SnapshotFiles {
        state_path,
        backup_path,
    })
}

fn list_tree(dir: &Path) -> Result<Vec<(PathBuf, bool)>> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                Error::extraction_io(path, e.into())
            })?;
            let is_dir = entry.file_type().is_dir();
            Ok((entry.into_path(), is_dir))
        })
        .collect()
}
