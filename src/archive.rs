//! Snapshot archive extraction
//!
//! RKE1 snapshots are zip bundles holding the cluster state document and the
//! etcd backup. The archive is untrusted input: every entry name is resolved
//! lexically against the destination root and the whole archive is rejected
//! if any entry would land outside it. All names are checked before the first
//! byte is written.
//!
//! Extraction is best-effort, not transactional. A failure part way through
//! leaves already written files in place.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};
use zip::ZipArchive;

use crate::{Error, Result};

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;
const PERMISSION_BITS: u32 = 0o7777;
/// Directories always keep owner rwx so their children can be written
const OWNER_RWX: u32 = 0o700;

/// Join `name` onto `dest` lexically.
///
/// `..` pops a component, `.` and root/prefix components are dropped, so an
/// absolute entry name is treated as relative to `dest`. Returns `None` when
/// a `..` would climb above `dest`.
pub fn contained_path(dest: &Path, name: &str) -> Option<PathBuf> {
    let mut resolved = dest.to_path_buf();
    let mut depth = 0usize;

    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    Some(resolved)
}

struct PlannedEntry {
    index: usize,
    path: PathBuf,
    is_dir: bool,
    mode: u32,
}

/// Extract the zip archive at `archive` into `dest`.
///
/// Returns the number of entries written.
pub fn extract(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive).map_err(|e| Error::archive_open(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| Error::archive_open(archive, e))?;

    let planned = plan_entries(&mut zip, archive, dest)?;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(OWNER_RWX)
        .create(dest)
        .map_err(|e| Error::extraction_io(dest, e))?;

    for entry in &planned {
        if entry.is_dir {
            create_dir(&entry.path, entry.mode | OWNER_RWX)?;
        } else {
            extract_file(&mut zip, entry)?;
        }
        debug!(path = %entry.path.display(), mode = format!("{:o}", entry.mode), "Extracted entry");
    }

    info!(
        archive = %archive.display(),
        dest = %dest.display(),
        entries = planned.len(),
        "Extracted snapshot archive"
    );
    Ok(planned.len())
}

/// Resolve every entry up front so a hostile name fails the whole archive
/// before anything is written.
fn plan_entries(
    zip: &mut ZipArchive<File>,
    archive: &Path,
    dest: &Path,
) -> Result<Vec<PlannedEntry>> {
    let mut planned = Vec::with_capacity(zip.len());

    for index in 0..zip.len() {
        let entry = zip
            .by_index_raw(index)
            .map_err(|e| Error::archive_open(archive, e))?;
        let name = entry.name().to_string();

        let path = contained_path(dest, &name).ok_or_else(|| Error::PathTraversal {
            entry: name.clone(),
            dest: dest.to_path_buf(),
        })?;

        let is_dir = entry.is_dir();
        let default_mode = if is_dir {
            DEFAULT_DIR_MODE
        } else {
            DEFAULT_FILE_MODE
        };
        let mode = entry
            .unix_mode()
            .map(|m| m & PERMISSION_BITS)
            .unwrap_or(default_mode);

        planned.push(PlannedEntry {
            index,
            path,
            is_dir,
            mode,
        });
    }

    Ok(planned)
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| Error::extraction_io(path, e))
}

fn extract_file(zip: &mut ZipArchive<File>, entry: &PlannedEntry) -> Result<()> {
    if let Some(parent) = entry.path.parent() {
        create_dir(parent, OWNER_RWX)?;
    }

    let mut reader = zip
        .by_index(entry.index)
        .map_err(|e| Error::extraction_io(&entry.path, std::io::Error::other(e)))?;

    let output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(entry.mode)
        .open(&entry.path)
        .map_err(|e| Error::extraction_io(&entry.path, e))?;

    let mut writer = BufWriter::new(output);
    std::io::copy(&mut reader, &mut writer).map_err(|e| Error::extraction_io(&entry.path, e))?;
    writer
        .flush()
        .map_err(|e| Error::extraction_io(&entry.path, e))
}
