//! Recursive copy helpers used for staging inputs and materializing outputs.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Copy the tree under `src` into `dst`, creating `dst` and merging into anything already there.
///
/// Symlinks are followed. Existing files at a destination path are overwritten.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).map_err(|e| io::Error::other(e.to_string()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// `true` when `dir` exists and contains at least one entry.
pub fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut entries| entries.next().is_some()).unwrap_or(false)
}

/// Remove `dir` and everything below it. A missing directory is not an error.
pub fn remove_tree(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
