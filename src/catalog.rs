//! Test definitions and toolboxes on disk.
//!
//! Layout:
//!
//! ```text
//! <tests_dir>/<id>/<id>.ini          definition
//! <tests_dir>/<id>/inputs/           fixture tree
//! <toolboxes_dir>/<env>/<dir>/<toolbox>.atbx | .tbx
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toolcheck_core::naming::{DEFINITION_EXTENSION, INPUTS_DIRNAME};
use toolcheck_core::{TestDefinition, definition, normalize_toolbox_name};
use walkdir::WalkDir;

use crate::tool::ToolRuntime;

/// File extensions recognized as toolboxes.
pub const TOOLBOX_EXTENSIONS: [&str; 2] = ["atbx", "tbx"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot scan {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A definition file found under the tests directory. The id is the file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTest {
    pub path: PathBuf,
    pub id: String,
}

/// Files with one of `extensions` exactly two levels below `root`, sorted by path.
fn files_at_depth_two(root: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, CatalogError> {
    if !root.is_dir() {
        tracing::warn!(root = %root.display(), "directory does not exist");
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root).min_depth(2).max_depth(2).sort_by_file_name() {
        let entry = entry.map_err(|e| CatalogError::Scan {
            path: root.to_path_buf(),
            source: io::Error::from(e),
        })?;
        let matches = entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|ext| extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)));
        if matches {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

/// Every `<tests_dir>/*/*.ini`, sorted. This order is the dispatch order.
pub fn find_tests(tests_dir: &Path) -> Result<Vec<DiscoveredTest>, CatalogError> {
    Ok(files_at_depth_two(tests_dir, &[DEFINITION_EXTENSION])?
        .into_iter()
        .filter_map(|path| {
            let id = path.file_stem()?.to_string_lossy().into_owned();
            Some(DiscoveredTest { path, id })
        })
        .collect())
}

/// Every `<root>/*/*.atbx` and `<root>/*/*.tbx`, sorted.
pub fn find_toolboxes(root: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    files_at_depth_two(root, &TOOLBOX_EXTENSIONS)
}

/// `true` when some variant `<toolbox>.<alias>.*` already has a directory under `tests_dir`.
fn has_any_variant(tests_dir: &Path, test: &TestDefinition) -> bool {
    let prefix = format!("{}.{}.", test.normalized_toolbox_name(), test.alias);
    fs::read_dir(tests_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        })
        .unwrap_or(false)
}

/// Toolbox path relative to the environment root, always with `/` separators.
fn relative_toolbox(toolbox: &Path, root: &Path) -> String {
    let rel = toolbox.strip_prefix(root).unwrap_or(toolbox);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Templates for every tool in `toolbox_root` that does not have a test yet.
///
/// Each new test gets `<id>/<id>.ini` (default variant) and an empty `inputs/` directory. Returns the number of
/// templates written. A toolbox the runtime cannot read, or a tool it cannot describe, is logged and skipped.
pub fn create_new_tests(
    runtime: &dyn ToolRuntime,
    toolbox_root: &Path,
    tests_dir: &Path,
    generated_at: &str,
) -> Result<usize, CatalogError> {
    fs::create_dir_all(tests_dir).map_err(|source| CatalogError::Write {
        path: tests_dir.to_path_buf(),
        source,
    })?;

    let mut created = 0;
    for toolbox in find_toolboxes(toolbox_root)? {
        let aliases = match runtime.list_tools(&toolbox) {
            Ok(aliases) => aliases,
            Err(e) => {
                tracing::error!(toolbox = %toolbox.display(), "skipping toolbox: {e}");
                continue;
            }
        };
        tracing::debug!(toolbox = %toolbox.display(), tools = aliases.len(), "scanned toolbox");

        for alias in aliases {
            let mut test = TestDefinition::new(relative_toolbox(&toolbox, toolbox_root), alias);
            if has_any_variant(tests_dir, &test) {
                continue;
            }
            test.parameters = match runtime.describe_parameters(&toolbox, &test.alias) {
                Ok(parameters) => parameters,
                Err(e) => {
                    tracing::error!(toolbox = %toolbox.display(), "skipping tool {}: {e}", test.alias);
                    continue;
                }
            };

            let path = test.default_definition_path(tests_dir);
            let dir = path.parent().unwrap_or(tests_dir);
            let write = |target: &Path, result: io::Result<()>| {
                result.map_err(|source| CatalogError::Write {
                    path: target.to_path_buf(),
                    source,
                })
            };
            write(dir, fs::create_dir_all(dir.join(INPUTS_DIRNAME)))?;
            write(&path, fs::write(&path, definition::render_template(&test, generated_at)))?;
            tracing::info!("created {}", path.display());
            created += 1;
        }
    }
    Ok(created)
}

fn rename(from: &Path, to: &Path) -> Result<(), CatalogError> {
    fs::rename(from, to).map_err(|source| CatalogError::Rename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// Rename toolbox files and their folders under `root` to the normalized toolbox name.
///
/// After this, a toolbox path differs between environments only in the environment root. Returns
/// `(old, new)` toolbox paths for everything that moved. A target that already exists is left alone.
pub fn normalize_toolboxes(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>, CatalogError> {
    let mut by_folder: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for toolbox in find_toolboxes(root)? {
        if let Some(folder) = toolbox.parent() {
            by_folder.entry(folder.to_path_buf()).or_default().push(toolbox);
        }
    }

    let mut moved = Vec::new();
    for (folder, toolboxes) in by_folder {
        let mut renamed_files = Vec::new();
        for toolbox in &toolboxes {
            let normalized = normalize_toolbox_name(toolbox);
            let ext = toolbox.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default();
            let target = toolbox.with_file_name(format!("{normalized}.{ext}"));
            if target != *toolbox {
                if target.exists() {
                    tracing::warn!("not renaming {}: {} exists", toolbox.display(), target.display());
                    renamed_files.push((toolbox.clone(), toolbox.clone()));
                    continue;
                }
                rename(toolbox, &target)?;
            }
            renamed_files.push((toolbox.clone(), target));
        }

        // A folder is named after its first toolbox.
        let folder_name = normalize_toolbox_name(&toolboxes[0]);
        let new_folder = folder.with_file_name(&folder_name);
        let folder_moved = if new_folder != folder && !new_folder.exists() {
            rename(&folder, &new_folder)?;
            true
        } else {
            false
        };

        for (old, new) in renamed_files {
            let new = match (folder_moved, new.file_name()) {
                (true, Some(name)) => new_folder.join(name),
                _ => new,
            };
            if new != old {
                tracing::info!("{} -> {}", relative_toolbox(&old, root), relative_toolbox(&new, root));
                moved.push((old, new));
            }
        }
    }
    Ok(moved)
}
