//! Test definitions and their parameters.
//!
//! A [`TestDefinition`] is portable: the toolbox path is relative to an environment root, and parameter values
//! that start with the `inputs` sentinel are rewritten to wherever the fixture tree is staged for a run. The
//! same definition therefore runs unmodified against both installations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::naming::{DEFAULT_VARIANT, DEFINITION_EXTENSION, INPUTS_DIRNAME};

/// A declared output that climbs out of the staged inputs with `..`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("output '{output}' points outside the test's directories")]
pub struct EscapingOutput {
    pub output: String,
}

/// One named tool argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Name in code
    pub name: String,
    /// Default value reported by the tool, or the value entered in a definition
    pub value: String,
    /// Label shown in the tool's own UI (advisory)
    pub display_name: String,
    /// Human-readable data type, e.g. `Feature Class` (advisory)
    pub data_type: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            display_name: String::new(),
            data_type: String::new(),
        }
    }

    pub fn with_metadata(mut self, display_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self.data_type = data_type.into();
        self
    }
}

/// The portable description of one tool invocation plus its expected outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDefinition {
    /// Toolbox path, relative to the environment's toolbox root
    pub toolbox: String,
    /// Tool alias (internal name, not display name)
    pub alias: String,
    /// Short description of the test
    pub description: String,
    /// Stage inputs on local scratch disk (`true`) or beside the definition (`false`)
    pub run_local: bool,
    pub parameters: Vec<Parameter>,
    /// Paths, usually under `inputs/`, whose contents are kept for comparison
    pub outputs: Vec<String>,
}

static VERSION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v?\d(\.\d){1,2}").expect("INVARIANT: version tag pattern compiles"));
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W").expect("INVARIANT: non-word pattern compiles"));

/// Normalized form of a toolbox file's stem.
///
/// Lowercases, drops version tags such as `v0.3.0` or `1.2`, replaces non-word characters with `_` and trims
/// spaces/underscores, so `NV5_Tools v0.3.0.atbx` and `nv5 tools v0.4.atbx` both become `nv5_tools`.
pub fn normalize_toolbox_name(toolbox: impl AsRef<Path>) -> String {
    let full = toolbox.as_ref().to_string_lossy();
    let file_name = path_parts(&full).last().copied().unwrap_or_default();
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let without_versions = VERSION_TAG.replace_all(&stem, "");
    let word_only = NON_WORD.replace_all(&without_versions, "_");
    word_only.trim_matches([' ', '_']).to_string()
}

/// Build the globally unique test id `<toolbox>.<alias>.<variant>`.
pub fn test_id(normalized_toolbox: &str, alias: &str, variant: &str) -> String {
    [normalized_toolbox, alias, variant].join(".")
}

/// Split a stored path on either separator; definitions may be authored on any platform.
fn path_parts(value: &str) -> Vec<&str> {
    value.split(['/', '\\']).filter(|part| !part.is_empty() && *part != ".").collect()
}

/// Strip the `inputs` sentinel from a relative path, if present.
pub fn strip_inputs_prefix(value: &str) -> PathBuf {
    let parts = path_parts(value);
    let rest = match parts.split_first() {
        Some((first, rest)) if *first == INPUTS_DIRNAME => rest,
        _ => &parts[..],
    };
    rest.iter().collect()
}

impl TestDefinition {
    pub fn new(toolbox: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            toolbox: toolbox.into(),
            alias: alias.into(),
            description: String::new(),
            run_local: true,
            parameters: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn normalized_toolbox_name(&self) -> String {
        normalize_toolbox_name(&self.toolbox)
    }

    pub fn test_id(&self, variant: &str) -> String {
        test_id(&self.normalized_toolbox_name(), &self.alias, variant)
    }

    /// Location of this definition's file under `tests_dir`: `<id>/<id>.ini`.
    pub fn definition_path(&self, tests_dir: &Path, variant: &str) -> PathBuf {
        let id = self.test_id(variant);
        tests_dir.join(&id).join(format!("{id}.{DEFINITION_EXTENSION}"))
    }

    pub fn default_definition_path(&self, tests_dir: &Path) -> PathBuf {
        self.definition_path(tests_dir, DEFAULT_VARIANT)
    }

    /// Parameters with every `inputs/...` value rewritten to point into `staged_inputs`.
    pub fn resolve_inputs(&self, staged_inputs: &Path) -> Vec<Parameter> {
        self.parameters
            .iter()
            .map(|p| {
                let parts = path_parts(&p.value);
                match parts.split_first() {
                    Some((first, rest)) if *first == INPUTS_DIRNAME => {
                        let target: PathBuf = std::iter::once(staged_inputs.as_os_str())
                            .chain(rest.iter().map(|r| std::ffi::OsStr::new(*r)))
                            .collect();
                        Parameter {
                            value: target.to_string_lossy().into_owned(),
                            ..p.clone()
                        }
                    }
                    _ => p.clone(),
                }
            })
            .collect()
    }

    /// `(source, destination)` pairs for every declared output, both relative to their roots with the
    /// `inputs` sentinel removed.
    ///
    /// Fails on the first output with a `..` component, before any pair is handed out.
    pub fn resolve_outputs(
        &self,
        staged_inputs: &Path,
        outputs_dir: &Path,
    ) -> Result<Vec<(PathBuf, PathBuf)>, EscapingOutput> {
        self.outputs
            .iter()
            .map(|output| {
                if path_parts(output).contains(&"..") {
                    return Err(EscapingOutput { output: output.clone() });
                }
                let relative = strip_inputs_prefix(output);
                Ok((staged_inputs.join(&relative), outputs_dir.join(&relative)))
            })
            .collect()
    }
}

/// Name/value map handed to the tool runtime.
pub fn parameter_map(params: &[Parameter]) -> BTreeMap<String, String> {
    params.iter().map(|p| (p.name.clone(), p.value.clone())).collect()
}
