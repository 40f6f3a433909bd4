//! Test-definition text format.
//!
//! A definition is a small sectioned key/value document:
//!
//! ```text
//! [test]
//! toolbox = nv5_toolbox/nv5_toolbox.atbx
//! alias = AOILandCover
//! description = duke giant spans
//! run_local = true
//!
//! [parameters]
//! ; display name: Input Features | type: Feature Class
//! input_fc = inputs/merged_spans.shp
//! buffer_distance = 152
//!
//! [outputs]
//! inputs/merged_spans_landcover.shp
//! ```
//!
//! ## Rules
//!
//! - Lines starting with `;` or `#` are comments. A `; display name: X | type: Y` comment directly above a
//!   parameter fills that parameter's advisory metadata.
//! - Keys are case-sensitive. A key without `=` has no value (this is how `[outputs]` lists paths).
//! - `[test]` is required with `toolbox` and `alias`; `[parameters]` and `[outputs]` may be absent.
//! - Duplicate sections or keys are errors. Unknown sections are ignored.

use thiserror::Error;

use crate::model::{Parameter, TestDefinition};

pub const SECTION_TEST: &str = "test";
pub const SECTION_PARAMETERS: &str = "parameters";
pub const SECTION_OUTPUTS: &str = "outputs";

/// Errors produced while reading a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("line {line}: entry outside of any section")]
    EntryOutsideSection { line: usize },

    #[error("line {line}: malformed section header '{text}'")]
    MalformedSection { line: usize, text: String },

    #[error("line {line}: duplicate section [{section}]")]
    DuplicateSection { line: usize, section: String },

    #[error("line {line}: duplicate key '{key}' in [{section}]")]
    DuplicateKey { line: usize, section: String, key: String },

    #[error("missing section [{0}]")]
    MissingSection(&'static str),

    #[error("missing key '{key}' in [{section}]")]
    MissingKey { section: &'static str, key: &'static str },

    #[error("invalid boolean '{value}' for '{key}'")]
    InvalidBool { key: &'static str, value: String },
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: Option<String>,
    /// `(display name, data type)` from the comment directly above
    meta: Option<(String, String)>,
}

#[derive(Debug)]
struct Section {
    name: String,
    entries: Vec<Entry>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

fn parse_parameter_meta(comment: &str) -> Option<(String, String)> {
    let rest = comment.strip_prefix("display name:")?;
    let (display_name, data_type) = rest.split_once("| type:")?;
    Some((display_name.trim().to_string(), data_type.trim().to_string()))
}

fn parse_sections(text: &str) -> Result<Vec<Section>, DefinitionError> {
    let mut sections: Vec<Section> = Vec::new();
    let mut pending_comment: Option<&str> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if line.is_empty() {
            pending_comment = None;
            continue;
        }

        if let Some(comment) = line.strip_prefix(';').or_else(|| line.strip_prefix('#')) {
            pending_comment = Some(comment.trim());
            continue;
        }

        if line.starts_with('[') {
            let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) else {
                return Err(DefinitionError::MalformedSection {
                    line: line_no,
                    text: line.to_string(),
                });
            };
            let name = name.trim();
            if sections.iter().any(|s| s.name == name) {
                return Err(DefinitionError::DuplicateSection {
                    line: line_no,
                    section: name.to_string(),
                });
            }
            sections.push(Section {
                name: name.to_string(),
                entries: Vec::new(),
            });
            pending_comment = None;
            continue;
        }

        let Some(section) = sections.last_mut() else {
            return Err(DefinitionError::EntryOutsideSection { line: line_no });
        };

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim().to_string())),
            None => (line, None),
        };

        if section.get(key).is_some() {
            return Err(DefinitionError::DuplicateKey {
                line: line_no,
                section: section.name.clone(),
                key: key.to_string(),
            });
        }

        section.entries.push(Entry {
            key: key.to_string(),
            value,
            meta: pending_comment.take().and_then(parse_parameter_meta),
        });
    }

    Ok(sections)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, DefinitionError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(DefinitionError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

fn required(section: &Section, key: &'static str) -> Result<String, DefinitionError> {
    section
        .get(key)
        .map(|e| e.value.clone().unwrap_or_default())
        .ok_or(DefinitionError::MissingKey {
            section: SECTION_TEST,
            key,
        })
}

/// Parse definition text.
pub fn parse(text: &str) -> Result<TestDefinition, DefinitionError> {
    let sections = parse_sections(text)?;
    let find = |name: &str| sections.iter().find(|s| s.name == name);

    let test = find(SECTION_TEST).ok_or(DefinitionError::MissingSection(SECTION_TEST))?;

    let run_local = match test.get("run_local").and_then(|e| e.value.as_deref()) {
        Some(value) if !value.is_empty() => parse_bool("run_local", value)?,
        _ => true,
    };

    let parameters = find(SECTION_PARAMETERS)
        .map(|section| {
            section
                .entries
                .iter()
                .map(|e| {
                    let param = Parameter::new(e.key.clone(), e.value.clone().unwrap_or_default());
                    match &e.meta {
                        Some((display_name, data_type)) => param.with_metadata(display_name, data_type),
                        None => param,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let outputs = find(SECTION_OUTPUTS)
        .map(|section| {
            section
                .entries
                .iter()
                .map(|e| e.key.trim_matches([' ', '\'', '"']).to_string())
                .filter(|o| !o.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(TestDefinition {
        toolbox: required(test, "toolbox")?,
        alias: required(test, "alias")?,
        description: test.get("description").and_then(|e| e.value.clone()).unwrap_or_default(),
        run_local,
        parameters,
        outputs,
    })
}

fn push_pair(out: &mut String, key: &str, value: &str) {
    if value.is_empty() {
        out.push_str(&format!("{key} =\n"));
    } else {
        out.push_str(&format!("{key} = {value}\n"));
    }
}

/// Serialize a definition as the commented template the catalog writes to disk.
pub fn serialize(test: &TestDefinition) -> String {
    let mut out = String::new();

    out.push_str("[test]\n");
    out.push_str("; toolbox (atbx/tbx) being tested, relative to each environment's toolbox folder.\n");
    push_pair(&mut out, "toolbox", &test.toolbox);
    out.push_str("; alias (tool's internal name) of tool being tested.\n");
    push_pair(&mut out, "alias", &test.alias);
    out.push_str("; SHORT description of test. letters, numbers, and spaces only.\n");
    push_pair(&mut out, "description", &test.description);
    out.push_str("; inputs are staged on local scratch disk if true. set false to stage them beside the test.\n");
    push_pair(&mut out, "run_local", if test.run_local { "true" } else { "false" });

    out.push_str("\n[parameters]\n");
    out.push_str("; tool input parameters.\n");
    for p in &test.parameters {
        if !p.display_name.is_empty() || !p.data_type.is_empty() {
            out.push_str(&format!("; display name: {} | type: {}\n", p.display_name, p.data_type));
        }
        push_pair(&mut out, &p.name, &p.value);
    }

    out.push_str("\n[outputs]\n");
    out.push_str("; list expected output files one per line.\n");
    out.push_str("; these are what will be compared between the baseline and target environments.\n");
    for output in &test.outputs {
        out.push_str(output);
        out.push('\n');
    }

    out
}

/// [`serialize`] prefixed with a `; generated <timestamp>` line.
pub fn render_template(test: &TestDefinition, generated_at: &str) -> String {
    format!("; generated {generated_at}\n{}", serialize(test))
}
