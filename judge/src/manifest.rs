//! This module implements the data-pack manifest and problem configuration
//! model.
//!
//! A data pack contains a `manifest.json` describing the test cases, an
//! optional subtask structure and the default IO configuration, plus a
//! `config.json` carrying the problem's default limits and per-language
//! overrides. Decoding is strict about structure; referential integrity
//! (unique ids, subtask references) is checked by `Manifest::validate`.
//!

use std::collections::HashSet;
use std::path::Path;

use serde::{Serialize, Deserialize};

use sandbox::ResourceLimit;

use crate::{Result, ResultExt, validation_error};

/// File name of the manifest inside a data pack.
pub const MANIFEST_FILE: &str = "manifest.json";

/// File name of the problem configuration inside a data pack.
pub const CONFIG_FILE: &str = "config.json";

/// How the judged program exchanges data with the test case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Input on stdin, output on stdout.
    Stdio,

    /// Input and output through named files in the work directory.
    FileIo,
}

impl Default for IoMode {
    fn default() -> IoMode {
        IoMode::Stdio
    }
}

/// IO configuration of a test case.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IoConfig {
    /// The IO mode.
    pub mode: IoMode,

    /// Name of the input file inside the work directory. Required in file IO
    /// mode.
    pub input_file_name: Option<String>,

    /// Name of the output file inside the work directory. Required in file
    /// IO mode.
    pub output_file_name: Option<String>,
}

impl IoConfig {
    /// Check the mode-specific file name requirements.
    pub fn validate(&self) -> Result<()> {
        if self.mode == IoMode::FileIo {
            let input_ok = self.input_file_name.as_ref()
                .map(|name| !name.is_empty())
                .unwrap_or(false);
            let output_ok = self.output_file_name.as_ref()
                .map(|name| !name.is_empty())
                .unwrap_or(false);
            if !input_ok || !output_ok {
                return Err(validation_error(
                    "file IO requires both input and output file names"));
            }
        }

        Ok(())
    }

    /// Name the input file is exposed under inside the work directory.
    pub fn input_name(&self) -> &str {
        self.input_file_name.as_deref().unwrap_or("input.txt")
    }

    /// Name the program's output is collected under inside the work
    /// directory.
    pub fn output_name(&self) -> &str {
        self.output_file_name.as_deref().unwrap_or("output.txt")
    }
}

/// An answer checker attached to a test case or to the whole manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checker {
    /// Path of the checker executable inside the work directory, or an
    /// absolute path provided by the data pack.
    pub binary: String,

    /// Extra arguments placed before the input/output/answer paths.
    #[serde(default)]
    pub args: Vec<String>,

    /// Language whose checker profile the checker runs under. Falls back to
    /// the submission's language when absent.
    #[serde(default)]
    pub language_id: Option<String>,
}

/// One test case of the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Testcase {
    /// Unique id of the test case within the manifest.
    pub test_id: String,

    /// Path of the input file, relative to the data pack root.
    pub input_path: String,

    /// Path of the answer file, relative to the data pack root.
    #[serde(default)]
    pub answer_path: Option<String>,

    /// Score awarded when this test case is accepted (ignored under
    /// subtask scoring).
    #[serde(default)]
    pub score: i64,

    /// Subtask this test case belongs to.
    #[serde(default)]
    pub subtask_id: Option<String>,

    /// Per-test limit overrides.
    #[serde(default)]
    pub limits: Option<ResourceLimit>,

    /// Per-test checker override.
    #[serde(default)]
    pub checker: Option<Checker>,

    /// Language whose checker profile the per-test checker runs under.
    #[serde(default)]
    pub checker_language_id: Option<String>,

    /// Per-test IO configuration override.
    #[serde(default)]
    pub io: Option<IoConfig>,
}

/// The scoring strategy of a subtask. `min` awards the subtask score iff
/// every test case in the group is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStrategy {
    Min,
}

impl Default for SubtaskStrategy {
    fn default() -> SubtaskStrategy {
        SubtaskStrategy::Min
    }
}

/// A group of test cases scored together.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Unique id of the subtask.
    pub id: String,

    /// Score awarded when the subtask passes.
    pub score: i64,

    /// Aggregation strategy.
    #[serde(default)]
    pub strategy: SubtaskStrategy,

    /// Whether remaining tests of this subtask are skipped after a failure.
    #[serde(default)]
    pub stop_on_fail: bool,
}

/// The decoded `manifest.json` of a data pack.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Test cases, in execution order.
    pub tests: Vec<Testcase>,

    /// Subtask structure, if the problem uses subtask scoring.
    #[serde(default)]
    pub subtasks: Option<Vec<Subtask>>,

    /// Default IO configuration for tests without an override.
    #[serde(default)]
    pub io: IoConfig,

    /// Default checker for tests without an override.
    #[serde(default)]
    pub checker: Option<Checker>,
}

impl Manifest {
    /// Decode a manifest from its JSON representation and validate it.
    pub fn from_json(raw: &str) -> Result<Manifest> {
        let manifest: Manifest = serde_json::from_str(raw)
            .map_err(|e| validation_error(format!("malformed manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load and validate the manifest stored in the given data pack
    /// directory.
    pub fn load<P>(pack_dir: P) -> Result<Manifest>
        where P: AsRef<Path> {
        let path = pack_dir.as_ref().join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .chain_err(|| format!("failed to read {}", path.display()))?;
        Manifest::from_json(&raw)
    }

    /// Check the manifest's structural invariants: at least one test, unique
    /// test and subtask ids, non-negative scores, valid IO configurations and
    /// resolvable subtask references.
    pub fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            return Err(validation_error("manifest has no test cases"));
        }

        self.io.validate()?;

        let mut subtask_ids = HashSet::new();
        if let Some(subtasks) = &self.subtasks {
            for subtask in subtasks {
                if subtask.score < 0 {
                    return Err(validation_error(format!(
                        "subtask {} has a negative score", subtask.id)));
                }
                if !subtask_ids.insert(subtask.id.as_str()) {
                    return Err(validation_error(format!(
                        "duplicate subtask id {}", subtask.id)));
                }
            }
        }

        let mut test_ids = HashSet::new();
        for test in &self.tests {
            if test.test_id.is_empty() {
                return Err(validation_error("empty test id"));
            }
            if !test_ids.insert(test.test_id.as_str()) {
                return Err(validation_error(format!(
                    "duplicate test id {}", test.test_id)));
            }
            if test.input_path.is_empty() {
                return Err(validation_error(format!(
                    "test {} has no input path", test.test_id)));
            }
            if test.score < 0 {
                return Err(validation_error(format!(
                    "test {} has a negative score", test.test_id)));
            }
            if let Some(io) = &test.io {
                io.validate()?;
            }
            if let Some(subtask_id) = &test.subtask_id {
                if !subtask_ids.contains(subtask_id.as_str()) {
                    return Err(validation_error(format!(
                        "test {} references unknown subtask {}",
                        test.test_id, subtask_id)));
                }
            }
        }

        Ok(())
    }
}

/// Per-language override entry of the problem configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageOverride {
    /// Language this override applies to.
    pub language_id: String,

    /// Extra flags appended to the compile command.
    #[serde(default)]
    pub extra_compile_flags: Vec<String>,

    /// Limit overrides for this language.
    #[serde(default)]
    pub limits: Option<ResourceLimit>,
}

/// The decoded `config.json` of a data pack.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProblemConfig {
    /// Limits applied to tests without a per-test override.
    pub default_limits: ResourceLimit,

    /// Per-language overrides, in declaration order.
    pub languages: Vec<LanguageOverride>,
}

impl ProblemConfig {
    /// Decode a problem configuration from its JSON representation.
    pub fn from_json(raw: &str) -> Result<ProblemConfig> {
        serde_json::from_str(raw)
            .map_err(|e| validation_error(format!("malformed problem config: {}", e)))
    }

    /// Load the configuration stored in the given data pack directory. A
    /// missing file yields the default configuration.
    pub fn load<P>(pack_dir: P) -> Result<ProblemConfig>
        where P: AsRef<Path> {
        let path = pack_dir.as_ref().join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => ProblemConfig::from_json(&raw),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ProblemConfig::default())
            },
            Err(e) => Err(e).chain_err(|| format!("failed to read {}", path.display())),
        }
    }

    /// The override entry for the given language, if any.
    pub fn language_override(&self, language_id: &str) -> Option<&LanguageOverride> {
        self.languages.iter().find(|entry| entry.language_id == language_id)
    }
}
