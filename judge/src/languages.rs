//! This module implements the language table used in the judge.
//!
//! Languages are plain configuration records; the judge looks them up by id
//! and expands their command templates into argv vectors. The placeholders
//! `{src}`, `{bin}` and `{extraFlags}` are substituted before the template is
//! split with POSIX shell rules.
//!

use std::collections::HashMap;

use serde::{Serialize, Deserialize};

use crate::{Error, ErrorKind, Result};

fn default_multiplier() -> f64 {
    1.0
}

/// Description of one judgeable language.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSpec {
    /// Identifier of the language, e.g. `cpp` or `python`.
    pub id: String,

    /// File name the submission source is stored under in the work dir.
    pub source_file: String,

    /// File name of the compiled binary in the work dir.
    pub binary_file: String,

    /// Whether sources of this language are compiled before running.
    pub compile_enabled: bool,

    /// Compile command template. Supports `{src}`, `{bin}` and
    /// `{extraFlags}`.
    #[serde(default)]
    pub compile_cmd_tpl: String,

    /// Run command template. Supports `{src}` and `{bin}`.
    pub run_cmd_tpl: String,

    /// Environment installed for tasks of this language, in `KEY=VALUE`
    /// form.
    #[serde(default)]
    pub env: Vec<String>,

    /// Multiplier applied to CPU and wall time limits.
    #[serde(default = "default_multiplier")]
    pub time_multiplier: f64,

    /// Multiplier applied to memory limits.
    #[serde(default = "default_multiplier")]
    pub memory_multiplier: f64,
}

impl LanguageSpec {
    /// Create a bare spec with the given names and neutral multipliers.
    /// Mostly useful for tests and built-in defaults.
    pub fn plain<I, S, B>(id: I, source_file: S, binary_file: B) -> Self
        where I: Into<String>, S: Into<String>, B: Into<String> {
        LanguageSpec {
            id: id.into(),
            source_file: source_file.into(),
            binary_file: binary_file.into(),
            compile_enabled: false,
            compile_cmd_tpl: String::new(),
            run_cmd_tpl: String::new(),
            env: Vec::new(),
            time_multiplier: 1.0,
            memory_multiplier: 1.0,
        }
    }
}

/// The table of judgeable languages, keyed by id.
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    /// Build a registry from the configured language list. Later entries with
    /// a duplicate id replace earlier ones.
    pub fn new<T>(specs: T) -> Self
        where T: IntoIterator<Item = LanguageSpec> {
        let mut languages = HashMap::new();
        for spec in specs {
            languages.insert(spec.id.clone(), spec);
        }
        LanguageRegistry { languages }
    }

    /// Find the language with the given id.
    pub fn find(&self, id: &str) -> Result<&LanguageSpec> {
        self.languages.get(id).ok_or_else(|| {
            Error::from(ErrorKind::LanguageNotSupported(id.to_owned()))
        })
    }

    /// Number of registered languages.
    pub fn len(&self) -> usize {
        self.languages.len()
    }

    /// Whether the registry holds no languages.
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

/// Expand a command template into an argv vector.
///
/// `{src}` and `{bin}` become the given file names; `{extraFlags}` becomes
/// the flags joined with single spaces (the empty list expands to nothing).
/// The expanded line is split with POSIX shell rules; an empty command is
/// rejected.
pub fn expand_command(
    template: &str,
    src: &str,
    bin: &str,
    extra_flags: &[String]) -> Result<Vec<String>> {
    let flags = extra_flags.join(" ");
    let line = template
        .replace("{src}", src)
        .replace("{bin}", bin)
        .replace("{extraFlags}", &flags);

    let argv = shell_words::split(&line).map_err(|e| {
        crate::validation_error(format!("malformed command template {:?}: {}", template, e))
    })?;
    if argv.is_empty() {
        return Err(crate::validation_error(format!(
            "command template {:?} expands to an empty command", template)));
    }

    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod registry {
        use super::*;

        #[test]
        fn finds_registered_language() {
            let registry = LanguageRegistry::new(vec![
                LanguageSpec::plain("cpp", "main.cpp", "main"),
            ]);
            assert_eq!("main.cpp", registry.find("cpp").unwrap().source_file);
        }

        #[test]
        fn unknown_language_is_unsupported() {
            let registry = LanguageRegistry::new(Vec::new());
            let err = registry.find("cobol").unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::LanguageNotSupported(..)));
        }
    }

    mod expand {
        use super::*;

        #[test]
        fn substitutes_placeholders() {
            let argv = expand_command(
                "g++ -O2 {extraFlags} -o {bin} {src}",
                "main.cpp",
                "main",
                &[String::from("-std=c++17"), String::from("-DONLINE_JUDGE")],
            ).unwrap();

            assert_eq!(vec![
                "g++", "-O2", "-std=c++17", "-DONLINE_JUDGE", "-o", "main", "main.cpp",
            ], argv);
        }

        #[test]
        fn empty_extra_flags_expand_to_nothing() {
            let argv = expand_command("g++ {extraFlags} -o {bin} {src}", "a.cpp", "a", &[])
                .unwrap();
            assert_eq!(vec!["g++", "-o", "a", "a.cpp"], argv);
        }

        #[test]
        fn quoted_arguments_stay_together() {
            let argv = expand_command("sh -c 'echo {src}'", "a.py", "a", &[]).unwrap();
            assert_eq!(vec!["sh", "-c", "echo a.py"], argv);
        }

        #[test]
        fn empty_expansion_is_rejected() {
            assert!(expand_command("{extraFlags}", "a", "b", &[]).is_err());
        }

        #[test]
        fn unbalanced_quote_is_rejected() {
            assert!(expand_command("g++ 'unterminated", "a", "b", &[]).is_err());
        }
    }
}
