//! This module implements the isolation profile table.
//!
//! A profile is addressed by the name `"{languageId}-{taskType}"` and maps to
//! the root file system, seccomp profile and default limits the sandbox
//! applies to tasks of that kind.
//!

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Serialize, Deserialize};

use sandbox::{IsolationProfile, ResourceLimit};

use crate::{Error, ErrorKind, Result};

/// The kind of task a profile applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Compiling a submission or checker source.
    Compile,

    /// Running the submitted program against a test case.
    Run,

    /// Running an answer checker.
    Checker,

    /// Running an interactor. Declared for forward compatibility; the runner
    /// refuses interactive tasks.
    Interactor,

    /// Running a linter.
    Lint,
}

impl TaskType {
    /// The name used in profile keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Compile => "compile",
            TaskType::Run => "run",
            TaskType::Checker => "checker",
            TaskType::Interactor => "interactor",
            TaskType::Lint => "lint",
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isolation parameters of one (language, task type) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProfile {
    /// The language this profile applies to.
    pub language_id: String,

    /// The task type this profile applies to.
    pub task_type: TaskType,

    /// Root file system tasks of this profile pivot into.
    pub root_fs: PathBuf,

    /// Name of the seccomp profile applied to tasks of this profile.
    pub seccomp_profile: String,

    /// Limits applied when a task carries no override.
    #[serde(default)]
    pub default_limits: ResourceLimit,
}

impl TaskProfile {
    /// The registry key of this profile.
    pub fn name(&self) -> String {
        profile_name(&self.language_id, self.task_type)
    }
}

/// Compose a profile registry key.
pub fn profile_name(language_id: &str, task_type: TaskType) -> String {
    format!("{}-{}", language_id, task_type)
}

/// The in-memory profile table, loaded from configuration.
pub struct ProfileResolver {
    profiles: HashMap<String, TaskProfile>,
}

impl ProfileResolver {
    /// Build a resolver from the configured profile list. Later entries with
    /// a duplicate key replace earlier ones.
    pub fn new<T>(profiles: T) -> Self
        where T: IntoIterator<Item = TaskProfile> {
        let mut table = HashMap::new();
        for profile in profiles {
            table.insert(profile.name(), profile);
        }
        ProfileResolver { profiles: table }
    }

    /// Resolve the profile registered for the given language and task type.
    pub fn resolve(&self, language_id: &str, task_type: TaskType) -> Result<&TaskProfile> {
        let name = profile_name(language_id, task_type);
        self.profiles.get(&name).ok_or_else(|| {
            Error::from(ErrorKind::ProfileNotFound(name))
        })
    }

    /// Export every profile as the engine-side isolation table, keyed by
    /// profile name. Network access is always disabled for judge profiles.
    pub fn isolation_profiles(&self) -> HashMap<String, IsolationProfile> {
        self.profiles.iter()
            .map(|(name, profile)| {
                (name.clone(), IsolationProfile {
                    root_fs: profile.root_fs.clone(),
                    seccomp_profile: profile.seccomp_profile.clone(),
                    disable_network: true,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(language_id: &str, task_type: TaskType) -> TaskProfile {
        TaskProfile {
            language_id: language_id.to_owned(),
            task_type,
            root_fs: PathBuf::from("/srv/rootfs/default"),
            seccomp_profile: String::from("default"),
            default_limits: ResourceLimit::default(),
        }
    }

    #[test]
    fn resolves_by_language_and_task() {
        let resolver = ProfileResolver::new(vec![
            profile("cpp", TaskType::Compile),
            profile("cpp", TaskType::Run),
        ]);

        assert!(resolver.resolve("cpp", TaskType::Compile).is_ok());
        assert!(resolver.resolve("cpp", TaskType::Run).is_ok());
    }

    #[test]
    fn missing_profile_is_not_found() {
        let resolver = ProfileResolver::new(vec![profile("cpp", TaskType::Run)]);
        let err = resolver.resolve("cpp", TaskType::Checker).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ProfileNotFound(..)));
    }

    #[test]
    fn profile_names_compose() {
        assert_eq!("python-checker", profile_name("python", TaskType::Checker));
        assert_eq!("cpp-interactor", profile_name("cpp", TaskType::Interactor));
    }

    #[test]
    fn exported_isolation_profiles_disable_network() {
        let resolver = ProfileResolver::new(vec![profile("cpp", TaskType::Run)]);
        let table = resolver.isolation_profiles();
        assert!(table.get("cpp-run").unwrap().disable_network);
    }
}
