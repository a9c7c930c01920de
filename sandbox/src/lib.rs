//! This crate implements the sandbox half of the judge worker. The sandbox is
//! responsible for executing tasks in a kernel-isolated and monitored
//! environment.
//!
//! The sandbox implements:
//!
//! * Namespace isolation: each task runs in fresh user, PID, mount, network,
//! IPC, UTS and cgroup namespaces with its own pivoted root file system;
//!
//! * Resource limits: CPU time, wall clock time, memory, output size and
//! process count caps enforced through cgroup v2 and rlimits;
//!
//! * Syscall filtering: a default-deny seccomp filter with an explicit
//! allow-list;
//!
//! * Resource accounting: CPU usage, peak memory and output size collected
//! from the task's cgroup after it exits.
//!
//! The crate is split into an engine half that runs inside the judge worker
//! process (see `LinuxEngine`) and a helper half that runs as a separate
//! `sandbox-helper` binary and performs the in-sandbox initialization before
//! `exec`ing the task command.

mod cgroup;
mod context;
mod engine;
mod helper;
mod misc;
mod rlimits;
mod seccomp;

use std::path::PathBuf;

use serde::{Serialize, Deserialize};

pub use cgroup::CgroupDir;
pub use context::Context;
pub use engine::{EngineOptions, LinuxEngine, StubEngine, create_engine};
pub use helper::helper_main;

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
        Json(::serde_json::Error);
        Seccomp(seccomp::SeccompError);
    }

    errors {
        EngineConfig(message: String) {
            description("sandbox engine misconfigured")
            display("sandbox engine misconfigured: {}", message)
        }

        InvalidRunSpec(message: String) {
            description("invalid run spec")
            display("invalid run spec: {}", message)
        }

        HelperFailed(message: String) {
            description("sandbox helper failed")
            display("sandbox helper failed: {}", message)
        }

        Cancelled {
            description("operation cancelled")
        }

        DeadlineExceeded {
            description("operation deadline exceeded")
        }
    }
}

/// Resource caps applied to one sandboxed task.
///
/// Every field is measured in the unit named by its suffix. A value of zero
/// means "inherit / unbounded" for that dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimit {
    /// CPU time cap in milliseconds.
    pub cpu_time_ms: i64,

    /// Wall clock cap in milliseconds.
    pub wall_time_ms: i64,

    /// Memory cap in megabytes.
    pub memory_mb: i64,

    /// Stack size cap in megabytes.
    pub stack_mb: i64,

    /// Output size cap in megabytes.
    pub output_mb: i64,

    /// Cap on the number of tasks inside the sandbox.
    pub pids: i64,
}

impl ResourceLimit {
    /// Merge this limit over the given defaults. A field of the result comes
    /// from `self` when it is positive and from `defaults` otherwise.
    pub fn merge(&self, defaults: &ResourceLimit) -> ResourceLimit {
        fn pick(over: i64, def: i64) -> i64 {
            if over > 0 { over } else { def }
        }

        ResourceLimit {
            cpu_time_ms: pick(self.cpu_time_ms, defaults.cpu_time_ms),
            wall_time_ms: pick(self.wall_time_ms, defaults.wall_time_ms),
            memory_mb: pick(self.memory_mb, defaults.memory_mb),
            stack_mb: pick(self.stack_mb, defaults.stack_mb),
            output_mb: pick(self.output_mb, defaults.output_mb),
            pids: pick(self.pids, defaults.pids),
        }
    }

    /// Scale the time caps by `time_multiplier` and the memory cap by
    /// `memory_multiplier`. Each scaled value is the ceiling of the f64
    /// product; zero inputs stay zero.
    pub fn scale(&self, time_multiplier: f64, memory_multiplier: f64) -> ResourceLimit {
        fn mul(value: i64, multiplier: f64) -> i64 {
            if value <= 0 {
                value
            } else {
                (value as f64 * multiplier).ceil() as i64
            }
        }

        ResourceLimit {
            cpu_time_ms: mul(self.cpu_time_ms, time_multiplier),
            wall_time_ms: mul(self.wall_time_ms, time_multiplier),
            memory_mb: mul(self.memory_mb, memory_multiplier),
            stack_mb: self.stack_mb,
            output_mb: self.output_mb,
            pids: self.pids,
        }
    }
}

/// A single bind mount from the host into the sandbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindMount {
    /// Absolute path of the mount source on the host.
    pub source: PathBuf,

    /// Absolute path of the mount target inside the sandbox.
    pub target: PathBuf,

    /// Whether the mount is remounted read-only after binding.
    pub read_only: bool,
}

impl BindMount {
    /// Create a new read-write bind mount.
    pub fn new<S, T>(source: S, target: T) -> Self
        where S: Into<PathBuf>, T: Into<PathBuf> {
        BindMount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Create a new read-only bind mount.
    pub fn read_only<S, T>(source: S, target: T) -> Self
        where S: Into<PathBuf>, T: Into<PathBuf> {
        BindMount {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Full description of one sandboxed execution.
///
/// `stdout_path` and `stderr_path` are host-side log files opened by the
/// engine before the task starts. `stdin_path` names a file inside the
/// sandbox; it is opened by the helper after the bind mounts are in place,
/// because the helper's own standard input carries the `InitRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// The submission this run belongs to.
    pub submission_id: String,

    /// The test (or synthetic task id such as `compile`) this run executes.
    pub test_id: String,

    /// Working directory of the task, as seen from inside the sandbox.
    pub work_dir: PathBuf,

    /// Command line in argv form.
    pub cmd: Vec<String>,

    /// Environment in `KEY=VALUE` form. When empty, the helper installs a
    /// default `PATH` only.
    pub env: Vec<String>,

    /// Standard input file inside the sandbox, or `None` for `/dev/null`.
    pub stdin_path: Option<PathBuf>,

    /// Host-side file capturing the task's standard output.
    pub stdout_path: PathBuf,

    /// Host-side file capturing the task's standard error.
    pub stderr_path: PathBuf,

    /// Bind mounts applied after the root file system.
    pub mounts: Vec<BindMount>,

    /// Name of the isolation profile to execute under.
    pub profile: String,

    /// Resource caps for this run.
    pub limits: ResourceLimit,
}

/// Resolved isolation parameters for a profile name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationProfile {
    /// Root file system the sandbox pivots into.
    pub root_fs: PathBuf,

    /// Name of the seccomp profile applied before `exec`.
    pub seccomp_profile: String,

    /// Whether the network namespace is left unconnected. Always true for
    /// judge profiles.
    pub disable_network: bool,
}

/// The JSON request the engine writes to the helper's standard input.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// The run to perform.
    pub spec: RunSpec,

    /// Resolved isolation profile.
    pub profile: IsolationProfile,

    /// Path of the engine-created cgroup the helper joins before `exec`, or
    /// `None` when cgroup confinement is disabled.
    pub cgroup_path: Option<PathBuf>,

    /// Whether the helper installs the seccomp filter.
    pub enable_seccomp: bool,

    /// Whether the helper unshares namespaces and pivots the root.
    pub enable_namespaces: bool,

    /// Allow-listed syscall names for the seccomp filter.
    pub seccomp_allow: Vec<String>,
}

/// Raw outcome of one sandboxed execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Exit code of the task. `-1` means the task was killed because it hit
    /// the CPU or wall clock deadline. Tasks killed by a signal report
    /// `128 + signo`.
    pub exit_code: i32,

    /// CPU time consumed, in milliseconds.
    pub time_ms: i64,

    /// Peak memory usage, in kilobytes.
    pub memory_kb: i64,

    /// Size of the captured standard output, in kilobytes.
    pub output_kb: i64,

    /// Standard output, truncated to the engine's read-back cap.
    pub stdout: String,

    /// Standard error, truncated to the engine's read-back cap.
    pub stderr: String,

    /// Whether the kernel OOM killer fired inside the task's cgroup.
    pub oom_killed: bool,

    /// Wall clock time elapsed, in milliseconds.
    pub wall_time_ms: i64,
}

impl RunResult {
    /// Whether the task was killed on a CPU or wall clock deadline.
    pub fn deadline_killed(&self) -> bool {
        self.exit_code == -1
    }
}

/// Capability interface of the sandbox execution engine.
///
/// Each `run` invocation is a self-contained transaction: whatever the
/// outcome, every resource it acquired (cgroup directory, log files, child
/// process) is released before it returns. The only state shared between
/// invocations is the submission to cgroup-path registry that backs
/// `kill_submission`.
pub trait Engine: Send + Sync {
    /// Execute the given run to completion and collect its statistics.
    ///
    /// A task that exits non-zero is not an engine error; engine errors mean
    /// the sandbox itself could not be set up or torn down.
    fn run(&self, ctx: &Context, spec: &RunSpec) -> Result<RunResult>;

    /// Kill every live run belonging to the given submission. Unknown
    /// submissions are a no-op success, and repeated kills are idempotent.
    fn kill_submission(&self, submission_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::ResourceLimit;

    mod resource_limit {
        use super::*;

        fn limit(cpu: i64, wall: i64, mem: i64, stack: i64, output: i64, pids: i64)
            -> ResourceLimit {
            ResourceLimit {
                cpu_time_ms: cpu,
                wall_time_ms: wall,
                memory_mb: mem,
                stack_mb: stack,
                output_mb: output,
                pids,
            }
        }

        #[test]
        fn merge_override_wins_when_positive() {
            let defaults = limit(1000, 3000, 256, 64, 16, 32);
            let over = limit(2000, 0, 0, 128, 0, 0);
            let merged = over.merge(&defaults);

            assert_eq!(2000, merged.cpu_time_ms);
            assert_eq!(3000, merged.wall_time_ms);
            assert_eq!(256, merged.memory_mb);
            assert_eq!(128, merged.stack_mb);
            assert_eq!(16, merged.output_mb);
            assert_eq!(32, merged.pids);
        }

        #[test]
        fn merge_zero_only_when_both_zero() {
            let defaults = limit(0, 0, 0, 0, 0, 0);
            let over = limit(0, 0, 512, 0, 0, 0);
            let merged = over.merge(&defaults);

            assert_eq!(0, merged.cpu_time_ms);
            assert_eq!(512, merged.memory_mb);
            assert_eq!(0, merged.pids);
        }

        #[test]
        fn scale_rounds_up() {
            let base = limit(1000, 3000, 256, 64, 16, 32);
            let scaled = base.scale(1.5, 2.0);

            assert_eq!(1500, scaled.cpu_time_ms);
            assert_eq!(4500, scaled.wall_time_ms);
            assert_eq!(512, scaled.memory_mb);
            assert_eq!(64, scaled.stack_mb);

            let odd = limit(333, 0, 100, 0, 0, 0).scale(1.1, 1.01);
            assert_eq!(367, odd.cpu_time_ms);
            assert_eq!(101, odd.memory_mb);
        }

        #[test]
        fn scale_keeps_zero() {
            let base = limit(0, 0, 0, 0, 0, 0);
            let scaled = base.scale(2.0, 2.0);
            assert_eq!(base, scaled);
        }
    }
}
