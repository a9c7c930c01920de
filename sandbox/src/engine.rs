//! This module implements the host side of the sandbox: spawning the helper,
//! enforcing deadlines, collecting statistics and tearing everything down.
//!

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use std::os::unix::fs::OpenOptionsExt;

use crate::{
    Context,
    Engine,
    Error,
    ErrorKind,
    InitRequest,
    IsolationProfile,
    Result,
    ResultExt,
    RunResult,
    RunSpec,
};
use crate::cgroup::{self, CgroupDir};
use crate::misc;

/// Interval between consecutive reap polls on the helper process.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration of a `LinuxEngine` instance.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Root of the cgroup v2 hierarchy the engine creates run cgroups under.
    pub cgroup_root: PathBuf,

    /// Path to the `sandbox-helper` binary.
    pub helper_path: PathBuf,

    /// Directory containing seccomp profile files (`{name}.json`).
    pub seccomp_dir: PathBuf,

    /// Read-back cap for captured stdout/stderr, in bytes.
    pub stdout_stderr_max_bytes: u64,

    /// Whether the helper installs seccomp filters.
    pub enable_seccomp: bool,

    /// Whether runs are confined and accounted through cgroups.
    pub enable_cgroup: bool,

    /// Whether the helper unshares namespaces and pivots the root.
    pub enable_namespaces: bool,

    /// Isolation profiles by name.
    pub profiles: HashMap<String, IsolationProfile>,
}

/// On-disk shape of a seccomp profile file.
#[derive(serde::Deserialize)]
struct SeccompProfileFile {
    allow: Vec<String>,
}

/// A stack of teardown actions executed in LIFO order when dropped.
///
/// Engine runs acquire resources in sequence (cgroup, registry entry, log
/// files); pushing the matching release onto this stack guarantees the
/// releases run on every exit path, early error returns and panics included.
struct Teardown<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Teardown<'a> {
    fn new() -> Self {
        Teardown { actions: Vec::new() }
    }

    fn push<F>(&mut self, action: F)
        where F: FnOnce() + 'a {
        self.actions.push(Box::new(action));
    }
}

impl<'a> Drop for Teardown<'a> {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

/// The Linux sandbox engine.
///
/// The submission to cgroup-path registry is the only state shared between
/// runs; it exists so that `kill_submission` can reach every live cgroup of a
/// submission without walking the file system.
pub struct LinuxEngine {
    options: EngineOptions,

    /// Live cgroup paths per submission, guarded by a short mutex.
    cgroups: Mutex<HashMap<String, Vec<PathBuf>>>,
}

impl LinuxEngine {
    /// Create a new engine. Fails closed when the helper binary is missing or
    /// cgroup v2 is not mounted while cgroup confinement is enabled.
    pub fn new(options: EngineOptions) -> Result<Self> {
        if !options.helper_path.is_file() {
            return Err(Error::from(ErrorKind::EngineConfig(format!(
                "sandbox helper not found at {}", options.helper_path.display()))));
        }
        if options.enable_cgroup {
            cgroup::ensure_v2(&options.cgroup_root)?;
        }

        Ok(LinuxEngine {
            options,
            cgroups: Mutex::new(HashMap::new()),
        })
    }

    fn resolve_profile(&self, name: &str) -> Result<IsolationProfile> {
        self.options.profiles.get(name).cloned().ok_or_else(|| {
            Error::from(ErrorKind::EngineConfig(format!(
                "isolation profile not registered: {}", name)))
        })
    }

    /// Load the allow-list of the named seccomp profile from the profile
    /// directory.
    fn load_seccomp_allowlist(&self, profile: &str) -> Result<Vec<String>> {
        let path = self.options.seccomp_dir.join(format!("{}.json", profile));
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            Error::from(ErrorKind::EngineConfig(format!(
                "seccomp profile not found: {}", path.display())))
        })?;
        let file: SeccompProfileFile = serde_json::from_str(&raw)
            .chain_err(|| format!("malformed seccomp profile: {}", path.display()))?;

        Ok(file.allow)
    }

    fn validate_spec(spec: &RunSpec) -> Result<()> {
        fn invalid<T>(message: String) -> Result<T> {
            Err(Error::from(ErrorKind::InvalidRunSpec(message)))
        }

        if spec.submission_id.is_empty() {
            return invalid(String::from("empty submission id"));
        }
        if spec.cmd.is_empty() {
            return invalid(String::from("empty command"));
        }
        for arg in &spec.cmd {
            if !misc::is_valid_c_string(arg) {
                return invalid(format!("invalid argv entry: {:?}", arg));
            }
        }
        for env in &spec.env {
            if !misc::is_valid_c_string(env) || !env.contains('=') {
                return invalid(format!("invalid environment entry: {:?}", env));
            }
        }
        if !spec.work_dir.is_absolute() {
            return invalid(format!("work dir is not absolute: {}", spec.work_dir.display()));
        }
        for io_path in &[&spec.stdout_path, &spec.stderr_path] {
            match io_path.parent() {
                Some(parent) if parent.is_dir() => (),
                _ => return invalid(format!(
                    "log path has no existing parent: {}", io_path.display())),
            }
        }
        for mount in &spec.mounts {
            if !mount.source.is_absolute() {
                return invalid(format!(
                    "bind mount source is not absolute: {}", mount.source.display()));
            }
            if !mount.source.exists() {
                return invalid(format!(
                    "bind mount source does not exist: {}", mount.source.display()));
            }
            if !mount.target.is_absolute() {
                return invalid(format!(
                    "bind mount target is not absolute: {}", mount.target.display()));
            }
            let escapes = mount.target.components().any(|component| {
                matches!(component, std::path::Component::ParentDir)
            });
            if escapes {
                return invalid(format!(
                    "bind mount target escapes the sandbox: {}", mount.target.display()));
            }
        }

        Ok(())
    }

    /// Open a log file for writing, create-or-truncate with mode 0644.
    fn open_log(path: &Path) -> Result<File> {
        retry_transient(|| {
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(0o644)
                .open(path)
        }).chain_err(|| format!("failed to open log file {}", path.display()))
    }

    /// Read back at most `max_bytes` of the given log file.
    fn read_log(path: &Path, max_bytes: u64) -> (i64, String) {
        let size = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        let mut content = String::new();

        if let Ok(file) = File::open(path) {
            let mut buf = Vec::new();
            let _ = file.take(max_bytes).read_to_end(&mut buf);
            content = String::from_utf8_lossy(&buf).into_owned();
        }

        (((size + 1023) / 1024) as i64, content)
    }

    fn register_cgroup(&self, submission_id: &str, path: PathBuf) {
        let mut cgroups = self.cgroups.lock().unwrap();
        cgroups.entry(submission_id.to_owned()).or_default().push(path);
    }

    fn unregister_cgroup(&self, submission_id: &str, path: &Path) {
        let mut cgroups = self.cgroups.lock().unwrap();
        if let Some(paths) = cgroups.get_mut(submission_id) {
            paths.retain(|p| p != path);
            if paths.is_empty() {
                cgroups.remove(submission_id);
            }
        }
    }
}

impl Engine for LinuxEngine {
    fn run(&self, ctx: &Context, spec: &RunSpec) -> Result<RunResult> {
        ctx.ensure_active()?;
        Self::validate_spec(spec)?;

        let profile = self.resolve_profile(&spec.profile)?;
        let seccomp_allow = if self.options.enable_seccomp {
            self.load_seccomp_allowlist(&profile.seccomp_profile)?
        } else {
            Vec::new()
        };

        let mut teardown = Teardown::new();

        // Cgroup first so that the kill switch exists before the task does.
        let cgroup = if self.options.enable_cgroup {
            let cg = CgroupDir::create(
                &self.options.cgroup_root, &spec.submission_id, &spec.test_id)?;
            cg.apply_limits(&spec.limits)?;

            let cg = Arc::new(cg);
            self.register_cgroup(&spec.submission_id, cg.path().to_path_buf());

            // The registry entry and the directory go away together.
            let registry_path = cg.path().to_path_buf();
            let submission_id = spec.submission_id.clone();
            let cleanup_cg = cg.clone();
            teardown.push(move || {
                self.unregister_cgroup(&submission_id, &registry_path);
                if let Err(e) = cleanup_cg.remove() {
                    log::warn!("failed to remove cgroup {}: {}", cleanup_cg.path().display(), e);
                }
            });
            Some(cg)
        } else {
            None
        };

        if let Some(stdin) = &spec.stdin_path {
            // The helper opens stdin inside the sandbox; here we only make
            // sure the backing file is readable on the host side when the
            // mount table lets us see it.
            log::trace!("run {}:{} stdin from {}",
                spec.submission_id, spec.test_id, stdin.display());
        }
        let stdout_file = Self::open_log(&spec.stdout_path)?;
        let stderr_file = Self::open_log(&spec.stderr_path)?;

        let init = InitRequest {
            spec: spec.clone(),
            profile,
            cgroup_path: cgroup.as_ref().map(|cg| cg.path().to_path_buf()),
            enable_seccomp: self.options.enable_seccomp,
            enable_namespaces: self.options.enable_namespaces,
            seccomp_allow,
        };

        let started = Instant::now();
        let mut child = Command::new(&self.options.helper_path)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout_file.try_clone()
                .chain_err(|| "failed to clone stdout handle")?))
            .stderr(Stdio::from(stderr_file.try_clone()
                .chain_err(|| "failed to clone stderr handle")?))
            .spawn()
            .chain_err(|| format!(
                "failed to spawn sandbox helper {}", self.options.helper_path.display()))?;

        let pid = child.id() as libc::pid_t;

        {
            let mut helper_stdin = child.stdin.take().ok_or_else(|| {
                Error::from(ErrorKind::HelperFailed(String::from("helper stdin unavailable")))
            })?;
            let payload = serde_json::to_vec(&init)?;
            if let Err(e) = helper_stdin.write_all(&payload) {
                let _ = kill_task(cgroup.as_deref(), pid);
                return Err(Error::from(e))
                    .chain_err(|| "failed to send init request to helper");
            }
            // Dropping the handle closes the pipe; the helper reads to EOF.
        }

        let deadline = if spec.limits.wall_time_ms > 0 {
            Some(started + Duration::from_millis(spec.limits.wall_time_ms as u64))
        } else {
            None
        };

        let mut deadline_hit = false;
        let mut cancelled = false;
        let (status, rusage) = loop {
            let mut status: libc::c_int = 0;
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            let reaped = unsafe {
                libc::wait4(pid, &mut status, libc::WNOHANG, &mut rusage)
            };

            if reaped == pid {
                break (status, rusage);
            }
            if reaped == -1 {
                let e = std::io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::from(e)).chain_err(|| "wait4 on helper failed");
            }

            if !cancelled && ctx.is_cancelled() {
                cancelled = true;
                kill_task(cgroup.as_deref(), pid);
            } else if !deadline_hit && !cancelled {
                let wall_expired = deadline
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(false);
                if wall_expired || ctx.deadline_exceeded() {
                    deadline_hit = true;
                    kill_task(cgroup.as_deref(), pid);
                }
            }

            std::thread::sleep(REAP_INTERVAL);
        };

        let wall_time_ms = started.elapsed().as_millis() as i64;

        if cancelled {
            return Err(Error::from(ErrorKind::Cancelled));
        }

        // Decode the helper exit status. The helper signals its own startup
        // failures by dying of SIGUSR1.
        let mut exit_code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            if signal == libc::SIGUSR1 {
                let (_, stderr) = Self::read_log(
                    &spec.stderr_path, self.options.stdout_stderr_max_bytes);
                return Err(Error::from(ErrorKind::HelperFailed(stderr)));
            }
            128 + signal
        } else {
            128
        };

        let (mut time_ms, mut memory_kb, oom_killed) = match &cgroup {
            Some(cg) => {
                let time_ms = cg.cpu_usage_ms()?;
                let memory_kb = cg.memory_peak_kb()
                    .unwrap_or(rusage.ru_maxrss as i64);
                (time_ms, memory_kb, cg.oom_killed())
            },
            None => {
                let user_ms = rusage.ru_utime.tv_sec as i64 * 1000
                    + rusage.ru_utime.tv_usec as i64 / 1000;
                let sys_ms = rusage.ru_stime.tv_sec as i64 * 1000
                    + rusage.ru_stime.tv_usec as i64 / 1000;
                (user_ms + sys_ms, rusage.ru_maxrss as i64, false)
            }
        };

        if deadline_hit {
            exit_code = -1;
        }
        if spec.limits.cpu_time_ms > 0 && time_ms > spec.limits.cpu_time_ms {
            // Killed by the kernel on RLIMIT_CPU, or finished right on the
            // edge; either way the task used more CPU than it was given.
            exit_code = -1;
        }
        if time_ms < 0 {
            time_ms = 0;
        }
        if memory_kb < 0 {
            memory_kb = 0;
        }

        let max_bytes = self.options.stdout_stderr_max_bytes;
        let (output_kb, stdout) = Self::read_log(&spec.stdout_path, max_bytes);
        let (_, stderr) = Self::read_log(&spec.stderr_path, max_bytes);

        drop(teardown);

        Ok(RunResult {
            exit_code,
            time_ms,
            memory_kb,
            output_kb,
            stdout,
            stderr,
            oom_killed,
            wall_time_ms,
        })
    }

    fn kill_submission(&self, submission_id: &str) -> Result<()> {
        let snapshot: Vec<PathBuf> = {
            let cgroups = self.cgroups.lock().unwrap();
            cgroups.get(submission_id).cloned().unwrap_or_default()
        };

        for path in snapshot {
            if let Err(e) = CgroupDir::open(&path).kill() {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to kill cgroup {}: {}", path.display(), e);
                }
            }
        }

        Ok(())
    }
}

/// Kill a running task: through its cgroup when confined, by signal
/// otherwise.
fn kill_task(cgroup: Option<&CgroupDir>, pid: libc::pid_t) {
    match cgroup {
        Some(cg) => {
            if let Err(e) = cg.kill() {
                log::warn!("cgroup.kill failed for {}: {}", cg.path().display(), e);
                unsafe { libc::kill(pid, libc::SIGKILL); }
            }
        },
        None => unsafe {
            libc::kill(pid, libc::SIGKILL);
        },
    }
}

/// Run the given IO action, retrying once on transient failures.
fn retry_transient<T, F>(mut action: F) -> std::io::Result<T>
    where F: FnMut() -> std::io::Result<T> {
    match action() {
        Ok(value) => Ok(value),
        Err(e) => {
            let transient = matches!(e.raw_os_error(),
                Some(libc::EINTR) | Some(libc::ENOSPC) | Some(libc::EAGAIN));
            if transient {
                action()
            } else {
                Err(e)
            }
        }
    }
}

/// An engine variant that fails closed for every operation. Selected on
/// platforms without namespace and cgroup support, or when namespaces are
/// disabled by configuration on a production profile.
pub struct StubEngine {
    reason: String,
}

impl StubEngine {
    /// Create a new `StubEngine` that reports the given reason.
    pub fn new<T>(reason: T) -> Self
        where T: Into<String> {
        StubEngine { reason: reason.into() }
    }
}

impl Engine for StubEngine {
    fn run(&self, _ctx: &Context, _spec: &RunSpec) -> Result<RunResult> {
        Err(Error::from(ErrorKind::EngineConfig(self.reason.clone())))
    }

    fn kill_submission(&self, _submission_id: &str) -> Result<()> {
        Err(Error::from(ErrorKind::EngineConfig(self.reason.clone())))
    }
}

/// Create the engine appropriate for this platform. Non-Linux hosts always
/// get the fail-closed stub.
#[cfg(target_os = "linux")]
pub fn create_engine(options: EngineOptions) -> Result<Arc<dyn Engine>> {
    Ok(Arc::new(LinuxEngine::new(options)?))
}

/// Create the engine appropriate for this platform. Non-Linux hosts always
/// get the fail-closed stub.
#[cfg(not(target_os = "linux"))]
pub fn create_engine(_options: EngineOptions) -> Result<Arc<dyn Engine>> {
    Ok(Arc::new(StubEngine::new("sandbox requires Linux namespaces and cgroup v2")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BindMount;

    fn spec_with(mutator: impl FnOnce(&mut RunSpec)) -> RunSpec {
        let dir = std::env::temp_dir();
        let mut spec = RunSpec {
            submission_id: String::from("sub-1"),
            test_id: String::from("t1"),
            work_dir: PathBuf::from("/work"),
            cmd: vec![String::from("/bin/true")],
            env: Vec::new(),
            stdin_path: None,
            stdout_path: dir.join("engine-test-stdout.log"),
            stderr_path: dir.join("engine-test-stderr.log"),
            mounts: Vec::new(),
            profile: String::from("cpp-run"),
            limits: crate::ResourceLimit::default(),
        };
        mutator(&mut spec);
        spec
    }

    mod validation {
        use super::*;

        #[test]
        fn accepts_minimal_spec() {
            assert!(LinuxEngine::validate_spec(&spec_with(|_| ())).is_ok());
        }

        #[test]
        fn rejects_empty_cmd() {
            let spec = spec_with(|s| s.cmd.clear());
            assert!(LinuxEngine::validate_spec(&spec).is_err());
        }

        #[test]
        fn rejects_relative_work_dir() {
            let spec = spec_with(|s| s.work_dir = PathBuf::from("work"));
            assert!(LinuxEngine::validate_spec(&spec).is_err());
        }

        #[test]
        fn rejects_nul_in_argv() {
            let spec = spec_with(|s| s.cmd.push(String::from("a\x00b")));
            assert!(LinuxEngine::validate_spec(&spec).is_err());
        }

        #[test]
        fn rejects_env_without_separator() {
            let spec = spec_with(|s| s.env.push(String::from("NOEQUALS")));
            assert!(LinuxEngine::validate_spec(&spec).is_err());
        }

        #[test]
        fn rejects_relative_mount_source() {
            let spec = spec_with(|s| {
                s.mounts.push(BindMount::new("relative/dir", "/work"));
            });
            assert!(LinuxEngine::validate_spec(&spec).is_err());
        }

        #[test]
        fn rejects_traversing_mount_target() {
            let spec = spec_with(|s| {
                s.mounts.push(BindMount::new(std::env::temp_dir(), "/work/../etc"));
            });
            assert!(LinuxEngine::validate_spec(&spec).is_err());
        }
    }

    mod stub {
        use super::*;

        #[test]
        fn stub_fails_closed() {
            let stub = StubEngine::new("unsupported platform");
            let ctx = Context::background();
            assert!(stub.run(&ctx, &spec_with(|_| ())).is_err());
            assert!(stub.kill_submission("sub-1").is_err());
        }
    }

    mod kill {
        use super::*;

        #[test]
        fn kill_unknown_submission_is_an_idempotent_noop() {
            let dir = tempfile::tempdir().unwrap();
            let helper = dir.path().join("sandbox-helper");
            std::fs::write(&helper, "").unwrap();

            let engine = LinuxEngine::new(EngineOptions {
                cgroup_root: dir.path().join("cgroup"),
                helper_path: helper,
                seccomp_dir: dir.path().join("seccomp"),
                stdout_stderr_max_bytes: 4096,
                enable_seccomp: false,
                enable_cgroup: false,
                enable_namespaces: false,
                profiles: HashMap::new(),
            }).unwrap();

            assert!(engine.kill_submission("ghost").is_ok());
            assert!(engine.kill_submission("ghost").is_ok());
        }
    }

    mod read_log {
        use super::*;

        #[test]
        fn truncates_to_cap() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("out.log");
            std::fs::write(&path, vec![b'x'; 4096]).unwrap();

            let (kb, content) = LinuxEngine::read_log(&path, 100);
            assert_eq!(4, kb);
            assert_eq!(100, content.len());
        }

        #[test]
        fn missing_file_reads_empty() {
            let dir = tempfile::tempdir().unwrap();
            let (kb, content) = LinuxEngine::read_log(&dir.path().join("absent"), 100);
            assert_eq!(0, kb);
            assert!(content.is_empty());
        }
    }
}
