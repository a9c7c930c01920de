//! This module implements the in-sandbox half of the engine. It runs inside
//! the `sandbox-helper` binary, which the engine spawns with an empty argv
//! and a JSON `InitRequest` on its standard input.
//!
//! The helper joins the engine-created cgroup, unshares its namespaces,
//! builds the sandbox mount tree, pivots into it, applies rlimits and the
//! seccomp filter, and finally `exec`s the task command. Setup failures are
//! signalled back to the engine by dying of `SIGUSR1` (startup failures are
//! thereby distinguishable from anything the task itself can produce by
//! exiting).
//!

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::IntoRawFd;

use nix::mount::{mount, umount2, MsFlags, MntFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::ForkResult;

use crate::{Error, ErrorKind, InitRequest, Result, ResultExt};
use crate::misc;
use crate::rlimits::{self, Resource};
use crate::seccomp;

/// Default `PATH` installed when the run spec carries no environment.
const DEFAULT_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";

/// Name of the directory the old root is pivoted onto, relative to the new
/// root. It is detached and removed before the task starts.
const OLD_ROOT_DIR: &str = ".old-root";

/// Entry point of the `sandbox-helper` binary. Never returns: the process
/// either becomes the task via `exec`, exits with the task's status, or dies
/// of `SIGUSR1` on setup failure.
pub fn helper_main() -> ! {
    if let Err(e) = run() {
        eprintln!("sandbox helper failed: {}", e);
    }
    die()
}

/// Kill the calling process with `SIGUSR1` and wait for delivery.
fn die() -> ! {
    let _ = nix::sys::signal::kill(nix::unistd::getpid(), Signal::SIGUSR1);
    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

fn run() -> Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)
        .chain_err(|| "failed to read init request")?;
    let init: InitRequest = serde_json::from_str(&raw)
        .chain_err(|| "malformed init request")?;

    // Join the cgroup first so every descendant, the task included, is
    // confined from its very first instruction.
    if let Some(cgroup_path) = &init.cgroup_path {
        join_cgroup(cgroup_path)?;
    }

    if init.enable_namespaces {
        enter_namespaces()?;

        // The new PID namespace only applies to children, so the task side
        // must be a fork. The parent stays behind to forward the status.
        match nix::unistd::fork()? {
            ForkResult::Parent { child } => wait_and_propagate(child),
            ForkResult::Child => {
                build_sandbox_tree(&init)?;
            }
        }
    }

    finish_exec(&init)
}

fn join_cgroup(cgroup_path: &Path) -> Result<()> {
    let procs = cgroup_path.join("cgroup.procs");
    std::fs::write(&procs, nix::unistd::getpid().as_raw().to_string())
        .chain_err(|| format!("failed to join cgroup {}", cgroup_path.display()))
}

/// Unshare into fresh namespaces and map the helper to root inside the new
/// user namespace.
fn enter_namespaces() -> Result<()> {
    let outer_uid = nix::unistd::getuid();
    let outer_gid = nix::unistd::getgid();

    let flags = libc::CLONE_NEWUSER
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWPID
        | libc::CLONE_NEWNET
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWUTS
        | libc::CLONE_NEWCGROUP;
    let ret = unsafe { libc::unshare(flags) };
    if ret != 0 {
        return Err(Error::from(std::io::Error::last_os_error()))
            .chain_err(|| "unshare failed");
    }

    // setgroups must be denied before the gid map becomes writable.
    std::fs::write("/proc/self/setgroups", "deny")
        .chain_err(|| "failed to deny setgroups")?;
    std::fs::write("/proc/self/gid_map", format!("0 {} 1", outer_gid))
        .chain_err(|| "failed to write gid map")?;
    std::fs::write("/proc/self/uid_map", format!("0 {} 1", outer_uid))
        .chain_err(|| "failed to write uid map")?;

    nix::unistd::sethostname("sandbox")?;

    Ok(())
}

/// Wait for the forked task side and exit with an equivalent status: the
/// task's exit code, or death by the same signal.
fn wait_and_propagate(child: nix::unistd::Pid) -> ! {
    loop {
        match nix::sys::wait::waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => std::process::exit(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                let _ = nix::sys::signal::kill(nix::unistd::getpid(), signal);
                loop {
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
            },
            Ok(..) => continue,
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(e) => {
                eprintln!("sandbox helper failed to wait for the task: {}", e);
                die();
            }
        }
    }
}

/// Build the mount tree under the profile root and pivot into it.
fn build_sandbox_tree(init: &InitRequest) -> Result<()> {
    let root = init.profile.root_fs.as_path();
    let none: Option<&Path> = None;

    // Detach mount propagation from the host before touching anything.
    mount(none, Path::new("/"), none, MsFlags::MS_REC | MsFlags::MS_PRIVATE, none)
        .chain_err(|| "failed to privatize mount propagation")?;

    mount(Some(root), root, none, MsFlags::MS_BIND | MsFlags::MS_REC, none)
        .chain_err(|| format!("failed to bind root fs {}", root.display()))?;

    // Mount targets (and the pivot directory) must exist before the root
    // goes read-only.
    let put_old = root.join(OLD_ROOT_DIR);
    std::fs::create_dir_all(&put_old)
        .chain_err(|| "failed to create pivot directory")?;
    std::fs::create_dir_all(root.join("proc"))
        .chain_err(|| "failed to create proc directory")?;
    for bind in &init.spec.mounts {
        prepare_mount_target(root, &bind.target, &bind.source)?;
    }

    mount(none, root, none,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY, none)
        .chain_err(|| "failed to remount root fs read-only")?;

    for bind in &init.spec.mounts {
        let target = in_root(root, &bind.target);
        mount(Some(bind.source.as_path()), target.as_path(), none,
            MsFlags::MS_BIND | MsFlags::MS_REC, none)
            .chain_err(|| format!(
                "failed to bind {} -> {}", bind.source.display(), target.display()))?;
        if bind.read_only {
            mount(none, target.as_path(), none,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY, none)
                .chain_err(|| format!(
                    "failed to remount {} read-only", target.display()))?;
        }
    }

    pivot_root(root, &put_old)?;
    nix::unistd::chdir("/")?;

    let old_root = Path::new("/").join(OLD_ROOT_DIR);
    umount2(old_root.as_path(), MntFlags::MNT_DETACH)
        .chain_err(|| "failed to detach the old root")?;
    let _ = std::fs::remove_dir(&old_root);

    mount(Some(Path::new("proc")), Path::new("/proc"), Some(Path::new("proc")),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC, none)
        .chain_err(|| "failed to mount /proc")?;

    Ok(())
}

/// Compute the pre-pivot location of an in-sandbox path.
fn in_root(root: &Path, target: &Path) -> PathBuf {
    match target.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(..) => root.join(target),
    }
}

/// Create the mount point for `target` under `root`, as a directory or an
/// empty file matching the kind of `source`.
fn prepare_mount_target(root: &Path, target: &Path, source: &Path) -> Result<()> {
    let target = in_root(root, target);
    if source.is_dir() {
        std::fs::create_dir_all(&target)
            .chain_err(|| format!("failed to create mount point {}", target.display()))?;
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .chain_err(|| format!("failed to create mount point {}", target.display()))?;
        }
        if !target.exists() {
            File::create(&target)
                .chain_err(|| format!("failed to create mount point {}", target.display()))?;
        }
    }

    Ok(())
}

fn pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    let new_root = CString::new(new_root.as_os_str().as_bytes())
        .map_err(|_| Error::from(ErrorKind::HelperFailed(String::from("bad root path"))))?;
    let put_old = CString::new(put_old.as_os_str().as_bytes())
        .map_err(|_| Error::from(ErrorKind::HelperFailed(String::from("bad pivot path"))))?;

    let ret = unsafe {
        libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr())
    };
    if ret != 0 {
        return Err(Error::from(std::io::Error::last_os_error()))
            .chain_err(|| "pivot_root failed");
    }

    Ok(())
}

/// Map an in-sandbox path to its host location through the bind mount table.
/// Only meaningful when namespaces are disabled and no pivot happened.
fn host_view(path: &Path, init: &InitRequest) -> PathBuf {
    let mut best: Option<(&Path, &Path)> = None;
    for bind in &init.spec.mounts {
        if path.starts_with(&bind.target) {
            let better = match best {
                Some((target, _)) => bind.target.as_os_str().len() > target.as_os_str().len(),
                None => true,
            };
            if better {
                best = Some((bind.target.as_path(), bind.source.as_path()));
            }
        }
    }

    match best {
        Some((target, source)) => {
            match path.strip_prefix(target) {
                Ok(rest) if rest.as_os_str().is_empty() => source.to_path_buf(),
                Ok(rest) => source.join(rest),
                Err(..) => path.to_path_buf(),
            }
        },
        None => path.to_path_buf(),
    }
}

/// Apply the per-process confinement and `exec` the task command. Runs in
/// the pivoted root when namespaces are enabled, and directly on the host
/// tree otherwise.
fn finish_exec(init: &InitRequest) -> Result<()> {
    let spec = &init.spec;
    if spec.cmd.is_empty() {
        return Err(Error::from(ErrorKind::HelperFailed(String::from("empty command"))));
    }

    let (work_dir, stdin_path) = if init.enable_namespaces {
        (spec.work_dir.clone(), spec.stdin_path.clone())
    } else {
        (host_view(&spec.work_dir, init),
         spec.stdin_path.as_ref().map(|p| host_view(p, init)))
    };

    apply_rlimits(&spec.limits)?;
    drop_privileges()?;

    let stdin_file = match &stdin_path {
        Some(path) => File::open(path)
            .chain_err(|| format!("failed to open stdin {}", path.display()))?,
        None => File::open("/dev/null")
            .chain_err(|| "failed to open /dev/null")?,
    };
    nix::unistd::dup2(stdin_file.into_raw_fd(), libc::STDIN_FILENO)?;

    let env_strings: Vec<String> = if spec.env.is_empty() {
        vec![String::from(DEFAULT_PATH)]
    } else {
        spec.env.clone()
    };
    for entry in &env_strings {
        if let Some(separator) = entry.find('=') {
            std::env::set_var(&entry[..separator], &entry[separator + 1..]);
        }
    }

    nix::unistd::chdir(work_dir.as_path())
        .chain_err(|| format!("failed to enter work dir {}", work_dir.display()))?;

    if init.enable_seccomp {
        seccomp::apply_allowlist(init.seccomp_allow.iter().map(String::as_str))?;
    }

    let resolved = misc::expand_path(&spec.cmd[0])
        .ok_or_else(|| Error::from(ErrorKind::HelperFailed(format!(
            "command not found: {}", spec.cmd[0]))))?;

    let native_file = CString::new(Vec::from(resolved.as_os_str().as_bytes()))
        .map_err(|_| Error::from(ErrorKind::HelperFailed(String::from("bad command path"))))?;
    let native_argv = spec.cmd.iter()
        .map(|arg| CString::new(arg.clone()))
        .collect::<std::result::Result<Vec<CString>, _>>()
        .map_err(|_| Error::from(ErrorKind::HelperFailed(String::from("bad argv"))))?;
    let native_envs = env_strings.iter()
        .map(|env| CString::new(env.clone()))
        .collect::<std::result::Result<Vec<CString>, _>>()
        .map_err(|_| Error::from(ErrorKind::HelperFailed(String::from("bad environment"))))?;

    nix::unistd::execve(&native_file, native_argv.as_ref(), native_envs.as_ref())?;
    unreachable!()
}

fn apply_rlimits(limits: &crate::ResourceLimit) -> Result<()> {
    const MIB: u64 = 1024 * 1024;
    const NOFILE: u64 = 1024;

    if limits.stack_mb > 0 {
        rlimits::setrlimit_hard(Resource::Stack, limits.stack_mb as u64 * MIB)
            .chain_err(|| "failed to set stack limit")?;
    }
    if limits.output_mb > 0 {
        rlimits::setrlimit_hard(Resource::FileSize, limits.output_mb as u64 * MIB)
            .chain_err(|| "failed to set output limit")?;
    }
    if limits.cpu_time_ms > 0 {
        let seconds = (limits.cpu_time_ms as u64 + 999) / 1000;
        rlimits::setrlimit_hard(Resource::CpuTime, seconds)
            .chain_err(|| "failed to set cpu limit")?;
    }
    rlimits::setrlimit_hard(Resource::OpenFiles, NOFILE)
        .chain_err(|| "failed to set open file limit")?;

    Ok(())
}

/// Set `no_new_privs` and drop the whole capability bounding set.
fn drop_privileges() -> Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(Error::from(std::io::Error::last_os_error()))
            .chain_err(|| "failed to set no_new_privs");
    }

    for capability in 0..=63 {
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, capability, 0, 0, 0) };
        if ret != 0 {
            let e = std::io::Error::last_os_error();
            // EINVAL marks the end of the capability range.
            if e.raw_os_error() == Some(libc::EINVAL) {
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BindMount, IsolationProfile, ResourceLimit, RunSpec};

    fn init_with_mounts(mounts: Vec<BindMount>) -> InitRequest {
        InitRequest {
            spec: RunSpec {
                submission_id: String::from("sub-1"),
                test_id: String::from("t1"),
                work_dir: PathBuf::from("/work"),
                cmd: vec![String::from("true")],
                env: Vec::new(),
                stdin_path: None,
                stdout_path: PathBuf::from("/tmp/out.log"),
                stderr_path: PathBuf::from("/tmp/err.log"),
                mounts,
                profile: String::from("cpp-run"),
                limits: ResourceLimit::default(),
            },
            profile: IsolationProfile {
                root_fs: PathBuf::from("/srv/rootfs"),
                seccomp_profile: String::from("default"),
                disable_network: true,
            },
            cgroup_path: None,
            enable_seccomp: false,
            enable_namespaces: false,
            seccomp_allow: Vec::new(),
        }
    }

    mod host_view {
        use super::*;

        #[test]
        fn maps_through_longest_mount() {
            let init = init_with_mounts(vec![
                BindMount::new("/host/work", "/work"),
                BindMount::read_only("/host/data/t1.in", "/work/t1.in"),
            ]);

            assert_eq!(PathBuf::from("/host/work"),
                host_view(Path::new("/work"), &init));
            assert_eq!(PathBuf::from("/host/work/output.txt"),
                host_view(Path::new("/work/output.txt"), &init));
            assert_eq!(PathBuf::from("/host/data/t1.in"),
                host_view(Path::new("/work/t1.in"), &init));
        }

        #[test]
        fn unmapped_path_passes_through() {
            let init = init_with_mounts(Vec::new());
            assert_eq!(PathBuf::from("/etc/passwd"),
                host_view(Path::new("/etc/passwd"), &init));
        }
    }

    mod in_root {
        use super::*;

        #[test]
        fn strips_leading_slash() {
            assert_eq!(PathBuf::from("/srv/rootfs/work"),
                in_root(Path::new("/srv/rootfs"), Path::new("/work")));
        }
    }
}
