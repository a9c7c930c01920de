//! This module manages the per-run cgroup v2 directories that confine and
//! account sandboxed tasks.
//!

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, ErrorKind, Result, ResourceLimit, ResultExt};

/// Check that the given path is the root of a mounted cgroup v2 hierarchy.
pub fn ensure_v2<P>(root: P) -> Result<()>
    where P: AsRef<Path> {
    let controllers = root.as_ref().join("cgroup.controllers");
    if controllers.exists() {
        Ok(())
    } else {
        Err(Error::from(ErrorKind::EngineConfig(format!(
            "cgroup v2 is not mounted at {}", root.as_ref().display()))))
    }
}

/// A fresh cgroup v2 directory owned by one sandboxed run.
#[derive(Debug)]
pub struct CgroupDir {
    path: PathBuf,
}

impl CgroupDir {
    /// Create `{root}/{submission_id}/{test_id}-{nanos}` and return a handle
    /// to it. The nanosecond suffix keeps re-runs of the same test apart.
    pub fn create<P>(root: P, submission_id: &str, test_id: &str) -> Result<CgroupDir>
        where P: AsRef<Path> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = root.as_ref()
            .join(submission_id)
            .join(format!("{}-{}", test_id, nanos));

        std::fs::create_dir_all(&path)
            .chain_err(|| format!("failed to create cgroup {}", path.display()))?;

        Ok(CgroupDir { path })
    }

    /// Re-open an existing cgroup directory.
    pub fn open<P>(path: P) -> CgroupDir
        where P: Into<PathBuf> {
        CgroupDir { path: path.into() }
    }

    /// Path of this cgroup directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the resource caps into the cgroup control files. Fields that are
    /// zero leave the inherited kernel defaults untouched, except `pids.max`
    /// which is reset to `max`.
    pub fn apply_limits(&self, limits: &ResourceLimit) -> Result<()> {
        let pids = if limits.pids > 0 {
            limits.pids.to_string()
        } else {
            String::from("max")
        };
        self.write_control("pids.max", &pids)?;

        if limits.memory_mb > 0 {
            let bytes = limits.memory_mb * 1024 * 1024;
            self.write_control("memory.max", &bytes.to_string())?;
            // Without swap confinement the memory cap is trivially evaded.
            let _ = std::fs::write(self.path.join("memory.swap.max"), "0");
        }

        self.write_control("cpu.max", "max 100000")?;

        Ok(())
    }

    fn write_control(&self, name: &str, value: &str) -> Result<()> {
        let path = self.path.join(name);
        std::fs::write(&path, value)
            .chain_err(|| format!("failed to write {} = {}", path.display(), value))
    }

    fn read_control(&self, name: &str) -> Result<String> {
        let path = self.path.join(name);
        std::fs::read_to_string(&path)
            .chain_err(|| format!("failed to read {}", path.display()))
    }

    /// CPU time consumed by every task that ever ran in this cgroup, in
    /// milliseconds, from `cpu.stat::usage_usec`.
    pub fn cpu_usage_ms(&self) -> Result<i64> {
        let stat = self.read_control("cpu.stat")?;
        for line in stat.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("usage_usec") {
                if let Some(value) = fields.next() {
                    let usec: i64 = value.parse().unwrap_or(0);
                    return Ok(usec / 1000);
                }
            }
        }

        Ok(0)
    }

    /// Peak memory usage in kilobytes from `memory.peak`, or `None` on
    /// kernels that do not expose the file.
    pub fn memory_peak_kb(&self) -> Option<i64> {
        let raw = std::fs::read_to_string(self.path.join("memory.peak")).ok()?;
        let bytes: i64 = raw.trim().parse().ok()?;
        Some(bytes / 1024)
    }

    /// Whether the kernel OOM killer fired in this cgroup, from
    /// `memory.events::oom_kill`.
    pub fn oom_killed(&self) -> bool {
        let events = match std::fs::read_to_string(self.path.join("memory.events")) {
            Ok(events) => events,
            Err(..) => return false,
        };
        for line in events.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("oom_kill") {
                return fields.next()
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(|count| count > 0)
                    .unwrap_or(false);
            }
        }

        false
    }

    /// Kill every task in this cgroup by writing `1` to `cgroup.kill`.
    /// Idempotent; killing an already empty cgroup succeeds.
    pub fn kill(&self) -> std::io::Result<()> {
        std::fs::write(self.path.join("cgroup.kill"), "1")
    }

    /// Remove the cgroup directory, retrying briefly while the kernel still
    /// reports it populated. The parent submission directory is removed too
    /// once it becomes empty.
    pub fn remove(&self) -> Result<()> {
        const ATTEMPTS: u32 = 50;
        const RETRY_INTERVAL: Duration = Duration::from_millis(10);

        let mut last_err = None;
        for attempt in 0..ATTEMPTS {
            match std::fs::remove_dir(&self.path) {
                Ok(..) => {
                    if let Some(parent) = self.path.parent() {
                        let _ = std::fs::remove_dir(parent);
                    }
                    return Ok(());
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    if attempt + 1 < ATTEMPTS {
                        let _ = self.kill();
                        std::thread::sleep(RETRY_INTERVAL);
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(Error::from(last_err.unwrap()))
            .chain_err(|| format!("failed to remove cgroup {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_v2_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_v2(dir.path()).is_err());
    }

    #[test]
    fn ensure_v2_accepts_hierarchy_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory pids").unwrap();
        assert!(ensure_v2(dir.path()).is_ok());
    }

    #[test]
    fn create_builds_nested_unique_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = CgroupDir::create(dir.path(), "sub-1", "t1").unwrap();
        let b = CgroupDir::create(dir.path(), "sub-1", "t1").unwrap();

        assert!(a.path().starts_with(dir.path().join("sub-1")));
        assert!(a.path().file_name().unwrap().to_str().unwrap().starts_with("t1-"));
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cg = CgroupDir::create(dir.path(), "sub-2", "t1").unwrap();

        assert!(cg.remove().is_ok());
        assert!(cg.remove().is_ok());
        assert!(!cg.path().exists());
    }
}
