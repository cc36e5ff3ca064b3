//! Per-job cgroup v2 resource isolation (spec §4.1).
//!
//! Creates a parent group under the cgroup v2 root and per-job child groups
//! beneath it, writing the literal resource caps the spec mandates. All
//! filesystem paths are relative to a configurable root so tests can point
//! this at a scratch directory instead of `/sys/fs/cgroup`.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::{Error, Result};

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const PARENT_GROUP_NAME: &str = "remote-job-challenge";

const CPU_LIMITS: &str = "200000 100000";
const MEM_LIMITS: &str = "1048576000";

/// A handle to a created cgroup directory. Removing it is the caller's
/// responsibility via [`CGroupManager::close`]; the kernel refuses removal
/// while the group still has member processes, which is the intended guard
/// against cleaning up a group that is still in use.
#[derive(Debug, Clone)]
pub struct CGroupHandle {
    pub path: PathBuf,
}

impl CGroupHandle {
    /// Absolute path to this group's `cgroup.procs` file, used to attach a
    /// child process to the group between fork and exec.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }
}

pub struct CGroupManager {
    root: PathBuf,
}

impl CGroupManager {
    pub fn new() -> Self {
        CGroupManager {
            root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }

    #[cfg(test)]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        CGroupManager { root: root.into() }
    }

    /// Verify the host exposes `cpu`, `memory`, and `io` in both
    /// `cgroup.controllers` and `cgroup.subtree_control` at the root.
    pub fn check_support(&self) -> Result<()> {
        let controllers = std::fs::read_to_string(self.root.join("cgroup.controllers"))
            .map_err(|e| Error::UnsupportedHost(format!("cgroup.controllers: {e}")))?;
        for want in ["cpu", "memory", "io"] {
            if !controllers.split_whitespace().any(|c| c == want) {
                return Err(Error::UnsupportedHost(format!(
                    "cgroup.controllers is missing {want}"
                )));
            }
        }

        let subtree = std::fs::read_to_string(self.root.join("cgroup.subtree_control"))
            .map_err(|e| Error::UnsupportedHost(format!("cgroup.subtree_control: {e}")))?;
        for want in ["cpu", "memory", "io"] {
            if !subtree.split_whitespace().any(|c| c == want) {
                return Err(Error::UnsupportedHost(format!(
                    "cgroup.subtree_control is missing {want}"
                )));
            }
        }

        Ok(())
    }

    /// Create the supervisor's parent group, delegating cpu/io/memory to its
    /// children but applying no limits of its own. Must run once, before any
    /// per-job `create_group` call, since `create_group` only makes the
    /// immediate directory and relies on its parent already existing.
    pub fn ensure_parent(&self) -> Result<()> {
        self.create_group(PARENT_GROUP_NAME, false).map(|_| ())
    }

    /// Create (idempotently) the group at `<root>/<name>`, delegate
    /// cpu/io/memory to its children, and optionally apply resource limits.
    pub fn create_group(&self, name: &str, limits: bool) -> Result<CGroupHandle> {
        let path = self.root.join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::internal(format!("mkdir {}: {e}", path.display()))),
        }
        let handle = CGroupHandle { path: path.clone() };

        if let Err(e) = std::fs::write(path.join("cgroup.subtree_control"), "+cpu +io +memory") {
            let _ = self.close(&handle);
            return Err(Error::internal(format!(
                "write cgroup.subtree_control for {}: {e}",
                path.display()
            )));
        }

        if !limits {
            return Ok(handle);
        }

        if let Err(e) = std::fs::write(path.join("cpu.max"), CPU_LIMITS) {
            let _ = self.close(&handle);
            return Err(Error::internal(format!("write cpu.max: {e}")));
        }
        if let Err(e) = std::fs::write(path.join("memory.max"), MEM_LIMITS) {
            let _ = self.close(&handle);
            return Err(Error::internal(format!("write memory.max: {e}")));
        }

        match read_partitions() {
            Ok(partitions) => {
                for (major, minor) in partitions {
                    let line = format!(
                        "{major}:{minor} rbps=1048576000 wbps=10485760 riops=1000000 wiops=1000000"
                    );
                    if let Err(e) = std::fs::write(path.join("io.max"), &line) {
                        // The kernel rejects a partition's entry once its parent
                        // device's entry is already present; this is expected
                        // and not fatal to group creation.
                        warn!(line = %line, error = %e, "skipping io.max entry for partition");
                    }
                }
            }
            Err(e) => {
                let _ = self.close(&handle);
                return Err(e);
            }
        }

        Ok(handle)
    }

    /// Remove the group's directory. Fails if member processes remain.
    pub fn close(&self, handle: &CGroupHandle) -> Result<()> {
        std::fs::remove_dir(&handle.path)
            .map_err(|e| Error::internal(format!("rmdir {}: {e}", handle.path.display())))?;
        debug!(path = %handle.path.display(), "cgroup directory removed");
        Ok(())
    }
}

impl Default for CGroupManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `/proc/partitions`, returning `(major, minor)` for each data line.
///
/// Header line and blank lines are skipped. Matches lines of the shape
/// `  <major> <minor> <blocks> <name>`.
fn read_partitions() -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string("/proc/partitions")
        .map_err(|e| Error::internal(format!("read /proc/partitions: {e}")))?;

    let mut partitions = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            continue;
        }
        let (major, minor, blocks, name) = (fields[0], fields[1], fields[2], fields[3]);
        if major.parse::<u32>().is_err() || minor.parse::<u32>().is_err() {
            continue; // header line: "major minor  #blocks  name"
        }
        if blocks.parse::<u64>().is_err() {
            continue;
        }
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            continue;
        }
        partitions.push((major.to_string(), minor.to_string()));
    }
    Ok(partitions)
}

/// Remove every `<root>/<name>` cgroup below `parent`, then `parent` itself.
/// Directories can only be removed once every member process has been
/// reaped, so this must run after all jobs have been stopped.
pub fn cleanup_parent(manager: &CGroupManager, job_paths: &[CGroupHandle]) -> Result<()> {
    for handle in job_paths {
        manager.close(handle)?;
    }
    manager.close(&CGroupHandle {
        path: manager.root.join(PARENT_GROUP_NAME),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_header_line_is_skipped() {
        let contents = "major minor  #blocks  name\n\n   8        0  488386584 sda\n";
        let parsed: Vec<(String, String)> = contents
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() != 4 {
                    return None;
                }
                if fields[0].parse::<u32>().is_err() || fields[1].parse::<u32>().is_err() {
                    return None;
                }
                Some((fields[0].to_string(), fields[1].to_string()))
            })
            .collect();
        assert_eq!(parsed, vec![("8".to_string(), "0".to_string())]);
    }

    #[test]
    fn create_and_close_group_without_limits() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CGroupManager::with_root(tmp.path());
        let handle = manager.create_group("job-a", false).unwrap();
        assert!(handle.path.is_dir());
        manager.close(&handle).unwrap();
        assert!(!handle.path.exists());
    }

    #[test]
    fn ensure_parent_then_nested_job_group_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CGroupManager::with_root(tmp.path());
        manager.ensure_parent().unwrap();
        let handle = manager
            .create_group(&format!("{PARENT_GROUP_NAME}/job-x"), true)
            .unwrap();
        assert!(handle.path.is_dir());
    }

    #[test]
    fn create_group_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CGroupManager::with_root(tmp.path());
        let first = manager.create_group("job-b", false).unwrap();
        let second = manager.create_group("job-b", false).unwrap();
        assert_eq!(first.path, second.path);
        manager.close(&second).unwrap();
    }

    #[test]
    fn close_fails_while_nonempty() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CGroupManager::with_root(tmp.path());
        let handle = manager.create_group("job-c", false).unwrap();
        std::fs::create_dir(handle.path.join("nested")).unwrap();
        assert!(manager.close(&handle).is_err());
    }

    #[test]
    fn check_support_reports_missing_controllers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("cgroup.controllers"), "cpu memory\n").unwrap();
        std::fs::write(tmp.path().join("cgroup.subtree_control"), "cpu memory io\n").unwrap();
        let manager = CGroupManager::with_root(tmp.path());
        assert!(manager.check_support().is_err());
    }

    #[test]
    fn check_support_passes_with_all_controllers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("cgroup.controllers"), "cpu io memory\n").unwrap();
        std::fs::write(tmp.path().join("cgroup.subtree_control"), "cpu io memory\n").unwrap();
        let manager = CGroupManager::with_root(tmp.path());
        manager.check_support().unwrap();
    }
}
