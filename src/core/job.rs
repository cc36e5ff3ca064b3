//! A single job's envelope (spec §4.3): identity, output stream, cgroup
//! handle, process handle, and lifecycle phase.

use std::sync::{Arc, Condvar, Mutex};

use super::cgroup::{CGroupHandle, CGroupManager, PARENT_GROUP_NAME};
use super::error::Result;
use super::ids::new_job_id;
use super::output_stream::OutputStream;

/// Where a job currently sits in the state machine of spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Terminated { exit_code: i32, forced: bool },
}

/// The outcome the reaper records once `waitpid` returns. Stored separately
/// from `Phase` because `Stop` blocks on the condvar beside it rather than
/// polling the phase mutex.
#[derive(Debug, Clone, Copy)]
pub struct TerminalState {
    pub exit_code: i32,
    pub forced: bool,
}

pub struct RemoteJob {
    pub id: String,
    pub output: Arc<OutputStream>,
    pub cgroup: Option<CGroupHandle>,
    /// Set once `JobSupervisor::start` spawns the child; ownership of the
    /// `Child` itself moves into the reaper thread, so only the pid lives
    /// here for liveness probes and signal delivery.
    pub pid: Mutex<Option<u32>>,
    pub phase: Mutex<Phase>,
    /// Set exactly once, by the reaper, after `waitpid` returns. `Stop`
    /// waits on the condvar instead of calling `wait` itself, since a
    /// `std::process::Child` must only ever be waited on from one place.
    pub termination: Arc<(Mutex<Option<TerminalState>>, Condvar)>,
}

impl RemoteJob {
    /// Allocate a job id and output stream, and — when `cgroups` is given —
    /// create its per-job cgroup. Does not spawn a process.
    pub fn new(cgroups: Option<&CGroupManager>) -> Result<Self> {
        let id = new_job_id();
        let cgroup = match cgroups {
            Some(manager) => Some(manager.create_group(
                &format!("{PARENT_GROUP_NAME}/{id}"),
                true,
            )?),
            None => None,
        };

        Ok(RemoteJob {
            id,
            output: Arc::new(OutputStream::new()),
            cgroup,
            pid: Mutex::new(None),
            phase: Mutex::new(Phase::Starting),
            termination: Arc::new((Mutex::new(None), Condvar::new())),
        })
    }

    /// True iff a pid has been recorded, the OS confirms it is alive, and
    /// the output stream has not been closed by the reaper.
    pub fn is_running(&self) -> bool {
        if self.output.is_closed() {
            return false;
        }
        match *self.pid.lock().expect("job lock poisoned") {
            Some(pid) => pid_is_alive(pid),
            None => false,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().expect("job lock poisoned")
    }

    pub fn terminal_state(&self) -> Option<TerminalState> {
        *self.termination.0.lock().expect("termination lock poisoned")
    }
}

/// Probe liveness of a known pid by sending signal 0 (spec §4.3, §9): the
/// kernel validates permissions and existence without actually signalling.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM: process exists but we lack permission to signal it — still alive.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_job_without_cgroups_starts_in_starting_phase() {
        let job = RemoteJob::new(None).unwrap();
        assert_eq!(job.phase(), Phase::Starting);
        assert!(job.cgroup.is_none());
        assert!(!job.is_running());
    }

    #[test]
    fn job_ids_are_unique_across_instances() {
        let a = RemoteJob::new(None).unwrap();
        let b = RemoteJob::new(None).unwrap();
        assert_ne!(a.id, b.id);
    }
}
