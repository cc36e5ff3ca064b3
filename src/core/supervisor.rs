//! Ties the cgroup manager, output streams, jobs, and authorizer together
//! into the four operations the RPC layer exposes (spec §4.4): `start`,
//! `stop`, `status`, and `tail`.
//!
//! Each job gets a background reaper thread that owns the `Child` and is the
//! only thread that ever calls `wait` on it. `stop` never calls `wait`
//! itself; it arms a kill timer and blocks on the job's termination condvar,
//! which the reaper signals once `waitpid` returns. This keeps "who reaps
//! the process" unambiguous no matter how many callers race to stop a job.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cgroup::CGroupManager;
use super::error::{Error, Result};
use super::job::{Phase, RemoteJob, TerminalState};
use super::output_stream::Sink;

/// The kill timer spec §4.4 describes: how long `stop` waits for a
/// cooperative exit before escalating to `SIGKILL`.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// How long `start` waits before reporting back, to distinguish a process
/// that is actually running from one that exited the instant it was execed.
const START_SETTLE_PERIOD: Duration = Duration::from_millis(100);

/// What `start` reports about a newly spawned job (spec §6's `JobStartStatus`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { job_id: String, running: bool },
    CommandNotFound,
}

pub struct JobSupervisor {
    cgroups: Option<CGroupManager>,
    registry: RwLock<HashMap<String, Arc<RemoteJob>>>,
}

impl JobSupervisor {
    pub fn new(cgroups: Option<CGroupManager>) -> Self {
        JobSupervisor {
            cgroups,
            registry: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, id: &str) -> Result<Arc<RemoteJob>> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Spawn `command` under its own cgroup (if enabled), stream its combined
    /// stdout/stderr into its output stream, and register it. Returns
    /// [`StartOutcome::CommandNotFound`] rather than an error when the
    /// executable itself cannot be found, matching the wire contract: a
    /// missing binary is a normal, successful response.
    pub fn start(&self, command: Vec<String>) -> Result<StartOutcome> {
        if command.is_empty() || command[0].is_empty() {
            return Err(Error::InvalidArgument);
        }

        let job = Arc::new(RemoteJob::new(self.cgroups.as_ref())?);
        if self
            .registry
            .read()
            .expect("registry lock poisoned")
            .contains_key(&job.id)
        {
            return Err(Error::DuplicateIdentifier);
        }

        let mut cmd = std::process::Command::new(&command[0]);
        cmd.args(&command[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(handle) = &job.cgroup {
            let procs_path = handle.procs_path();
            // SAFETY: only async-signal-safe calls between fork and exec.
            // Writing our own pid to the cgroup's `cgroup.procs` file is a
            // single `write(2)`.
            unsafe {
                cmd.pre_exec(move || {
                    std::fs::write(&procs_path, std::process::id().to_string())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(command = %command[0], "executable not found");
                if let Some(handle) = &job.cgroup {
                    if let Some(manager) = &self.cgroups {
                        let _ = manager.close(handle);
                    }
                }
                return Ok(StartOutcome::CommandNotFound);
            }
            Err(e) => return Err(Error::internal(format!("spawn {}: {e}", command[0]))),
        };

        let pid = child.id();
        *job.pid.lock().expect("job lock poisoned") = Some(pid);
        *job.phase.lock().expect("job lock poisoned") = Phase::Running;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let out_for_stdout = job.output.clone();
        let out_for_stderr = job.output.clone();
        let stdout_thread = std::thread::spawn(move || stream_into(stdout, &out_for_stdout));
        let stderr_thread = std::thread::spawn(move || stream_into(stderr, &out_for_stderr));

        let reaper_job = job.clone();
        std::thread::spawn(move || {
            let status = child.wait();
            let _ = stdout_thread.join();
            let _ = stderr_thread.join();

            let state = match status {
                Ok(status) => exit_state(status),
                Err(e) => {
                    warn!(job_id = %reaper_job.id, error = %e, "wait failed");
                    TerminalState { exit_code: -1, forced: true }
                }
            };
            *reaper_job.phase.lock().expect("job lock poisoned") = Phase::Terminated {
                exit_code: state.exit_code,
                forced: state.forced,
            };
            {
                let (lock, cvar) = &*reaper_job.termination;
                *lock.lock().expect("termination lock poisoned") = Some(state);
                cvar.notify_all();
            }
            reaper_job.output.close();
            info!(job_id = %reaper_job.id, exit_code = state.exit_code, forced = state.forced, "job terminated");
        });

        // Give an instantly-failing process a chance to be observed as such
        // before we report back, per spec §4.4's exec-failure distinction.
        std::thread::sleep(START_SETTLE_PERIOD);
        let running = job.is_running();

        self.registry
            .write()
            .expect("registry lock poisoned")
            .insert(job.id.clone(), job.clone());

        Ok(StartOutcome::Started { job_id: job.id.clone(), running })
    }

    /// Stop a job, waiting at most [`STOP_GRACE_PERIOD`] for a cooperative
    /// exit before sending `SIGKILL`. Idempotent: a job already terminated
    /// (by itself or a prior `stop`) returns its recorded exit state with no
    /// further signalling.
    pub fn stop(&self, id: &str) -> Result<(i32, bool)> {
        let job = self.lookup(id)?;

        if let Some(state) = job.terminal_state() {
            return Ok((state.exit_code, state.forced));
        }

        if let Some(pid) = *job.pid.lock().expect("job lock poisoned") {
            let termination = job.termination.clone();
            std::thread::spawn(move || {
                std::thread::sleep(STOP_GRACE_PERIOD);
                let guard = termination.0.lock().expect("termination lock poisoned");
                if guard.is_none() {
                    drop(guard);
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            });
        }

        let (lock, cvar) = &*job.termination;
        let mut guard = lock.lock().expect("termination lock poisoned");
        while guard.is_none() {
            guard = cvar.wait(guard).expect("termination lock poisoned");
        }
        let state = guard.expect("loop only exits once set");
        Ok((state.exit_code, state.forced))
    }

    /// `(running, terminal state if any)` for a job. Liveness is a
    /// best-effort snapshot, not a synchronization point (spec §9).
    pub fn status(&self, id: &str) -> Result<(bool, Option<(i32, bool)>)> {
        let job = self.lookup(id)?;
        let terminal = job.terminal_state().map(|s| (s.exit_code, s.forced));
        Ok((job.is_running(), terminal))
    }

    /// Atomically back-fill `sink` with everything written so far and
    /// install it as a live subscriber, then block until the job is no
    /// longer running.
    pub fn tail(&self, id: &str, sink: Box<dyn Sink>) -> Result<()> {
        let job = self.lookup(id)?;
        job.output.attach_with_backfill(sink);

        while job.is_running() {
            std::thread::sleep(Duration::from_secs(1));
        }
        Ok(())
    }

    /// Force-kill every job still running, then tear down every per-job
    /// cgroup and the parent group. Intended for graceful server shutdown.
    pub fn cleanup(&self) {
        let jobs: Vec<Arc<RemoteJob>> = self
            .registry
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();

        for job in &jobs {
            if job.terminal_state().is_none() {
                if let Err(e) = self.stop(&job.id) {
                    warn!(job_id = %job.id, error = %e, "stop during cleanup failed");
                }
            }
        }

        if let Some(manager) = &self.cgroups {
            let handles: Vec<_> = jobs.iter().filter_map(|j| j.cgroup.clone()).collect();
            if let Err(e) = super::cgroup::cleanup_parent(manager, &handles) {
                warn!(error = %e, "cgroup cleanup failed");
            }
        }
    }
}

/// Mirrors `os.ProcessState.ExitCode()`: -1 when the process was killed by a
/// signal rather than exiting on its own (spec §4.4, §8 scenario 2).
fn exit_state(status: std::process::ExitStatus) -> TerminalState {
    match status.code() {
        Some(code) => TerminalState { exit_code: code, forced: false },
        None => TerminalState { exit_code: -1, forced: true },
    }
}

fn stream_into(mut reader: impl Read, output: &super::output_stream::OutputStream) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                output.write(&buf[..n]);
            }
            Err(e) => {
                debug!(error = %e, "output reader failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink(Arc<StdMutex<Vec<u8>>>);

    impl Sink for CollectingSink {
        fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }
    }

    #[test]
    fn start_rejects_empty_command() {
        let sup = JobSupervisor::new(None);
        assert!(matches!(sup.start(vec![]), Err(Error::InvalidArgument)));
    }

    #[test]
    fn start_reports_command_not_found_for_missing_executable() {
        let sup = JobSupervisor::new(None);
        let outcome = sup.start(vec!["this-binary-does-not-exist-anywhere".into()]).unwrap();
        assert_eq!(outcome, StartOutcome::CommandNotFound);
    }

    #[test]
    fn start_runs_a_long_lived_process_and_reports_it_running() {
        let sup = JobSupervisor::new(None);
        let outcome = sup
            .start(vec!["sleep".into(), "5".into()])
            .unwrap();
        match outcome {
            StartOutcome::Started { job_id, running } => {
                assert!(running);
                let (still_running, terminal) = sup.status(&job_id).unwrap();
                assert!(still_running);
                assert!(terminal.is_none());
                let (exit_code, forced) = sup.stop(&job_id).unwrap();
                assert!(forced);
                assert_eq!(exit_code, -1);
            }
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[test]
    fn start_reports_instant_exit_as_not_running() {
        let sup = JobSupervisor::new(None);
        let outcome = sup.start(vec!["true".into()]).unwrap();
        match outcome {
            StartOutcome::Started { job_id, running } => {
                assert!(!running);
                std::thread::sleep(Duration::from_millis(50));
                let (still_running, terminal) = sup.status(&job_id).unwrap();
                assert!(!still_running);
                let (exit_code, forced) = terminal.unwrap();
                assert_eq!(exit_code, 0);
                assert!(!forced);
            }
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[test]
    fn stop_is_idempotent_after_natural_exit() {
        let sup = JobSupervisor::new(None);
        let outcome = sup.start(vec!["true".into()]).unwrap();
        let job_id = match outcome {
            StartOutcome::Started { job_id, .. } => job_id,
            other => panic!("expected Started, got {other:?}"),
        };
        let first = sup.stop(&job_id).unwrap();
        let second = sup.stop(&job_id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.0, 0);
        assert!(!first.1);
    }

    #[test]
    fn stop_on_unknown_job_is_not_found() {
        let sup = JobSupervisor::new(None);
        assert!(matches!(sup.stop("no-such-job"), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn status_on_unknown_job_is_not_found() {
        let sup = JobSupervisor::new(None);
        assert!(matches!(sup.status("no-such-job"), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn tail_backfills_then_streams_live_output() {
        let sup = JobSupervisor::new(None);
        let outcome = sup
            .start(vec!["sh".into(), "-c".into(), "echo one; sleep 0.2; echo two".into()])
            .unwrap();
        let job_id = match outcome {
            StartOutcome::Started { job_id, .. } => job_id,
            other => panic!("expected Started, got {other:?}"),
        };

        std::thread::sleep(Duration::from_millis(50));
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(CollectingSink(received.clone()));
        sup.tail(&job_id, sink).unwrap();

        let text = String::from_utf8(received.lock().unwrap().clone()).unwrap();
        assert!(text.contains("one"));
        assert!(text.contains("two"));
    }
}
