// SPDX-License-Identifier: MIT

//! Launch the child process, and track it until it is reaped.

use std::{
    os::unix::process::CommandExt as _,
    process::{Command, Stdio},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, kill},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};

use crate::runtime::{
    error::SandboxError,
    spawn::{ExitReport, LaunchEnv},
    spawn_linux::fd::ForkedFd,
};

/// Handle the child process launching.
pub fn launch_child(env: LaunchEnv) -> Result<ChildProcess, SandboxError> {
    // Everything that allocates happens here, before the fork.  The closure
    // run in the child only touches the pre-computed descriptor table.
    let exec_path = which::which(&env.cmd)?;
    let mut cmd = Command::new(&exec_path);
    cmd.arg0(&env.cmd).args(&env.args).stdin(Stdio::null());
    if let Some(vars) = &env.env {
        cmd.env_clear();
        cmd.envs(vars.iter().map(|(k, v)| (k, v)));
    }

    let mut fds = ForkedFd::new(env.fds);
    unsafe {
        cmd.pre_exec(move || fds.child_after_fork());
    }
    let child = cmd.spawn()?;
    let pid = i32::try_from(child.id())
        .map_err(|e| SandboxError::ProcessError(format!("pid out of range: {e}")))?;

    // Dropping the command closes the parent's copies of the inherited
    // descriptors; the child owns them now.
    drop(cmd);
    Ok(ChildProcess::new(Pid::from_raw(pid)))
}

/// Structure that allows killing and reaping a launched child process.
///
/// Clones share the reaping state.  Only one clone at a time blocks in
/// `waitpid`; the others wait for its report.
#[derive(Clone, Debug)]
pub struct ChildProcess {
    pid: Pid,
    exit: Arc<(Mutex<Reaping>, Condvar)>,
}

#[derive(Debug, Default)]
struct Reaping {
    report: Option<ExitReport>,
    // A clone is blocked in `waitpid`.
    reaper: bool,
}

impl ChildProcess {
    pub(crate) fn new(pid: Pid) -> Self {
        ChildProcess {
            pid,
            exit: Arc::new((Mutex::new(Reaping::default()), Condvar::new())),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// The exit status, if the child has been reaped.  Does not block.
    pub fn exit_status(&self) -> Option<ExitReport> {
        let mut state = self.state();
        if state.report.is_some() || state.reaper {
            return state.report;
        }
        // The lock is held, so no waiter can start reaping meanwhile.
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                state.report = to_report(status);
                state.report
            }
            Err(_) => None,
        }
    }

    /// Send SIGKILL.  The child is not reaped; call [`ChildProcess::wait`].
    pub fn kill(&self) -> Result<(), SandboxError> {
        if self.state().report.is_some() {
            // Already reaped; the pid may belong to someone else by now.
            return Ok(());
        }
        kill(self.pid, Signal::SIGKILL).map_err(|e| {
            SandboxError::ProcessError(format!("failed terminating child {}: {e}", self.pid))
        })
    }

    /// Block until the child exits, and reap it.
    pub fn wait(&self) -> Result<ExitReport, SandboxError> {
        let (_, changed) = &*self.exit;
        let mut state = self.state();
        loop {
            if let Some(report) = state.report {
                return Ok(report);
            }
            if !state.reaper {
                break;
            }
            state = changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.reaper = true;
        drop(state);

        let reaped = self.reap();
        let mut state = self.state();
        state.reaper = false;
        if let Ok(report) = reaped {
            state.report = Some(report);
        }
        changed.notify_all();
        reaped
    }

    fn reap(&self) -> Result<ExitReport, SandboxError> {
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(status) => {
                    if let Some(report) = to_report(status) {
                        return Ok(report);
                    }
                    // Stopped or continued; keep waiting for the real exit.
                }
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, Reaping> {
        self.exit.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_report(status: WaitStatus) -> Option<ExitReport> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitReport::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ExitReport::Signaled(sig as i32)),
        _ => None,
    }
}
