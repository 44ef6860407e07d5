/// Forced termination of the agent process.
///
/// SIGKILL cannot be caught, so the agent gets no chance to delay shutdown.
/// The races around a process that is already dead or already reaped are
/// ordinary outcomes here, not errors.
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

/// How a termination request played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Signal delivered and the child reaped by us.
    Terminated,
    /// No process with that pid exists anymore.
    AlreadyGone,
    /// Signal delivered, but the process is not ours to reap or was reaped elsewhere.
    AlreadyReaped,
}

impl std::fmt::Display for TerminateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateOutcome::Terminated => write!(f, "terminated"),
            TerminateOutcome::AlreadyGone => write!(f, "already gone"),
            TerminateOutcome::AlreadyReaped => write!(f, "already reaped"),
        }
    }
}

/// Send SIGKILL to `pid` and try to reap it.
pub fn terminate(pid: u32) -> Result<TerminateOutcome, ProcessError> {
    // 0 and anything above i32::MAX would address process groups, not a process.
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(ProcessError::InvalidPid(pid)),
    };
    let target = Pid::from_raw(raw);

    match signal::kill(target, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "no such process");
            return Ok(TerminateOutcome::AlreadyGone);
        }
        Err(e) => return Err(ProcessError::Signal { pid, source: e }),
    }

    loop {
        match waitpid(target, None) {
            Ok(status) => {
                tracing::debug!(pid, ?status, "reaped agent process");
                return Ok(TerminateOutcome::Terminated);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(TerminateOutcome::AlreadyReaped),
            Err(e) => return Err(ProcessError::Reap { pid, source: e }),
        }
    }
}

/// Errors from process termination other than the tolerated races.
#[derive(Debug)]
pub enum ProcessError {
    InvalidPid(u32),
    Signal { pid: u32, source: Errno },
    Reap { pid: u32, source: Errno },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::InvalidPid(pid) => write!(f, "refusing to signal invalid pid {pid}"),
            ProcessError::Signal { pid, source } => {
                write!(f, "failed to send SIGKILL to pid {pid}: {source}")
            }
            ProcessError::Reap { pid, source } => {
                write!(f, "failed to reap pid {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::InvalidPid(_) => None,
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::Reap { source, .. } => Some(source),
        }
    }
}
