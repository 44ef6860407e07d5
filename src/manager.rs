/// Agent process lifecycle: start, stop and status of the local agent.
///
/// This is a best-effort supervisor. Double starts and double stops are logged and
/// returned as outcomes; only a log directory that cannot be created (or an agent
/// that cannot be launched at all) aborts an operation.
use crate::config::AgentConfig;
use crate::config_dir::ConfigDir;
use crate::ports::{PortAllocator, PortError};
use crate::process::{self, TerminateOutcome};
use crate::state::{AgentState, AgentStatus, StateError, StateFile};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// How to invoke the agent executable.
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub debug: bool,
    /// Forwarded as `--config-dir` so the agent reads the same config.
    pub config_dir: Option<PathBuf>,
}

impl AgentLaunch {
    pub fn from_config(config: &AgentConfig, dir: &ConfigDir) -> Result<Self, ManagerError> {
        let executable = match &config.agent.executable {
            Some(exe) => exe.clone(),
            None => std::env::current_exe().map_err(|e| ManagerError::Executable { source: e })?,
        };
        Ok(Self {
            executable,
            args: config.agent.args.clone(),
            debug: config.agent.debug,
            config_dir: Some(dir.root().to_path_buf()),
        })
    }

    /// Full argument list for one run.
    fn build_args(&self, log_path: &str, heartbeat_port: u16, activity_port: u16) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(dir) = &self.config_dir {
            args.push("--config-dir".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.push("--log-path".to_string());
        args.push(log_path.to_string());
        if self.debug {
            args.push("--debug".to_string());
        }
        args.push("--heartbeat-port".to_string());
        args.push(heartbeat_port.to_string());
        args.push("--activity-port".to_string());
        args.push(activity_port.to_string());
        args
    }
}

/// Result of `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(AgentState),
    /// The record already says RUNNING; nothing was spawned or written.
    AlreadyRunning(AgentState),
}

/// Result of `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NeverStarted,
    NotRunning(AgentStatus),
    Stopped(Option<TerminateOutcome>),
    Unreadable,
}

/// Result of `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatusReport {
    NeverStarted,
    Recorded(AgentState),
    Unreadable,
}

pub struct AgentProcessManager {
    state_file: StateFile,
    log_dir: PathBuf,
    launch: AgentLaunch,
    ports: PortAllocator,
}

impl AgentProcessManager {
    pub fn new(
        state_file: StateFile,
        log_dir: PathBuf,
        launch: AgentLaunch,
        ports: PortAllocator,
    ) -> Self {
        Self {
            state_file,
            log_dir,
            launch,
            ports,
        }
    }

    pub fn from_config(config: &AgentConfig, dir: &ConfigDir) -> Result<Self, ManagerError> {
        Ok(Self::new(
            StateFile::new(dir.state_file(config)),
            dir.log_dir(config),
            AgentLaunch::from_config(config, dir)?,
            PortAllocator::from_config(&config.ports),
        ))
    }

    /// Launch the agent unless the record already says it is running.
    ///
    /// The recorded pid is not probed: an agent that crashed without `stop`
    /// still counts as running until `stop` is called.
    pub fn start(&self) -> Result<StartOutcome, ManagerError> {
        match self.state_file.load() {
            Ok(Some(state)) if state.is_running() => {
                tracing::warn!(
                    pid = ?state.pid,
                    log_path = %state.log_path,
                    "agent is already running, use stop first"
                );
                return Ok(StartOutcome::AlreadyRunning(state));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "unreadable agent state, it will be replaced");
            }
        }

        std::fs::create_dir_all(&self.log_dir).map_err(|e| {
            tracing::error!(
                log_dir = %self.log_dir.display(),
                error = %e,
                "cannot create log directory, aborting start"
            );
            ManagerError::LogDir {
                path: self.log_dir.clone(),
                source: e,
            }
        })?;

        let log_path = uuid::Uuid::new_v4().to_string();
        let (heartbeat_port, activity_port) = self.ports.allocate_pair()?;
        let args = self
            .launch
            .build_args(&log_path, heartbeat_port, activity_port);

        tracing::info!(
            executable = %self.launch.executable.display(),
            args = ?args,
            "spawning agent"
        );

        let child = Command::new(&self.launch.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0) // Detach from the operator's terminal signals
            .spawn()
            .map_err(|e| ManagerError::Spawn {
                executable: self.launch.executable.clone(),
                source: e,
            })?;

        let state = AgentState::running(child.id(), log_path, heartbeat_port, activity_port);
        self.state_file.save(&state)?;

        tracing::info!(
            pid = child.id(),
            heartbeat_port,
            activity_port,
            log_path = %state.log_path,
            state_file = %self.state_file.path().display(),
            "agent started"
        );
        Ok(StartOutcome::Started(state))
    }

    /// Kill the recorded agent and mark the record STOPPED.
    ///
    /// The record is rewritten even when the process was already gone.
    pub fn stop(&self) -> StopOutcome {
        let state = match self.state_file.load() {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::info!("agent does not exist, nothing to stop");
                return StopOutcome::NeverStarted;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read agent state, nothing stopped");
                return StopOutcome::Unreadable;
            }
        };

        if !state.is_running() {
            tracing::info!(status = %state.status, "agent is not running");
            return StopOutcome::NotRunning(state.status);
        }

        let outcome = match state.pid {
            Some(pid) => match process::terminate(pid) {
                Ok(outcome) => {
                    tracing::info!(pid, %outcome, "agent process killed");
                    Some(outcome)
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to kill agent process");
                    None
                }
            },
            None => {
                tracing::warn!("running record has no pid");
                None
            }
        };

        if let Err(e) = self.state_file.save(&state.into_stopped()) {
            tracing::warn!(error = %e, "failed to record stopped agent state");
        }
        StopOutcome::Stopped(outcome)
    }

    /// Report the recorded status without touching the record or the process.
    pub fn status(&self) -> AgentStatusReport {
        match self.state_file.load() {
            Ok(Some(state)) => {
                tracing::info!(
                    status = %state.status,
                    pid = ?state.pid,
                    heartbeat_port = ?state.heartbeat_port,
                    activity_port = ?state.activity_port,
                    "agent status"
                );
                AgentStatusReport::Recorded(state)
            }
            Ok(None) => {
                tracing::info!("agent does not exist, use start");
                AgentStatusReport::NeverStarted
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read agent state");
                AgentStatusReport::Unreadable
            }
        }
    }
}

/// Errors that abort `start`.
#[derive(Debug)]
pub enum ManagerError {
    Executable {
        source: std::io::Error,
    },
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Ports(PortError),
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },
    State(StateError),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::Executable { source } => {
                write!(f, "cannot determine agent executable: {source}")
            }
            ManagerError::LogDir { path, source } => {
                write!(
                    f,
                    "failed to create log directory {}: {source}",
                    path.display()
                )
            }
            ManagerError::Ports(e) => write!(f, "port allocation failed: {e}"),
            ManagerError::Spawn { executable, source } => {
                write!(
                    f,
                    "failed to spawn agent {}: {source}",
                    executable.display()
                )
            }
            ManagerError::State(e) => write!(f, "failed to record agent state: {e}"),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManagerError::Executable { source } => Some(source),
            ManagerError::LogDir { source, .. } => Some(source),
            ManagerError::Ports(e) => Some(e),
            ManagerError::Spawn { source, .. } => Some(source),
            ManagerError::State(e) => Some(e),
        }
    }
}

impl From<PortError> for ManagerError {
    fn from(e: PortError) -> Self {
        ManagerError::Ports(e)
    }
}

impl From<StateError> for ManagerError {
    fn from(e: StateError) -> Self {
        ManagerError::State(e)
    }
}
