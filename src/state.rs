/// Persisted agent state: the on-disk record of the agent running on this host.
///
/// Written as a flat TOML document. Every write replaces the whole file
/// (temp file then rename), so readers never observe a half-updated record.
/// A missing file means "never started", which is distinct from `STOPPED`.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle status recorded in the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Initialized,
    Running,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Initialized => "INITIALIZED",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// One agent instance's identity and health.
///
/// When `status` is `Running`, `pid` and both ports are set. Otherwise they are cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_port: Option<u16>,
    pub status: AgentStatus,
}

impl AgentState {
    pub fn running(pid: u32, log_path: String, heartbeat_port: u16, activity_port: u16) -> Self {
        Self {
            pid: Some(pid),
            log_path,
            heartbeat_port: Some(heartbeat_port),
            activity_port: Some(activity_port),
            status: AgentStatus::Running,
        }
    }

    /// The same record with pid and ports cleared and status `STOPPED`.
    /// `log_path` is kept so the last run's logs can still be found.
    pub fn into_stopped(self) -> Self {
        Self {
            pid: None,
            log_path: self.log_path,
            heartbeat_port: None,
            activity_port: None,
            status: AgentStatus::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }
}

/// Reads and atomically rewrites the state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. `Ok(None)` when the file does not exist.
    pub fn load(&self) -> Result<Option<AgentState>, StateError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents)
            .map(Some)
            .map_err(|e| StateError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Replace the whole record.
    ///
    /// Writes to a temporary file in the same directory, then renames it over
    /// the state file. The parent directory is created if needed.
    pub fn save(&self, state: &AgentState) -> Result<(), StateError> {
        let contents =
            toml::to_string(state).map_err(|e| StateError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| StateError::Write {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent_state".to_string());
        let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, contents.as_bytes()).map_err(|e| StateError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StateError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }
}

/// Errors from state file operations.
#[derive(Debug)]
pub enum StateError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Serialize {
        source: toml::ser::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Read { path, source } => {
                write!(f, "failed to read state file {}: {source}", path.display())
            }
            StateError::Parse { path, source } => {
                write!(f, "failed to parse state file {}: {source}", path.display())
            }
            StateError::Serialize { source } => write!(f, "failed to serialize state: {source}"),
            StateError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            StateError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Read { source, .. } => Some(source),
            StateError::Parse { source, .. } => Some(source),
            StateError::Serialize { source } => Some(source),
            StateError::Write { source, .. } => Some(source),
            StateError::Rename { source, .. } => Some(source),
        }
    }
}
