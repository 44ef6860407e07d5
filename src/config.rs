use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `config.toml` in the config directory.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: LaunchConfig,
    pub paths: PathsConfig,
    pub ports: PortsConfig,
    pub monitor: MonitorConfig,
}

/// How the agent process is launched by `start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Agent executable. Defaults to this binary.
    pub executable: Option<PathBuf>,
    /// Arguments placed before the generated `--log-path`/port flags.
    pub args: Vec<String>,
    /// Pass `--debug` to the agent.
    pub debug: bool,
}

/// File locations, relative paths resolved against the config directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub bind_host: String,
    pub range_start: u16,
    pub range_end: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub heartbeat_secs: u64,
    pub diagnostics_secs: u64,
    pub poll_interval_ms: u64,
}

// --- Default implementations ---

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: vec!["run".to_string()],
            debug: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("agent_state.toml"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            range_start: 49152,
            range_end: 65535,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            diagnostics_secs: 10,
            poll_interval_ms: 100,
        }
    }
}

impl MonitorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostics_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl AgentConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.range_start > self.ports.range_end {
            return Err(ConfigError::Invalid(format!(
                "ports.range_start ({}) is greater than ports.range_end ({})",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.args, vec!["run"]);
        assert!(config.agent.executable.is_none());
        assert!(!config.agent.debug);
        assert_eq!(config.paths.state_file, PathBuf::from("agent_state.toml"));
        assert_eq!(config.ports.range_start, 49152);
        assert_eq!(config.monitor.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.diagnostics_interval(), Duration::from_secs(10));
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.monitor.heartbeat_secs, 5);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[monitor]\nheartbeat_secs = 2\n\n[agent]\nexecutable = \"/opt/agent\"\ndebug = true\n",
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.monitor.heartbeat_secs, 2);
        assert_eq!(config.monitor.poll_interval_ms, 100);
        assert_eq!(config.agent.executable, Some(PathBuf::from("/opt/agent")));
        assert!(config.agent.debug);
        assert_eq!(config.agent.args, vec!["run"]);
        assert_eq!(config.ports.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor\nheartbeat_secs = ").unwrap();

        let err = AgentConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ports]\nrange_start = 6000\nrange_end = 5000\n").unwrap();

        let err = AgentConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\npoll_interval_ms = 0\n").unwrap();

        assert!(matches!(
            AgentConfig::load(&path).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }
}
