use crate::config::AgentConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the per-user config directory.
pub const HOME_ENV: &str = "CAMPAIGN_AGENT_HOME";

/// Manages the per-user config directory (default `~/.config/campaign-agent/`).
///
/// The config file, the persisted agent state and the agent logs all live here
/// unless the config points them elsewhere.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the directory from `$CAMPAIGN_AGENT_HOME`, then the platform config dir.
    pub fn from_env() -> Self {
        Self::resolve_from(std::env::var_os(HOME_ENV), dirs::config_dir())
    }

    pub(crate) fn resolve_from(home_override: Option<OsString>, platform: Option<PathBuf>) -> Self {
        if let Some(home) = home_override.filter(|h| !h.is_empty()) {
            return Self::new(PathBuf::from(home));
        }
        match platform {
            Some(dir) => Self::new(dir.join("campaign-agent")),
            None => Self::new(".campaign-agent"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to `config.toml`.
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Path to the persisted agent state record.
    pub fn state_file(&self, config: &AgentConfig) -> PathBuf {
        self.resolve(&config.paths.state_file)
    }

    /// Directory holding one log subdirectory per agent run.
    pub fn log_dir(&self, config: &AgentConfig) -> PathBuf {
        self.resolve(&config.paths.log_dir)
    }

    /// Join a relative path onto the root; absolute paths pass through.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Default content written to `config.toml` by `init`.
    const DEFAULT_CONFIG: &str = "\
# campaign-agent configuration

[agent]
# executable = \"/usr/local/bin/campaign-agent\"
args = [\"run\"]
debug = false

[paths]
state_file = \"agent_state.toml\"
log_dir = \"logs\"

[ports]
bind_host = \"127.0.0.1\"
range_start = 49152
range_end = 65535

[monitor]
heartbeat_secs = 5
diagnostics_secs = 10
poll_interval_ms = 100
";

    /// Create the directory and a default `config.toml` if none exists.
    /// Returns Ok(true) if the directory was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;

        let config_path = self.config();
        if !config_path.exists() {
            std::fs::write(&config_path, Self::DEFAULT_CONFIG)?;
        }

        Ok(created)
    }
}
