use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WardenConfig {
    pub session: SessionConfig,
    pub worker: WorkerConfig,
    pub limits: LimitsConfig,
    pub launcher: LauncherConfig,
    pub state: StateConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub name: String,
    pub backend: BackendKind,
    /// tmux only: server socket name passed as `-L`.
    pub tmux_socket: Option<String>,
}

/// Which terminal multiplexer hosts the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Tmux,
    Screen,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    /// Regex used for liveness matching. Defaults to the escaped start signature.
    pub match_pattern: Option<String>,
    pub match_mode: MatchMode,
}

/// How far the liveness probe looks for the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Only processes descending from the session's controlling process.
    Descendants,
    /// Any process on the host. Can be fooled by an unrelated process
    /// that happens to share the command line. tmux and screen servers are
    /// skipped, since their argv carries the launch line.
    Host,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_restarts: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub kill_settle_ms: u64,
    pub start_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub event_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub host_name: Option<String>,
}

// --- Default implementations ---

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 5,
            host_name: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            backend: BackendKind::Tmux,
            tmux_socket: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::new(),
            args: Vec::new(),
            working_dir: None,
            log_file: None,
            match_pattern: None,
            match_mode: MatchMode::Descendants,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window_secs: 600,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            kill_settle_ms: 1000,
            start_settle_ms: 2000,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".warden"),
            event_log: None,
        }
    }
}

/// Errors raised while loading or validating configuration.
///
/// Any of these means the deployment is misconfigured, so the supervisor
/// exits before touching the session.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid match_pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Load configuration from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<WardenConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WardenConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl WardenConfig {
    /// Check the settings that would make every tick fail or misbehave.
    ///
    /// Does not touch the filesystem; the executable check lives in preflight.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.name.trim().is_empty() {
            return Err(ConfigError::Invalid("session.name must not be empty".into()));
        }
        // tmux treats '.' and ':' as target separators
        if self.session.name.contains(['.', ':']) {
            return Err(ConfigError::Invalid(format!(
                "session.name {:?} must not contain '.' or ':'",
                self.session.name
            )));
        }
        if self.worker.command.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker.command is required".into()));
        }
        if self.limits.max_restarts == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_restarts must be at least 1".into(),
            ));
        }
        if self.limits.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "limits.window_secs must be at least 1".into(),
            ));
        }
        self.match_regex()?;
        Ok(())
    }

    /// The start signature: executable file name followed by its arguments.
    pub fn signature(&self) -> String {
        let program = self
            .worker
            .command
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.worker.command.to_string_lossy().to_string());
        std::iter::once(program)
            .chain(self.worker.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Compiled liveness pattern: the configured override, or the literal signature.
    pub fn match_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = match &self.worker.match_pattern {
            Some(p) => p.clone(),
            None => regex::escape(&self.signature()),
        };
        Regex::new(&pattern).map_err(|e| ConfigError::Pattern {
            pattern,
            source: e,
        })
    }
}
