pub mod screen;
pub mod tmux;

use crate::config::{MatchMode, WardenConfig};
use crate::procs::{ProcessEntry, ProcessTable, Scope};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Liveness verdict for the hosting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProbe {
    /// No session with the configured name exists.
    Missing,
    /// The session exists but nothing inside it matches the worker signature.
    AliveNoWorker,
    /// The worker process was found.
    AliveWithWorker,
}

impl SessionProbe {
    #[cfg(test)]
    pub fn needs_restart(self) -> bool {
        !matches!(self, SessionProbe::AliveWithWorker)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionProbe::Missing => "missing",
            SessionProbe::AliveNoWorker => "alive_no_worker",
            SessionProbe::AliveWithWorker => "alive_with_worker",
        }
    }
}

impl std::fmt::Display for SessionProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host introspection failed outright (the multiplexer could not be run).
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run {tool}: {source}")]
    Command {
        tool: &'static str,
        source: std::io::Error,
    },
}

/// Errors that can occur while relaunching the session.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to run {tool}: {source}")]
    Command {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("failed to prepare worker log {path}: {source}")]
    LogSink {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to terminate session {session}: {stderr}")]
    Terminate { session: String, stderr: String },
    #[error("failed to create session {session}: {stderr}")]
    Create { session: String, stderr: String },
    #[error("session {session} exited during startup")]
    NotStarted { session: String },
}

/// Environment problems that make every tick pointless.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("required tool {tool} not found on PATH: {source}")]
    MissingTool {
        tool: &'static str,
        source: which::Error,
    },
    #[error("worker executable {path} not found or not a file")]
    MissingWorker { path: PathBuf },
}

/// The worker's start command.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            program: config.worker.command.clone(),
            args: config.worker.args.clone(),
            working_dir: config.worker.working_dir.clone(),
        }
    }

    /// Verify the executable exists: a path is checked directly, a bare
    /// name is looked up on `PATH`.
    pub fn preflight(&self) -> Result<(), PreflightError> {
        let missing = || PreflightError::MissingWorker {
            path: self.program.clone(),
        };
        if self.program.components().count() > 1 {
            if self.program.is_file() {
                Ok(())
            } else {
                Err(missing())
            }
        } else {
            which::which(&self.program).map(|_| ()).map_err(|_| missing())
        }
    }

    /// Render the `sh` command line that runs the worker with stdout and
    /// stderr appended to `log`.
    ///
    /// `exec` replaces the shell, so the session's controlling process is the
    /// worker itself.
    pub fn shell_line(&self, log: &Path) -> String {
        let mut line = String::new();
        if let Some(dir) = &self.working_dir {
            line.push_str("cd ");
            line.push_str(&shell_quote(&dir.to_string_lossy()));
            line.push_str(" && ");
        }
        line.push_str("exec ");
        line.push_str(&shell_quote(&self.program.to_string_lossy()));
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line.push_str(" >> ");
        line.push_str(&shell_quote(&log.to_string_lossy()));
        line.push_str(" 2>&1");
        line
    }
}

/// Single-quote `s` for POSIX sh.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Settle delays around a relaunch.
#[derive(Debug, Clone, Copy)]
pub struct SettleDelays {
    /// After terminating the old session, before creating the new one.
    pub after_kill: Duration,
    /// After creating the new session, before returning.
    pub after_start: Duration,
}

impl SettleDelays {
    pub fn from_millis(after_kill: u64, after_start: u64) -> Self {
        Self {
            after_kill: Duration::from_millis(after_kill),
            after_start: Duration::from_millis(after_start),
        }
    }
}

/// Executables that host sessions. Their argv may carry the launch line, so
/// they never count as the worker.
const MULTIPLEXERS: &[&str] = &["tmux", "screen", "SCREEN"];

fn is_multiplexer(entry: &ProcessEntry) -> bool {
    let name = entry.program_name();
    MULTIPLEXERS.iter().any(|m| *m == name)
}

/// The processes a session is rooted at, as reported by a backend.
#[derive(Debug, Clone, Copy)]
pub enum SessionRoots<'a> {
    /// Pane processes that `exec` into the worker (tmux). The roots
    /// themselves can be the worker.
    Panes(&'a [u32]),
    /// Multiplexer servers whose argv carries the launch line (screen). Only
    /// their descendants can be the worker.
    Servers(&'a [u32]),
}

/// How the worker is recognised in the process table.
#[derive(Debug, Clone)]
pub struct WorkerMatcher {
    pub pattern: Regex,
    pub mode: MatchMode,
}

impl WorkerMatcher {
    pub fn new(pattern: Regex, mode: MatchMode) -> Self {
        Self { pattern, mode }
    }

    /// Decide the verdict for a session known to exist.
    ///
    /// If the process table cannot be read at all the evidence is ambiguous,
    /// so the session is reported healthy rather than torn down.
    pub fn verdict(&self, session: &str, roots: SessionRoots<'_>) -> SessionProbe {
        let table = match ProcessTable::snapshot() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(
                    session,
                    error = %e,
                    "process table unavailable, assuming worker is alive"
                );
                return SessionProbe::AliveWithWorker;
            }
        };
        self.verdict_in(&table, session, roots)
    }

    pub fn verdict_in(
        &self,
        table: &ProcessTable,
        session: &str,
        roots: SessionRoots<'_>,
    ) -> SessionProbe {
        let scope = match (self.mode, roots) {
            (MatchMode::Descendants, SessionRoots::Panes(pids)) => Scope::DescendantsOf(pids),
            (MatchMode::Descendants, SessionRoots::Servers(pids)) => Scope::Beneath(pids),
            (MatchMode::Host, _) => {
                tracing::debug!(session, "host-wide worker matching (weaker than descendant scope)");
                Scope::Host
            }
        };
        let found = table
            .matching(&self.pattern, scope)
            .find(|entry| !is_multiplexer(entry));
        match found {
            Some(entry) => {
                tracing::debug!(session, pid = entry.pid, "worker process found");
                SessionProbe::AliveWithWorker
            }
            None => SessionProbe::AliveNoWorker,
        }
    }
}

/// A terminal multiplexer that can host the worker.
///
/// Implementations are chosen once at startup; the supervisor is generic over
/// this trait.
pub trait SessionBackend {
    /// Human-readable backend name (e.g., "tmux", "screen").
    fn name(&self) -> &'static str;

    /// Check the multiplexer binary is available.
    fn preflight(&self) -> Result<(), PreflightError>;

    /// Inspect the session. Absence is a normal verdict, not an error.
    async fn probe(&self, session: &str) -> Result<SessionProbe, ProbeError>;

    /// Destroy any session named `session` and start a fresh, detached one
    /// running `worker` with output appended to `log`.
    async fn relaunch(
        &self,
        session: &str,
        worker: &WorkerCommand,
        log: &Path,
    ) -> Result<(), LaunchError>;
}

/// Run a multiplexer command to completion, capturing its output.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> std::io::Result<Output> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
}

pub(crate) fn check_tool(tool: &'static str) -> Result<(), PreflightError> {
    which::which(tool)
        .map(|_| ())
        .map_err(|e| PreflightError::MissingTool { tool, source: e })
}

/// Make sure the worker log's directory exists before the shell redirects into it.
pub(crate) fn prepare_log_sink(log: &Path) -> Result<(), LaunchError> {
    if let Some(parent) = log.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| LaunchError::LogSink {
                path: log.to_path_buf(),
                source: e,
            })?;
        }
    }
    Ok(())
}

pub(crate) fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
