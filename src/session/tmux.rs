/// tmux backend.
///
/// Session targets are always written as `=NAME` so tmux matches the name
/// exactly instead of by prefix.
use super::{
    check_tool, prepare_log_sink, run_tool, stderr_text, LaunchError, PreflightError, ProbeError,
    SessionBackend, SessionProbe, SessionRoots, SettleDelays, WorkerCommand, WorkerMatcher,
};
use std::path::Path;

const TOOL: &str = "tmux";

/// Upper bound on kill attempts when clearing a stale session.
const MAX_KILL_ATTEMPTS: usize = 5;

pub struct TmuxBackend {
    matcher: WorkerMatcher,
    delays: SettleDelays,
    /// Optional `-L` server socket name, isolating the worker's tmux server.
    socket: Option<String>,
}

impl TmuxBackend {
    pub fn new(matcher: WorkerMatcher, delays: SettleDelays, socket: Option<String>) -> Self {
        Self {
            matcher,
            delays,
            socket,
        }
    }

    async fn tmux(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = &self.socket {
            full.push("-L");
            full.push(socket.as_str());
        }
        full.extend_from_slice(args);
        run_tool(TOOL, &full).await
    }

    async fn has_session(&self, target: &str) -> std::io::Result<bool> {
        // Exits non-zero both for "no such session" and "no server running"
        Ok(self.tmux(&["has-session", "-t", target]).await?.status.success())
    }

    async fn pane_pids(&self, target: &str) -> std::io::Result<Option<Vec<u32>>> {
        let output = self
            .tmux(&["list-panes", "-s", "-t", target, "-F", "#{pane_pid}"])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(parse_pane_pids(&String::from_utf8_lossy(&output.stdout))))
    }
}

fn target(session: &str) -> String {
    format!("={session}")
}

/// Parse `list-panes -F '#{pane_pid}'` output, one pid per line.
fn parse_pane_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

impl SessionBackend for TmuxBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    fn preflight(&self) -> Result<(), PreflightError> {
        check_tool(TOOL)
    }

    async fn probe(&self, session: &str) -> Result<SessionProbe, ProbeError> {
        let target = target(session);
        let probe_err = |e| ProbeError::Command {
            tool: TOOL,
            source: e,
        };

        if !self.has_session(&target).await.map_err(probe_err)? {
            return Ok(SessionProbe::Missing);
        }
        // The session can vanish between the two calls
        let Some(roots) = self.pane_pids(&target).await.map_err(probe_err)? else {
            return Ok(SessionProbe::Missing);
        };
        Ok(self.matcher.verdict(session, SessionRoots::Panes(&roots)))
    }

    async fn relaunch(
        &self,
        session: &str,
        worker: &WorkerCommand,
        log: &Path,
    ) -> Result<(), LaunchError> {
        let target = target(session);
        let launch_err = |e| LaunchError::Command {
            tool: TOOL,
            source: e,
        };

        let mut killed = 0;
        while self.has_session(&target).await.map_err(launch_err)? {
            if killed == MAX_KILL_ATTEMPTS {
                return Err(LaunchError::Terminate {
                    session: session.to_string(),
                    stderr: format!("session still present after {killed} kill attempts"),
                });
            }
            let output = self
                .tmux(&["kill-session", "-t", &target])
                .await
                .map_err(launch_err)?;
            if !output.status.success() {
                tracing::debug!(session, stderr = %stderr_text(&output), "kill-session failed");
            }
            killed += 1;
        }
        if killed > 0 {
            tracing::info!(session, "terminated stale tmux session");
        }
        tokio::time::sleep(self.delays.after_kill).await;

        prepare_log_sink(log)?;
        let line = worker.shell_line(log);
        tracing::info!(session, command = %line, "creating tmux session");
        let output = self
            .tmux(&["new-session", "-d", "-s", session, &line])
            .await
            .map_err(launch_err)?;
        if !output.status.success() {
            return Err(LaunchError::Create {
                session: session.to_string(),
                stderr: stderr_text(&output),
            });
        }

        tokio::time::sleep(self.delays.after_start).await;

        if !self.has_session(&target).await.map_err(launch_err)? {
            return Err(LaunchError::NotStarted {
                session: session.to_string(),
            });
        }
        Ok(())
    }
}
