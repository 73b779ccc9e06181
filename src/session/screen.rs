/// GNU screen backend.
///
/// Unlike tmux, screen happily runs several sessions under the same name, so
/// every `PID.NAME` entry is tracked and torn down individually. A SCREEN
/// process that was killed outright leaves a dead socket behind; those are
/// wiped before every listing so they never count as a live session.
use super::{
    check_tool, prepare_log_sink, run_tool, stderr_text, LaunchError, PreflightError, ProbeError,
    SessionBackend, SessionProbe, SessionRoots, SettleDelays, WorkerCommand, WorkerMatcher,
};
use std::path::Path;

const TOOL: &str = "screen";

pub struct ScreenBackend {
    matcher: WorkerMatcher,
    delays: SettleDelays,
}

impl ScreenBackend {
    pub fn new(matcher: WorkerMatcher, delays: SettleDelays) -> Self {
        Self { matcher, delays }
    }

    /// Pids of the SCREEN processes hosting sessions named exactly `session`.
    async fn session_pids(&self, session: &str) -> std::io::Result<Vec<u32>> {
        // Both commands exit non-zero even when they list sessions; only the
        // output matters.
        let wiped = run_tool(TOOL, &["-wipe", session]).await?;
        if String::from_utf8_lossy(&wiped.stdout).contains("removed") {
            tracing::info!(session, "wiped dead screen sessions");
        }
        let output = run_tool(TOOL, &["-ls", session]).await?;
        Ok(parse_screen_ls(&String::from_utf8_lossy(&output.stdout), session))
    }
}

/// Parse `screen -ls` output, keeping entries whose name is exactly `session`.
///
/// Entries look like `\t12345.gateway\t(Detached)`; `screen -ls NAME` also
/// lists prefix matches, which are dropped here, as are `(Dead ???)` entries
/// that survived a wipe.
fn parse_screen_ls(output: &str, session: &str) -> Vec<u32> {
    output
        .lines()
        .filter(|line| !line.contains("(Dead"))
        .filter_map(|line| {
            let id = line.split_whitespace().next()?;
            let (pid, name) = id.split_once('.')?;
            if name != session {
                return None;
            }
            pid.parse().ok()
        })
        .collect()
}

impl SessionBackend for ScreenBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    fn preflight(&self) -> Result<(), PreflightError> {
        check_tool(TOOL)
    }

    async fn probe(&self, session: &str) -> Result<SessionProbe, ProbeError> {
        let roots = self
            .session_pids(session)
            .await
            .map_err(|e| ProbeError::Command {
                tool: TOOL,
                source: e,
            })?;
        if roots.is_empty() {
            return Ok(SessionProbe::Missing);
        }
        Ok(self.matcher.verdict(session, SessionRoots::Servers(&roots)))
    }

    async fn relaunch(
        &self,
        session: &str,
        worker: &WorkerCommand,
        log: &Path,
    ) -> Result<(), LaunchError> {
        let launch_err = |e| LaunchError::Command {
            tool: TOOL,
            source: e,
        };

        let stale = self.session_pids(session).await.map_err(launch_err)?;
        for pid in &stale {
            let id = format!("{pid}.{session}");
            let output = run_tool(TOOL, &["-S", &id, "-X", "quit"])
                .await
                .map_err(launch_err)?;
            if !output.status.success() {
                tracing::debug!(session = %id, stderr = %stderr_text(&output), "screen quit failed");
            }
        }
        if !stale.is_empty() {
            tracing::info!(session, count = stale.len(), "terminated stale screen sessions");
        }
        tokio::time::sleep(self.delays.after_kill).await;

        let leftover = self.session_pids(session).await.map_err(launch_err)?;
        if !leftover.is_empty() {
            return Err(LaunchError::Terminate {
                session: session.to_string(),
                stderr: format!("{} session(s) survived quit", leftover.len()),
            });
        }

        prepare_log_sink(log)?;
        let line = worker.shell_line(log);
        tracing::info!(session, command = %line, "creating screen session");
        let output = run_tool(TOOL, &["-dmS", session, "sh", "-c", &line])
            .await
            .map_err(launch_err)?;
        if !output.status.success() {
            return Err(LaunchError::Create {
                session: session.to_string(),
                stderr: stderr_text(&output),
            });
        }

        tokio::time::sleep(self.delays.after_start).await;

        if self.session_pids(session).await.map_err(launch_err)?.is_empty() {
            return Err(LaunchError::NotStarted {
                session: session.to_string(),
            });
        }
        Ok(())
    }
}
