/// One supervisory tick: probe the session, consult the restart ledger,
/// relaunch or refuse, and report.
///
/// A tick runs to completion and holds no state of its own between runs;
/// everything that must carry over lives in the ledger file.
use crate::config::WardenConfig;
use crate::event_log::EventLog;
use crate::ledger::RestartLedger;
use crate::notify::{NotificationEvent, Notifier};
use crate::session::{LaunchError, ProbeError, SessionBackend, SessionProbe, WorkerCommand};
use crate::state_dir::StateDir;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Result of a completed tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Worker present; nothing done.
    Healthy,
    /// Worker was down and has been relaunched.
    Restarted { restart_count: u32 },
    /// Worker is down but the window is full; left down.
    Blocked { restart_count: u32 },
}

/// The only failures that end a tick with a non-zero exit.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("session probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("relaunch failed: {0}")]
    Launch(#[from] LaunchError),
}

/// Static inputs for a tick.
#[derive(Debug, Clone)]
pub struct TickSettings {
    pub session: String,
    pub worker: WorkerCommand,
    pub worker_log: PathBuf,
    pub ledger_path: PathBuf,
    pub max_restarts: u32,
    pub window_secs: u64,
    pub host: String,
}

impl TickSettings {
    pub fn from_config(config: &WardenConfig, state: &StateDir, host: String) -> Self {
        Self {
            session: config.session.name.clone(),
            worker: WorkerCommand::from_config(config),
            worker_log: state.worker_log(),
            ledger_path: state.ledger(),
            max_restarts: config.limits.max_restarts,
            window_secs: config.limits.window_secs,
            host,
        }
    }
}

pub struct Supervisor<'a, B, N> {
    backend: &'a B,
    notifier: &'a N,
    events: &'a EventLog,
    settings: TickSettings,
}

impl<'a, B: SessionBackend, N: Notifier> Supervisor<'a, B, N> {
    pub fn new(
        backend: &'a B,
        notifier: &'a N,
        events: &'a EventLog,
        settings: TickSettings,
    ) -> Self {
        Self {
            backend,
            notifier,
            events,
            settings,
        }
    }

    /// Run one tick as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, TickError> {
        let session = self.settings.session.as_str();

        let verdict = match self.backend.probe(session).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(session, backend = self.backend.name(), error = %e, "probe failed");
                self.events.append(&format!("probe of session {session} failed: {e}"));
                return Err(e.into());
            }
        };

        let reason = match verdict {
            SessionProbe::Missing => "session missing",
            SessionProbe::AliveNoWorker => "session alive but worker not running",
            SessionProbe::AliveWithWorker => {
                tracing::debug!(session, "worker alive");
                self.notify(NotificationEvent::NoChange {
                    host: self.settings.host.clone(),
                    timestamp: now,
                })
                .await;
                return Ok(TickOutcome::Healthy);
            }
        };
        tracing::warn!(session, verdict = %verdict, "worker down");
        self.events.append(&format!("{reason}: {session}"));

        let now_secs = now.timestamp();
        let mut ledger = RestartLedger::load(&self.settings.ledger_path);
        let pruned = ledger.prune(now_secs, self.settings.window_secs);

        if !ledger.can_restart(now_secs, self.settings.window_secs, self.settings.max_restarts) {
            if pruned > 0 {
                self.save_ledger(&ledger);
            }
            let restart_count = count(&ledger);
            tracing::warn!(
                session,
                restart_count,
                max_restarts = self.settings.max_restarts,
                window_secs = self.settings.window_secs,
                "restart blocked by rate limit"
            );
            self.events.append(&format!(
                "restart blocked: {restart_count}/{} restarts in the last {}s",
                self.settings.max_restarts, self.settings.window_secs
            ));
            self.notify(NotificationEvent::Blocked {
                host: self.settings.host.clone(),
                timestamp: now,
                session_id: session.to_string(),
                restart_count,
                max_restarts: self.settings.max_restarts,
                window_secs: self.settings.window_secs,
            })
            .await;
            return Ok(TickOutcome::Blocked { restart_count });
        }

        // Recorded before launching so a launch that keeps failing still
        // counts against the window.
        ledger.record(now_secs);
        self.save_ledger(&ledger);
        let restart_count = count(&ledger);

        self.events.append(&format!(
            "restarting {session} ({restart_count}/{})",
            self.settings.max_restarts
        ));
        if let Err(e) = self
            .backend
            .relaunch(session, &self.settings.worker, &self.settings.worker_log)
            .await
        {
            tracing::error!(session, error = %e, "relaunch failed");
            self.events.append(&format!("relaunch of {session} failed: {e}"));
            return Err(e.into());
        }

        tracing::info!(session, restart_count, "worker relaunched");
        self.events.append(&format!("relaunched {session}"));
        self.notify(NotificationEvent::Restarted {
            host: self.settings.host.clone(),
            timestamp: now,
            session_id: session.to_string(),
            restart_count,
            max_restarts: self.settings.max_restarts,
        })
        .await;
        Ok(TickOutcome::Restarted { restart_count })
    }

    /// Persist the ledger. A write failure leaves the old file in place,
    /// which can only under-count restarts.
    fn save_ledger(&self, ledger: &RestartLedger) {
        if let Err(e) = ledger.save(&self.settings.ledger_path) {
            tracing::warn!(error = %e, "failed to save restart ledger");
            self.events.append(&format!("failed to save restart ledger: {e}"));
        }
    }

    async fn notify(&self, event: NotificationEvent) {
        if !event.is_deliverable() {
            return;
        }
        if let Err(e) = self.notifier.send(&event).await {
            tracing::warn!(event = event.kind(), error = %e, "notification failed");
            self.events
                .append(&format!("{} notification not delivered: {e}", event.kind()));
        }
    }
}

fn count(ledger: &RestartLedger) -> u32 {
    u32::try_from(ledger.len()).unwrap_or(u32::MAX)
}
