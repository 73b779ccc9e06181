/// Read-only status report for `warden --status`.
///
/// Probes the session and summarises the restart ledger without taking the
/// tick lock or writing anything.
use crate::ledger::RestartLedger;
use crate::session::{SessionBackend, SessionProbe};
use crate::supervisor::TickSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// The JSON payload printed by `--status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session: String,
    pub backend: &'static str,
    pub host: String,
    /// `None` when the probe itself failed.
    pub probe: Option<&'static str>,
    pub probe_error: Option<String>,
    pub restarts_in_window: usize,
    pub max_restarts: u32,
    pub window_secs: u64,
    pub last_restart: Option<DateTime<Utc>>,
    /// In-window restarts in ledger order.
    pub recent_restarts: Vec<DateTime<Utc>>,
    pub restart_allowed: bool,
    pub checked_at: DateTime<Utc>,
}

/// Build a status report as of `now`.
pub async fn collect<B: SessionBackend>(
    backend: &B,
    settings: &TickSettings,
    now: DateTime<Utc>,
) -> StatusReport {
    let (probe, probe_error) = match backend.probe(&settings.session).await {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_string())),
    };
    build_report(backend.name(), settings, probe, probe_error, now)
}

fn build_report(
    backend: &'static str,
    settings: &TickSettings,
    probe: Option<SessionProbe>,
    probe_error: Option<String>,
    now: DateTime<Utc>,
) -> StatusReport {
    // Work on a loaded copy; the file on disk is left alone
    let mut ledger = RestartLedger::load(&settings.ledger_path);
    let restarts_in_window = ledger.count_in_window(now.timestamp(), settings.window_secs);
    let restart_allowed = restarts_in_window < settings.max_restarts as usize;
    let last_restart = ledger
        .last()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    let recent_restarts = ledger
        .records()
        .iter()
        .filter_map(|&ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .collect();

    StatusReport {
        session: settings.session.clone(),
        backend,
        host: settings.host.clone(),
        probe: probe.map(SessionProbe::as_str),
        probe_error,
        restarts_in_window,
        max_restarts: settings.max_restarts,
        window_secs: settings.window_secs,
        last_restart,
        recent_restarts,
        restart_allowed,
        checked_at: now,
    }
}
