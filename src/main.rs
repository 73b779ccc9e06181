mod config;
mod event_log;
mod ledger;
mod lock;
mod notify;
mod procs;
mod session;
mod state_dir;
mod status;
mod supervisor;

use clap::Parser;
use config::{BackendKind, WardenConfig};
use event_log::EventLog;
use lock::{LockError, TickLock};
use notify::WebhookNotifier;
use session::screen::ScreenBackend;
use session::tmux::TmuxBackend;
use session::{SessionBackend, SettleDelays, WorkerMatcher};
use state_dir::StateDir;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use supervisor::{Supervisor, TickOutcome, TickSettings};

/// Exit code for a tick that failed to probe or relaunch.
const EXIT_TICK_FAILED: u8 = 1;
/// Exit code for a misconfigured environment.
const EXIT_MISCONFIGURED: u8 = 2;

/// Keeps a long-running worker alive inside a tmux or screen session.
///
/// Meant to be run by a periodic scheduler (cron, systemd timer): each
/// invocation is one tick that checks the worker and relaunches it when it
/// is gone, subject to a restart rate limit.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// State directory (overrides config)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Session name (overrides config)
    #[arg(long)]
    session: Option<String>,

    /// Validate config and environment, print resolved settings, don't probe
    #[arg(long)]
    dry_run: bool,

    /// Print session and restart-window state as JSON and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (probe verdicts, launch commands)
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_MISCONFIGURED);
        }
    };

    let pattern = match config.match_regex() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_MISCONFIGURED);
        }
    };
    let matcher = WorkerMatcher::new(pattern, config.worker.match_mode);
    let delays = SettleDelays::from_millis(
        config.launcher.kill_settle_ms,
        config.launcher.start_settle_ms,
    );

    // The backend is chosen once; everything below is generic over it
    match config.session.backend {
        BackendKind::Tmux => {
            let backend = TmuxBackend::new(matcher, delays, config.session.tmux_socket.clone());
            run(&cli, &config, &backend).await
        }
        BackendKind::Screen => {
            let backend = ScreenBackend::new(matcher, delays);
            run(&cli, &config, &backend).await
        }
    }
}

/// Load the config file and apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<WardenConfig, config::ConfigError> {
    let mut config = config::load_config(&cli.config)?;
    if let Some(dir) = &cli.state_dir {
        config.state.dir = dir.clone();
    }
    if let Some(name) = &cli.session {
        config.session.name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run<B: SessionBackend>(cli: &Cli, config: &WardenConfig, backend: &B) -> ExitCode {
    let worker = session::WorkerCommand::from_config(config);
    if let Err(e) = backend.preflight().and_then(|()| worker.preflight()) {
        tracing::error!(error = %e, "preflight failed");
        return ExitCode::from(EXIT_MISCONFIGURED);
    }

    let state = StateDir::new(&config.state.dir)
        .with_event_log(config.state.event_log.clone())
        .with_worker_log(config.worker.log_file.clone());
    let host = notify::host_identity(config.notify.host_name.as_deref());
    let settings = TickSettings::from_config(config, &state, host);

    if cli.dry_run {
        println!("warden v{}", env!("CARGO_PKG_VERSION"));
        println!("backend:      {}", backend.name());
        println!("session:      {}", settings.session);
        println!("signature:    {}", config.signature());
        println!("match mode:   {:?}", config.worker.match_mode);
        println!(
            "rate limit:   {} restarts / {}s",
            settings.max_restarts, settings.window_secs
        );
        println!("state dir:    {}", state.root().display());
        println!("event log:    {}", state.event_log().display());
        println!("worker log:   {}", settings.worker_log.display());
        println!(
            "notify url:   {}",
            config.notify.url.as_deref().unwrap_or("(disabled)")
        );
        return ExitCode::SUCCESS;
    }

    if cli.status {
        let report = status::collect(backend, &settings, chrono::Utc::now()).await;
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render status");
                return ExitCode::from(EXIT_TICK_FAILED);
            }
        }
        return ExitCode::SUCCESS;
    }

    if let Err(e) = state.init() {
        tracing::error!(error = %e, dir = %state.root().display(), "cannot create state directory");
        return ExitCode::from(EXIT_MISCONFIGURED);
    }

    let tick_lock = match TickLock::acquire(&state.lock()) {
        Ok(l) => l,
        Err(LockError::Contended { path }) => {
            tracing::info!(lock = %path.display(), "another tick is running, skipping");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot take tick lock");
            return ExitCode::from(EXIT_TICK_FAILED);
        }
    };

    let notifier = config.notify.url.as_ref().and_then(|url| {
        WebhookNotifier::new(url.clone(), Duration::from_secs(config.notify.timeout_secs))
            .map_err(|e| tracing::warn!(error = %e, "notifications disabled"))
            .ok()
    });
    let events = EventLog::new(state.event_log());
    tracing::debug!(
        lock = %tick_lock.path().display(),
        event_log = %events.path().display(),
        "tick starting"
    );
    let supervisor = Supervisor::new(backend, &notifier, &events, settings);

    match supervisor.tick(chrono::Utc::now()).await {
        Ok(TickOutcome::Healthy) => ExitCode::SUCCESS,
        Ok(TickOutcome::Restarted { restart_count }) => {
            tracing::info!(restart_count, "tick finished: worker restarted");
            ExitCode::SUCCESS
        }
        // Blocked is a decision, not a failure
        Ok(TickOutcome::Blocked { restart_count }) => {
            tracing::info!(restart_count, "tick finished: restart blocked");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "tick failed");
            ExitCode::from(EXIT_TICK_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["warden"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("warden.toml"));
        assert!(!cli.dry_run && !cli.status && !cli.verbose && !cli.quiet);
    }

    #[test]
    fn test_cli_overrides_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[worker]\ncommand = \"/bin/sh\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "warden",
            "--config",
            path.to_str().unwrap(),
            "--state-dir",
            "/tmp/wst",
            "--session",
            "edge",
        ])
        .unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.state.dir, PathBuf::from("/tmp/wst"));
        assert_eq!(config.session.name, "edge");
    }

    #[test]
    fn test_resolve_config_rejects_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "warden",
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
        ])
        .unwrap();
        assert!(resolve_config(&cli).is_err());
    }
}
