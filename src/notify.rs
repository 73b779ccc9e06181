/// Outbound notifications about supervisor decisions.
///
/// Delivery is fire-and-forget: the orchestrator logs and discards any
/// `NotifyError`, and nothing is retried.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// What happened during a tick, as seen by the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// The worker was relaunched.
    Restarted {
        host: String,
        timestamp: DateTime<Utc>,
        session_id: String,
        restart_count: u32,
        max_restarts: u32,
    },
    /// The worker is down but the restart budget for the window is spent.
    Blocked {
        host: String,
        timestamp: DateTime<Utc>,
        session_id: String,
        restart_count: u32,
        max_restarts: u32,
        window_secs: u64,
    },
    /// Nothing worth reporting. Never delivered.
    #[serde(rename = "none")]
    NoChange {
        host: String,
        timestamp: DateTime<Utc>,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::Restarted { .. } => "restarted",
            NotificationEvent::Blocked { .. } => "blocked",
            NotificationEvent::NoChange { .. } => "none",
        }
    }

    pub fn is_deliverable(&self) -> bool {
        !matches!(self, NotificationEvent::NoChange { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("notification request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// Destination for notification events.
pub trait Notifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// An absent notifier accepts and drops every event.
impl<N: Notifier> Notifier for Option<N> {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        match self {
            Some(inner) => inner.send(event).await,
            None => Ok(()),
        }
    }
}

/// POSTs each event as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        if !event.is_deliverable() {
            return Ok(());
        }
        let resp = self.client.post(&self.url).json(event).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status()));
        }
        tracing::debug!(event = event.kind(), url = %self.url, "notification delivered");
        Ok(())
    }
}

/// Host identity reported in notifications: the override if set, else the
/// kernel hostname.
pub fn host_identity(configured: Option<&str>) -> String {
    if let Some(name) = configured {
        return name.to_string();
    }
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read hostname");
            "unknown".to_string()
        }
    }
}
