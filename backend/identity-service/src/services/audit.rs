/// Authentication event channel
///
/// The core never persists audit data. It pushes [`AuthEvent`]s into a
/// bounded channel whose receiving end belongs to the audit collaborator.
///
/// ## Backpressure
///
/// - `Block`: emitters wait for capacity; no event is lost
/// - `DropOldest`: emitters never wait; a slow consumer loses the oldest
///   buffered events and is told how many
use crate::models::RequestMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventKind {
    PrincipalRegistered,
    LoginSucceeded,
    LoginFailed,
    SecondFactorRequired,
    TokenRefreshed,
    RefreshRejected,
    Logout,
    MfaEnrollmentStarted,
    MfaEnabled,
    MfaDisabled,
    BackupCodeUsed,
    PasswordChanged,
    PrincipalDeactivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub metadata: RequestMetadata,
    /// Machine-readable reason for failures
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, metadata: &RequestMetadata) -> Self {
        Self {
            kind,
            user_id: None,
            email: None,
            metadata: metadata.clone(),
            reason: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    Block,
    DropOldest,
}

impl std::str::FromStr for Backpressure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Backpressure::Block),
            "drop_oldest" | "drop-oldest" => Ok(Backpressure::DropOldest),
            other => Err(format!("unknown backpressure policy '{other}'")),
        }
    }
}

#[derive(Clone)]
enum SinkInner {
    Disabled,
    Blocking(mpsc::Sender<AuthEvent>),
    DropOldest(broadcast::Sender<AuthEvent>),
}

/// Emitting half, cheap to clone into every service
#[derive(Clone)]
pub struct AuditSink {
    inner: SinkInner,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.inner {
            SinkInner::Disabled => "disabled",
            SinkInner::Blocking(_) => "block",
            SinkInner::DropOldest(_) => "drop_oldest",
        };
        f.debug_struct("AuditSink").field("mode", &mode).finish()
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::disabled()
    }
}

impl AuditSink {
    /// Sink that discards every event
    pub fn disabled() -> Self {
        Self {
            inner: SinkInner::Disabled,
        }
    }

    /// Bounded channel with the given backpressure policy
    pub fn channel(capacity: usize, policy: Backpressure) -> (Self, AuditReceiver) {
        let capacity = capacity.max(1);
        match policy {
            Backpressure::Block => {
                let (tx, rx) = mpsc::channel(capacity);
                (
                    Self {
                        inner: SinkInner::Blocking(tx),
                    },
                    AuditReceiver {
                        inner: ReceiverInner::Blocking(rx),
                        dropped: 0,
                    },
                )
            }
            Backpressure::DropOldest => {
                let (tx, rx) = broadcast::channel(capacity);
                (
                    Self {
                        inner: SinkInner::DropOldest(tx),
                    },
                    AuditReceiver {
                        inner: ReceiverInner::DropOldest(rx),
                        dropped: 0,
                    },
                )
            }
        }
    }

    pub async fn emit(&self, event: AuthEvent) {
        match &self.inner {
            SinkInner::Disabled => {}
            SinkInner::Blocking(tx) => {
                if tx.send(event).await.is_err() {
                    debug!("Audit receiver dropped; event discarded");
                }
            }
            SinkInner::DropOldest(tx) => {
                if tx.send(event).is_err() {
                    debug!("Audit receiver dropped; event discarded");
                }
            }
        }
    }
}

enum ReceiverInner {
    Blocking(mpsc::Receiver<AuthEvent>),
    DropOldest(broadcast::Receiver<AuthEvent>),
}

/// Receiving half, owned by the audit collaborator
pub struct AuditReceiver {
    inner: ReceiverInner,
    dropped: u64,
}

impl AuditReceiver {
    /// Next event; `None` once every sink has been dropped
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        match &mut self.inner {
            ReceiverInner::Blocking(rx) => rx.recv().await,
            ReceiverInner::DropOldest(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.dropped += skipped;
                        warn!(skipped, "Audit consumer lagging; oldest events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Events lost to `DropOldest` so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
