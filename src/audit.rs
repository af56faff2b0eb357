//! Fire-and-forget audit trail for checks and administrative mutations.
//!
//! Events go through a bounded queue with `try_send`, so a slow consumer
//! drops events locally instead of stalling the request path. The consumer
//! writes each event as a structured log line under the `audit` target.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::settings::Audit as AuditCfg;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub at: i64,
    /// Who caused it: an admin actor, or the principal for checks.
    pub actor: String,
    pub action: &'static str,
    pub target: String,
    pub outcome: String,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: &'static str,
        target: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now().timestamp(),
            actor: actor.into(),
            action,
            target: target.into(),
            outcome: outcome.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEvent>>,
}

impl AuditSink {
    /// Sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Sink plus the receiving end, for callers that consume events
    /// themselves.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Build a sink from settings and spawn the logging consumer.
    /// Must be called inside a tokio runtime.
    pub fn spawn(cfg: &AuditCfg) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }
        let (sink, mut rx) = Self::channel(cfg.buffer);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::info!(
                    target: "audit",
                    at = event.at,
                    actor = %event.actor,
                    action = event.action,
                    target_id = %event.target,
                    outcome = %event.outcome,
                    "audit"
                );
            }
        });
        sink
    }

    pub fn record(&self, event: AuditEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(event) => {
                    tracing::warn!(action = event.action, "audit queue full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!("audit consumer gone");
                }
            }
        }
    }
}
