use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::model::Change;

/// Receives every committed change. Failures are logged, never propagated:
/// the engine has already committed by the time a sink sees a change.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, change: &Change) -> Result<(), String>;
}

/// Writes each change as a structured event on the `audit` tracing target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, change: &Change) -> Result<(), String> {
        let before = serde_json::to_string(&change.before).map_err(|e| e.to_string())?;
        let after = serde_json::to_string(&change.after).map_err(|e| e.to_string())?;
        info!(
            target: "audit",
            resource_id = %change.resource_id,
            entity = ?change.entity,
            entity_id = %change.entity_id,
            action = ?change.action,
            actor = change.actor.as_deref().unwrap_or("-"),
            at = change.at,
            before = %before,
            after = %after,
            "change"
        );
        Ok(())
    }
}

/// Forward the global change feed to `sink` until the feed closes.
pub async fn run_audit_forwarder(mut rx: broadcast::Receiver<Change>, sink: Arc<dyn AuditSink>) {
    loop {
        match rx.recv().await {
            Ok(change) => {
                if let Err(e) = sink.record(&change).await {
                    warn!(entity_id = %change.entity_id, "audit sink failed: {e}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "audit forwarder lagged; changes dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
