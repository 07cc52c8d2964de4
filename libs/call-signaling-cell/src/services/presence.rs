// libs/call-signaling-cell/src/services/presence.rs
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::{ChangeType, DocumentChange, Filter, SignalingStore};

use crate::models::{CallRecord, CallStatus};
use crate::services::repository::CALLS_COLLECTION;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Incoming-call notifications for one user.
#[derive(Debug)]
pub enum PresenceEvent {
    /// A new call is ringing for this user. Emitted at most once per
    /// record id, across reconnects.
    Incoming(CallRecord),
    /// The ringing call left the open set before being handled here
    /// (caller cancelled, timed out, or answered elsewhere).
    Cancelled(Uuid),
}

/// Watches the signaling store for calls addressed to the local user.
pub struct PresenceWatcher {
    store: Arc<dyn SignalingStore>,
    user_id: String,
}

impl PresenceWatcher {
    pub fn new(store: Arc<dyn SignalingStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    /// Spawn the watch loop. Events arrive on the returned receiver; the
    /// loop exits when the receiver is dropped, and the handle lets the
    /// owning session abort it on teardown.
    pub fn spawn(self) -> (JoinHandle<()>, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let handle = tokio::spawn(async move { self.run(tx).await });
        (handle, rx)
    }

    async fn run(self, tx: mpsc::UnboundedSender<PresenceEvent>) {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let filter = Filter::new()
                .eq("receiver_id", &self.user_id)
                .eq("status", CallStatus::Calling.as_str());

            let mut stream = match self.store.subscribe(CALLS_COLLECTION, filter).await {
                Ok(stream) => {
                    backoff = INITIAL_BACKOFF;
                    stream
                }
                Err(e) => {
                    warn!(
                        "Presence subscription for {} failed ({}), retrying in {:?}",
                        self.user_id, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            while let Some(change) = stream.next().await {
                if self.handle_change(change, &mut seen, &tx).await.is_err() {
                    // Receiver dropped; the session is gone.
                    return;
                }
            }

            warn!(
                "Presence subscription for {} ended, resubscribing in {:?}",
                self.user_id, backoff
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn handle_change(
        &self,
        change: DocumentChange,
        seen: &mut HashSet<Uuid>,
        tx: &mpsc::UnboundedSender<PresenceEvent>,
    ) -> Result<(), ()> {
        match change.change_type {
            ChangeType::Added => {
                let record: CallRecord = match serde_json::from_value(change.doc) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Ignoring malformed call record: {}", e);
                        return Ok(());
                    }
                };

                if !seen.insert(record.id) {
                    debug!("Suppressing duplicate incoming notification for {}", record.id);
                    return Ok(());
                }

                // Out-of-order delivery guard: only ring for a call that
                // still exists in `calling` state right now.
                if !self.still_ringing(record.id).await {
                    debug!("Incoming call {} already gone, not ringing", record.id);
                    return Ok(());
                }

                tx.unbounded_send(PresenceEvent::Incoming(record))
                    .map_err(|_| ())
            }
            ChangeType::Removed => {
                let Some(id) = parse_id(&change.doc) else {
                    return Ok(());
                };
                seen.remove(&id);
                tx.unbounded_send(PresenceEvent::Cancelled(id)).map_err(|_| ())
            }
            // Still inside the ringing filter; nothing new to surface.
            ChangeType::Modified => Ok(()),
        }
    }

    async fn still_ringing(&self, call_id: Uuid) -> bool {
        let filter = Filter::new()
            .eq("id", call_id)
            .eq("status", CallStatus::Calling.as_str());
        match self.store.query(CALLS_COLLECTION, &filter).await {
            Ok(rows) => !rows.is_empty(),
            Err(e) => {
                // A just-delivered add is almost certainly live; ring rather
                // than drop a real call on a transient read failure.
                warn!("Existence re-check for {} failed: {}", call_id, e);
                true
            }
        }
    }
}

fn parse_id(doc: &Value) -> Option<Uuid> {
    doc.get("id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}
