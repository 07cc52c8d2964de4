// libs/call-signaling-cell/src/services/repository.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::{Filter, SignalingStore};

use crate::models::{CallRecord, CallSignalingError, CallStatus, CallType, CloseReason};

pub const CALLS_COLLECTION: &str = "calls";

const OPEN_STATUSES: &[&str] = &["calling", "connected"];

/// Thin operations over call records in the signaling store.
///
/// Enforces the one-open-call-per-receiver invariant at creation time and
/// keeps status transitions monotonic through conditional writes.
#[derive(Clone)]
pub struct CallRepository {
    store: Arc<dyn SignalingStore>,
    /// When set, closed calls are marked `ended`/`rejected` instead of
    /// being deleted.
    retain_history: bool,
}

impl CallRepository {
    pub fn new(store: Arc<dyn SignalingStore>, retain_history: bool) -> Self {
        Self {
            store,
            retain_history,
        }
    }

    /// Create a new `calling` record after the admission check.
    ///
    /// The check is an explicit read immediately before the insert; the
    /// window between the two is accepted for a two-party calling feature
    /// (see DESIGN.md).
    pub async fn create_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<CallRecord, CallSignalingError> {
        if self.open_call_for_receiver(receiver_id).await?.is_some() {
            debug!("Admission rejected: {} already has an open call", receiver_id);
            return Err(CallSignalingError::ReceiverBusy);
        }

        let record = CallRecord {
            id: Uuid::new_v4(),
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            call_type,
            status: CallStatus::Calling,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        };

        self.store
            .insert(CALLS_COLLECTION, serde_json::to_value(&record)?)
            .await?;

        info!(
            "Created {} call {} from {} to {}",
            call_type.as_str(),
            record.id,
            caller_id,
            receiver_id
        );
        Ok(record)
    }

    /// Move a `calling` record to `connected`, setting `answered_at` once.
    ///
    /// Conditional on the record still being in `calling`; if the other
    /// party already cancelled or the record moved on, this reports
    /// `CallNotFound` — a recoverable race, not a fatal error.
    pub async fn set_connected(
        &self,
        call_id: Uuid,
    ) -> Result<DateTime<Utc>, CallSignalingError> {
        let answered_at = Utc::now();
        let filter = Filter::new()
            .eq("id", call_id)
            .eq("status", CallStatus::Calling.as_str());
        let patch = json!({
            "status": CallStatus::Connected,
            "answered_at": answered_at,
        });

        let matched = self.store.update(CALLS_COLLECTION, &filter, patch).await?;
        if matched == 0 {
            debug!("set_connected {}: call already gone or past calling", call_id);
            return Err(CallSignalingError::CallNotFound);
        }

        info!("Call {} connected", call_id);
        Ok(answered_at)
    }

    /// Terminally close a call record. Idempotent: closing an already
    /// closed or missing call is a no-op.
    pub async fn close_call(
        &self,
        call_id: Uuid,
        reason: CloseReason,
    ) -> Result<(), CallSignalingError> {
        let filter = Filter::new()
            .eq("id", call_id)
            .is_in("status", OPEN_STATUSES);

        let matched = if self.retain_history {
            let patch = json!({
                "status": reason.terminal_status(),
                "ended_at": Utc::now(),
            });
            self.store.update(CALLS_COLLECTION, &filter, patch).await?
        } else {
            self.store.delete(CALLS_COLLECTION, &filter).await?
        };

        if matched == 0 {
            debug!("close_call {}: already closed", call_id);
        } else {
            info!("Closed call {} ({:?})", call_id, reason);
        }
        Ok(())
    }

    pub async fn get_call(&self, call_id: Uuid) -> Result<Option<CallRecord>, CallSignalingError> {
        let rows = self
            .store
            .query(CALLS_COLLECTION, &Filter::new().eq("id", call_id))
            .await?;
        rows.into_iter()
            .next()
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .transpose()
    }

    /// The admission query: any record with this receiver in an open status.
    pub async fn open_call_for_receiver(
        &self,
        receiver_id: &str,
    ) -> Result<Option<CallRecord>, CallSignalingError> {
        let filter = Filter::new()
            .eq("receiver_id", receiver_id)
            .is_in("status", OPEN_STATUSES);
        let rows = self.store.query(CALLS_COLLECTION, &filter).await?;
        rows.into_iter()
            .next()
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .transpose()
    }
}
