// libs/call-signaling-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_database::StoreError;

// ==============================================================================
// CALL SIGNALING DOMAIN MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "voice")]
    Voice,
    #[serde(rename = "video")]
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }
}

/// Persisted lifecycle state of a call record.
///
/// Transitions are monotonic: `calling -> connected -> ended`,
/// `calling -> rejected`, or `calling -> ended` (caller cancels before
/// answer). Terminal states are immutable; the repository enforces this
/// with conditional writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallStatus {
    #[serde(rename = "calling")]
    Calling,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "ended")]
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Connected => "connected",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CallStatus::Calling | CallStatus::Connected)
    }
}

/// The one persisted entity of this subsystem, stored in the `calls`
/// collection of the signaling store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The call this client is currently party to, as caller or receiver.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActiveCall {
    pub id: Uuid,
    pub call_type: CallType,
}

/// Local call phase of one client. Terminal closes land back in `Idle`;
/// the terminal status (`rejected`/`ended`) lives on the persisted record.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    #[default]
    Idle,
    /// Caller side, waiting for the receiver to answer.
    RingingOut,
    /// Receiver side, incoming call not yet answered.
    RingingIn,
    Connected,
}

/// Why a call record is being terminally closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Rejected,
    Ended,
}

impl CloseReason {
    pub fn terminal_status(&self) -> CallStatus {
        match self {
            CloseReason::Rejected => CallStatus::Rejected,
            CloseReason::Ended => CallStatus::Ended,
        }
    }
}

// ==============================================================================
// ERROR HANDLING
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CallSignalingError {
    #[error("Receiver is currently in another call")]
    ReceiverBusy,

    #[error("Call no longer exists")]
    CallNotFound,

    #[error("No active call matches id {0}")]
    NoActiveCall(Uuid),

    #[error("Signaling store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid call record: {0}")]
    InvalidRecord(String),
}

impl From<serde_json::Error> for CallSignalingError {
    fn from(err: serde_json::Error) -> Self {
        CallSignalingError::InvalidRecord(err.to_string())
    }
}
