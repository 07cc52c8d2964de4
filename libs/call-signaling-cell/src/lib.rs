// libs/call-signaling-cell/src/lib.rs
//! # Call Signaling Cell
//!
//! This cell provides real-time one-to-one call signaling between patients
//! and doctors, using the shared document store as the only signaling
//! transport - no message broker or socket server.
//!
//! ## Features
//!
//! - **Call lifecycle**: initiate, answer, reject, hang up; monotonic
//!   status transitions on the persisted record
//! - **Call admission**: one open call per receiver, checked at creation
//! - **Presence**: live incoming-call notifications via store subscription,
//!   deduplicated and re-checked against current state
//! - **Audio cues**: ringtone/ringback tied to phase transitions, tolerant
//!   of playback failure
//! - **Cleanup**: guaranteed teardown of subscriptions, timers and cues on
//!   both success and failure paths
//!
//! ## Architecture
//!
//! The cell follows the established cell architecture pattern:
//!
//! ```text
//! +-----------------------------------------------------+
//! |                Call Signaling Cell                  |
//! +-----------------------------------------------------+
//! |  models.rs      |  Call records, phases, errors     |
//! |  services/      |  Business logic layer             |
//! |    repository.rs|  Call record CRUD + admission     |
//! |    presence.rs  |  Incoming-call watcher            |
//! |    session.rs   |  Call state machine + facade      |
//! |    audio.rs     |  Ringtone/ringback reconciler     |
//! +-----------------------------------------------------+
//! ```
//!
//! Control flow: UI action -> `CallSession` -> `CallRepository` (writes) ->
//! signaling store -> `PresenceWatcher` on the peer (subscription) ->
//! phase update -> `AudioCueController` (side effect).
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use call_signaling_cell::services::{CallSession, NullCuePlayer};
//! use call_signaling_cell::models::CallType;
//! use shared_config::AppConfig;
//! use shared_database::SupabaseClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env();
//! let store = Arc::new(SupabaseClient::new(&config));
//!
//! let session = CallSession::open("doctor-17", store, Arc::new(NullCuePlayer), &config);
//! let call_id = session.initiate_call("patient-42", CallType::Video).await?;
//! // ... later
//! session.hangup_call(call_id).await?;
//! session.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Environment variables (see `shared-config`):
//! - `SIGNALING_STORE_URL`, `SIGNALING_STORE_ANON_KEY` - store endpoint
//! - `SIGNALING_POLL_INTERVAL_MS` - subscription poll interval
//! - `CALL_RING_TIMEOUT_SECS` - optional auto-cancel for unanswered rings
//! - `CALL_RETAIN_HISTORY` - keep terminally closed records instead of
//!   deleting them

pub mod models;
pub mod services;

// Re-export commonly used types
pub use models::{
    ActiveCall, CallPhase, CallRecord, CallSignalingError, CallStatus, CallType, CloseReason,
};

pub use services::{
    AudioCue, AudioCueController, CallRepository, CallSession, CuePlayer, NullCuePlayer,
    PresenceEvent, PresenceWatcher,
};
