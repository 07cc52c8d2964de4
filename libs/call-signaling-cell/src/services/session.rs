// libs/call-signaling-cell/src/services/session.rs
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{ChangeType, Filter, SignalingStore};

use crate::models::{
    ActiveCall, CallPhase, CallRecord, CallSignalingError, CallStatus, CallType, CloseReason,
};
use crate::services::audio::{AudioCueController, CuePlayer};
use crate::services::presence::{PresenceEvent, PresenceWatcher};
use crate::services::repository::{CallRepository, CALLS_COLLECTION};

#[derive(Debug, Clone, Default)]
struct SessionState {
    phase: CallPhase,
    incoming: Option<CallRecord>,
    active: Option<ActiveCall>,
}

/// One user's call session: the state machine for a single one-to-one
/// call, the presence watch for incoming calls, and the audio cues tied
/// to phase transitions.
///
/// All transitions - user actions, watcher deliveries, timers - are
/// serialized through one transition lock; the state machine is never
/// mutated concurrently. Local state changes only after the store has
/// confirmed the corresponding write, with one deliberate exception:
/// ringtone/ringback stop immediately on user action, so silencing tracks
/// the user's tap rather than network latency.
pub struct CallSession {
    core: Arc<SessionCore>,
}

struct SessionCore {
    // Self-handle for spawning tasks that call back into the core.
    this: Weak<SessionCore>,
    user_id: String,
    repo: CallRepository,
    store: Arc<dyn SignalingStore>,
    cues: AudioCueController,
    ring_timeout: Option<Duration>,
    state: StdMutex<SessionState>,
    transition: Mutex<()>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    /// Open a session for `user_id`: starts the presence watch and begins
    /// surfacing incoming calls. `close` (or drop) tears everything down.
    pub fn open(
        user_id: impl Into<String>,
        store: Arc<dyn SignalingStore>,
        player: Arc<dyn CuePlayer>,
        config: &AppConfig,
    ) -> Self {
        let user_id = user_id.into();
        let core = Arc::new_cyclic(|this| SessionCore {
            this: this.clone(),
            user_id: user_id.clone(),
            repo: CallRepository::new(store.clone(), config.call_retain_history),
            store,
            cues: AudioCueController::new(player),
            ring_timeout: config.call_ring_timeout_secs.map(Duration::from_secs),
            state: StdMutex::new(SessionState::default()),
            transition: Mutex::new(()),
            tasks: StdMutex::new(Vec::new()),
        });

        let (watcher_handle, mut events) =
            PresenceWatcher::new(core.store.clone(), user_id.clone()).spawn();
        core.register_task(watcher_handle);

        let pump_core = core.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                pump_core.handle_presence_event(event).await;
            }
        });
        core.register_task(pump);

        info!("Call session opened for {}", user_id);
        Self { core }
    }

    /// Start a call. Returns the new call id, or `ReceiverBusy` if either
    /// endpoint is already party to an open call.
    pub async fn initiate_call(
        &self,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<Uuid, CallSignalingError> {
        self.core.initiate_call(receiver_id, call_type).await
    }

    /// Answer the currently ringing incoming call.
    pub async fn answer_call(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        self.core.answer_call(call_id).await
    }

    /// Decline the currently ringing incoming call.
    pub async fn reject_call(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        self.core.reject_call(call_id).await
    }

    /// Hang up the active call: cancels an unanswered outgoing call, or
    /// ends a connected one.
    pub async fn hangup_call(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        self.core.hangup_call(call_id).await
    }

    pub fn user_id(&self) -> &str {
        &self.core.user_id
    }

    pub fn phase(&self) -> CallPhase {
        self.core.state.lock().unwrap().phase
    }

    pub fn incoming_call(&self) -> Option<CallRecord> {
        self.core.state.lock().unwrap().incoming.clone()
    }

    pub fn active_call(&self) -> Option<ActiveCall> {
        self.core.state.lock().unwrap().active.clone()
    }

    /// Whether the given cue is currently engaged; observability hook for
    /// the UI and for tests.
    pub fn cue_engaged(&self, cue: crate::services::audio::AudioCue) -> bool {
        self.core.cues.is_engaged(cue)
    }

    /// Tear the session down: abort the presence watch, call watches and
    /// timers, silence any cue still playing, and reset local state.
    pub fn close(&self) {
        for handle in self.core.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.core.cues.stop_all();
        *self.core.state.lock().unwrap() = SessionState::default();
        debug!("Call session for {} closed", self.core.user_id);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionCore {
    fn register_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn initiate_call(
        &self,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<Uuid, CallSignalingError> {
        let _guard = self.transition.lock().await;

        {
            let state = self.state.lock().unwrap();
            if state.phase != CallPhase::Idle || state.incoming.is_some() {
                debug!(
                    "initiate_call by {} refused: local phase is {:?}",
                    self.user_id, state.phase
                );
                return Err(CallSignalingError::ReceiverBusy);
            }
        }
        // Fail fast if a record already targets this client as receiver;
        // the local watcher may not have delivered it yet.
        if self.repo.open_call_for_receiver(&self.user_id).await?.is_some() {
            return Err(CallSignalingError::ReceiverBusy);
        }

        info!(
            "User {} initiating {} call to {}",
            self.user_id,
            call_type.as_str(),
            receiver_id
        );
        let record = self.repo.create_call(&self.user_id, receiver_id, call_type).await?;

        {
            let mut state = self.state.lock().unwrap();
            state.phase = CallPhase::RingingOut;
            state.active = Some(ActiveCall {
                id: record.id,
                call_type,
            });
        }
        self.cues.sync_to_phase(CallPhase::RingingOut);
        self.spawn_call_watch(record.id);
        self.spawn_ring_timeout(record.id, CallPhase::RingingOut);

        Ok(record.id)
    }

    async fn answer_call(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        let _guard = self.transition.lock().await;

        let incoming = {
            let state = self.state.lock().unwrap();
            match &state.incoming {
                Some(record) if record.id == call_id => record.clone(),
                _ => {
                    warn!("answer_call {}: no matching incoming call", call_id);
                    return Err(CallSignalingError::NoActiveCall(call_id));
                }
            }
        };

        // Silence the ring on the user's tap, before the store round-trip.
        self.cues.stop_all();

        match self.repo.set_connected(call_id).await {
            Ok(_answered_at) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.incoming = None;
                    state.active = Some(ActiveCall {
                        id: call_id,
                        call_type: incoming.call_type,
                    });
                    state.phase = CallPhase::Connected;
                }
                self.cues.sync_to_phase(CallPhase::Connected);
                self.spawn_call_watch(call_id);
                Ok(())
            }
            Err(CallSignalingError::CallNotFound) => {
                // Caller cancelled while we were answering. Clear the
                // stale ring and report the benign race.
                {
                    let mut state = self.state.lock().unwrap();
                    state.incoming = None;
                    state.phase = CallPhase::Idle;
                }
                self.cues.sync_to_phase(CallPhase::Idle);
                self.resurface_pending_ring().await;
                Err(CallSignalingError::CallNotFound)
            }
            // Store failure: no local transition, the UI decides on retry.
            Err(e) => Err(e),
        }
    }

    async fn reject_call(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        let _guard = self.transition.lock().await;
        self.reject_locked(call_id).await
    }

    /// Body of `reject_call`; the caller holds the transition lock.
    async fn reject_locked(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        {
            let state = self.state.lock().unwrap();
            if state.incoming.as_ref().map(|r| r.id) != Some(call_id) {
                warn!("reject_call {}: no matching incoming call", call_id);
                return Err(CallSignalingError::NoActiveCall(call_id));
            }
        }

        self.cues.stop_all();
        self.repo.close_call(call_id, CloseReason::Rejected).await?;

        {
            let mut state = self.state.lock().unwrap();
            state.incoming = None;
            state.phase = CallPhase::Idle;
        }
        self.cues.sync_to_phase(CallPhase::Idle);
        info!("User {} rejected call {}", self.user_id, call_id);
        self.resurface_pending_ring().await;
        Ok(())
    }

    async fn hangup_call(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        let _guard = self.transition.lock().await;
        self.hangup_locked(call_id).await
    }

    /// Body of `hangup_call`; the caller holds the transition lock.
    async fn hangup_locked(&self, call_id: Uuid) -> Result<(), CallSignalingError> {
        {
            let state = self.state.lock().unwrap();
            if state.active.as_ref().map(|a| a.id) != Some(call_id) {
                warn!("hangup_call {}: no matching active call", call_id);
                return Err(CallSignalingError::NoActiveCall(call_id));
            }
        }

        // Either cue may still be running; stop both unconditionally.
        self.cues.stop_all();
        self.repo.close_call(call_id, CloseReason::Ended).await?;

        {
            let mut state = self.state.lock().unwrap();
            state.active = None;
            state.phase = CallPhase::Idle;
        }
        self.cues.sync_to_phase(CallPhase::Idle);
        info!("User {} hung up call {}", self.user_id, call_id);
        self.resurface_pending_ring().await;
        Ok(())
    }

    async fn handle_presence_event(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::Incoming(record) => {
                let _guard = self.transition.lock().await;
                {
                    let mut state = self.state.lock().unwrap();
                    if state.phase != CallPhase::Idle {
                        // Already in a call flow; the remote ring will be
                        // cancelled by its own timeout or caller.
                        debug!(
                            "Ignoring incoming call {} while {:?}",
                            record.id, state.phase
                        );
                        return;
                    }
                    info!(
                        "Incoming {} call {} from {} for {}",
                        record.call_type.as_str(),
                        record.id,
                        record.caller_id,
                        self.user_id
                    );
                    state.phase = CallPhase::RingingIn;
                    state.incoming = Some(record.clone());
                }
                self.cues.sync_to_phase(CallPhase::RingingIn);
                self.spawn_ring_timeout(record.id, CallPhase::RingingIn);
            }
            PresenceEvent::Cancelled(call_id) => {
                let _guard = self.transition.lock().await;
                let cleared = {
                    let mut state = self.state.lock().unwrap();
                    if state.phase == CallPhase::RingingIn
                        && state.incoming.as_ref().map(|r| r.id) == Some(call_id)
                    {
                        state.incoming = None;
                        state.phase = CallPhase::Idle;
                        true
                    } else {
                        false
                    }
                };
                if cleared {
                    info!("Incoming call {} withdrawn before answer", call_id);
                    self.cues.sync_to_phase(CallPhase::Idle);
                    self.resurface_pending_ring().await;
                }
            }
        }
    }

    /// Pick up a ring that arrived while this session was busy.
    ///
    /// The presence watcher emits each call id once; an `Incoming` event
    /// delivered mid-call is dropped, but the record stays `calling` in
    /// the store. Every transition back to `Idle` therefore re-queries
    /// for an open call addressed to this user and rings for it, so a
    /// live caller is not left waiting on a record nobody surfaces.
    /// The caller holds the transition lock.
    async fn resurface_pending_ring(&self) {
        {
            let state = self.state.lock().unwrap();
            if state.phase != CallPhase::Idle || state.incoming.is_some() {
                return;
            }
        }

        let record = match self.repo.open_call_for_receiver(&self.user_id).await {
            Ok(Some(record)) if record.status == CallStatus::Calling => record,
            Ok(_) => return,
            Err(e) => {
                warn!("Pending-ring check for {} failed: {}", self.user_id, e);
                return;
            }
        };

        info!(
            "Surfacing waiting {} call {} from {} for {}",
            record.call_type.as_str(),
            record.id,
            record.caller_id,
            self.user_id
        );
        {
            let mut state = self.state.lock().unwrap();
            state.phase = CallPhase::RingingIn;
            state.incoming = Some(record.clone());
        }
        self.cues.sync_to_phase(CallPhase::RingingIn);
        self.spawn_ring_timeout(record.id, CallPhase::RingingIn);
    }

    /// Watch one call record for the peer's transitions: the receiver
    /// answering (caller side) and the record being terminally closed
    /// (either side).
    fn spawn_call_watch(&self, call_id: Uuid) {
        let Some(core) = self.this.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let filter = Filter::new().eq("id", call_id);
            let mut stream = match core.store.subscribe(CALLS_COLLECTION, filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Call watch for {} failed to subscribe: {}", call_id, e);
                    return;
                }
            };

            while let Some(change) = stream.next().await {
                match change.change_type {
                    ChangeType::Removed => {
                        core.on_call_closed_remotely(call_id).await;
                        return;
                    }
                    ChangeType::Added | ChangeType::Modified => {
                        match change.doc.get("status").and_then(Value::as_str) {
                            Some(status) if status == CallStatus::Connected.as_str() => {
                                core.on_peer_answered(call_id).await;
                            }
                            Some(status)
                                if status == CallStatus::Rejected.as_str()
                                    || status == CallStatus::Ended.as_str() =>
                            {
                                core.on_call_closed_remotely(call_id).await;
                                return;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
        self.register_task(handle);
    }

    async fn on_peer_answered(&self, call_id: Uuid) {
        let _guard = self.transition.lock().await;
        let transitioned = {
            let mut state = self.state.lock().unwrap();
            if state.phase == CallPhase::RingingOut
                && state.active.as_ref().map(|a| a.id) == Some(call_id)
            {
                state.phase = CallPhase::Connected;
                true
            } else {
                false
            }
        };
        if transitioned {
            info!("Call {} answered by peer", call_id);
            self.cues.sync_to_phase(CallPhase::Connected);
        }
    }

    async fn on_call_closed_remotely(&self, call_id: Uuid) {
        let _guard = self.transition.lock().await;
        let cleared = {
            let mut state = self.state.lock().unwrap();
            let matches_active = state.active.as_ref().map(|a| a.id) == Some(call_id);
            let matches_incoming = state.incoming.as_ref().map(|r| r.id) == Some(call_id);
            if matches_active || matches_incoming {
                state.active = None;
                if matches_incoming {
                    state.incoming = None;
                }
                state.phase = CallPhase::Idle;
                true
            } else {
                false
            }
        };
        if cleared {
            info!("Call {} closed by peer", call_id);
            self.cues.sync_to_phase(CallPhase::Idle);
            self.resurface_pending_ring().await;
        }
    }

    /// Auto-cancel an unanswered ring after the configured timeout.
    fn spawn_ring_timeout(&self, call_id: Uuid, ringing_phase: CallPhase) {
        let Some(timeout) = self.ring_timeout else {
            return;
        };
        let Some(core) = self.this.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            // Re-check under the transition lock: an answer that landed
            // while the timer slept must not be torn down.
            let _guard = core.transition.lock().await;
            let still_ringing = {
                let state = core.state.lock().unwrap();
                match ringing_phase {
                    CallPhase::RingingOut => {
                        state.phase == CallPhase::RingingOut
                            && state.active.as_ref().map(|a| a.id) == Some(call_id)
                    }
                    CallPhase::RingingIn => {
                        state.phase == CallPhase::RingingIn
                            && state.incoming.as_ref().map(|r| r.id) == Some(call_id)
                    }
                    _ => false,
                }
            };
            if !still_ringing {
                return;
            }

            info!("Call {} unanswered after {:?}, cancelling", call_id, timeout);
            let result = match ringing_phase {
                CallPhase::RingingOut => core.hangup_locked(call_id).await,
                _ => core.reject_locked(call_id).await,
            };
            if let Err(e) = result {
                // The ring resolved while we raced the timer; nothing to do.
                debug!("Ring timeout cleanup for {} skipped: {}", call_id, e);
            }
        });
        self.register_task(handle);
    }
}
