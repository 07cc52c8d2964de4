use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use futures::channel::mpsc;
use serde_json::{json, Value};
use uuid::Uuid;

use call_signaling_cell::models::{CallPhase, CallSignalingError, CallType};
use call_signaling_cell::services::{AudioCue, CallSession, NullCuePlayer};
use shared_config::AppConfig;
use shared_database::{
    ChangeType, DocumentChange, DocumentStream, Filter, SignalingStore, StoreError,
};

mockall::mock! {
    Store {}

    #[async_trait::async_trait]
    impl SignalingStore for Store {
        async fn insert(&self, collection: &str, doc: Value) -> Result<(), StoreError>;
        async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;
        async fn update(
            &self,
            collection: &str,
            filter: &Filter,
            patch: Value,
        ) -> Result<u64, StoreError>;
        async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
        async fn subscribe(
            &self,
            collection: &str,
            filter: Filter,
        ) -> Result<DocumentStream, StoreError>;
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        signaling_store_url: "http://localhost:54321".to_string(),
        signaling_store_anon_key: "test-anon-key".to_string(),
        signaling_store_service_key: String::new(),
        signaling_poll_interval_ms: 50,
        call_ring_timeout_secs: None,
        call_retain_history: false,
    }
}

fn down() -> StoreError {
    StoreError::Unavailable("store is down".to_string())
}

fn silent_stream() -> DocumentStream {
    let (tx, rx) = mpsc::unbounded();
    std::mem::forget(tx);
    rx
}

fn ringing_doc(call_id: Uuid) -> Value {
    json!({
        "id": call_id,
        "caller_id": "caller-1",
        "receiver_id": "receiver-1",
        "call_type": "voice",
        "status": "calling",
        "created_at": Utc::now(),
    })
}

/// Mock where the presence subscription immediately delivers one ringing
/// call, so the session under test reaches `RingingIn`.
fn store_with_incoming(call_id: Uuid) -> MockStore {
    let mut store = MockStore::new();
    store.expect_subscribe().returning(move |_, filter| {
        if filter.to_query_string().contains("receiver_id") {
            let (tx, rx) = mpsc::unbounded();
            tx.unbounded_send(DocumentChange {
                change_type: ChangeType::Added,
                doc: ringing_doc(call_id),
            })
            .unwrap();
            std::mem::forget(tx);
            Ok(rx)
        } else {
            Ok(silent_stream())
        }
    });
    // Existence re-check by the presence watcher.
    store
        .expect_query()
        .returning(move |_, _| Ok(vec![ringing_doc(call_id)]));
    store
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), deadline)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for: {}", what));
}

#[tokio::test]
async fn test_initiate_with_store_down_leaves_idle_and_silent() {
    let mut store = MockStore::new();
    store.expect_subscribe().returning(|_, _| Ok(silent_stream()));
    store.expect_query().returning(|_, _| Err(down()));

    let session = CallSession::open("caller-1", Arc::new(store), Arc::new(NullCuePlayer), &test_config());

    let err = session.initiate_call("receiver-1", CallType::Voice).await.unwrap_err();
    assert_matches!(err, CallSignalingError::Store(_));

    // No partial state, no cue.
    assert_eq!(session.phase(), CallPhase::Idle);
    assert!(session.active_call().is_none());
    assert!(!session.cue_engaged(AudioCue::Ringback));
}

#[tokio::test]
async fn test_initiate_with_failing_insert_leaves_idle() {
    let mut store = MockStore::new();
    store.expect_subscribe().returning(|_, _| Ok(silent_stream()));
    store.expect_query().returning(|_, _| Ok(vec![]));
    store.expect_insert().returning(|_, _| Err(down()));

    let session = CallSession::open("caller-1", Arc::new(store), Arc::new(NullCuePlayer), &test_config());

    let err = session.initiate_call("receiver-1", CallType::Voice).await.unwrap_err();
    assert_matches!(err, CallSignalingError::Store(_));
    assert_eq!(session.phase(), CallPhase::Idle);
    assert!(!session.cue_engaged(AudioCue::Ringback));
}

#[tokio::test]
async fn test_answer_with_store_down_keeps_ringing_state_but_silences_cue() {
    let call_id = Uuid::new_v4();
    let mut store = store_with_incoming(call_id);
    store.expect_update().returning(|_, _, _| Err(down()));

    let session = CallSession::open("receiver-1", Arc::new(store), Arc::new(NullCuePlayer), &test_config());
    wait_until("session is ringing", || session.phase() == CallPhase::RingingIn).await;
    assert!(session.cue_engaged(AudioCue::Ringtone));

    let err = session.answer_call(call_id).await.unwrap_err();
    assert_matches!(err, CallSignalingError::Store(_));

    // No optimistic transition: still ringing-in, incoming call intact.
    assert_eq!(session.phase(), CallPhase::RingingIn);
    assert_eq!(session.incoming_call().unwrap().id, call_id);
    assert!(session.active_call().is_none());
    // The ringtone was silenced on the user's tap regardless.
    assert!(!session.cue_engaged(AudioCue::Ringtone));
}

#[tokio::test]
async fn test_answer_lost_race_clears_stale_ring() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let call_id = Uuid::new_v4();
    // Set once the losing update runs: the caller cancelled, so any
    // later query must see no record.
    let gone = Arc::new(AtomicBool::new(false));

    let mut store = MockStore::new();
    store.expect_subscribe().returning(move |_, filter| {
        if filter.to_query_string().contains("receiver_id") {
            let (tx, rx) = mpsc::unbounded();
            tx.unbounded_send(DocumentChange {
                change_type: ChangeType::Added,
                doc: ringing_doc(call_id),
            })
            .unwrap();
            std::mem::forget(tx);
            Ok(rx)
        } else {
            Ok(silent_stream())
        }
    });
    let query_gone = gone.clone();
    store.expect_query().returning(move |_, _| {
        if query_gone.load(Ordering::SeqCst) {
            Ok(vec![])
        } else {
            Ok(vec![ringing_doc(call_id)])
        }
    });
    let update_gone = gone.clone();
    store.expect_update().returning(move |_, _, _| {
        update_gone.store(true, Ordering::SeqCst);
        // Zero rows matched: the caller cancelled first.
        Ok(0)
    });

    let session = CallSession::open("receiver-1", Arc::new(store), Arc::new(NullCuePlayer), &test_config());
    wait_until("session is ringing", || session.phase() == CallPhase::RingingIn).await;

    let err = session.answer_call(call_id).await.unwrap_err();
    assert_matches!(err, CallSignalingError::CallNotFound);

    assert_eq!(session.phase(), CallPhase::Idle);
    assert!(session.incoming_call().is_none());
    assert!(!session.cue_engaged(AudioCue::Ringtone));
}

#[tokio::test]
async fn test_reject_with_store_down_keeps_state_and_propagates() {
    let call_id = Uuid::new_v4();
    let mut store = store_with_incoming(call_id);
    store.expect_delete().returning(|_, _| Err(down()));

    let session = CallSession::open("receiver-1", Arc::new(store), Arc::new(NullCuePlayer), &test_config());
    wait_until("session is ringing", || session.phase() == CallPhase::RingingIn).await;

    let err = session.reject_call(call_id).await.unwrap_err();
    assert_matches!(err, CallSignalingError::Store(_));

    // Stale-but-consistent: the record was not closed, so the incoming
    // call stays; only the cue was silenced on the user's action.
    assert_eq!(session.phase(), CallPhase::RingingIn);
    assert!(session.incoming_call().is_some());
    assert!(!session.cue_engaged(AudioCue::Ringtone));
}

#[tokio::test]
async fn test_hangup_with_store_down_keeps_active_call() {
    let mut store = MockStore::new();
    store.expect_subscribe().returning(|_, _| Ok(silent_stream()));
    store.expect_query().returning(|_, _| Ok(vec![]));
    store.expect_insert().returning(|_, _| Ok(()));
    store.expect_delete().returning(|_, _| Err(down()));

    let session = CallSession::open("caller-1", Arc::new(store), Arc::new(NullCuePlayer), &test_config());
    let call_id = session.initiate_call("receiver-1", CallType::Voice).await.unwrap();
    assert_eq!(session.phase(), CallPhase::RingingOut);

    let err = session.hangup_call(call_id).await.unwrap_err();
    assert_matches!(err, CallSignalingError::Store(_));

    assert_eq!(session.phase(), CallPhase::RingingOut);
    assert_eq!(session.active_call().unwrap().id, call_id);
    assert!(!session.cue_engaged(AudioCue::Ringback));
}
