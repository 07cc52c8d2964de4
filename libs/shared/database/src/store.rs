// libs/shared/database/src/store.rs
use async_trait::async_trait;
use futures::channel::mpsc;
use serde_json::Value;
use thiserror::Error;

use crate::filter::Filter;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("signaling store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// How a document moved relative to a subscription's filtered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub change_type: ChangeType,
    /// For `Removed`, the last known contents of the document.
    pub doc: Value,
}

pub type DocumentStream = mpsc::UnboundedReceiver<DocumentChange>;

/// Contract of the shared signaling store.
///
/// Documents are JSON objects carrying a string `id` field. `update` and
/// `delete` are conditional on the filter and report how many documents
/// matched, which is what makes status transitions monotonic under races:
/// a predicate like `id = X AND status = calling` matching zero rows tells
/// the caller the call is already gone or already past that state.
///
/// `subscribe` delivers changes relative to the *filtered* result set:
/// a document edited so that it no longer matches is delivered as
/// `Removed`, and the initial matching set is delivered as `Added`.
#[async_trait]
pub trait SignalingStore: Send + Sync {
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
