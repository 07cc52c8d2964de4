// libs/shared/database/src/memory.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use serde_json::Value;

use crate::filter::Filter;
use crate::store::{ChangeType, DocumentChange, DocumentStream, SignalingStore, StoreError};

/// In-process signaling store with query-scoped change fan-out.
///
/// Used by the test suites and by embedders that bring their own transport;
/// behaves like the REST store, including the subscription semantics
/// (initial `Added` snapshot, `Removed` when a document is edited out of a
/// subscription's filter).
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, HashMap<String, Value>>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    collection: String,
    filter: Filter,
    tx: mpsc::UnboundedSender<DocumentChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn doc_id(doc: &Value) -> Result<String, StoreError> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(|id| id.to_string())
        .ok_or_else(|| StoreError::InvalidDocument("document has no string 'id' field".into()))
}

impl Inner {
    fn notify(&mut self, collection: &str, old: Option<&Value>, new: Option<&Value>) {
        self.subscribers.retain(|sub| {
            if sub.collection != collection {
                return !sub.tx.is_closed();
            }
            let was = old.map(|d| sub.filter.matches(d)).unwrap_or(false);
            let is = new.map(|d| sub.filter.matches(d)).unwrap_or(false);
            let change = match (was, is) {
                (false, true) => Some(DocumentChange {
                    change_type: ChangeType::Added,
                    doc: new.cloned().unwrap_or(Value::Null),
                }),
                (true, false) => Some(DocumentChange {
                    change_type: ChangeType::Removed,
                    doc: old.cloned().unwrap_or(Value::Null),
                }),
                (true, true) => Some(DocumentChange {
                    change_type: ChangeType::Modified,
                    doc: new.cloned().unwrap_or(Value::Null),
                }),
                (false, false) => None,
            };
            match change {
                Some(change) => sub.tx.unbounded_send(change).is_ok(),
                None => !sub.tx.is_closed(),
            }
        });
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn insert(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, doc.clone());
        inner.notify(collection, None, Some(&doc));
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
    ) -> Result<u64, StoreError> {
        let patch = patch
            .as_object()
            .ok_or_else(|| StoreError::InvalidDocument("patch must be an object".into()))?
            .clone();

        let mut inner = self.inner.lock().unwrap();
        let matched: Vec<(String, Value)> = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| filter.matches(doc))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (id, old) in &matched {
            let mut updated = old.clone();
            if let Some(obj) = updated.as_object_mut() {
                for (k, v) in &patch {
                    obj.insert(k.clone(), v.clone());
                }
            }
            if let Some(docs) = inner.collections.get_mut(collection) {
                docs.insert(id.clone(), updated.clone());
            }
            inner.notify(collection, Some(old), Some(&updated));
        }

        Ok(matched.len() as u64)
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let matched: Vec<(String, Value)> = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| filter.matches(doc))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (id, old) in &matched {
            if let Some(docs) = inner.collections.get_mut(collection) {
                docs.remove(id);
            }
            inner.notify(collection, Some(old), None);
        }

        Ok(matched.len() as u64)
    }

    async fn subscribe(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<DocumentStream, StoreError> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.inner.lock().unwrap();

        // Initial snapshot, delivered as Added.
        if let Some(docs) = inner.collections.get(collection) {
            for doc in docs.values().filter(|doc| filter.matches(doc)) {
                let _ = tx.unbounded_send(DocumentChange {
                    change_type: ChangeType::Added,
                    doc: doc.clone(),
                });
            }
        }

        inner.subscribers.push(Subscriber {
            collection: collection.to_string(),
            filter,
            tx,
        });

        Ok(rx)
    }
}
