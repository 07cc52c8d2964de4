// libs/shared/database/src/supabase.rs
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use shared_config::AppConfig;

use crate::filter::Filter;
use crate::store::{ChangeType, DocumentChange, DocumentStream, SignalingStore, StoreError};

/// Signaling store backed by the Supabase REST API (PostgREST).
///
/// Live subscriptions are realized as a polling diff loop over the filtered
/// query; the poll interval comes from configuration.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    service_key: String,
    poll_interval: Duration,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.signaling_store_url.clone(),
            anon_key: config.signaling_store_anon_key.clone(),
            service_key: config.signaling_store_service_key.clone(),
            poll_interval: Duration::from_millis(config.signaling_poll_interval_ms),
        }
    }

    fn get_headers(&self, prefer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key).unwrap());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let bearer = if self.service_key.is_empty() {
            &self.anon_key
        } else {
            &self.service_key
        };
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", bearer)).unwrap(),
        );

        if let Some(prefer) = prefer {
            headers.insert("Prefer", HeaderValue::from_str(prefer).unwrap());
        }

        headers
    }

    fn collection_path(&self, collection: &str, filter: &Filter) -> String {
        if filter.is_empty() {
            format!("/rest/v1/{}", collection)
        } else {
            format!("/rest/v1/{}?{}", collection, filter.to_query_string())
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        prefer: Option<&str>,
        body: Option<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let headers = self.get_headers(prefer);

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Store API error ({}): {}", status, error_text);
            return Err(StoreError::Unavailable(format!(
                "API error ({}): {}",
                status, error_text
            )));
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))
    }
}

#[async_trait]
impl SignalingStore for SupabaseClient {
    async fn insert(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let path = format!("/rest/v1/{}", collection);
        self.request(Method::POST, &path, Some("return=representation"), Some(doc))
            .await?;
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let path = self.collection_path(collection, filter);
        self.request(Method::GET, &path, None, None).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
    ) -> Result<u64, StoreError> {
        let path = self.collection_path(collection, filter);
        let rows = self
            .request(Method::PATCH, &path, Some("return=representation"), Some(patch))
            .await?;
        Ok(rows.len() as u64)
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let path = self.collection_path(collection, filter);
        let rows = self
            .request(Method::DELETE, &path, Some("return=representation"), None)
            .await?;
        Ok(rows.len() as u64)
    }

    async fn subscribe(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<DocumentStream, StoreError> {
        let (tx, rx) = mpsc::unbounded();
        let client = self.clone();
        let collection = collection.to_string();

        tokio::spawn(async move {
            let mut known: HashMap<String, Value> = HashMap::new();

            loop {
                match client.query(&collection, &filter).await {
                    Ok(rows) => {
                        let current: HashMap<String, Value> = rows
                            .into_iter()
                            .filter_map(|doc| {
                                doc.get("id")
                                    .and_then(Value::as_str)
                                    .map(|id| (id.to_string(), doc.clone()))
                            })
                            .collect();

                        let mut changes = Vec::new();
                        for (id, doc) in &known {
                            if !current.contains_key(id) {
                                changes.push(DocumentChange {
                                    change_type: ChangeType::Removed,
                                    doc: doc.clone(),
                                });
                            }
                        }
                        for (id, doc) in &current {
                            match known.get(id) {
                                None => changes.push(DocumentChange {
                                    change_type: ChangeType::Added,
                                    doc: doc.clone(),
                                }),
                                Some(old) if old != doc => changes.push(DocumentChange {
                                    change_type: ChangeType::Modified,
                                    doc: doc.clone(),
                                }),
                                Some(_) => {}
                            }
                        }
                        known = current;

                        for change in changes {
                            if tx.unbounded_send(change).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        // Keep the snapshot; a transient poll failure must not
                        // surface as every document being removed.
                        warn!("Subscription poll on '{}' failed: {}", collection, e);
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(client.poll_interval).await;
            }
        });

        Ok(rx)
    }
}
