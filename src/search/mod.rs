//! Best-effort denormalized copy of medicine and pharmacy attributes in a
//! search index. Like the cache it is advisory: failures are logged by
//! callers and the index self-heals on the next update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Index operation failed: {0}")]
    OperationFailed(String),
}

/// Denormalized medicine document, one per medicine, keyed by medicine id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicineDocument {
    pub id: i32,
    pub name: String,
    pub generic_name: Option<String>,
    pub manufacturer: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub requires_prescription: bool,
    pub unit_price: f64,
    pub stock_quantity: i32,
    pub pharmacy_id: i32,
    pub pharmacy_name: String,
    pub pharmacy_city: String,
    pub is_24_hours: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates or replaces the document for a medicine.
    async fn index(&self, doc: &MedicineDocument) -> Result<(), SearchError>;

    /// Partially updates the document with the given fields.
    async fn update(&self, medicine_id: i32, fields: Value) -> Result<(), SearchError>;

    /// Removes the document.
    async fn delete(&self, medicine_id: i32) -> Result<(), SearchError>;
}

/// Elasticsearch-compatible HTTP index client.
pub struct ElasticSearchIndex {
    http: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticSearchIndex {
    pub fn new(base_url: String, index: String, timeout: Duration) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            index,
        })
    }

    fn doc_url(&self, medicine_id: i32) -> String {
        format!("{}/{}/_doc/{}", self.base_url, self.index, medicine_id)
    }

    fn update_url(&self, medicine_id: i32) -> String {
        format!("{}/{}/_update/{}", self.base_url, self.index, medicine_id)
    }

    fn check(response: reqwest::Response) -> Result<(), SearchError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SearchError::OperationFailed(format!(
                "index returned {status}"
            )))
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticSearchIndex {
    async fn index(&self, doc: &MedicineDocument) -> Result<(), SearchError> {
        let response = self
            .http
            .put(self.doc_url(doc.id))
            .json(doc)
            .send()
            .await?;
        debug!(medicine_id = doc.id, "medicine document indexed");
        Self::check(response)
    }

    async fn update(&self, medicine_id: i32, fields: Value) -> Result<(), SearchError> {
        let response = self
            .http
            .post(self.update_url(medicine_id))
            .json(&json!({ "doc": fields }))
            .send()
            .await?;
        Self::check(response)
    }

    async fn delete(&self, medicine_id: i32) -> Result<(), SearchError> {
        let response = self.http.delete(self.doc_url(medicine_id)).send().await?;
        Self::check(response)
    }
}

/// In-memory index for tests and runs without a search backend.
#[derive(Clone, Default)]
pub struct InMemorySearchIndex {
    docs: Arc<Mutex<HashMap<i32, Value>>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, medicine_id: i32) -> Option<Value> {
        self.docs.lock().unwrap().get(&medicine_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index(&self, doc: &MedicineDocument) -> Result<(), SearchError> {
        let value = serde_json::to_value(doc)?;
        self.docs.lock().unwrap().insert(doc.id, value);
        Ok(())
    }

    async fn update(&self, medicine_id: i32, fields: Value) -> Result<(), SearchError> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs.entry(medicine_id).or_insert_with(|| json!({}));
        if let (Some(doc), Some(fields)) = (doc.as_object_mut(), fields.as_object()) {
            for (key, value) in fields {
                doc.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, medicine_id: i32) -> Result<(), SearchError> {
        self.docs.lock().unwrap().remove(&medicine_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: i32, stock_quantity: i32) -> MedicineDocument {
        MedicineDocument {
            id,
            name: "Paracetamol 500mg".to_string(),
            generic_name: Some("Acetaminophen".to_string()),
            manufacturer: None,
            description: None,
            category: Some("analgesic".to_string()),
            requires_prescription: false,
            unit_price: 4.5,
            stock_quantity,
            pharmacy_id: 1,
            pharmacy_name: "Central Pharmacy".to_string(),
            pharmacy_city: "lisbon".to_string(),
            is_24_hours: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn partial_update_only_touches_given_fields() {
        let index = InMemorySearchIndex::new();
        index.index(&doc(1, 40)).await.unwrap();

        index
            .update(1, json!({"stock_quantity": 37}))
            .await
            .unwrap();

        let stored = index.document(1).unwrap();
        assert_eq!(stored["stock_quantity"], 37);
        assert_eq!(stored["name"], "Paracetamol 500mg");
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let index = InMemorySearchIndex::new();
        index.index(&doc(2, 5)).await.unwrap();
        index.delete(2).await.unwrap();
        assert!(index.document(2).is_none());
    }
}
