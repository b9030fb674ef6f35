pub use in_memory_data_store::InMemoryDataStore;
pub use postgres_data_store::{PostgresDataStore, PostgresDataStoreConfig};

use crate::api::{Document, DocumentStream, FieldFilter};

mod in_memory_data_store;
mod postgres_data_store;

#[derive(thiserror::Error, Debug)]
pub enum DataStoreError {
    #[error("Document {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("Document {id} in {collection} does not match the expected state")]
    ConditionFailed { collection: String, id: String },

    #[error("Failed to deserialize document: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl DataStoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn condition_failed(collection: &str, id: &str) -> Self {
        Self::ConditionFailed {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// Retrieves a document, `None` when there is no document with given id
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DataStoreError>;

    /// Lists documents of the collection for which every filter matches
    async fn query(
        &self,
        collection: &str,
        filters: &[FieldFilter],
    ) -> Result<Vec<Document>, DataStoreError>;

    /// Inserts the document or fully replaces the existing one
    async fn set(&self, collection: &str, id: &str, document: Document)
        -> Result<(), DataStoreError>;

    /// Merges fields into an existing document
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> Result<(), DataStoreError>;

    /// Merges fields into an existing document only if all `expected` filters match it,
    /// fails with `ConditionFailed` otherwise
    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        expected: &[FieldFilter],
        fields: Document,
    ) -> Result<(), DataStoreError>;

    /// Removes the document, returns false if there was nothing to remove
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, DataStoreError>;

    /// Live view of the documents matching filters
    fn subscribe(&self, collection: &str, filters: Vec<FieldFilter>) -> DocumentStream;
}
