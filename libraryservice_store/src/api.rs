use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data_store::DataStoreError;

pub type DocumentId = String;

/// Flat key-value document as persisted in a collection
pub type Document = serde_json::Map<String, Value>;

/// Live view of a collection, first item is the current snapshot
pub type DocumentStream = BoxStream<'static, Result<Vec<Document>, DataStoreError>>;

/// Equality condition on a single document field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    /// Missing fields only match a `null` filter value
    pub fn matches(&self, document: &Document) -> bool {
        document.get(&self.field).unwrap_or(&Value::Null) == &self.value
    }
}

pub fn matches_all(filters: &[FieldFilter], document: &Document) -> bool {
    filters.iter().all(|filter| filter.matches(document))
}

/// Builds the JSON object whose containment is equivalent to all filters matching
pub fn filters_to_object(filters: &[FieldFilter]) -> Value {
    Value::Object(
        filters
            .iter()
            .map(|filter| (filter.field.clone(), filter.value.clone()))
            .collect(),
    )
}
