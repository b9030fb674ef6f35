use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use libraryservice_store::api::Document;

use crate::error::DomainError;

pub(crate) fn to_document<T: Serialize>(entity: &T) -> Result<Document, DomainError> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(DomainError::MalformedDocument(serde::ser::Error::custom(
            format!("expected an object, got {other}"),
        ))),
    }
}

pub(crate) fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, DomainError> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

pub(crate) fn from_documents<T: DeserializeOwned>(
    documents: Vec<Document>,
) -> Result<Vec<T>, DomainError> {
    documents.into_iter().map(from_document).collect()
}

/// Document holding only the given fields, used for merges
pub(crate) fn fields<const N: usize>(entries: [(&str, Value); N]) -> Document {
    entries
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect()
}
