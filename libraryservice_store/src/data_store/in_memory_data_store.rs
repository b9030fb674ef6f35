use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::api::{matches_all, Document, DocumentId, DocumentStream, FieldFilter};
use crate::data_store::{DataStore, DataStoreError};

const CHANGES_CHANNEL_CAPACITY: usize = 64;

type Collections = HashMap<String, BTreeMap<DocumentId, Document>>;

pub struct InMemoryDataStore {
    collections: Arc<parking_lot::RwLock<Collections>>,
    changes: broadcast::Sender<String>,
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);
        Self {
            collections: Default::default(),
            changes,
        }
    }
}

impl InMemoryDataStore {
    fn notify_changed(&self, collection: &str) {
        // nobody listening is fine
        let _ = self.changes.send(collection.to_string());
    }

    fn merge_into(document: &mut Document, fields: Document) {
        let mut merged = Value::Object(std::mem::take(document));
        json_patch::merge(&mut merged, &Value::Object(fields));
        if let Value::Object(map) = merged {
            *document = map;
        }
    }
}

fn snapshot(
    collections: &parking_lot::RwLock<Collections>,
    collection: &str,
    filters: &[FieldFilter],
) -> Vec<Document> {
    collections
        .read()
        .get(collection)
        .map(|documents| {
            documents
                .values()
                .filter(|document| matches_all(filters, document))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

struct Subscription {
    collections: Arc<parking_lot::RwLock<Collections>>,
    receiver: broadcast::Receiver<String>,
    collection: String,
    filters: Vec<FieldFilter>,
    initial_sent: bool,
}

impl Subscription {
    fn snapshot(&self) -> Vec<Document> {
        snapshot(&self.collections, &self.collection, &self.filters)
    }
}

#[async_trait::async_trait]
impl DataStore for InMemoryDataStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DataStoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[FieldFilter],
    ) -> Result<Vec<Document>, DataStoreError> {
        Ok(snapshot(&self.collections, collection, filters))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        document: Document,
    ) -> Result<(), DataStoreError> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        self.notify_changed(collection);
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> Result<(), DataStoreError> {
        self.update_if(collection, id, &[], fields).await
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        expected: &[FieldFilter],
        fields: Document,
    ) -> Result<(), DataStoreError> {
        {
            let mut locked_collections = self.collections.write();
            let document = locked_collections
                .get_mut(collection)
                .and_then(|documents| documents.get_mut(id))
                .ok_or_else(|| DataStoreError::not_found(collection, id))?;

            if !matches_all(expected, document) {
                return Err(DataStoreError::condition_failed(collection, id));
            }
            Self::merge_into(document, fields);
        }
        self.notify_changed(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, DataStoreError> {
        let removed = self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|documents| documents.remove(id))
            .is_some();
        if removed {
            self.notify_changed(collection);
        }
        Ok(removed)
    }

    fn subscribe(&self, collection: &str, filters: Vec<FieldFilter>) -> DocumentStream {
        let subscription = Subscription {
            collections: self.collections.clone(),
            receiver: self.changes.subscribe(),
            collection: collection.to_string(),
            filters,
            initial_sent: false,
        };

        stream::unfold(subscription, |mut subscription| async move {
            if !subscription.initial_sent {
                subscription.initial_sent = true;
                let documents = subscription.snapshot();
                return Some((Ok(documents), subscription));
            }
            loop {
                match subscription.receiver.recv().await {
                    Ok(changed) if changed == subscription.collection => {
                        let documents = subscription.snapshot();
                        return Some((Ok(documents), subscription));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            "Subscription on {} lagged by {} changes",
                            subscription.collection,
                            skipped
                        );
                        let documents = subscription.snapshot();
                        return Some((Ok(documents), subscription));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
