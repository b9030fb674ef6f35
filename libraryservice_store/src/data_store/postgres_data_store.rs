use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio_postgres::{Client, NoTls, Statement};

use crate::api::{filters_to_object, Document, DocumentStream, FieldFilter};
use crate::data_store::{DataStore, DataStoreError};

pub struct PostgresDataStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Upper bound for a single database round trip
    pub operation_timeout: Duration,
    /// How often subscriptions re-read their collection
    pub poll_interval: Duration,
}

pub struct PostgresDataStore {
    client: Arc<Client>,
    operation_timeout: Duration,
    poll_interval: Duration,
}

impl PostgresDataStore {
    pub async fn init(config: PostgresDataStoreConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
        tracing::info!("Postgres host: {}", config.hostname);
        let (client, connection) = tokio_postgres::connect(&connection_str, NoTls)
            .await
            .context("Failed to start postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("connection error: {}", e);
            }
        });

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS documents (
            collection      TEXT NOT NULL,
            id              TEXT NOT NULL,
            params          JSONB NOT NULL,
            PRIMARY KEY (collection, id)
            )
        ",
            )
            .await
            .context("Failed to setup documents table")?;

        Ok(Self {
            client: Arc::new(client),
            operation_timeout: config.operation_timeout,
            poll_interval: config.poll_interval,
        })
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, DataStoreError>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        with_timeout(self.operation_timeout, operation).await
    }

    async fn exists(&self, collection: &str, id: &str) -> Result<bool, DataStoreError> {
        Ok(self.get(collection, id).await?.is_some())
    }
}

async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T, DataStoreError>
where
    F: Future<Output = Result<T, tokio_postgres::Error>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DataStoreError::Unavailable(format!(
            "database did not answer within {}ms",
            timeout.as_millis()
        ))),
    }
}

async fn select_documents(
    client: &Client,
    timeout: Duration,
    collection: &str,
    filters: &[FieldFilter],
) -> Result<Vec<Document>, DataStoreError> {
    let containment = filters_to_object(filters);
    let rows = with_timeout(
        timeout,
        client.query(
            "SELECT params FROM documents WHERE collection = $1 AND params @> $2 ORDER BY id",
            &[&collection, &containment],
        ),
    )
    .await?;

    rows.iter()
        .map(|row| {
            let params: Value = row.try_get(0)?;
            Ok(serde_json::from_value(params)?)
        })
        .collect()
}

fn expect_document(value: Value) -> Result<Document, DataStoreError> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait::async_trait]
impl DataStore for PostgresDataStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DataStoreError> {
        let stmt: Statement = self
            .bounded(
                self.client
                    .prepare("SELECT params FROM documents WHERE collection = $1 AND id = $2"),
            )
            .await?;

        let rows = self
            .bounded(self.client.query(&stmt, &[&collection, &id]))
            .await?;

        match rows.first() {
            Some(row) => {
                let params: Value = row.try_get(0)?;
                Ok(Some(expect_document(params)?))
            }
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[FieldFilter],
    ) -> Result<Vec<Document>, DataStoreError> {
        select_documents(&self.client, self.operation_timeout, collection, filters).await
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        document: Document,
    ) -> Result<(), DataStoreError> {
        let stmt: Statement = self
            .bounded(self.client.prepare(
                "INSERT INTO documents (collection, id, params) VALUES ($1, $2, $3)
                 ON CONFLICT (collection, id) DO UPDATE SET params = EXCLUDED.params",
            ))
            .await?;

        let params = Value::Object(document);
        self.bounded(self.client.execute(&stmt, &[&collection, &id, &params]))
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> Result<(), DataStoreError> {
        let stmt: Statement = self
            .bounded(self.client.prepare(
                "UPDATE documents SET params = params || $3
                 WHERE collection = $1 AND id = $2 RETURNING id",
            ))
            .await?;

        let fields = Value::Object(fields);
        let rows = self
            .bounded(self.client.query(&stmt, &[&collection, &id, &fields]))
            .await?;

        if rows.is_empty() {
            Err(DataStoreError::not_found(collection, id))
        } else {
            Ok(())
        }
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        expected: &[FieldFilter],
        fields: Document,
    ) -> Result<(), DataStoreError> {
        let stmt: Statement = self
            .bounded(self.client.prepare(
                "UPDATE documents SET params = params || $3
                 WHERE collection = $1 AND id = $2 AND params @> $4 RETURNING id",
            ))
            .await?;

        let fields = Value::Object(fields);
        let containment = filters_to_object(expected);
        let rows = self
            .bounded(
                self.client
                    .query(&stmt, &[&collection, &id, &fields, &containment]),
            )
            .await?;

        if !rows.is_empty() {
            Ok(())
        } else if self.exists(collection, id).await? {
            Err(DataStoreError::condition_failed(collection, id))
        } else {
            Err(DataStoreError::not_found(collection, id))
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, DataStoreError> {
        let stmt: Statement = self
            .bounded(self.client.prepare(
                "DELETE FROM documents WHERE collection = $1 AND id = $2 RETURNING id",
            ))
            .await?;

        let rows = self
            .bounded(self.client.query(&stmt, &[&collection, &id]))
            .await?;
        Ok(!rows.is_empty())
    }

    fn subscribe(&self, collection: &str, filters: Vec<FieldFilter>) -> DocumentStream {
        let client = self.client.clone();
        let timeout = self.operation_timeout;
        let collection = collection.to_string();
        let poll_interval = self.poll_interval;

        // Emits on the first tick and afterwards only when the snapshot changed
        stream::unfold(
            (None::<tokio::time::Interval>, None::<Vec<Document>>),
            move |(mut interval, mut last)| {
                let client = client.clone();
                let collection = collection.clone();
                let filters = filters.clone();
                async move {
                    let ticker =
                        interval.get_or_insert_with(|| tokio::time::interval(poll_interval));
                    loop {
                        ticker.tick().await;
                        match select_documents(&client, timeout, &collection, &filters).await {
                            Ok(documents) if last.as_ref() == Some(&documents) => continue,
                            Ok(documents) => {
                                last = Some(documents.clone());
                                return Some((Ok(documents), (interval, last)));
                            }
                            Err(err) => return Some((Err(err), (interval, last))),
                        }
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests_postgres_data_store {
    use serde_json::json;
    use serial_test::file_serial;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use super::*;

    async fn start_postgres_container_and_init_store() -> (ContainerAsync<GenericImage>, PostgresDataStore)
    {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        for _ in 0..10 {
            if let Ok(store) = PostgresDataStore::init(PostgresDataStoreConfig {
                hostname: "127.0.0.1".to_string(),
                username: "postgres".to_string(),
                password: "postgres".to_string(),
                operation_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(50),
            })
            .await
            {
                return (_pg_container, store);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        panic!("Failed to setup postgres container")
    }

    fn document(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Covers document management against real database
    /// Combined into big unit test to avoid starting container multiple times
    /// 1. Gets missing document
    /// 2. Sets documents, gets and queries them
    /// 3. Merges an update
    /// 4. Conditional update with stale and fresh expectations
    /// 5. Deletes
    async fn test_document_management() {
        let (_container, store) = start_postgres_container_and_init_store().await;

        assert_eq!(store.get("books", "b1").await.unwrap(), None);

        let book = document(json!({"id": "b1", "title": "Dune", "stock": 1}));
        store.set("books", "b1", book.clone()).await.unwrap();
        store
            .set(
                "books",
                "b2",
                document(json!({"id": "b2", "title": "1984", "stock": 0})),
            )
            .await
            .unwrap();

        assert_eq!(store.get("books", "b1").await.unwrap(), Some(book));
        let in_stock = store
            .query("books", &[FieldFilter::new("stock", 1)])
            .await
            .unwrap();
        assert_eq!(in_stock.len(), 1);
        assert_eq!(in_stock[0]["id"], json!("b1"));
        assert_eq!(store.query("books", &[]).await.unwrap().len(), 2);

        store
            .update("books", "b1", document(json!({"stock": 2})))
            .await
            .unwrap();
        assert_eq!(
            store.get("books", "b1").await.unwrap().unwrap()["title"],
            json!("Dune")
        );

        let stale = store
            .update_if(
                "books",
                "b1",
                &[FieldFilter::new("stock", 1)],
                document(json!({"stock": 0})),
            )
            .await;
        assert!(matches!(
            stale,
            Err(DataStoreError::ConditionFailed { .. })
        ));

        store
            .update_if(
                "books",
                "b1",
                &[FieldFilter::new("stock", 2)],
                document(json!({"stock": 1})),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get("books", "b1").await.unwrap().unwrap()["stock"],
            json!(1)
        );

        let missing = store
            .update_if("books", "b9", &[], document(json!({"stock": 1})))
            .await;
        assert!(matches!(missing, Err(DataStoreError::NotFound { .. })));

        assert!(store.delete("books", "b1").await.unwrap());
        assert!(!store.delete("books", "b1").await.unwrap());
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Polling subscription emits the first snapshot and then only changed snapshots
    async fn test_subscription() {
        let (_container, store) = start_postgres_container_and_init_store().await;

        let mut borrowings = store.subscribe("borrowings", vec![]);
        assert_eq!(borrowings.next().await.unwrap().unwrap(), vec![]);

        store
            .set(
                "borrowings",
                "l1",
                document(json!({"id": "l1", "status": "active"})),
            )
            .await
            .unwrap();

        let snapshot = borrowings.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0]["status"], json!("active"));
    }
}
