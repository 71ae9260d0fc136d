// Storage module - writes gathered metric records to their destination
//
// This module is responsible for:
// 1. Converting metric records into BSON documents and inserting them into MongoDB
// 2. Printing records as JSON lines when no database is configured
// 3. Handling storage errors gracefully so a failed write never stops collection

use bson::{doc, Bson, Document};
use mongodb::{Client, Collection};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::decode::{MetricRecord, Value};

/// Errors that can occur during metric storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("MongoDB insert failed: {0}")]
    InsertError(#[from] mongodb::error::Error),

    #[error("Failed to serialize record: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// MongoDB metric storage
///
/// Every record becomes one document in the configured collection.
pub struct MetricStorage {
    /// MongoDB client for database operations
    client: Client,

    /// Database name where metrics are stored
    database_name: String,
}

impl MetricStorage {
    /// Creates a new MetricStorage instance
    ///
    /// # Arguments
    /// * `client` - MongoDB client (shared reference from ConfigManager)
    /// * `database_name` - Name of the database where metrics will be stored
    pub fn new(client: &Client, database_name: &str) -> Self {
        MetricStorage {
            client: client.clone(),
            database_name: database_name.to_string(),
        }
    }

    /// Stores a metric document in the specified collection
    ///
    /// # Returns
    /// * `Ok(())` - Successfully stored the metric
    /// * `Err(StorageError)` - Failed to store (network error, auth error, etc.)
    pub async fn store_metric(
        &self,
        collection_name: &str,
        document: Document,
    ) -> Result<(), StorageError> {
        let collection: Collection<Document> =
            self.client.database(&self.database_name).collection(collection_name);

        match collection.insert_one(document, None).await {
            Ok(result) => {
                debug!(
                    "Stored metric with id: {:?} in collection '{}'",
                    result.inserted_id, collection_name
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to store metric in collection '{}': {}",
                    collection_name, e
                );
                Err(StorageError::InsertError(e))
            }
        }
    }

    /// Stores a metric, retrying once on failure
    ///
    /// # Note
    /// This method never returns an error - it logs failures and continues.
    /// A failed insert must not hold up the records queued behind it.
    pub async fn store_metric_safe(
        &self,
        collection_name: &str,
        measurement: &str,
        document: Document,
    ) {
        const MAX_RETRIES: u32 = 1;

        for attempt in 0..=MAX_RETRIES {
            match self.store_metric(collection_name, document.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            "Stored {} metric after {} retry(ies)",
                            measurement, attempt
                        );
                    }
                    return;
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        error!(
                            "Failed to store {} metric (attempt {}): {}. Retrying...",
                            measurement,
                            attempt + 1,
                            e
                        );
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    } else {
                        error!(
                            "Failed to store {} metric after {} attempts: {}. Giving up.",
                            measurement,
                            attempt + 1,
                            e
                        );
                    }
                }
            }
        }
    }

    /// Creates the recommended indexes for a metric collection
    ///
    /// # Recommended Indexes
    /// - `node` + `measurement` + `timestamp` (compound) - per-series queries over time
    pub async fn create_indexes(&self, collection_name: &str) -> Result<(), StorageError> {
        use mongodb::options::IndexOptions;
        use mongodb::IndexModel;

        info!("Creating indexes for collection '{}'", collection_name);

        let collection: Collection<Document> =
            self.client.database(&self.database_name).collection(collection_name);

        let index = IndexModel::builder()
            .keys(doc! {
                "node": 1,
                "measurement": 1,
                "timestamp": -1  // Descending for most recent first
            })
            .options(
                IndexOptions::builder()
                    .name("node_measurement_timestamp_idx".to_string())
                    .build(),
            )
            .build();

        collection.create_index(index, None).await?;
        info!("Created indexes for collection '{}'", collection_name);
        Ok(())
    }
}

/// Converts a metric record into the stored document layout
///
/// # Document Structure
/// ```json
/// {
///   "node": "db-node-1",
///   "measurement": "sqlserver_cpu",
///   "timestamp": "2024-01-15T10:30:00Z",
///   "tags": { "sql_instance": "DB01" },
///   "fields": { "sqlserver_process_cpu": 12, "other_process_cpu": 3 }
/// }
/// ```
pub fn to_document(node_id: &str, record: &MetricRecord) -> Document {
    let mut tags = Document::new();
    for (key, value) in &record.tags {
        tags.insert(key.clone(), value.clone());
    }

    let mut fields = Document::new();
    for (key, value) in &record.fields {
        fields.insert(key.clone(), to_bson(value));
    }

    doc! {
        "node": node_id,
        "measurement": record.measurement.clone(),
        "timestamp": record.timestamp,
        "tags": tags,
        "fields": fields,
    }
}

fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Boolean(v) => Bson::Boolean(*v),
        Value::Integer(v) => Bson::Int64(*v),
        Value::Float(v) => Bson::Double(*v),
        Value::Text(v) => Bson::String(v.clone()),
        Value::Timestamp(v) => Bson::DateTime(bson::DateTime::from_chrono(*v)),
    }
}

/// Destination of gathered records
pub enum MetricSink {
    /// One JSON document per line on stdout
    Stdout,

    /// Documents in a MongoDB collection
    Mongo {
        storage: MetricStorage,
        collection: String,
    },
}

impl MetricSink {
    /// Writes one record; failures are logged, never returned
    pub async fn write(&self, node_id: &str, record: &MetricRecord) {
        match self {
            MetricSink::Stdout => match to_json_line(node_id, record) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to print {} metric: {}", record.measurement, e),
            },
            MetricSink::Mongo {
                storage,
                collection,
            } => {
                storage
                    .store_metric_safe(collection, &record.measurement, to_document(node_id, record))
                    .await;
            }
        }
    }
}

/// Renders a record as a single JSON line tagged with the node id
pub fn to_json_line(node_id: &str, record: &MetricRecord) -> Result<String, StorageError> {
    let mut value = serde_json::to_value(record)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("node".to_string(), serde_json::Value::from(node_id));
    }
    Ok(serde_json::to_string(&value)?)
}
