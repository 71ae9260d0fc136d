// Configuration module - loads and validates the collector settings
//
// This module is responsible for:
// 1. Reading settings from a local JSON file, or
// 2. Fetching them from the MonitoringSettings collection in MongoDB by key
// 3. Validating the result before anything is scheduled

use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::connector::ServerTarget;
use crate::query::QueryVersion;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MongoDB connection failed: {0}")]
    MongoConnectionError(#[from] mongodb::error::Error),

    #[error("Failed to read settings file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Settings document not found for key: {0}")]
    SettingsNotFound(String),

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),

    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),
}

/// Collector settings
///
/// The same structure is read from a JSON file or from a document in the
/// MonitoringSettings collection (where `key` identifies the node).
///
/// # Example
/// ```json
/// {
///   "key": "db-node-1",
///   "servers": [
///     "Server=192.168.1.10;Port=1433;User Id=telegraf;Password=<pw>;app name=telegraf;"
///   ],
///   "query_version": 2,
///   "azuredb": false,
///   "exclude_query": ["Schedulers", "SqlRequests"],
///   "tag_keys": ["sql_instance", "database_name"],
///   "interval": 10
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Node identifier, stored with every metric document
    pub key: String,

    /// Connection strings of the instances to monitor
    pub servers: Vec<ServerTarget>,

    /// Catalog version: 1 (legacy dashboards) or 2 (SQL Server 2012+, Azure SQL DB)
    pub query_version: QueryVersion,

    /// Also run the Azure SQL DB resource queries
    pub azuredb: bool,

    /// Only run these queries (all when empty)
    pub include_query: Vec<String>,

    /// Never run these queries, even when included
    pub exclude_query: Vec<String>,

    /// Result columns reported as tags instead of fields
    pub tag_keys: Vec<String>,

    /// Add integrated-security targets for SQL Server instances running locally
    pub local_instances_auto_discovery: bool,

    /// Seconds between gather cycles
    pub interval: u64,

    /// MongoDB collection receiving the metric documents
    pub collection: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        CollectorSettings {
            key: "local".to_string(),
            servers: Vec::new(),
            query_version: QueryVersion::default(),
            azuredb: false,
            include_query: Vec::new(),
            exclude_query: Vec::new(),
            tag_keys: Vec::new(),
            local_instances_auto_discovery: false,
            interval: 10,
            collection: "sqlserver_metrics".to_string(),
        }
    }
}

impl CollectorSettings {
    /// Parses settings from a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: CollectorSettings = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads and parses settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading settings from file: {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Checks settings that would make the collector useless or unschedulable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::InvalidSettings(
                "interval must be at least 1 second".to_string(),
            ));
        }

        if self.servers.is_empty() && !self.local_instances_auto_discovery {
            return Err(ConfigError::MissingRequiredSetting(
                "servers (or local_instances_auto_discovery)".to_string(),
            ));
        }

        if self.collection.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("collection".to_string()));
        }

        Ok(())
    }

    /// Logs the effective settings, with credentials masked
    pub fn log_summary(&self) {
        info!("Query version: {}", self.query_version);
        info!("Azure DB metrics: {}", self.azuredb);
        for server in &self.servers {
            info!("  Server: {}", server);
        }
        if !self.include_query.is_empty() {
            info!("Included queries: {:?}", self.include_query);
        }
        if !self.exclude_query.is_empty() {
            info!("Excluded queries: {:?}", self.exclude_query);
        }
        if !self.tag_keys.is_empty() {
            info!("Tag keys: {:?}", self.tag_keys);
        }
        info!(
            "Interval: {}s, collection: '{}', local discovery: {}",
            self.interval, self.collection, self.local_instances_auto_discovery
        );
    }
}

/// Configuration manager backed by MongoDB
///
/// Handles MongoDB connection and settings retrieval. The same client is
/// reused by the storage module for writing metrics.
pub struct ConfigManager {
    /// MongoDB client instance
    client: Client,

    /// Database name where MonitoringSettings collection resides
    database_name: String,
}

impl ConfigManager {
    /// Creates a new ConfigManager and establishes MongoDB connection
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI (e.g., "mongodb://localhost:27017")
    /// * `database_name` - Name of the database to use (optional, defaults to "monitoring")
    ///
    /// # Returns
    /// * `Ok(ConfigManager)` - Successfully connected to MongoDB
    /// * `Err(ConfigError)` - Connection failed
    pub async fn new(
        connection_string: &str,
        database_name: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let client = Client::with_uri_str(connection_string).await?;

        // Verify connection by listing databases (lightweight operation)
        match client.list_database_names(None, None).await {
            Ok(_) => info!("Successfully connected to MongoDB"),
            Err(e) => {
                warn!("MongoDB connection verification failed: {}", e);
                return Err(ConfigError::MongoConnectionError(e));
            }
        }

        let database_name = database_name.unwrap_or("monitoring").to_string();

        Ok(ConfigManager {
            client,
            database_name,
        })
    }

    fn get_database(&self) -> Database {
        self.client.database(&self.database_name)
    }

    /// Fetches collector settings from MongoDB for a specific key
    ///
    /// # MongoDB Query
    /// Executes: `db.MonitoringSettings.findOne({ key: "<key>" })`
    pub async fn load_settings(&self, key: &str) -> Result<CollectorSettings, ConfigError> {
        info!("Loading collector settings for key: {}", key);

        let collection: Collection<CollectorSettings> =
            self.get_database().collection("MonitoringSettings");

        let filter = mongodb::bson::doc! { "key": key };

        match collection.find_one(filter, None).await? {
            Some(settings) => {
                settings.validate()?;
                info!(
                    "Loaded settings with {} server(s) for key '{}'",
                    settings.servers.len(),
                    settings.key
                );
                Ok(settings)
            }
            None => {
                warn!("No settings found for key: {}", key);
                Err(ConfigError::SettingsNotFound(key.to_string()))
            }
        }
    }

    /// Returns a reference to the MongoDB client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the database name
    pub fn database_name(&self) -> &str {
        &self.database_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_settings() {
        let json = r#"{
            "key": "db-node-1",
            "servers": ["Server=db01;User Id=telegraf;Password=secret;"],
            "query_version": 2,
            "azuredb": true,
            "include_query": ["Cpu", "MemoryClerk"],
            "exclude_query": ["Schedulers"],
            "tag_keys": ["sql_instance"],
            "local_instances_auto_discovery": false,
            "interval": 30,
            "collection": "mssql"
        }"#;

        let settings = CollectorSettings::from_json(json).unwrap();

        assert_eq!(settings.key, "db-node-1");
        assert_eq!(settings.servers.len(), 1);
        assert_eq!(settings.query_version, QueryVersion::V2);
        assert!(settings.azuredb);
        assert_eq!(settings.include_query, vec!["Cpu", "MemoryClerk"]);
        assert_eq!(settings.exclude_query, vec!["Schedulers"]);
        assert_eq!(settings.tag_keys, vec!["sql_instance"]);
        assert_eq!(settings.interval, 30);
        assert_eq!(settings.collection, "mssql");
    }

    #[test]
    fn test_defaults_apply() {
        let settings = CollectorSettings::from_json(r#"{"servers": ["Server=db01;"]}"#).unwrap();

        assert_eq!(settings.query_version, QueryVersion::V1);
        assert!(!settings.azuredb);
        assert!(settings.include_query.is_empty());
        assert_eq!(settings.interval, 10);
        assert_eq!(settings.collection, "sqlserver_metrics");
    }

    #[test]
    fn test_rejects_unknown_query_version() {
        let result = CollectorSettings::from_json(r#"{"servers": ["Server=db01;"], "query_version": 3}"#);
        assert!(matches!(result, Err(ConfigError::InvalidSettings(_))));
    }

    #[test]
    fn test_requires_a_target_source() {
        let result = CollectorSettings::from_json("{}");
        assert!(matches!(result, Err(ConfigError::MissingRequiredSetting(_))));

        let discovery_only =
            CollectorSettings::from_json(r#"{"local_instances_auto_discovery": true}"#);
        assert!(discovery_only.is_ok());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = CollectorSettings::from_json(r#"{"servers": ["Server=db01;"], "interval": 0}"#);
        assert!(matches!(result, Err(ConfigError::InvalidSettings(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = CollectorSettings::from_file("/nonexistent/sqlserver-collector.json");
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
