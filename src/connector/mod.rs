// Connector module - the seam between the gather engine and the database driver
//
// The engine only needs three things from a driver:
// 1. Open a connection for a server target
// 2. Run an opaque query text and stream back rows with their column names
// 3. Close the connection again
//
// Everything driver specific lives behind the traits below, so the engine can
// be exercised with in-memory fakes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::decode::RawRow;

pub mod mssql;

pub use mssql::MssqlConnector;

/// Stream of decoded-but-unclassified rows of one query
pub type RowStream<'a> = BoxStream<'a, Result<RawRow, ConnectorError>>;

/// Errors reported by a driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    /// The target is unreachable or refused the connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server rejected or failed the query
    #[error("query failed: {0}")]
    Execute(String),

    /// A column value has no representation as a metric value
    #[error("unsupported column value: {0}")]
    Conversion(String),
}

/// Opaque connection descriptor for one server instance
///
/// Usually an ADO style connection string such as
/// `Server=192.168.1.10;Port=1433;User Id=telegraf;Password=secret;`.
/// `Display` masks passwords so targets can be logged safely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerTarget(String);

impl ServerTarget {
    pub fn new(descriptor: impl Into<String>) -> Self {
        ServerTarget(descriptor.into())
    }

    /// Returns the unmasked descriptor, for handing to the driver only
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mask_credentials(&self.0))
    }
}

/// Masks password values in `key=value;` connection strings
///
/// # Example
/// ```text
/// Server=db01;User Id=sa;Password=secret;
/// becomes
/// Server=db01;User Id=sa;Password=****;
/// ```
pub fn mask_credentials(descriptor: &str) -> String {
    descriptor
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if is_secret_key(key) => format!("{}=****", key),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn is_secret_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    key == "password" || key == "pwd"
}

/// Opens connections to server targets
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a fresh connection dedicated to one gather unit
    ///
    /// # Errors
    /// `ConnectorError::Connect` if the target is unreachable or refuses us
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn Connection>, ConnectorError>;
}

/// A live connection owned by exactly one gather unit
#[async_trait]
pub trait Connection: Send {
    /// Runs the query text verbatim and streams its rows
    ///
    /// Column names are reported by the driver once per result set and
    /// shared by all rows of that set.
    async fn query<'a>(&'a mut self, text: &'a str) -> Result<RowStream<'a>, ConnectorError>;

    /// Releases the connection
    async fn close(self: Box<Self>) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_credentials() {
        let target = "Server=192.168.1.10;Port=1433;User Id=telegraf;Password=s3cret;app name=telegraf;";
        assert_eq!(
            mask_credentials(target),
            "Server=192.168.1.10;Port=1433;User Id=telegraf;Password=****;app name=telegraf;"
        );

        assert_eq!(mask_credentials("server=db;PWD=x"), "server=db;PWD=****");

        let no_auth = "Server=HOST\\SQLEXPRESS;Integrated Security=SSPI;";
        assert_eq!(mask_credentials(no_auth), no_auth);
    }

    #[test]
    fn test_server_target_display_is_masked() {
        let target = ServerTarget::new("Server=db01;Password=hunter2;");
        assert_eq!(target.to_string(), "Server=db01;Password=****;");
        assert_eq!(target.as_str(), "Server=db01;Password=hunter2;");
    }
}
