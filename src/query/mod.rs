// Query module - the named diagnostic queries and the logic choosing which of them run
//
// Query texts are opaque: the collector never parses or rewrites them, it only
// selects them by name and hands them to the connector verbatim.

use std::collections::BTreeMap;
use std::sync::Arc;

pub mod catalog;
pub mod selector;

pub use catalog::QueryVersion;
pub use selector::{QueryFilter, QuerySelector};

/// A named diagnostic query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinition {
    /// Stable identifier used by the include/exclude filters
    pub name: String,

    /// Query text sent to the server as-is
    pub text: String,
}

impl QueryDefinition {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        QueryDefinition {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// The active queries of a collector, keyed by query name
///
/// Built once and shared read-only between all gather units.
pub type QuerySet = BTreeMap<String, Arc<QueryDefinition>>;
