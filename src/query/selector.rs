// Query selection - decides which named queries a collector runs
//
// Selection rules, applied to every candidate name on its own:
// 1. A non-empty include list acts as a whitelist
// 2. A name in the exclude list is always dropped, even if it is also included
// 3. With both lists empty, every catalog entry runs

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::catalog::{self, QueryVersion};
use super::{QueryDefinition, QuerySet};

/// Name-based include/exclude filter over query names
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl QueryFilter {
    /// Creates a filter from the configured include and exclude lists
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        QueryFilter {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the query with this name should run
    pub fn accepts(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.contains(name) {
            return false;
        }
        !self.exclude.contains(name)
    }
}

/// Builds the active query set from a catalog version and a filter
#[derive(Debug, Clone)]
pub struct QuerySelector {
    version: QueryVersion,
    extended_metrics: bool,
    filter: QueryFilter,
}

impl QuerySelector {
    /// Creates a selector
    ///
    /// # Arguments
    /// * `version` - Which built-in catalog to use
    /// * `extended_metrics` - Also consider the Azure SQL DB resource queries
    /// * `filter` - Include/exclude filter applied to every candidate
    pub fn new(version: QueryVersion, extended_metrics: bool, filter: QueryFilter) -> Self {
        QuerySelector {
            version,
            extended_metrics,
            filter,
        }
    }

    /// Built-in queries this selector chooses from, before filtering
    pub fn candidates(&self) -> Vec<QueryDefinition> {
        let mut candidates = Vec::new();
        if self.extended_metrics {
            candidates.extend(catalog::extended_catalog());
        }
        candidates.extend(catalog::catalog(self.version));
        candidates
    }

    /// Selects from an arbitrary catalog
    ///
    /// An empty result is valid: it simply means no gather units will run.
    pub fn select_from<I>(&self, catalog: I) -> QuerySet
    where
        I: IntoIterator<Item = QueryDefinition>,
    {
        let mut queries = QuerySet::new();

        for query in catalog {
            if self.filter.accepts(&query.name) {
                queries.insert(query.name.clone(), Arc::new(query));
            } else {
                debug!("Query '{}' filtered out", query.name);
            }
        }

        queries
    }
}
