// Built-in query catalogs
//
// Two incompatible catalog versions exist. Version 1 keeps the measurement
// layout of the legacy dashboards; version 2 targets SQL Server 2012 and
// later (and Azure SQL DB) with a reworked layout. The Azure set holds the
// extra resource queries that are only added when extended metrics are on.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::QueryDefinition;

/// Which catalog version to draw queries from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QueryVersion {
    #[default]
    V1,
    V2,
}

impl TryFrom<u8> for QueryVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(QueryVersion::V1),
            2 => Ok(QueryVersion::V2),
            other => Err(format!("unsupported query_version {}, expected 1 or 2", other)),
        }
    }
}

impl From<QueryVersion> for u8 {
    fn from(version: QueryVersion) -> Self {
        match version {
            QueryVersion::V1 => 1,
            QueryVersion::V2 => 2,
        }
    }
}

impl fmt::Display for QueryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", u8::from(*self))
    }
}

/// Returns every query of the given catalog version
pub fn catalog(version: QueryVersion) -> Vec<QueryDefinition> {
    let table = match version {
        QueryVersion::V1 => V1,
        QueryVersion::V2 => V2,
    };
    to_definitions(table)
}

/// Returns the extended (Azure SQL DB) queries
pub fn extended_catalog() -> Vec<QueryDefinition> {
    to_definitions(AZURE)
}

fn to_definitions(table: &[(&str, &str)]) -> Vec<QueryDefinition> {
    table
        .iter()
        .map(|(name, text)| QueryDefinition::new(*name, *text))
        .collect()
}

const V1: &[(&str, &str)] = &[
    ("PerformanceCounters", include_str!("../../queries/v1/PerformanceCounters.sql")),
    ("WaitStatsCategorized", include_str!("../../queries/v1/WaitStatsCategorized.sql")),
    ("CPUHistory", include_str!("../../queries/v1/CPUHistory.sql")),
    ("DatabaseIO", include_str!("../../queries/v1/DatabaseIO.sql")),
    ("DatabaseSize", include_str!("../../queries/v1/DatabaseSize.sql")),
    ("DatabaseStats", include_str!("../../queries/v1/DatabaseStats.sql")),
    ("DatabaseProperties", include_str!("../../queries/v1/DatabaseProperties.sql")),
    ("MemoryClerk", include_str!("../../queries/v1/MemoryClerk.sql")),
    ("VolumeSpace", include_str!("../../queries/v1/VolumeSpace.sql")),
    ("PerformanceMetrics", include_str!("../../queries/v1/PerformanceMetrics.sql")),
];

const V2: &[(&str, &str)] = &[
    ("PerformanceCounters", include_str!("../../queries/v2/PerformanceCounters.sql")),
    ("WaitStatsCategorized", include_str!("../../queries/v2/WaitStatsCategorized.sql")),
    ("DatabaseIO", include_str!("../../queries/v2/DatabaseIO.sql")),
    ("ServerProperties", include_str!("../../queries/v2/ServerProperties.sql")),
    ("MemoryClerk", include_str!("../../queries/v2/MemoryClerk.sql")),
    ("Schedulers", include_str!("../../queries/v2/Schedulers.sql")),
    ("SqlRequests", include_str!("../../queries/v2/SqlRequests.sql")),
    ("VolumeSpace", include_str!("../../queries/v2/VolumeSpace.sql")),
    ("Cpu", include_str!("../../queries/v2/Cpu.sql")),
    ("AlwaysOnHealth", include_str!("../../queries/v2/AlwaysOnHealth.sql")),
    ("CachedPlans", include_str!("../../queries/v2/CachedPlans.sql")),
    ("InstanceWaits", include_str!("../../queries/v2/InstanceWaits.sql")),
    ("PageLifeExpectancy", include_str!("../../queries/v2/PageLifeExpectancy.sql")),
    ("LogUsage", include_str!("../../queries/v2/LogUsage.sql")),
    ("DatabasesByInstance", include_str!("../../queries/v2/DatabasesByInstance.sql")),
    ("DatabasesOnAG", include_str!("../../queries/v2/DatabasesOnAG.sql")),
    ("JobRuns", include_str!("../../queries/v2/JobRuns.sql")),
    ("DatabaseProperties", include_str!("../../queries/v2/DatabaseProperties.sql")),
    ("Backups", include_str!("../../queries/v2/Backups.sql")),
    ("OrphanedUsers", include_str!("../../queries/v2/OrphanedUsers.sql")),
    ("UsersSysadmin", include_str!("../../queries/v2/UsersSysadmin.sql")),
    ("LockedUsers", include_str!("../../queries/v2/LockedUsers.sql")),
    ("PolicyChecked", include_str!("../../queries/v2/PolicyChecked.sql")),
    ("DiskUsage", include_str!("../../queries/v2/DiskUsage.sql")),
];

const AZURE: &[(&str, &str)] = &[
    ("AzureDBResourceStats", include_str!("../../queries/azure/AzureDBResourceStats.sql")),
    ("AzureDBResourceGovernance", include_str!("../../queries/azure/AzureDBResourceGovernance.sql")),
];
