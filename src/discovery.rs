// Local instance discovery
//
// Finds SQL Server engine processes running on this host and synthesizes
// connection strings for them using integrated (Windows) authentication.
// Discovery is best-effort: any failure simply means no extra targets.

use sysinfo::System;
use thiserror::Error;
use tracing::{debug, info};

use crate::connector::ServerTarget;

/// Instance name used by a default (unnamed) SQL Server installation
pub const DEFAULT_INSTANCE: &str = "MSSQLSERVER";

/// Errors that can occur while discovering local instances
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("could not determine the local host name")]
    UnknownHostName,

    #[error("no local SQL Server instances found")]
    NoInstances,
}

/// Supplies additional server targets found on the local host
pub trait Discovery: Send + Sync {
    fn discover(&self) -> Result<Vec<ServerTarget>, DiscoveryError>;
}

/// Discovers instances from the local process table
///
/// Each running `sqlservr` process is one instance. Named instances are
/// started with a `-s<INSTANCE>` argument; without it the process is the
/// default instance.
#[derive(Debug, Default)]
pub struct LocalInstanceDiscovery;

impl LocalInstanceDiscovery {
    pub fn new() -> Self {
        LocalInstanceDiscovery
    }

    /// Lists the instance names of all running engine processes
    fn running_instances() -> Vec<String> {
        let mut system = System::new();
        system.refresh_processes();

        let mut instances: Vec<String> = system
            .processes()
            .values()
            .filter(|process| is_engine_process(process.name()))
            .map(|process| instance_name(process.cmd()))
            .collect();

        instances.sort();
        instances.dedup();
        instances
    }
}

impl Discovery for LocalInstanceDiscovery {
    fn discover(&self) -> Result<Vec<ServerTarget>, DiscoveryError> {
        let instances = Self::running_instances();
        if instances.is_empty() {
            return Err(DiscoveryError::NoInstances);
        }
        debug!("Found local instances: {:?}", instances);

        let hostname = System::host_name().ok_or(DiscoveryError::UnknownHostName)?;
        let targets = connection_strings(&hostname, &instances);

        info!("Discovered {} local SQL Server instance(s)", targets.len());
        Ok(targets)
    }
}

fn is_engine_process(name: &str) -> bool {
    name.eq_ignore_ascii_case("sqlservr") || name.eq_ignore_ascii_case("sqlservr.exe")
}

/// Extracts the instance name from the engine's command line
fn instance_name(cmd: &[String]) -> String {
    cmd.iter()
        .skip(1)
        .find_map(|arg| {
            arg.strip_prefix("-s")
                .or_else(|| arg.strip_prefix("/s"))
                .filter(|name| !name.is_empty())
        })
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_INSTANCE.to_string())
}

/// Builds integrated-security connection strings for local instances
pub fn connection_strings(hostname: &str, instances: &[String]) -> Vec<ServerTarget> {
    instances
        .iter()
        .map(|instance| {
            if instance.eq_ignore_ascii_case(DEFAULT_INSTANCE) {
                ServerTarget::new(format!("Server={};Integrated Security=SSPI;", hostname))
            } else {
                ServerTarget::new(format!(
                    "Server={}\\{};Integrated Security=SSPI;",
                    hostname, instance
                ))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_connection_strings() {
        let instances = args(&["MSSQLSERVER", "SQLEXPRESS", "mssqlserver"]);
        let targets = connection_strings("WIN-DB01", &instances);

        assert_eq!(
            targets,
            vec![
                ServerTarget::new("Server=WIN-DB01;Integrated Security=SSPI;"),
                ServerTarget::new("Server=WIN-DB01\\SQLEXPRESS;Integrated Security=SSPI;"),
                ServerTarget::new("Server=WIN-DB01;Integrated Security=SSPI;"),
            ]
        );
    }

    #[test]
    fn test_instance_name_from_command_line() {
        assert_eq!(
            instance_name(&args(&["C:\\MSSQL\\Binn\\sqlservr.exe", "-sSQLEXPRESS"])),
            "SQLEXPRESS"
        );
        assert_eq!(
            instance_name(&args(&["sqlservr.exe", "-c", "-sREPORTING"])),
            "REPORTING"
        );
        assert_eq!(instance_name(&args(&["/opt/mssql/bin/sqlservr"])), DEFAULT_INSTANCE);
        assert_eq!(instance_name(&args(&["sqlservr", "-s"])), DEFAULT_INSTANCE);
    }

    #[test]
    fn test_is_engine_process() {
        assert!(is_engine_process("sqlservr"));
        assert!(is_engine_process("SQLSERVR.EXE"));
        assert!(!is_engine_process("sqlwriter.exe"));
    }
}
