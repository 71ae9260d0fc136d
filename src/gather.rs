// Gather module - runs every selected query against every server target
//
// # Architecture
// - One-time initialization freezes the query set, the tag keys and the
//   (optionally discovery-augmented) target list
// - Each (server, query) pair is a gather unit running in its own Tokio task
// - Every unit opens and closes its own connection
// - A failing unit reports one error and never affects the other units
// - A cycle waits for all units and never fails as a whole

use futures_util::TryStreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::Accumulator;
use crate::config::CollectorSettings;
use crate::connector::{Connection, Connector, ConnectorError, ServerTarget};
use crate::decode::{decode_row, DecodeError, TagKeySet};
use crate::discovery::Discovery;
use crate::query::{QueryDefinition, QueryFilter, QuerySelector, QuerySet};

/// What went wrong inside a single gather unit
#[derive(Error, Debug)]
pub enum UnitErrorKind {
    #[error("connectivity error: {0}")]
    Connectivity(ConnectorError),

    #[error("execution error: {0}")]
    Execution(ConnectorError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("gather task aborted: {0}")]
    Aborted(String),
}

/// The error of one failed gather unit, tagged with the unit it belongs to
#[derive(Error, Debug)]
#[error("query '{query}' on server '{server}' failed: {kind}")]
pub struct GatherError {
    /// Server the unit ran against (masked when displayed)
    pub server: ServerTarget,

    /// Name of the query the unit ran
    pub query: String,

    pub kind: UnitErrorKind,
}

impl GatherError {
    pub fn new(server: ServerTarget, query: impl Into<String>, kind: UnitErrorKind) -> Self {
        GatherError {
            server,
            query: query.into(),
            kind,
        }
    }
}

/// Counts of one finished gather cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatherSummary {
    /// Number of (server, query) units launched
    pub units: usize,

    /// Number of units that reported an error
    pub failed: usize,
}

/// Unit tasks of one cycle; dropping an unfinished cycle aborts them
#[derive(Default)]
struct UnitTasks(Vec<AbortHandle>);

impl Drop for UnitTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Frozen state shared read-only by all gather units
#[derive(Debug)]
pub struct GatherState {
    queries: QuerySet,
    tag_keys: Arc<TagKeySet>,
    targets: Vec<ServerTarget>,
}

impl GatherState {
    pub fn queries(&self) -> &QuerySet {
        &self.queries
    }

    pub fn targets(&self) -> &[ServerTarget] {
        &self.targets
    }
}

/// Runs gather cycles for one collector configuration
pub struct Gatherer {
    servers: Vec<ServerTarget>,
    selector: QuerySelector,
    candidates: Vec<QueryDefinition>,
    tag_keys: Vec<String>,
    discovery: Option<Arc<dyn Discovery>>,
    connector: Arc<dyn Connector>,
    state: OnceCell<GatherState>,
}

impl Gatherer {
    /// Creates a gatherer over the built-in query catalogs
    ///
    /// # Arguments
    /// * `settings` - Servers, query selection and tag keys
    /// * `connector` - Driver used to open one connection per gather unit
    pub fn new(settings: &CollectorSettings, connector: Arc<dyn Connector>) -> Self {
        let candidates = query_selector(settings).candidates();
        Self::from_catalog(settings, connector, candidates)
    }

    /// Creates a gatherer choosing its queries from `catalog`
    ///
    /// The include/exclude lists of `settings` are applied to `catalog`
    /// during initialization; version and extended flag play no part.
    pub(crate) fn from_catalog(
        settings: &CollectorSettings,
        connector: Arc<dyn Connector>,
        catalog: Vec<QueryDefinition>,
    ) -> Self {
        Gatherer {
            servers: settings.servers.clone(),
            selector: query_selector(settings),
            candidates: catalog,
            tag_keys: settings.tag_keys.clone(),
            discovery: None,
            connector,
            state: OnceCell::new(),
        }
    }

    /// Appends targets found by `discovery` during initialization
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Builds the frozen gather state, exactly once
    ///
    /// Selects the active queries, freezes the tag keys and, if a discovery
    /// source is configured, appends the discovered targets. Later calls
    /// return the state built by the first one. `gather` calls this itself,
    /// so calling it up front is only needed to fail fast or to log the
    /// resulting plan.
    pub async fn initialize(&self) -> &GatherState {
        self.state.get_or_init(|| self.build_state()).await
    }

    async fn build_state(&self) -> GatherState {
        let queries = self.selector.select_from(self.candidates.iter().cloned());
        info!(
            "Selected {} query(s): {:?}",
            queries.len(),
            queries.keys().collect::<Vec<_>>()
        );

        let mut targets = self.servers.clone();
        if let Some(discovery) = &self.discovery {
            let discovery = Arc::clone(discovery);
            match tokio::task::spawn_blocking(move || discovery.discover()).await {
                Ok(Ok(discovered)) => {
                    for target in &discovered {
                        info!("Adding discovered server {}", target);
                    }
                    targets.extend(discovered);
                }
                Ok(Err(e)) => warn!("Local instance discovery skipped: {}", e),
                Err(e) => warn!("Local instance discovery task failed: {}", e),
            }
        }

        GatherState {
            queries,
            tag_keys: Arc::new(self.tag_keys.iter().cloned().collect()),
            targets,
        }
    }

    /// Runs one gather cycle
    ///
    /// Spawns one task per (server, query) pair and waits for all of them.
    /// Records are delivered to the accumulator while rows stream in; every
    /// failed unit adds exactly one error to it. Dropping the returned future
    /// before it completes aborts the units still running.
    ///
    /// # Returns
    /// Number of launched and failed units
    pub async fn gather(&self, acc: Arc<dyn Accumulator>) -> GatherSummary {
        let state = self.initialize().await;

        let mut handles = Vec::with_capacity(state.targets.len() * state.queries.len());
        let mut running = UnitTasks::default();

        for server in &state.targets {
            for query in state.queries.values() {
                let connector = Arc::clone(&self.connector);
                let tag_keys = Arc::clone(&state.tag_keys);
                let acc = Arc::clone(&acc);
                let unit_server = server.clone();
                let unit_query = Arc::clone(query);

                let handle = tokio::spawn(async move {
                    run_unit(
                        connector.as_ref(),
                        &unit_server,
                        &unit_query,
                        &tag_keys,
                        acc.as_ref(),
                    )
                    .await
                });

                running.0.push(handle.abort_handle());
                handles.push((server.clone(), query.name.clone(), handle));
            }
        }

        let mut summary = GatherSummary {
            units: handles.len(),
            failed: 0,
        };

        // Wait for every unit, failures included
        for (server, query, handle) in handles {
            let kind = match handle.await {
                Ok(Ok(rows)) => {
                    debug!("Query '{}' on {} produced {} row(s)", query, server, rows);
                    continue;
                }
                Ok(Err(kind)) => kind,
                Err(e) => {
                    error!("Gather task for query '{}' on {} panicked: {}", query, server, e);
                    UnitErrorKind::Aborted(e.to_string())
                }
            };

            summary.failed += 1;
            acc.add_error(GatherError::new(server, query, kind));
        }

        info!(
            "Gather cycle complete: {}/{} unit(s) succeeded",
            summary.units - summary.failed,
            summary.units
        );

        summary
    }
}

fn query_selector(settings: &CollectorSettings) -> QuerySelector {
    let filter = QueryFilter::new(
        settings.include_query.iter().cloned(),
        settings.exclude_query.iter().cloned(),
    );
    QuerySelector::new(settings.query_version, settings.azuredb, filter)
}

/// Runs one (server, query) unit on its own connection
///
/// The connection is closed on every exit path once it has been opened.
async fn run_unit(
    connector: &dyn Connector,
    server: &ServerTarget,
    query: &QueryDefinition,
    tag_keys: &TagKeySet,
    acc: &dyn Accumulator,
) -> Result<usize, UnitErrorKind> {
    let mut connection = connector
        .connect(server)
        .await
        .map_err(UnitErrorKind::Connectivity)?;

    let outcome = stream_rows(connection.as_mut(), query, tag_keys, acc).await;

    if let Err(e) = connection.close().await {
        debug!("Closing connection to {} failed: {}", server, e);
    }

    outcome
}

async fn stream_rows(
    connection: &mut dyn Connection,
    query: &QueryDefinition,
    tag_keys: &TagKeySet,
    acc: &dyn Accumulator,
) -> Result<usize, UnitErrorKind> {
    let mut rows = connection
        .query(&query.text)
        .await
        .map_err(UnitErrorKind::Execution)?;

    let mut count = 0;
    while let Some(row) = rows.try_next().await.map_err(UnitErrorKind::Execution)? {
        acc.add_metric(decode_row(row, tag_keys)?);
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::CollectingAccumulator;
    use crate::connector::RowStream;
    use crate::decode::{RawRow, Value};
    use crate::discovery::DiscoveryError;
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// How the fake driver behaves for a server, a query text or a pair
    #[derive(Clone)]
    enum Script {
        Refuse,
        Reject,
        Rows(Vec<RawRow>),
        BreakAfter(Vec<RawRow>),
    }

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    /// In-memory connector; scripts are looked up by "server|text", then text, then server
    struct FakeConnector {
        scripts: Arc<HashMap<String, Script>>,
        default_rows: Vec<RawRow>,
        counters: Arc<Counters>,
    }

    impl FakeConnector {
        fn new(default_rows: Vec<RawRow>) -> Self {
            FakeConnector {
                scripts: Arc::new(HashMap::new()),
                default_rows,
                counters: Arc::new(Counters::default()),
            }
        }

        fn script(mut self, key: &str, script: Script) -> Self {
            Arc::make_mut(&mut self.scripts).insert(key.to_string(), script);
            self
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            target: &ServerTarget,
        ) -> Result<Box<dyn Connection>, ConnectorError> {
            if let Some(Script::Refuse) = self.scripts.get(target.as_str()) {
                return Err(ConnectorError::Connect("connection refused".to_string()));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                server: target.as_str().to_string(),
                scripts: Arc::clone(&self.scripts),
                default_rows: self.default_rows.clone(),
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct FakeConnection {
        server: String,
        scripts: Arc<HashMap<String, Script>>,
        default_rows: Vec<RawRow>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn query<'a>(&'a mut self, text: &'a str) -> Result<RowStream<'a>, ConnectorError> {
            let script = self
                .scripts
                .get(&format!("{}|{}", self.server, text))
                .or_else(|| self.scripts.get(text))
                .or_else(|| self.scripts.get(&self.server))
                .cloned()
                .unwrap_or_else(|| Script::Rows(self.default_rows.clone()));

            match script {
                Script::Refuse | Script::Reject => {
                    Err(ConnectorError::Execute("syntax error".to_string()))
                }
                Script::Rows(rows) => {
                    Ok(stream::iter(rows.into_iter().map(Ok::<RawRow, ConnectorError>)).boxed())
                }
                Script::BreakAfter(rows) => {
                    let broken = Err(ConnectorError::Execute("connection reset".to_string()));
                    let items = rows
                        .into_iter()
                        .map(Ok::<RawRow, ConnectorError>)
                        .chain(std::iter::once(broken));
                    Ok(stream::iter(items).boxed())
                }
            }
        }

        async fn close(self: Box<Self>) -> Result<(), ConnectorError> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingDiscovery {
        calls: AtomicUsize,
        result: fn() -> Result<Vec<ServerTarget>, DiscoveryError>,
    }

    impl Discovery for CountingDiscovery {
        fn discover(&self) -> Result<Vec<ServerTarget>, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn scenario_row() -> RawRow {
        RawRow::from_pairs([
            ("measurement", Value::from("m")),
            ("host", Value::from("h1")),
            ("value", Value::Integer(42)),
        ])
    }

    fn settings(servers: &[&str]) -> CollectorSettings {
        CollectorSettings {
            servers: servers.iter().map(|s| ServerTarget::new(*s)).collect(),
            tag_keys: vec!["host".to_string()],
            ..CollectorSettings::default()
        }
    }

    fn catalog(names: &[&str]) -> Vec<QueryDefinition> {
        names
            .iter()
            .map(|name| QueryDefinition::new(*name, format!("SELECT {}", name)))
            .collect()
    }

    async fn run(gatherer: &Gatherer) -> (GatherSummary, crate::accumulator::GatherResult) {
        let acc = Arc::new(CollectingAccumulator::new());
        let summary = gatherer.gather(acc.clone()).await;
        (summary, acc.take())
    }

    #[tokio::test]
    async fn test_two_servers_one_query() {
        let connector = Arc::new(FakeConnector::new(vec![scenario_row()]));
        let counters = Arc::clone(&connector.counters);
        let gatherer = Gatherer::from_catalog(
            &settings(&["Server=a;", "Server=b;"]),
            connector,
            catalog(&["Q"]),
        );

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary { units: 2, failed: 0 });
        assert!(result.errors.is_empty());
        assert_eq!(result.records.len(), 2);
        for record in &result.records {
            assert_eq!(record.measurement, "m");
            assert_eq!(record.tags.len(), 1);
            assert_eq!(record.tags["host"], "h1");
            assert_eq!(record.fields.len(), 1);
            assert_eq!(record.fields["value"], Value::Integer(42));
        }
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_and_cycle_completes() {
        let connector = Arc::new(
            FakeConnector::new(vec![scenario_row()]).script("Server=down;", Script::Refuse),
        );
        let counters = Arc::clone(&connector.counters);
        let gatherer =
            Gatherer::from_catalog(&settings(&["Server=down;"]), connector, catalog(&["Q"]));

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary { units: 1, failed: 1 });
        assert!(result.records.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(result.errors[0].kind, UnitErrorKind::Connectivity(_)));
        assert_eq!(result.errors[0].server.as_str(), "Server=down;");
        assert_eq!(result.errors[0].query, "Q");
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_failing_unit_does_not_affect_the_others() {
        let connector = Arc::new(
            FakeConnector::new(vec![scenario_row()])
                .script("Server=b;|SELECT Q2", Script::Reject),
        );
        let counters = Arc::clone(&connector.counters);
        let gatherer = Gatherer::from_catalog(
            &settings(&["Server=a;", "Server=b;", "Server=c;"]),
            connector,
            catalog(&["Q1", "Q2", "Q3", "Q4"]),
        );

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary { units: 12, failed: 1 });
        assert_eq!(result.records.len(), 11);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].server.as_str(), "Server=b;");
        assert_eq!(result.errors[0].query, "Q2");
        assert!(matches!(result.errors[0].kind, UnitErrorKind::Execution(_)));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 12);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_earlier_rows_and_closes_connection() {
        let bad_row = RawRow::from_pairs([("value", Value::Integer(1))]);
        let connector = Arc::new(FakeConnector::new(vec![scenario_row(), bad_row, scenario_row()]));
        let counters = Arc::clone(&connector.counters);
        let gatherer =
            Gatherer::from_catalog(&settings(&["Server=a;"]), connector, catalog(&["Q"]));

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(result.records.len(), 1);
        assert!(matches!(
            result.errors[0].kind,
            UnitErrorKind::Decode(DecodeError::MissingMeasurement)
        ));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_stream_keeps_rows_already_produced() {
        let connector = Arc::new(
            FakeConnector::new(vec![])
                .script("SELECT Q", Script::BreakAfter(vec![scenario_row(), scenario_row()])),
        );
        let counters = Arc::clone(&connector.counters);
        let gatherer =
            Gatherer::from_catalog(&settings(&["Server=a;"]), connector, catalog(&["Q"]));

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary { units: 1, failed: 1 });
        assert_eq!(result.records.len(), 2);
        assert!(matches!(result.errors[0].kind, UnitErrorKind::Execution(_)));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_query_closes_connection() {
        let connector =
            Arc::new(FakeConnector::new(vec![scenario_row()]).script("SELECT Q", Script::Reject));
        let counters = Arc::clone(&connector.counters);
        let gatherer = Gatherer::from_catalog(
            &settings(&["Server=a;", "Server=b;"]),
            connector,
            catalog(&["Q"]),
        );

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary { units: 2, failed: 2 });
        assert!(result.records.is_empty());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_query_set_runs_nothing() {
        let connector = Arc::new(FakeConnector::new(vec![scenario_row()]));
        let counters = Arc::clone(&connector.counters);
        let mut settings = settings(&["Server=a;"]);
        settings.include_query = vec!["DoesNotExist".to_string()];
        let gatherer = Gatherer::from_catalog(&settings, connector, catalog(&["Q"]));

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary::default());
        assert!(result.records.is_empty() && result.errors.is_empty());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialization_runs_once_and_adds_discovered_targets() {
        let discovery = Arc::new(CountingDiscovery {
            calls: AtomicUsize::new(0),
            result: || Ok(vec![ServerTarget::new("Server=local;Integrated Security=SSPI;")]),
        });
        let connector = Arc::new(FakeConnector::new(vec![scenario_row()]));
        let gatherer =
            Gatherer::from_catalog(&settings(&["Server=a;"]), connector, catalog(&["Q1", "Q2"]))
                .with_discovery(discovery.clone());

        let state = gatherer.initialize().await;
        assert_eq!(state.targets().len(), 2);
        assert_eq!(state.queries().len(), 2);

        let (first, _) = run(&gatherer).await;
        let (second, _) = run(&gatherer).await;

        assert_eq!(first.units, 4);
        assert_eq!(second.units, 4);
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_discovery_is_not_fatal() {
        let discovery = Arc::new(CountingDiscovery {
            calls: AtomicUsize::new(0),
            result: || Err(DiscoveryError::NoInstances),
        });
        let connector = Arc::new(FakeConnector::new(vec![scenario_row()]));
        let gatherer =
            Gatherer::from_catalog(&settings(&["Server=a;"]), connector, catalog(&["Q"]))
                .with_discovery(discovery);

        let (summary, result) = run(&gatherer).await;

        assert_eq!(summary, GatherSummary { units: 1, failed: 0 });
        assert_eq!(result.records.len(), 1);
    }

    #[test]
    fn test_gather_error_display_masks_password() {
        let error = GatherError::new(
            ServerTarget::new("Server=db01;Password=secret;"),
            "Cpu",
            UnitErrorKind::Connectivity(ConnectorError::Connect("timed out".to_string())),
        );
        let message = error.to_string();

        assert!(message.contains("Cpu"));
        assert!(message.contains("Password=****"));
        assert!(!message.contains("secret"));
    }
}
