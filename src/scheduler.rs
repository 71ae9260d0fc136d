// Scheduler module - runs gather cycles periodically
//
// # Architecture
// - Uses Tokio's interval timer for periodic execution
// - A cycle fans out over all (server, query) units and waits for them
// - Records flow through a channel to a dedicated sink task
// - Failures in one unit are logged and counted, never fatal

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::accumulator::{ChannelAccumulator, CollectingAccumulator, GatherResult};
use crate::gather::Gatherer;
use crate::storage::MetricSink;

/// Runs gather cycles for one collector at a fixed interval
pub struct MetricScheduler {
    /// Engine running the (server, query) units
    gatherer: Arc<Gatherer>,

    /// Where gathered records end up
    sink: Arc<MetricSink>,

    /// Node identifier (from configuration key)
    node_id: String,

    /// Seconds between the start of two cycles
    interval_secs: u64,
}

impl MetricScheduler {
    /// Creates a new MetricScheduler instance
    ///
    /// # Arguments
    /// * `gatherer` - Engine to run every cycle
    /// * `sink` - Destination of the gathered records
    /// * `node_id` - Node identifier (typically the configuration key)
    /// * `interval_secs` - Seconds between cycles
    pub fn new(gatherer: Gatherer, sink: MetricSink, node_id: String, interval_secs: u64) -> Self {
        MetricScheduler {
            gatherer: Arc::new(gatherer),
            sink: Arc::new(sink),
            node_id,
            interval_secs,
        }
    }

    /// Runs gather cycles until Ctrl+C is received
    pub async fn start(self) {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        };
        self.run_until(shutdown).await;
    }

    /// Runs gather cycles until `shutdown` completes
    ///
    /// A cycle that overruns the interval delays the next tick instead of
    /// starting cycles back to back. Shutdown also interrupts a running cycle,
    /// aborting its unfinished units. The records already queued for the sink
    /// are written before returning.
    async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting gather loop for node '{}' (every {}s)",
            self.node_id, self.interval_secs
        );

        let (accumulator, mut receiver) = ChannelAccumulator::new();
        let accumulator = Arc::new(accumulator);

        let sink = Arc::clone(&self.sink);
        let node_id = self.node_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                sink.write(&node_id, &record).await;
            }
        });

        let mut interval_timer = interval(Duration::from_secs(self.interval_secs));
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }

            let summary = tokio::select! {
                summary = self.gatherer.gather(accumulator.clone()) => summary,
                _ = &mut shutdown => {
                    warn!("Shutdown requested during a gather cycle, abandoning it");
                    break;
                }
            };

            let errors = accumulator.take_error_count();
            if errors > 0 {
                warn!(
                    "{} of {} gather unit(s) failed this cycle",
                    errors, summary.units
                );
            }
        }

        // Closing the channel lets the writer drain and finish
        drop(accumulator);
        if let Err(e) = writer.await {
            error!("Metric writer task panicked: {}", e);
        }
    }

    /// Performs a single gather cycle (useful for testing and debugging)
    ///
    /// Records are written to the sink after the cycle completes.
    ///
    /// # Returns
    /// Everything the cycle produced, including per-unit errors
    pub async fn collect_once(&self) -> GatherResult {
        info!("Running one-time gather cycle");

        let accumulator = Arc::new(CollectingAccumulator::new());
        let summary = self.gatherer.gather(accumulator.clone()).await;
        let result = accumulator.take();

        for record in &result.records {
            self.sink.write(&self.node_id, record).await;
        }
        for e in &result.errors {
            error!("{}", e);
        }

        info!(
            "One-time gather complete: {}/{} unit(s) succeeded, {} record(s)",
            summary.units - summary.failed,
            summary.units,
            result.records.len()
        );

        result
    }
}
