// Accumulator module - where gather units deliver their output
//
// Records are handed over one at a time as soon as a row is decoded; errors
// arrive separately, one per failed unit. The engine doesn't care what
// happens to them afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::decode::MetricRecord;
use crate::gather::GatherError;

/// Receives the output of gather units
///
/// Implementations are shared between all concurrently running units and
/// must therefore be thread-safe.
pub trait Accumulator: Send + Sync {
    /// Accepts one decoded metric record
    fn add_metric(&self, record: MetricRecord);

    /// Accepts the error of one failed gather unit
    fn add_error(&self, error: GatherError);
}

/// Everything one gather cycle produced
#[derive(Debug, Default)]
pub struct GatherResult {
    pub records: Vec<MetricRecord>,
    pub errors: Vec<GatherError>,
}

/// Keeps all records and errors in memory
///
/// Used for one-shot collection runs and tests.
#[derive(Debug, Default)]
pub struct CollectingAccumulator {
    result: Mutex<GatherResult>,
}

impl CollectingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything collected so far and starts over empty
    pub fn take(&self) -> GatherResult {
        std::mem::take(&mut *self.result.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Accumulator for CollectingAccumulator {
    fn add_metric(&self, record: MetricRecord) {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .push(record);
    }

    fn add_error(&self, error: GatherError) {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .errors
            .push(error);
    }
}

/// Forwards records to a sink task over a channel and logs errors
///
/// This is the accumulator used by the long running scheduler: storage
/// happens on the receiving side of the channel so slow inserts never hold
/// up a gather unit.
pub struct ChannelAccumulator {
    sender: mpsc::UnboundedSender<MetricRecord>,
    errors: AtomicUsize,
}

impl ChannelAccumulator {
    /// Creates the accumulator together with the receiving end for the sink
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MetricRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let accumulator = ChannelAccumulator {
            sender,
            errors: AtomicUsize::new(0),
        };
        (accumulator, receiver)
    }

    /// Returns and resets the number of errors seen since the last call
    pub fn take_error_count(&self) -> usize {
        self.errors.swap(0, Ordering::Relaxed)
    }
}

impl Accumulator for ChannelAccumulator {
    fn add_metric(&self, record: MetricRecord) {
        if self.sender.send(record).is_err() {
            warn!("Metric sink is gone, dropping record");
        }
    }

    fn add_error(&self, error: GatherError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        error!("{}", error);
    }
}
