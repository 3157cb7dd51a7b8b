//! Metric assertions for unit tests.

use std::future::Future;

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use metrics_util::CompositeKey;

pub(crate) type Snapshot = Vec<(CompositeKey, DebugValue)>;

/// Run `test` on a current-thread runtime with a local recorder installed and
/// return everything it recorded.
pub(crate) fn with_recorder<F, Fut>(test: F) -> Snapshot
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    metrics::with_local_recorder(&recorder, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(test())
    });
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| (key, value))
        .collect()
}

/// Sum of every counter named `name`, across labels.
pub(crate) fn counter(snapshot: &Snapshot, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _)| key.key().name() == name)
        .map(|(_, value)| match value {
            DebugValue::Counter(count) => *count,
            _ => 0,
        })
        .sum()
}

pub(crate) fn gauge(snapshot: &Snapshot, name: &str) -> Option<f64> {
    snapshot
        .iter()
        .find(|(key, _)| key.key().name() == name)
        .and_then(|(_, value)| match value {
            DebugValue::Gauge(value) => Some(value.into_inner()),
            _ => None,
        })
}

/// Every sample of the histograms named `name`, across labels.
pub(crate) fn histogram(snapshot: &Snapshot, name: &str) -> Vec<f64> {
    snapshot
        .iter()
        .filter(|(key, _)| key.key().name() == name)
        .flat_map(|(_, value)| match value {
            DebugValue::Histogram(samples) => samples.iter().map(|s| s.into_inner()).collect(),
            _ => Vec::new(),
        })
        .collect()
}
