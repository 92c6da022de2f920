//! Tests for the metrics layer.

use metrics::Label;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshot, Snapshotter};
use once_cell::sync::Lazy;
use slotpool::{PoolError, SlotPool};
use std::collections::HashSet;
use std::time::Duration;

/// Sets up a `DebuggingRecorder` to capture metrics emitted during a test.
/// This is wrapped in a `Lazy` to ensure it's only initialized once.
static SNAPSHOTTER: Lazy<Snapshotter> = Lazy::new(|| {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install recorder");
    snapshotter
});

// --- Assertion Helpers ---
//
// The recorder is global and counters accumulate across tests in this binary,
// so assertions check floors rather than exact values.

fn counter_value(snapshot: Snapshot, name: &'static str, labels: &[(&'static str, &'static str)]) -> u64 {
    let labels: HashSet<Label> = labels.iter().map(|(k, v)| Label::new(*k, *v)).collect();

    snapshot
        .into_vec()
        .into_iter()
        .find_map(|(composite_key, _, _, v)| {
            let (_, key) = composite_key.into_parts();
            let key_labels_set = key.labels().cloned().collect::<HashSet<_>>();
            if key.name() == name && key_labels_set == labels {
                if let DebugValue::Counter(c) = v {
                    return Some(c);
                }
            }
            None
        })
        .unwrap_or(0)
}

fn gauge_value(snapshot: Snapshot, name: &'static str) -> f64 {
    snapshot
        .into_vec()
        .into_iter()
        .find_map(|(composite_key, _, _, v)| {
            let (_, key) = composite_key.into_parts();
            if key.name() == name {
                if let DebugValue::Gauge(g) = v {
                    return Some(g.into_inner());
                }
            }
            None
        })
        .unwrap_or(0.0)
}

#[test]
fn growth_and_refusal_metrics() {
    let growths_before = counter_value(SNAPSHOTTER.snapshot(), "slotpool_growths_total", &[]);
    let refusals_before = counter_value(
        SNAPSHOTTER.snapshot(),
        "slotpool_growth_refusals_total",
        &[("reason", "rate_limited")],
    );

    let pool: SlotPool<u64> = SlotPool::builder()
        .block_slots(4)
        .growth_threshold(Duration::from_secs(3600))
        .build()
        .unwrap();

    // First allocation grows the pool and records the event.
    let mut held = vec![pool.allocate().unwrap()];

    let snapshot = SNAPSHOTTER.snapshot();
    assert!(counter_value(snapshot, "slotpool_growths_total", &[]) > growths_before);
    assert_eq!(
        gauge_value(SNAPSHOTTER.snapshot(), "slotpool_capacity_slots"),
        pool.capacity() as f64
    );

    // Exhaust the block; the rate-limited refusal is counted.
    while let Ok(slot) = pool.allocate() {
        held.push(slot);
    }
    assert_eq!(pool.allocate(), Err(PoolError::Exhausted));

    let refusals_after = counter_value(
        SNAPSHOTTER.snapshot(),
        "slotpool_growth_refusals_total",
        &[("reason", "rate_limited")],
    );
    assert!(refusals_after > refusals_before);

    for slot in held {
        unsafe { pool.deallocate(slot) };
    }
}
