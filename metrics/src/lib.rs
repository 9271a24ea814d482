use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

pub mod state_store {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Clone, Debug)]
    pub struct Metrics {
        pub state_write: Histogram<f64>,
        pub state_read: Histogram<f64>,
        pub txn_commits: Counter<u64>,
        pub txn_retries: Counter<u64>,
        pub txn_errors: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("state_store");

            let state_write = meter
                .f64_histogram("gpu_inventory.state_write_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Inventory write latency in seconds")
                .build();

            let state_read = meter
                .f64_histogram("gpu_inventory.state_read_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Inventory read latency in seconds")
                .build();

            let txn_commits = meter
                .u64_counter("gpu_inventory.txn_commits")
                .with_description("Number of committed inventory transactions")
                .build();

            let txn_retries = meter
                .u64_counter("gpu_inventory.txn_retries")
                .with_description("Number of inventory transactions retried after lock contention")
                .build();

            let txn_errors = meter
                .u64_counter("gpu_inventory.txn_errors")
                .with_description("Number of inventory transactions that failed")
                .build();

            Metrics {
                state_write,
                state_read,
                txn_commits,
                txn_retries,
                txn_errors,
            }
        }
    }
}

pub mod reconciler {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Clone, Debug)]
    pub struct Metrics {
        pub reconcile_latency: Histogram<f64>,
        pub devices_created: Counter<u64>,
        pub devices_lost: Counter<u64>,
        pub facts_skipped: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("reconciler");

            let reconcile_latency = meter
                .f64_histogram("gpu_inventory.reconcile_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Latency of merging one host report in seconds")
                .build();

            let devices_created = meter
                .u64_counter("gpu_inventory.devices_created")
                .with_description("Number of devices first seen in a host report")
                .build();

            let devices_lost = meter
                .u64_counter("gpu_inventory.devices_lost")
                .with_description("Number of devices missing from a host report")
                .build();

            let facts_skipped = meter
                .u64_counter("gpu_inventory.facts_skipped")
                .with_description("Number of malformed device facts skipped")
                .build();

            Metrics {
                reconcile_latency,
                devices_created,
                devices_lost,
                facts_skipped,
            }
        }
    }
}

pub mod allocator {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Clone, Debug)]
    pub struct Metrics {
        pub allocate_latency: Histogram<f64>,
        pub allocations: Counter<u64>,
        pub allocation_failures: Counter<u64>,
        pub devices_released: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("allocator");

            let allocate_latency = meter
                .f64_histogram("gpu_inventory.allocate_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Latency of GPU allocation in seconds")
                .build();

            let allocations = meter
                .u64_counter("gpu_inventory.allocations")
                .with_description("Number of successful allocations, labeled by packing tier")
                .build();

            let allocation_failures = meter
                .u64_counter("gpu_inventory.allocation_failures")
                .with_description("Number of allocations rejected")
                .build();

            let devices_released = meter
                .u64_counter("gpu_inventory.devices_released")
                .with_description("Number of devices returned to the free pool")
                .build();

            Metrics {
                allocate_latency,
                allocations,
                allocation_failures,
                devices_released,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_are_sorted() {
        let boundaries = low_latency_boundaries();
        assert!(boundaries.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_timer_records_on_drop() {
        let metrics = state_store::Metrics::new();
        let labels = [KeyValue::new("request", "test")];
        {
            let _timer = Timer::start_with_labels(&metrics.state_write, &labels);
            metrics.txn_commits.increment(&labels);
        }
    }
}
