use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters collected for every bulk call, whatever the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOperationMetrics {
    pub total_items: usize,
    /// Includes skipped duplicates.
    pub success_count: usize,
    pub failure_count: usize,
    /// Items that collided with an existing row and were left untouched.
    pub skipped_count: usize,
    pub duration: Duration,
    /// Completed items per second of wall-clock time.
    pub throughput: f64,
    pub batch_count: usize,
}

/// Running tally for one bulk call.
#[derive(Debug)]
pub(crate) struct MetricsCollector {
    start_time: Instant,
    total_items: usize,
    success_count: usize,
    failure_count: usize,
    skipped_count: usize,
    batch_count: usize,
}

impl MetricsCollector {
    pub(crate) fn start(total_items: usize) -> Self {
        Self {
            start_time: Instant::now(),
            total_items,
            success_count: 0,
            failure_count: 0,
            skipped_count: 0,
            batch_count: 0,
        }
    }

    pub(crate) fn batch_started(&mut self) {
        self.batch_count += 1;
    }

    pub(crate) fn record_batch(&mut self, outcome: &BatchTally) {
        self.success_count += outcome.written + outcome.skipped;
        self.skipped_count += outcome.skipped;
        self.failure_count += outcome.failed;
    }

    pub(crate) fn finish(self) -> BulkOperationMetrics {
        let duration = self.start_time.elapsed();
        let completed = (self.success_count + self.failure_count) as f64;
        let secs = duration.as_secs_f64();
        let throughput = if secs > 0.0 { completed / secs } else { 0.0 };

        BulkOperationMetrics {
            total_items: self.total_items,
            success_count: self.success_count,
            failure_count: self.failure_count,
            skipped_count: self.skipped_count,
            duration,
            throughput,
            batch_count: self.batch_count,
        }
    }
}

/// Per-batch counts, folded into the collector only once the batch commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchTally {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_accumulates_batches() {
        let mut collector = MetricsCollector::start(10);
        collector.batch_started();
        collector.record_batch(&BatchTally {
            written: 4,
            skipped: 1,
            failed: 0,
        });
        collector.batch_started();
        collector.record_batch(&BatchTally {
            written: 3,
            skipped: 0,
            failed: 2,
        });

        let metrics = collector.finish();
        assert_eq!(metrics.batch_count, 2);
        assert_eq!(metrics.success_count, 8);
        assert_eq!(metrics.skipped_count, 1);
        assert_eq!(metrics.failure_count, 2);
        assert!(metrics.throughput >= 0.0);
    }

    #[test]
    fn test_empty_run_reports_no_batches() {
        let metrics = MetricsCollector::start(0).finish();
        assert_eq!(metrics.total_items, 0);
        assert_eq!(metrics.batch_count, 0);
        assert!(metrics.throughput >= 0.0);
    }
}
