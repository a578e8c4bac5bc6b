use metrics::{Counter, Gauge};

/// Counter and gauge handles recorded by the core.
///
/// Handles default to no-ops; an embedder that installs a recorder sees the
/// values, everyone else pays nothing.
pub struct CoreMetrics {
    pub snapshots_taken: Counter,
    pub snapshots_failed: Counter,
    pub uploads_sent: Counter,
    pub uploads_failed: Counter,
    pub tasks_canceled: Counter,
    pub snapshot_queue_depth: Gauge,
    pub upload_queue_depth: Gauge,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            snapshots_taken: Counter::noop(),
            snapshots_failed: Counter::noop(),
            uploads_sent: Counter::noop(),
            uploads_failed: Counter::noop(),
            tasks_canceled: Counter::noop(),
            snapshot_queue_depth: Gauge::noop(),
            upload_queue_depth: Gauge::noop(),
        }
    }

    pub fn record_snapshot(&self, success: bool) {
        if success {
            self.snapshots_taken.increment(1);
        } else {
            self.snapshots_failed.increment(1);
        }
    }

    pub fn record_upload(&self, success: bool) {
        if success {
            self.uploads_sent.increment(1);
        } else {
            self.uploads_failed.increment(1);
        }
    }

    pub fn record_canceled(&self) {
        self.tasks_canceled.increment(1);
    }

    pub fn set_queue_depths(&self, snapshots: usize, uploads: usize) {
        self.snapshot_queue_depth.set(snapshots as f64);
        self.upload_queue_depth.set(uploads as f64);
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_handles_do_not_panic() {
        let metrics = CoreMetrics::new();
        metrics.record_snapshot(true);
        metrics.record_snapshot(false);
        metrics.record_upload(true);
        metrics.record_canceled();
        metrics.set_queue_depths(3, 7);
    }
}
