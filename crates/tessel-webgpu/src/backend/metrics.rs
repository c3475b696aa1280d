use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub submissions: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub pipeline_hits: u64,
    pub pipeline_misses: u64,
}

pub struct BackendMetrics {
    dispatches: AtomicU64,
    submissions: AtomicU64,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
    pipeline_hits: AtomicU64,
    pipeline_misses: AtomicU64,
}

impl Default for BackendMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendMetrics {
    pub fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            pipeline_hits: AtomicU64::new(0),
            pipeline_misses: AtomicU64::new(0),
        }
    }

    pub fn inc_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_upload_bytes(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download_bytes(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_hit(&self) {
        self.pipeline_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_miss(&self) {
        self.pipeline_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
            pipeline_hits: self.pipeline_hits.load(Ordering::Relaxed),
            pipeline_misses: self.pipeline_misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.dispatches,
            &self.submissions,
            &self.upload_bytes,
            &self.download_bytes,
            &self.pipeline_hits,
            &self.pipeline_misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let metrics = BackendMetrics::new();
        metrics.inc_dispatch();
        metrics.inc_dispatch();
        metrics.add_upload_bytes(64);
        metrics.inc_miss();
        let snap = metrics.snapshot();
        assert_eq!(snap.dispatches, 2);
        assert_eq!(snap.upload_bytes, 64);
        assert_eq!(snap.pipeline_misses, 1);
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
