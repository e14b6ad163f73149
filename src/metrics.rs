//! Metric handles injected into the feed view, the persistence shards and the
//! field-array serializer. Everything registers into one caller-owned
//! [`prometheus::Registry`]; nothing here is process-global.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{FeedError, Result};

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn registration_error(e: prometheus::Error) -> FeedError {
    FeedError::Config(format!("metrics registration failed: {}", e))
}

/// Per document type feed counters.
#[derive(Clone)]
pub struct FeedMetrics {
    operations: IntCounterVec,
    failures: IntCounterVec,
    store_writes: IntCounterVec,
    commit_latency: Histogram,
}

impl FeedMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new("bucketfeed_feed_operations_total", "Feed operations handled"),
            &["doc_type", "op"],
        )
        .map_err(registration_error)?;
        let failures = IntCounterVec::new(
            Opts::new("bucketfeed_feed_failures_total", "Feed operations that failed"),
            &["doc_type", "op"],
        )
        .map_err(registration_error)?;
        let store_writes = IntCounterVec::new(
            Opts::new(
                "bucketfeed_store_writes_total",
                "Sub-writes dispatched to backing stores",
            ),
            &["doc_type", "store"],
        )
        .map_err(registration_error)?;
        let commit_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bucketfeed_commit_latency_seconds",
                "Time from force_commit to commit done",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .map_err(registration_error)?;
        registry
            .register(Box::new(operations.clone()))
            .map_err(registration_error)?;
        registry
            .register(Box::new(failures.clone()))
            .map_err(registration_error)?;
        registry
            .register(Box::new(store_writes.clone()))
            .map_err(registration_error)?;
        registry
            .register(Box::new(commit_latency.clone()))
            .map_err(registration_error)?;
        Ok(FeedMetrics {
            operations,
            failures,
            store_writes,
            commit_latency,
        })
    }

    pub fn record_operation(&self, doc_type: &str, op: &str) {
        self.operations.with_label_values(&[doc_type, op]).inc();
    }

    pub fn record_failure(&self, doc_type: &str, op: &str) {
        self.failures.with_label_values(&[doc_type, op]).inc();
    }

    pub fn record_store_write(&self, doc_type: &str, store: &str) {
        self.store_writes.with_label_values(&[doc_type, store]).inc();
    }

    pub fn observe_commit(&self, seconds: f64) {
        self.commit_latency.observe(seconds);
    }

    pub fn operations(&self, doc_type: &str, op: &str) -> u64 {
        self.operations.with_label_values(&[doc_type, op]).get()
    }

    pub fn failures(&self, doc_type: &str, op: &str) -> u64 {
        self.failures.with_label_values(&[doc_type, op]).get()
    }

    pub fn store_writes(&self, doc_type: &str, store: &str) -> u64 {
        self.store_writes.with_label_values(&[doc_type, store]).get()
    }
}

/// Per shard, per command persistence counters.
#[derive(Clone)]
pub struct PersistenceMetrics {
    commands: IntCounterVec,
    failed: IntCounterVec,
    slow: IntCounterVec,
    latency: HistogramVec,
}

impl PersistenceMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let commands = IntCounterVec::new(
            Opts::new("bucketfeed_persistence_commands_total", "Commands processed"),
            &["shard", "command"],
        )
        .map_err(registration_error)?;
        let failed = IntCounterVec::new(
            Opts::new("bucketfeed_persistence_failed_total", "Commands that failed"),
            &["shard", "command", "code"],
        )
        .map_err(registration_error)?;
        let slow = IntCounterVec::new(
            Opts::new(
                "bucketfeed_persistence_slow_operations_total",
                "Commands exceeding the slow-operation threshold",
            ),
            &["shard", "command"],
        )
        .map_err(registration_error)?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "bucketfeed_persistence_latency_seconds",
                "Command processing latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["command"],
        )
        .map_err(registration_error)?;
        for collector in [&commands, &failed, &slow] {
            registry
                .register(Box::new(collector.clone()))
                .map_err(registration_error)?;
        }
        registry
            .register(Box::new(latency.clone()))
            .map_err(registration_error)?;
        Ok(PersistenceMetrics {
            commands,
            failed,
            slow,
            latency,
        })
    }

    pub fn record(&self, shard: usize, command: &str, seconds: f64, failure_code: Option<&str>) {
        let shard = shard.to_string();
        self.commands.with_label_values(&[&shard, command]).inc();
        self.latency.with_label_values(&[command]).observe(seconds);
        if let Some(code) = failure_code {
            self.failed.with_label_values(&[&shard, command, code]).inc();
        }
    }

    pub fn record_slow(&self, shard: usize, command: &str) {
        self.slow
            .with_label_values(&[&shard.to_string(), command])
            .inc();
    }

    pub fn commands(&self, shard: usize, command: &str) -> u64 {
        self.commands
            .with_label_values(&[&shard.to_string(), command])
            .get()
    }

    pub fn failed(&self, shard: usize, command: &str, code: &str) -> u64 {
        self.failed
            .with_label_values(&[&shard.to_string(), command, code])
            .get()
    }

    pub fn slow_operations(&self, shard: usize, command: &str) -> u64 {
        self.slow
            .with_label_values(&[&shard.to_string(), command])
            .get()
    }
}

/// Field-array serialization outcomes.
#[derive(Clone)]
pub struct SerializationMetrics {
    outcomes: IntCounterVec,
}

impl SerializationMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let outcomes = IntCounterVec::new(
            Opts::new(
                "bucketfeed_field_serialization_total",
                "Field array serializations by outcome",
            ),
            &["outcome"],
        )
        .map_err(registration_error)?;
        registry
            .register(Box::new(outcomes.clone()))
            .map_err(registration_error)?;
        Ok(SerializationMetrics { outcomes })
    }

    pub fn record(&self, outcome: SerializationOutcome) {
        self.outcomes.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn count(&self, outcome: SerializationOutcome) -> u64 {
        self.outcomes.with_label_values(&[outcome.as_str()]).get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationOutcome {
    UsedCached,
    Compressed,
    CompressionDidntHelp,
    Uncompressed,
}

impl SerializationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationOutcome::UsedCached => "used_cached",
            SerializationOutcome::Compressed => "compressed",
            SerializationOutcome::CompressionDidntHelp => "compression_didnt_help",
            SerializationOutcome::Uncompressed => "uncompressed",
        }
    }
}

/// Owner of the registry and every metric family registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub feed: FeedMetrics,
    pub persistence: PersistenceMetrics,
    pub serialization: SerializationMetrics,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let feed = FeedMetrics::register(&registry)?;
        let persistence = PersistenceMetrics::register(&registry)?;
        let serialization = SerializationMetrics::register(&registry)?;
        Ok(MetricsRegistry {
            registry,
            feed,
            persistence,
            serialization,
        })
    }

    /// Prometheus text exposition of everything registered.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("[METRICS] encode failed: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();
        a.feed.record_operation("music", "put");
        assert_eq!(a.feed.operations("music", "put"), 1);
        assert_eq!(b.feed.operations("music", "put"), 0);
    }

    #[test]
    fn persistence_failure_and_slow_counters() {
        let m = MetricsRegistry::new().unwrap();
        m.persistence.record(0, "put", 0.001, None);
        m.persistence.record(0, "put", 0.002, Some("NotFound"));
        m.persistence.record_slow(0, "put");
        assert_eq!(m.persistence.commands(0, "put"), 2);
        assert_eq!(m.persistence.failed(0, "put", "NotFound"), 1);
        assert_eq!(m.persistence.slow_operations(0, "put"), 1);
        assert_eq!(m.persistence.commands(1, "put"), 0);
    }

    #[test]
    fn text_exposition_contains_families() {
        let m = MetricsRegistry::new().unwrap();
        m.feed.record_store_write("music", "summary");
        m.serialization.record(SerializationOutcome::Compressed);
        let text = m.gather_text();
        assert!(text.contains("bucketfeed_store_writes_total"));
        assert!(text.contains("bucketfeed_field_serialization_total"));
        assert_eq!(m.serialization.count(SerializationOutcome::Compressed), 1);
    }
}
