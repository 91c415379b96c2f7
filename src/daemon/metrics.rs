//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink
//! can be installed to capture emissions in unit tests.

use std::sync::{Arc, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) | MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> =
    std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn topic_label(topic: &str) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key: "topic",
        value: topic.to_string(),
    }]
}

pub fn unicast_dropped(topic: &str) {
    emit("mesh_unicast_dropped", MetricValue::Counter(1), topic_label(topic));
}

pub fn multicast_sent(topic: &str, recipients: usize) {
    emit(
        "mesh_multicast_recipients",
        MetricValue::Counter(recipients as u64),
        topic_label(topic),
    );
}

pub fn protocol_violation(identity: &str) {
    emit(
        "mesh_protocol_violation",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "identity",
            value: identity.to_string(),
        }],
    );
}

pub fn directory_evicted(count: usize) {
    emit("discovery_evicted", MetricValue::Counter(count as u64), Vec::new());
}

pub fn directory_size(size: usize) {
    emit("discovery_directory_size", MetricValue::Gauge(size as u64), Vec::new());
}

pub fn stale_reply() {
    emit("delegation_stale_reply", MetricValue::Counter(1), Vec::new());
}

pub fn assignments_issued(count: usize) {
    emit(
        "delegation_assign_issued",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn assignments_timed_out(count: usize) {
    emit(
        "delegation_assign_timeout",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn export_records(count: usize) {
    emit("export_records", MetricValue::Counter(count as u64), Vec::new());
}

pub fn export_queue_full() {
    emit("export_queue_full", MetricValue::Counter(1), Vec::new());
}

/// Capturing sink for unit tests.
#[derive(Clone, Default)]
pub struct CaptureSink {
    events: Arc<RwLock<Vec<MetricEvent>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.read().expect("capture sink lock poisoned").clone()
    }
}

impl MetricSink for CaptureSink {
    fn record(&self, event: MetricEvent) {
        self.events
            .write()
            .expect("capture sink lock poisoned")
            .push(event);
    }
}
