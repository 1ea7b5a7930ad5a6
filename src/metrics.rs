//! Minimal metrics emission helpers.
//!
//! Metrics are emitted as structured events through a process-global sink.
//! The default sink logs via tracing; deployments install their own sink to
//! feed the real counter registry, and tests install a capturing one.

use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
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
        tracing::debug!(
            target: "metrics",
            metric = event.name,
            value = ?event.value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> = std::sync::OnceLock::new();

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
    sink().record(MetricEvent {
        name,
        value,
        labels,
    });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn propose_ok(duration: Duration) {
    emit("channel_propose_ok", MetricValue::Counter(1), Vec::new());
    emit(
        "channel_propose_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn propose_err(duration: Duration) {
    emit("channel_propose_err", MetricValue::Counter(1), Vec::new());
    emit(
        "channel_propose_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn append_ok(duration: Duration) {
    emit("channel_log_append_ok", MetricValue::Counter(1), Vec::new());
    emit(
        "channel_log_append_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn append_err(duration: Duration) {
    emit("channel_log_append_err", MetricValue::Counter(1), Vec::new());
    emit(
        "channel_log_append_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn apply_ok(duration: Duration) {
    emit("channel_apply_ok", MetricValue::Counter(1), Vec::new());
    emit(
        "channel_apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn msg_sync_in(count: usize) {
    emit(
        "cluster_msg_sync_incoming_count",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn msg_sync_resp_in(count: usize, bytes: usize) {
    emit(
        "cluster_msg_syncresp_incoming_count",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
    emit(
        "cluster_msg_syncresp_incoming_bytes",
        MetricValue::Counter(bytes as u64),
        Vec::new(),
    );
}

pub fn msg_sync_resp_out(count: usize, bytes: usize) {
    emit(
        "cluster_msg_syncresp_outgoing_count",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
    emit(
        "cluster_msg_syncresp_outgoing_bytes",
        MetricValue::Counter(bytes as u64),
        Vec::new(),
    );
}

pub fn channel_election_started() {
    emit("channel_election_count", MetricValue::Counter(1), Vec::new());
}

pub fn channel_election_success() {
    emit(
        "channel_election_success_count",
        MetricValue::Counter(1),
        Vec::new(),
    );
}

pub fn inbound_queue_full() {
    emit(
        "channel_inbound_queue_full",
        MetricValue::Counter(1),
        Vec::new(),
    );
}

pub fn set_channel_count(count: usize) {
    emit(
        "reactor_channel_count",
        MetricValue::Gauge(count as u64),
        Vec::new(),
    );
}

pub fn pipeline_stage_ok(stage: &'static str) {
    emit(
        "pipeline_stage_ok",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "stage",
            value: stage.to_string(),
        }],
    );
}

pub fn pipeline_stage_err(stage: &'static str) {
    emit(
        "pipeline_stage_err",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "stage",
            value: stage.to_string(),
        }],
    );
}
