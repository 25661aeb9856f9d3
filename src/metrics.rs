//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink can
//! be installed to capture emissions in unit tests.

use std::sync::{Arc, PoisonError, RwLock};

use crate::core::Vbid;

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
            MetricValue::Counter(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    gauge = value,
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
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().unwrap_or_else(PoisonError::into_inner) = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn vb_label(vbid: Vbid) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key: "vb",
        value: vbid.get().to_string(),
    }]
}

pub fn items_sent(count: u64) {
    emit("dcp_items_sent", MetricValue::Counter(count), Vec::new());
}

pub fn backfill_items(vbid: Vbid, count: u64) {
    emit("dcp_backfill_items", MetricValue::Counter(count), vb_label(vbid));
}

pub fn message_buffered(vbid: Vbid) {
    emit("dcp_messages_buffered", MetricValue::Counter(1), vb_label(vbid));
}

pub fn consumer_backoff() {
    emit("dcp_consumer_backoffs", MetricValue::Counter(1), Vec::new());
}

pub fn seqno_ack_emitted(vbid: Vbid) {
    emit("dcp_seqno_acks", MetricValue::Counter(1), vb_label(vbid));
}

pub fn sequence_invariant_violation(vbid: Vbid) {
    emit(
        "dcp_sequence_invariant_violations",
        MetricValue::Counter(1),
        vb_label(vbid),
    );
}

pub fn connections_reaped(count: usize) {
    emit(
        "dcp_connections_reaped",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn set_dead_connections(count: usize) {
    emit(
        "dcp_dead_connections",
        MetricValue::Gauge(count as u64),
        Vec::new(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for TestSink {
        fn record(&self, event: MetricEvent) {
            self.events.lock().expect("metrics lock").push(event);
        }
    }

    #[test]
    fn emits_counters_and_gauges() {
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        items_sent(3);
        message_buffered(Vbid::new(7));
        set_dead_connections(2);

        let events = sink.events.lock().expect("metrics lock");
        assert!(events.iter().any(|e| e.name == "dcp_items_sent"));
        assert!(events.iter().any(|e| e.name == "dcp_messages_buffered"
            && e.labels.iter().any(|l| l.key == "vb" && l.value == "7")));
        assert!(events
            .iter()
            .any(|e| e.name == "dcp_dead_connections" && e.value == MetricValue::Gauge(2)));
    }
}
