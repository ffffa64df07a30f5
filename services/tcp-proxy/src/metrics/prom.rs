//! Prometheus-backed metrics recorder.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use ulid::Ulid;

use super::MetricsRecorder;

/// Labels attached to every series.
///
/// `instance` is generated once per process. It only separates series of
/// concurrently running proxies that are scraped into the same backend.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub instance: String,
}

/// Point-in-time copy of all six series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub inbound_connections_total: u64,
    pub outbound_connections_total: u64,
    pub inbound_bytes_total: u64,
    pub outbound_bytes_total: u64,
    pub active_inbound_connections: i64,
    pub active_outbound_connections: i64,
}

/// Connection and byte metrics registered in a Prometheus registry.
///
/// Counter names are registered without the `_total` suffix;
/// `prometheus-client` appends it when encoding.
#[derive(Clone)]
pub struct ProxyMetrics {
    instance_id: String,
    inbound_connections: Counter,
    outbound_connections: Counter,
    inbound_bytes: Counter,
    outbound_bytes: Counter,
    active_inbound: Gauge,
    active_outbound: Gauge,
}

impl ProxyMetrics {
    /// Register all series with a freshly generated instance id.
    pub fn new(registry: &mut Registry) -> Self {
        Self::with_instance_id(registry, Ulid::new().to_string().to_lowercase())
    }

    /// Register all series labelled with the given instance id.
    pub fn with_instance_id(registry: &mut Registry, instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let labels = InstanceLabels {
            instance: instance_id.clone(),
        };

        let inbound_connections = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "proxy_inbound_connections",
            "Inbound connections accepted",
            inbound_connections.clone(),
        );

        let outbound_connections = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "proxy_outbound_connections",
            "Outbound connections established to the upstream",
            outbound_connections.clone(),
        );

        let inbound_bytes = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "proxy_inbound_bytes",
            "Bytes received from inbound connections",
            inbound_bytes.clone(),
        );

        let outbound_bytes = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "proxy_outbound_bytes",
            "Bytes received from the upstream",
            outbound_bytes.clone(),
        );

        let active_inbound = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "proxy_active_inbound_connections",
            "Inbound connections currently open",
            active_inbound.clone(),
        );

        let active_outbound = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "proxy_active_outbound_connections",
            "Outbound connections currently open",
            active_outbound.clone(),
        );

        // One label set per process, so resolve the handles up front. Cloned
        // metrics share their underlying atomics with the family entry.
        let metrics = Self {
            inbound_connections: inbound_connections.get_or_create(&labels).clone(),
            outbound_connections: outbound_connections.get_or_create(&labels).clone(),
            inbound_bytes: inbound_bytes.get_or_create(&labels).clone(),
            outbound_bytes: outbound_bytes.get_or_create(&labels).clone(),
            active_inbound: active_inbound.get_or_create(&labels).clone(),
            active_outbound: active_outbound.get_or_create(&labels).clone(),
            instance_id,
        };
        metrics
    }

    /// The instance label value attached to every series.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inbound_connections_total: self.inbound_connections.get(),
            outbound_connections_total: self.outbound_connections.get(),
            inbound_bytes_total: self.inbound_bytes.get(),
            outbound_bytes_total: self.outbound_bytes.get(),
            active_inbound_connections: self.active_inbound.get(),
            active_outbound_connections: self.active_outbound.get(),
        }
    }
}

impl MetricsRecorder for ProxyMetrics {
    fn record_inbound_connection_opened(&self) {
        self.inbound_connections.inc();
    }

    fn record_outbound_connection_opened(&self) {
        self.outbound_connections.inc();
    }

    fn add_inbound_bytes(&self, n: u64) {
        self.inbound_bytes.inc_by(n);
    }

    fn add_outbound_bytes(&self, n: u64) {
        self.outbound_bytes.inc_by(n);
    }

    fn increment_active_inbound(&self) {
        self.active_inbound.inc();
    }

    fn decrement_active_inbound(&self) {
        self.active_inbound.dec();
    }

    fn increment_active_outbound(&self) {
        self.active_outbound.inc();
    }

    fn decrement_active_outbound(&self) {
        self.active_outbound.dec();
    }
}
