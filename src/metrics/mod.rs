//! Prometheus metrics for VibeMesh
//!
//! One registry per channel. Rendered with `encode_text` for whatever
//! exporter the embedding process runs.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// All membership metrics of one channel
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // View
    pub nodes_live: IntGauge,
    pub nodes_dead: IntGauge,

    // Event fan-out
    pub events_delivered: IntCounter,
    pub events_dropped: IntCounter,

    // Failure detector
    pub probes_total: IntCounter,
    pub nodes_declared_dead: IntCounter,
    pub gossip_sent: IntCounter,

    // Outbound
    pub dispatch_failures: IntCounter,
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge options")
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter options")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let nodes_live = gauge("vibemesh_nodes_live", "Peers currently in the live view");
        let nodes_dead = gauge(
            "vibemesh_nodes_dead",
            "Peers currently held as tombstones",
        );
        let events_delivered = counter(
            "vibemesh_events_delivered_total",
            "Async listener invocations scheduled",
        );
        let events_dropped = counter(
            "vibemesh_events_dropped_total",
            "Async listener invocations dropped on a saturated queue",
        );
        let probes_total = counter(
            "vibemesh_probes_total",
            "Indirect health-check rounds started for suspect peers",
        );
        let nodes_declared_dead = counter(
            "vibemesh_nodes_declared_dead_total",
            "Peers declared dead by the failure detector",
        );
        let gossip_sent = counter(
            "vibemesh_gossip_sent_total",
            "Gossip notifications sent to peers",
        );
        let dispatch_failures = counter(
            "vibemesh_dispatch_failures_total",
            "Outbound dispatches rejected locally or by the transport",
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(nodes_live.clone()),
            Box::new(nodes_dead.clone()),
            Box::new(events_delivered.clone()),
            Box::new(events_dropped.clone()),
            Box::new(probes_total.clone()),
            Box::new(nodes_declared_dead.clone()),
            Box::new(gossip_sent.clone()),
            Box::new(dispatch_failures.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        Self {
            registry,
            nodes_live,
            nodes_dead,
            events_delivered,
            events_dropped,
            probes_total,
            nodes_declared_dead,
            gossip_sent,
            dispatch_failures,
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
