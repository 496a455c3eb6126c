//! Metrics definitions for peer routing.

use shared::metrics_defs::{MetricDef, MetricType};

pub const PROXIED_REQUESTS: MetricDef = MetricDef {
    name: "peer_proxy.proxied_requests",
    metric_type: MetricType::Counter,
    description: "Requests forwarded to a peer, tagged with the response status",
};

pub const CATALOG_EVENTS: MetricDef = MetricDef {
    name: "peer_proxy.catalog.events",
    metric_type: MetricType::Counter,
    description: "Catalog events applied to the serviceability index, tagged with the event type",
};

pub const CATALOG_LIST_FAILURES: MetricDef = MetricDef {
    name: "peer_proxy.catalog.list_failures",
    metric_type: MetricType::Counter,
    description: "Catalog listings that failed after retries",
};

pub const INDEX_SIZE: MetricDef = MetricDef {
    name: "peer_proxy.index.size",
    metric_type: MetricType::Gauge,
    description: "Number of GVRs tracked in the serviceability index",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PROXIED_REQUESTS,
    CATALOG_EVENTS,
    CATALOG_LIST_FAILURES,
    INDEX_SIZE,
];
