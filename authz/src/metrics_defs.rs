//! Metrics definitions for the authorization chain.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RELOAD_SUCCESS: MetricDef = MetricDef {
    name: "authz.reload.success",
    metric_type: MetricType::Counter,
    description: "Authorization config reloads that published a new chain",
};

pub const RELOAD_FAILURE: MetricDef = MetricDef {
    name: "authz.reload.failure",
    metric_type: MetricType::Counter,
    description: "Authorization config reloads that kept the previous chain",
};

pub const RELOAD_LAST_TIMESTAMP: MetricDef = MetricDef {
    name: "authz.reload.last_timestamp_seconds",
    metric_type: MetricType::Gauge,
    description: "Unix time of the last reload attempt, tagged with its status",
};

pub const DECISIONS: MetricDef = MetricDef {
    name: "authz.decisions",
    metric_type: MetricType::Counter,
    description: "Authorization decisions, tagged with the decision",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RELOAD_SUCCESS,
    RELOAD_FAILURE,
    RELOAD_LAST_TIMESTAMP,
    DECISIONS,
];
