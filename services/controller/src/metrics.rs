//! Fleet metrics.
//!
//! Recorded through the `metrics` facade; the binary installs a Prometheus
//! recorder and serves it on `/metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `vmfleet_vms` | Gauge | `project`, `zone`, `state` |
//! | `vmfleet_vms_by_server` | Gauge | `project`, `server`, `zone`, `state` |
//! | `vmfleet_quota_limit` | Gauge | `project`, `region`, `metric` |
//! | `vmfleet_quota_usage` | Gauge | `project`, `region`, `metric` |
//! | `vmfleet_queue_tasks` | Gauge | `queue`, `state` |
//! | `vmfleet_instance_creation_seconds` | Histogram | `project`, `zone` |
//! | `vmfleet_bot_connection_seconds` | Histogram | `project`, `zone` |
//! | `vmfleet_tasks_total` | Counter | `queue`, `result` |

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::dispatch::QueueStats;

/// Metric names.
pub mod names {
    /// Gauge: VMs per project and zone, by lifecycle state.
    pub const VMS: &str = "vmfleet_vms";
    /// Gauge: VMs per project, bot server and zone, by lifecycle state.
    pub const VMS_BY_SERVER: &str = "vmfleet_vms_by_server";
    /// Gauge: Quota limit per project, region and metric.
    pub const QUOTA_LIMIT: &str = "vmfleet_quota_limit";
    /// Gauge: Quota usage per project, region and metric.
    pub const QUOTA_USAGE: &str = "vmfleet_quota_usage";
    /// Gauge: Tasks per queue and state.
    pub const QUEUE_TASKS: &str = "vmfleet_queue_tasks";
    /// Histogram: Seconds from slot configuration to instance creation.
    pub const INSTANCE_CREATION_SECONDS: &str = "vmfleet_instance_creation_seconds";
    /// Histogram: Seconds from instance creation to bot connection.
    pub const BOT_CONNECTION_SECONDS: &str = "vmfleet_bot_connection_seconds";
    /// Counter: Handled task deliveries by outcome.
    pub const TASKS_TOTAL: &str = "vmfleet_tasks_total";
}

/// Label keys.
pub mod labels {
    pub const PROJECT: &str = "project";
    pub const ZONE: &str = "zone";
    pub const SERVER: &str = "server";
    pub const STATE: &str = "state";
    pub const REGION: &str = "region";
    pub const METRIC: &str = "metric";
    pub const QUEUE: &str = "queue";
    pub const RESULT: &str = "result";
}

/// VMs in each lifecycle state. A VM counts in every state it has reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmCounts {
    pub configured: u64,
    pub created: u64,
    pub connected: u64,
}

impl VmCounts {
    fn by_state(&self) -> [(&'static str, u64); 3] {
        [
            ("configured", self.configured),
            ("created", self.created),
            ("connected", self.connected),
        ]
    }
}

/// Handle for recording fleet metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct FleetMetrics;

impl FleetMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    pub fn set_vm_counts(&self, project: &str, zone: &str, counts: VmCounts) {
        for (state, n) in counts.by_state() {
            gauge!(
                names::VMS,
                labels::PROJECT => project.to_string(),
                labels::ZONE => zone.to_string(),
                labels::STATE => state,
            )
            .set(n as f64);
        }
    }

    pub fn set_vm_counts_by_server(
        &self,
        project: &str,
        server: &str,
        zone: &str,
        counts: VmCounts,
    ) {
        for (state, n) in counts.by_state() {
            gauge!(
                names::VMS_BY_SERVER,
                labels::PROJECT => project.to_string(),
                labels::SERVER => server.to_string(),
                labels::ZONE => zone.to_string(),
                labels::STATE => state,
            )
            .set(n as f64);
        }
    }

    pub fn set_quota(&self, project: &str, region: &str, metric: &str, limit: f64, usage: f64) {
        gauge!(
            names::QUOTA_LIMIT,
            labels::PROJECT => project.to_string(),
            labels::REGION => region.to_string(),
            labels::METRIC => metric.to_string(),
        )
        .set(limit);
        gauge!(
            names::QUOTA_USAGE,
            labels::PROJECT => project.to_string(),
            labels::REGION => region.to_string(),
            labels::METRIC => metric.to_string(),
        )
        .set(usage);
    }

    pub fn set_queue_stats(&self, queue: &str, stats: QueueStats) {
        for (state, n) in [
            ("pending", stats.pending),
            ("leased", stats.leased),
            ("failed", stats.failed),
        ] {
            gauge!(
                names::QUEUE_TASKS,
                labels::QUEUE => queue.to_string(),
                labels::STATE => state,
            )
            .set(n as f64);
        }
    }

    pub fn observe_instance_creation(&self, project: &str, zone: &str, seconds: f64) {
        histogram!(
            names::INSTANCE_CREATION_SECONDS,
            labels::PROJECT => project.to_string(),
            labels::ZONE => zone.to_string(),
        )
        .record(seconds);
    }

    pub fn observe_bot_connection(&self, project: &str, zone: &str, seconds: f64) {
        histogram!(
            names::BOT_CONNECTION_SECONDS,
            labels::PROJECT => project.to_string(),
            labels::ZONE => zone.to_string(),
        )
        .record(seconds);
    }

    /// Count one handled delivery; `result` is `completed`, `retried` or `failed`.
    pub fn record_task(&self, queue: &str, result: &'static str) {
        counter!(
            names::TASKS_TOTAL,
            labels::QUEUE => queue.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }
}

/// Install the global Prometheus recorder and return its render handle.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
