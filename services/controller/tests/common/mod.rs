//! In-process controller for integration tests.
//!
//! Wires the handlers to the memory store and queue, the provider fakes and
//! a manual clock, and drives the pipeline without sleeping.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use vmfleet_controller::{
    clock::ManualClock,
    cron::{CronIntervals, CronWorker},
    deps::Deps,
    dispatch::{MemoryTaskQueue, TaskWorker, WorkerConfig, WorkerStats},
    handlers::Handlers,
    metrics::FleetMetrics,
    providers::fake::{FakeCompute, FakeFleet},
    providers::BotInfo,
    store::{EntityStore, MemoryEntityStore, VmQuery},
};
use vmfleet_model::{AccessConfig, Amount, Config, Disk, NetworkInterfaceSpec, Vm, VmAttributes};
use vmfleet_tasks::RetryPolicy;

pub struct Controller {
    pub store: Arc<MemoryEntityStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub compute: Arc<FakeCompute>,
    pub fleet: Arc<FakeFleet>,
    pub clock: Arc<ManualClock>,
    pub handlers: Handlers,
    pub worker: TaskWorker,
    pub cron: CronWorker,
}

pub fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

impl Controller {
    pub fn new() -> Self {
        Self::with_retry(RetryPolicy::default())
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(MemoryEntityStore::new());
        let queue = Arc::new(MemoryTaskQueue::new(clock.clone()));
        let compute = Arc::new(FakeCompute::new(clock.clone()));
        let fleet = Arc::new(FakeFleet::new());

        let handlers = Handlers::new(Deps {
            store: store.clone(),
            dispatcher: queue.clone(),
            compute: compute.clone(),
            fleet: fleet.clone(),
            clock: clock.clone(),
            metrics: FleetMetrics::new(),
        });
        let worker = TaskWorker::new(
            queue.clone(),
            handlers.clone(),
            WorkerConfig {
                retry,
                ..WorkerConfig::all_queues(50)
            },
        );
        let cron = CronWorker::new(handlers.clone(), CronIntervals::default());

        Self {
            store,
            queue,
            compute,
            fleet,
            clock,
            handlers,
            worker,
            cron,
        }
    }

    /// Run the worker until no task is deliverable.
    pub async fn drain(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for _ in 0..50 {
            let stats = self.worker.run_once().await;
            if stats.total() == 0 {
                return total;
            }
            total.completed += stats.completed;
            total.retried += stats.retried;
            total.failed += stats.failed;
        }
        panic!("queue did not settle");
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    pub async fn vm(&self, id: &str) -> Option<Vm> {
        self.store.get_vm(id).await.unwrap()
    }

    pub async fn vms(&self) -> Vec<Vm> {
        self.store.query_vms(&VmQuery::default()).await.unwrap()
    }

    /// Register a live bot for every VM with an instance.
    pub async fn connect_bots(&self) {
        for vm in self.vms().await {
            if !vm.url.is_empty() {
                self.fleet
                    .set_bot(&vm.hostname, BotInfo::alive(&vm.hostname, None))
                    .await;
            }
        }
    }

    /// Expand configs and create their VMs and instances.
    pub async fn provision(&self) {
        self.cron.expand_configs().await.unwrap();
        self.drain().await;
        self.cron.create_instances().await.unwrap();
        self.drain().await;
    }
}

pub fn config(prefix: &str, amount: i32) -> Config {
    Config {
        id: prefix.to_string(),
        prefix: prefix.to_string(),
        amount: Amount::fixed(amount),
        attributes: VmAttributes {
            project: "proj".to_string(),
            zone: "us-central1-b".to_string(),
            machine_type: "zones/{{.Zone}}/machineTypes/n1-standard-2".to_string(),
            disks: vec![Disk {
                image: "global/images/bot".to_string(),
                size_gb: 100,
                disk_type: "zones/{{.Zone}}/diskTypes/pd-ssd".to_string(),
            }],
            network_interfaces: vec![NetworkInterfaceSpec {
                network: "global/networks/default".to_string(),
                access_configs: vec![AccessConfig {
                    kind: "ONE_TO_ONE_NAT".to_string(),
                }],
                ..Default::default()
            }],
            ..Default::default()
        },
        lifetime: 3600,
        timeout: 600,
        swarming: "bots.example.com".to_string(),
        revision: "rev-1".to_string(),
        ..Default::default()
    }
}
