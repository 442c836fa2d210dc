//! Periodic triggers.
//!
//! Each job turns a scan of the store into a batch of tasks. Jobs run on
//! independent intervals; a failing pass is logged and the job simply runs
//! again on its next tick.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use vmfleet_tasks::Task;

use crate::handlers::{HandlerError, Handlers};
use crate::store::VmQuery;

/// Interval per cron job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronIntervals {
    pub expand_configs: Duration,
    pub create_instances: Duration,
    pub manage_bots: Duration,
    pub count_vms: Duration,
    pub report_quotas: Duration,
    pub queue_stats: Duration,
}

impl CronIntervals {
    /// Every job on `every`, except quota reporting on `quotas`.
    pub fn new(every: Duration, quotas: Duration) -> Self {
        Self {
            expand_configs: every,
            create_instances: every,
            manage_bots: every,
            count_vms: every,
            report_quotas: quotas,
            queue_stats: every,
        }
    }
}

impl Default for CronIntervals {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(300))
    }
}

/// How long failed tasks are kept before the queue-stats job purges them.
pub const DEFAULT_FAILED_TASK_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Runs the periodic jobs.
pub struct CronWorker {
    handlers: Handlers,
    intervals: CronIntervals,
    failed_task_retention: Duration,
}

impl CronWorker {
    pub fn new(handlers: Handlers, intervals: CronIntervals) -> Self {
        Self {
            handlers,
            intervals,
            failed_task_retention: DEFAULT_FAILED_TASK_RETENTION,
        }
    }

    #[must_use]
    pub fn with_failed_task_retention(mut self, retention: Duration) -> Self {
        self.failed_task_retention = retention;
        self
    }

    /// Run every job on its interval until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(intervals = ?self.intervals, "Starting cron worker");

        let mut expand = ticker(self.intervals.expand_configs);
        let mut create = ticker(self.intervals.create_instances);
        let mut manage = ticker(self.intervals.manage_bots);
        let mut count = ticker(self.intervals.count_vms);
        let mut quotas = ticker(self.intervals.report_quotas);
        let mut stats = ticker(self.intervals.queue_stats);

        loop {
            tokio::select! {
                _ = expand.tick() => log_pass("expand-configs", self.expand_configs().await),
                _ = create.tick() => log_pass("create-instances", self.create_instances().await),
                _ = manage.tick() => log_pass("manage-bots", self.manage_bots().await),
                _ = count.tick() => log_pass("count-vms", self.count_vms().await),
                _ = quotas.tick() => log_pass("report-quotas", self.report_quotas().await),
                _ = stats.tick() => log_pass("queue-stats", self.publish_queue_stats().await),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cron worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run every job once, in pipeline order.
    pub async fn run_all(&self) {
        log_pass("expand-configs", self.expand_configs().await);
        log_pass("create-instances", self.create_instances().await);
        log_pass("manage-bots", self.manage_bots().await);
        log_pass("count-vms", self.count_vms().await);
        log_pass("report-quotas", self.report_quotas().await);
        log_pass("queue-stats", self.publish_queue_stats().await);
    }

    /// Enqueue ExpandConfig for every config.
    pub async fn expand_configs(&self) -> Result<usize, HandlerError> {
        let configs = self.handlers.deps().store.list_configs().await?;
        self.enqueue(configs.iter().map(|c| Task::expand_config(&c.id)).collect())
            .await
    }

    /// Drain, then enqueue CreateInstance for, every VM without an instance.
    pub async fn create_instances(&self) -> Result<usize, HandlerError> {
        let vms = self
            .handlers
            .deps()
            .store
            .query_vms(&VmQuery::with_url(false))
            .await?;
        for vm in &vms {
            if let Err(e) = self.handlers.drain_vm(vm).await {
                warn!(vm_id = %vm.id, error = %e, "Failed to drain VM");
            }
        }
        self.enqueue(vms.iter().map(|vm| Task::create_instance(&vm.id)).collect())
            .await
    }

    /// Drain, then enqueue ManageBot for, every VM with an instance.
    pub async fn manage_bots(&self) -> Result<usize, HandlerError> {
        let vms = self
            .handlers
            .deps()
            .store
            .query_vms(&VmQuery::with_url(true))
            .await?;
        for vm in &vms {
            if let Err(e) = self.handlers.drain_vm(vm).await {
                warn!(vm_id = %vm.id, error = %e, "Failed to drain VM");
            }
        }
        self.enqueue(vms.iter().map(|vm| Task::manage_bot(&vm.id)).collect())
            .await
    }

    /// Enqueue CountVms for every config.
    pub async fn count_vms(&self) -> Result<usize, HandlerError> {
        let configs = self.handlers.deps().store.list_configs().await?;
        self.enqueue(configs.iter().map(|c| Task::count_vms(&c.id)).collect())
            .await
    }

    /// Enqueue ReportQuota for every project.
    pub async fn report_quotas(&self) -> Result<usize, HandlerError> {
        let projects = self.handlers.deps().store.list_projects().await?;
        self.enqueue(projects.iter().map(|p| Task::report_quota(&p.id)).collect())
            .await
    }

    /// Purge expired failed tasks, then publish queue depth gauges.
    pub async fn publish_queue_stats(&self) -> Result<usize, HandlerError> {
        let deps = self.handlers.deps();
        let purged = deps
            .dispatcher
            .purge_failed(self.failed_task_retention)
            .await?;
        if purged > 0 {
            info!(purged, "Purged failed tasks");
        }
        let stats = deps.dispatcher.queue_stats().await?;
        for (queue, s) in &stats {
            deps.metrics.set_queue_stats(queue.as_str(), *s);
        }
        Ok(stats.len())
    }

    async fn enqueue(&self, tasks: Vec<Task>) -> Result<usize, HandlerError> {
        let n = tasks.len();
        if n > 0 {
            self.handlers.deps().dispatcher.add_tasks(tasks).await?;
        }
        Ok(n)
    }
}

fn ticker(period: Duration) -> Interval {
    // First tick one period after startup.
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn log_pass(job: &'static str, result: Result<usize, HandlerError>) {
    match result {
        Ok(0) => debug!(job, "Cron pass found nothing"),
        Ok(count) => info!(job, count, "Cron pass complete"),
        Err(e) => error!(job, error = %e, "Cron pass failed"),
    }
}
