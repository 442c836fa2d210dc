//! VM count and quota reporting.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};
use vmfleet_model::{Project, Vm};

use super::{HandlerError, Handlers};
use crate::metrics::VmCounts;
use crate::providers::{Quota, Region};
use crate::store::VmQuery;

type ZoneKey = (String, String);
type ServerKey = (String, String, String);

impl Handlers {
    /// Publish VM counts for one config, per zone and per bot server.
    #[instrument(skip(self))]
    pub async fn count_vms(&self, config_id: &str) -> Result<(), HandlerError> {
        let vms = self
            .deps
            .store
            .query_vms(&VmQuery::for_config(config_id))
            .await?;
        let (by_zone, by_server) = tally(&vms);

        for ((project, zone), counts) in &by_zone {
            self.deps.metrics.set_vm_counts(project, zone, *counts);
        }
        for ((project, server, zone), counts) in &by_server {
            self.deps
                .metrics
                .set_vm_counts_by_server(project, server, zone, *counts);
        }
        debug!(config_id, vms = vms.len(), zones = by_zone.len(), "Counted VMs");
        Ok(())
    }

    /// Republish the provider's quotas for the regions and metrics a
    /// project asks for.
    #[instrument(skip(self))]
    pub async fn report_quota(&self, project_id: &str) -> Result<(), HandlerError> {
        let Some(project) = self.deps.store.get_project(project_id).await? else {
            info!(project_id, "Project not found; nothing to report");
            return Ok(());
        };

        let regions = self.deps.compute.list_regions(&project.project).await?;
        let wanted = wanted_quotas(&project, &regions);
        for (region, quota) in &wanted {
            self.deps
                .metrics
                .set_quota(&project.project, region, &quota.metric, quota.limit, quota.usage);
        }
        debug!(project_id, quotas = wanted.len(), "Reported quotas");
        Ok(())
    }
}

/// Count VMs per (project, zone) and per (project, server, zone).
fn tally(vms: &[Vm]) -> (BTreeMap<ZoneKey, VmCounts>, BTreeMap<ServerKey, VmCounts>) {
    let mut by_zone: BTreeMap<ZoneKey, VmCounts> = BTreeMap::new();
    let mut by_server: BTreeMap<ServerKey, VmCounts> = BTreeMap::new();

    for vm in vms {
        let project = &vm.attributes.project;
        let zone = &vm.attributes.zone;
        let zone_counts = by_zone.entry((project.clone(), zone.clone())).or_default();
        count(zone_counts, vm);
        let server_counts = by_server
            .entry((project.clone(), vm.swarming.clone(), zone.clone()))
            .or_default();
        count(server_counts, vm);
    }
    (by_zone, by_server)
}

fn count(counts: &mut VmCounts, vm: &Vm) {
    if vm.configured.is_some() {
        counts.configured += 1;
    }
    if vm.created.is_some() {
        counts.created += 1;
    }
    if vm.connected.is_some() {
        counts.connected += 1;
    }
}

fn wanted_quotas<'a>(project: &Project, regions: &'a [Region]) -> Vec<(&'a str, &'a Quota)> {
    regions
        .iter()
        .flat_map(|r| r.quotas.iter().map(move |q| (r.name.as_str(), q)))
        .filter(|(region, q)| project.wants(region, &q.metric))
        .collect()
}
