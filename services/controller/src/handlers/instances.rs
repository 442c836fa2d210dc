//! Compute instance creation and destruction.

use tracing::{debug, info, instrument, warn};
use vmfleet_model::{NetworkInterface, Vm};
use vmfleet_tasks::Task;

use super::{HandlerError, Handlers};
use crate::providers::{InsertInstance, Instance};
use crate::store::{Mutation, TxnOutcome};

impl Handlers {
    /// Create the compute instance for a VM.
    ///
    /// The insert carries a request id derived from the hostname, so a
    /// redelivered task cannot create a second instance. A pending
    /// operation leaves the VM untouched; the next periodic pass re-issues
    /// the same request and picks up the result.
    #[instrument(skip(self))]
    pub async fn create_instance(&self, id: &str) -> Result<(), HandlerError> {
        let Some(vm) = self.deps.store.get_vm(id).await? else {
            debug!(vm_id = %id, "VM not found");
            return Ok(());
        };
        if !vm.url.is_empty() {
            debug!(vm_id = %id, url = %vm.url, "Instance already exists");
            return Ok(());
        }
        if vm.drained {
            return self.reap_drained(&vm).await;
        }
        if vm.hostname.is_empty() {
            debug!(vm_id = %id, "VM awaiting a hostname");
            return Ok(());
        }

        let request = InsertInstance::for_vm(&vm);
        let op = match self.deps.compute.insert_instance(&request).await {
            Ok(op) => op,
            Err(e) if e.is_transient() => {
                warn!(vm_id = %id, error = %e, "Transient error creating instance");
                return Err(e.into());
            }
            Err(e) => {
                return Err(self.creation_failed(&vm, e.to_string()).await);
            }
        };

        if op.has_errors() {
            return Err(self.creation_failed(&vm, op.error_message()).await);
        }
        if !op.is_done() {
            info!(vm_id = %id, hostname = %vm.hostname, status = ?op.status, "Instance creation pending");
            return Ok(());
        }

        let instance = self
            .deps
            .compute
            .get_instance(&request.project, &request.zone, &request.name)
            .await?;
        self.set_created(&vm, &instance).await
    }

    /// Remove a drained VM that has no recorded instance.
    ///
    /// An earlier insert may still have produced an instance under the
    /// current hostname. If the provider knows it, the instance is recorded
    /// instead so the bot manager tears it down through the normal path.
    async fn reap_drained(&self, vm: &Vm) -> Result<(), HandlerError> {
        if !vm.hostname.is_empty() {
            let found = self
                .deps
                .compute
                .get_instance(&vm.attributes.project, &vm.attributes.zone, &vm.hostname)
                .await;
            match found {
                Ok(instance) => {
                    info!(vm_id = %vm.id, hostname = %vm.hostname, "Drained VM has an instance; recording it for teardown");
                    return self.set_created(vm, &instance).await;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(vm_id = %vm.id, hostname = %vm.hostname, "Removing drained VM");
        self.delete_vm_fenced(&vm.id, &vm.hostname).await
    }

    /// Remove a VM whose instance the provider refused, so the next
    /// expansion recreates the slot under a new hostname.
    async fn creation_failed(&self, vm: &Vm, message: String) -> HandlerError {
        warn!(vm_id = %vm.id, hostname = %vm.hostname, error = %message, "Instance creation failed");
        if let Err(e) = self.delete_vm_fenced(&vm.id, &vm.hostname).await {
            return e;
        }
        HandlerError::InstanceCreationFailed {
            id: vm.id.clone(),
            message,
        }
    }

    async fn delete_vm_fenced(&self, id: &str, hostname: &str) -> Result<(), HandlerError> {
        self.deps
            .store
            .transact_vm(id, &|current| match current {
                Some(cur) if cur.hostname == hostname => Mutation::Delete,
                _ => Mutation::Keep,
            })
            .await?;
        Ok(())
    }

    /// Record a created instance on its VM.
    ///
    /// Only applies while the VM still has the instance's hostname and no
    /// creation time, so duplicate confirmations are no-ops.
    #[instrument(skip(self, vm, instance), fields(vm_id = %vm.id, hostname = %instance.name))]
    pub async fn set_created(&self, vm: &Vm, instance: &Instance) -> Result<(), HandlerError> {
        let interfaces = network_interfaces(instance);

        let outcome = self
            .deps
            .store
            .transact_vm(&vm.id, &|current| match current {
                Some(cur) if cur.hostname == instance.name && cur.created.is_none() => {
                    let mut cur = cur.clone();
                    cur.created = Some(instance.creation_timestamp);
                    cur.network_interfaces = interfaces.clone();
                    cur.url = instance.self_link.clone();
                    Mutation::Put(cur)
                }
                _ => Mutation::Keep,
            })
            .await?;

        if outcome == TxnOutcome::Written {
            info!(url = %instance.self_link, "Instance created");
            if let Some(configured) = vm.configured {
                let elapsed = instance.creation_timestamp - configured;
                self.deps.metrics.observe_instance_creation(
                    &vm.attributes.project,
                    &vm.attributes.zone,
                    elapsed.num_milliseconds() as f64 / 1000.0,
                );
            }
        }
        Ok(())
    }

    /// Delete a VM's compute instance, then hand off to bot deletion.
    #[instrument(skip(self))]
    pub async fn destroy_instance(&self, id: &str, url: &str) -> Result<(), HandlerError> {
        let Some(vm) = self.deps.store.get_vm(id).await? else {
            debug!(vm_id = %id, "VM not found");
            return Ok(());
        };
        if vm.url != url {
            debug!(vm_id = %id, current = %vm.url, "URL changed; instance already replaced");
            return Ok(());
        }

        let result = self
            .deps
            .compute
            .delete_instance(
                &vm.attributes.project,
                &vm.attributes.zone,
                &vm.hostname,
                vm.destroy_request_id(),
            )
            .await;

        match result {
            Err(e) if e.is_not_found() => {
                info!(vm_id = %id, hostname = %vm.hostname, "Instance already gone");
            }
            Err(e) => return Err(e.into()),
            Ok(op) if op.has_errors() => {
                return Err(HandlerError::OperationFailed {
                    id: id.to_string(),
                    message: op.error_message(),
                });
            }
            Ok(op) if !op.is_done() => {
                info!(vm_id = %id, status = ?op.status, "Instance deletion pending");
                return Ok(());
            }
            Ok(_) => {
                info!(vm_id = %id, hostname = %vm.hostname, "Instance destroyed");
            }
        }

        self.enqueue(Task::delete_bot(id, &vm.hostname)).await
    }
}

/// Resolved interfaces of an instance. At most one external IP per
/// interface is kept; the first wins.
fn network_interfaces(instance: &Instance) -> Vec<NetworkInterface> {
    instance
        .network_interfaces
        .iter()
        .map(|nic| {
            let mut external = nic
                .access_configs
                .iter()
                .map(|ac| ac.nat_ip.as_str())
                .filter(|ip| !ip.is_empty());
            let external_ip = external.next().map(str::to_string);
            for extra in external {
                warn!(instance = %instance.name, ip = %extra, "Ignoring unexpected external IP");
            }
            NetworkInterface {
                internal_ip: nic.network_ip.clone(),
                external_ip,
            }
        })
        .collect()
}
