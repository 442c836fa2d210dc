//! VM entity creation and draining.

use tracing::{debug, info, instrument};
use vmfleet_model::{generate_hostname, Vm};
use vmfleet_tasks::CreateVm;

use super::{HandlerError, Handlers};
use crate::store::{Mutation, TxnOutcome};

impl Handlers {
    /// Create the VM entity for a slot, or re-arm a torn-down one.
    ///
    /// A VM that exists with a hostname is left alone. A VM that exists
    /// without one was torn down and gets a fresh hostname; `drained` and
    /// unknown properties carry over.
    #[instrument(skip(self, task), fields(vm_id = %task.id))]
    pub async fn create_vm(&self, task: &CreateVm) -> Result<(), HandlerError> {
        if let Some(vm) = self.deps.store.get_vm(&task.id).await? {
            if !vm.hostname.is_empty() {
                debug!(hostname = %vm.hostname, "VM already exists");
                return Ok(());
            }
        }

        let attributes = task.attributes.clone().resolve_zone();
        let hostname = generate_hostname(&task.prefix, task.index);
        let arm = |vm: &mut Vm| {
            vm.clear_live_fields();
            vm.id = task.id.clone();
            vm.config = task.config.clone();
            vm.index = task.index;
            vm.hostname = hostname.clone();
            vm.attributes = attributes.clone();
            vm.prefix = task.prefix.clone();
            vm.revision = task.revision.clone();
            vm.swarming = task.swarming.clone();
            vm.lifetime = task.lifetime;
            vm.timeout = task.timeout;
            vm.configured = Some(task.configured);
        };

        let outcome = self
            .deps
            .store
            .transact_vm(&task.id, &|current| match current {
                Some(vm) if !vm.hostname.is_empty() => Mutation::Keep,
                Some(vm) => {
                    let mut vm = vm.clone();
                    arm(&mut vm);
                    Mutation::Put(vm)
                }
                None => {
                    let mut vm = Vm::default();
                    arm(&mut vm);
                    Mutation::Put(vm)
                }
            })
            .await?;

        if outcome == TxnOutcome::Written {
            info!(hostname = %hostname, "Stored VM");
        }
        Ok(())
    }

    /// Mark a VM drained if its config no longer wants its slot.
    ///
    /// Never clears `drained`. A VM that disappears meanwhile is fine.
    #[instrument(skip(self, vm), fields(vm_id = %vm.id))]
    pub async fn drain_vm(&self, vm: &Vm) -> Result<(), HandlerError> {
        if vm.drained {
            return Ok(());
        }

        match self.deps.store.get_config(&vm.config).await? {
            Some(config) if vm.index < config.current_amount => return Ok(()),
            Some(config) => debug!(
                index = vm.index,
                current_amount = config.current_amount,
                "Slot out of budget"
            ),
            None => debug!(config_id = %vm.config, "Config gone"),
        }

        let outcome = self
            .deps
            .store
            .transact_vm(&vm.id, &|current| match current {
                Some(cur) if !cur.drained => {
                    let mut cur = cur.clone();
                    cur.drained = true;
                    Mutation::Put(cur)
                }
                _ => Mutation::Keep,
            })
            .await?;

        if outcome.changed() {
            info!("Drained VM");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use vmfleet_model::VmAttributes;

    use super::super::testing::{config, harness};
    use super::*;
    use crate::store::EntityStore;

    fn create_task(id: &str, index: i32) -> CreateVm {
        CreateVm {
            id: id.to_string(),
            config: "p".to_string(),
            index,
            attributes: VmAttributes {
                zone: "z1".to_string(),
                machine_type: "zones/{{.Zone}}/machineTypes/n1".to_string(),
                ..Default::default()
            },
            prefix: "p".to_string(),
            lifetime: 100,
            timeout: 10,
            swarming: "bots.example.com".to_string(),
            revision: "rev".to_string(),
            configured: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_vm_is_idempotent() {
        let h = harness();
        let task = create_task("p-0", 0);

        h.handlers.create_vm(&task).await.unwrap();
        let first = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert!(first.hostname.starts_with("p-0-"));
        assert_eq!(first.attributes.machine_type, "zones/z1/machineTypes/n1");
        assert_eq!(first.configured, Some(task.configured));

        h.handlers.create_vm(&task).await.unwrap();
        let second = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_create_vm_rearms_torn_down_slot() {
        let h = harness();
        h.store
            .put_vm(&Vm {
                id: "p-0".to_string(),
                config: "p".to_string(),
                drained: true,
                extra: [("legacy".to_string(), serde_json::json!(1))].into(),
                ..Default::default()
            })
            .await
            .unwrap();

        h.handlers.create_vm(&create_task("p-0", 0)).await.unwrap();

        let vm = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert!(vm.hostname.starts_with("p-0-"));
        assert!(vm.drained);
        assert_eq!(vm.extra["legacy"], 1);
        assert_eq!(vm.lifetime, 100);
    }

    #[tokio::test]
    async fn test_drain_out_of_budget() {
        let h = harness();
        let mut c = config("p", 1);
        c.current_amount = 1;
        h.store.put_config(&c).await.unwrap();

        let in_budget = Vm {
            id: "p-0".to_string(),
            config: "p".to_string(),
            index: 0,
            ..Default::default()
        };
        let out_of_budget = Vm {
            id: "p-1".to_string(),
            config: "p".to_string(),
            index: 1,
            ..Default::default()
        };
        h.store.put_vm(&in_budget).await.unwrap();
        h.store.put_vm(&out_of_budget).await.unwrap();

        h.handlers.drain_vm(&in_budget).await.unwrap();
        h.handlers.drain_vm(&out_of_budget).await.unwrap();

        assert!(!h.store.get_vm("p-0").await.unwrap().unwrap().drained);
        assert!(h.store.get_vm("p-1").await.unwrap().unwrap().drained);
    }

    #[tokio::test]
    async fn test_drain_without_config() {
        let h = harness();
        let vm = Vm {
            id: "gone-0".to_string(),
            config: "gone".to_string(),
            ..Default::default()
        };
        h.store.put_vm(&vm).await.unwrap();

        h.handlers.drain_vm(&vm).await.unwrap();
        assert!(h.store.get_vm("gone-0").await.unwrap().unwrap().drained);

        // A VM deleted in the meantime is not an error.
        h.store.delete_vm("gone-0").await.unwrap();
        h.handlers.drain_vm(&vm).await.unwrap();
        assert!(h.store.get_vm("gone-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_is_sticky() {
        let h = harness();
        let mut c = config("p", 5);
        c.current_amount = 5;
        h.store.put_config(&c).await.unwrap();
        let vm = Vm {
            id: "p-0".to_string(),
            config: "p".to_string(),
            drained: true,
            ..Default::default()
        };
        h.store.put_vm(&vm).await.unwrap();

        h.handlers.drain_vm(&vm).await.unwrap();
        assert!(h.store.get_vm("p-0").await.unwrap().unwrap().drained);
    }
}
