//! Bot supervision and deregistration.

use tracing::{debug, info, instrument, warn};
use vmfleet_model::Vm;
use vmfleet_tasks::Task;

use super::{HandlerError, Handlers};
use crate::providers::BotInfo;
use crate::store::{Mutation, TxnOutcome};

impl Handlers {
    /// Decide what to do with a VM's bot.
    #[instrument(skip(self))]
    pub async fn manage_bot(&self, id: &str) -> Result<(), HandlerError> {
        let Some(vm) = self.deps.store.get_vm(id).await? else {
            debug!(vm_id = %id, "VM not found");
            return Ok(());
        };
        if vm.url.is_empty() {
            debug!(vm_id = %id, "VM has no instance");
            return Ok(());
        }

        let now = self.deps.clock.now();
        let bot = match self.deps.fleet.get_bot(&vm.swarming, &vm.hostname).await {
            Ok(bot) => bot,
            Err(e) if e.is_not_found() => {
                let never_connected = vm.connected.is_none() && vm.timeout_exceeded(now);
                if vm.lifetime_exceeded(now) || never_connected || vm.drained {
                    info!(
                        vm_id = %id,
                        hostname = %vm.hostname,
                        drained = vm.drained,
                        never_connected,
                        "Bot missing; destroying instance"
                    );
                    return self.enqueue(Task::destroy_instance(id, &vm.url)).await;
                }
                debug!(vm_id = %id, hostname = %vm.hostname, "Bot not registered yet");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if bot.deleted || bot.is_dead {
            info!(vm_id = %id, hostname = %vm.hostname, deleted = bot.deleted, dead = bot.is_dead, "Bot gone; destroying instance");
            return self.enqueue(Task::destroy_instance(id, &vm.url)).await;
        }

        self.set_connected(&vm, &bot).await?;

        let events = self
            .deps
            .fleet
            .list_bot_events(&vm.swarming, &vm.hostname)
            .await?;
        if events.iter().any(|e| e.is_terminate()) {
            info!(vm_id = %id, hostname = %vm.hostname, "Bot terminated; destroying instance");
            return self.enqueue(Task::destroy_instance(id, &vm.url)).await;
        }

        if vm.lifetime_exceeded(now) || vm.drained {
            info!(vm_id = %id, hostname = %vm.hostname, drained = vm.drained, "Requesting bot termination");
            return self.enqueue(Task::terminate_bot(id, &vm.hostname)).await;
        }
        Ok(())
    }

    /// Stamp the time a VM's bot first connected.
    async fn set_connected(&self, vm: &Vm, bot: &BotInfo) -> Result<(), HandlerError> {
        if vm.connected.is_some() {
            return Ok(());
        }
        let connected = bot.first_seen.unwrap_or_else(|| self.deps.clock.now());

        let outcome = self
            .deps
            .store
            .transact_vm(&vm.id, &|current| match current {
                Some(cur) if cur.hostname == vm.hostname && cur.connected.is_none() => {
                    let mut cur = cur.clone();
                    cur.connected = Some(connected);
                    Mutation::Put(cur)
                }
                _ => Mutation::Keep,
            })
            .await?;

        if outcome == TxnOutcome::Written {
            info!(vm_id = %vm.id, hostname = %vm.hostname, "Bot connected");
            if let Some(created) = vm.created {
                let elapsed = connected - created;
                self.deps.metrics.observe_bot_connection(
                    &vm.attributes.project,
                    &vm.attributes.zone,
                    elapsed.num_milliseconds() as f64 / 1000.0,
                );
            }
        }
        Ok(())
    }

    /// Ask a bot to finish its current work and shut down.
    #[instrument(skip(self))]
    pub async fn terminate_bot(&self, id: &str, hostname: &str) -> Result<(), HandlerError> {
        let Some(vm) = self.current_vm(id, hostname).await? else {
            return Ok(());
        };
        match self.deps.fleet.terminate_bot(&vm.swarming, hostname).await {
            Ok(()) => {
                info!(vm_id = %id, hostname, "Bot termination requested");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %id, hostname, "Bot already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a bot's registration and retire the VM's incarnation.
    ///
    /// A drained VM is deleted; any other VM is cleared so the next
    /// expansion re-arms it under a new hostname.
    #[instrument(skip(self))]
    pub async fn delete_bot(&self, id: &str, hostname: &str) -> Result<(), HandlerError> {
        let Some(vm) = self.current_vm(id, hostname).await? else {
            return Ok(());
        };
        match self.deps.fleet.delete_bot(&vm.swarming, hostname).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %id, hostname, "Bot already deregistered");
            }
            Err(e) => {
                warn!(vm_id = %id, hostname, error = %e, "Failed to delete bot");
                return Err(e.into());
            }
        }

        let outcome = self
            .deps
            .store
            .transact_vm(id, &|current| match current {
                Some(cur) if cur.hostname == hostname && cur.drained => Mutation::Delete,
                Some(cur) if cur.hostname == hostname => {
                    let mut cur = cur.clone();
                    cur.clear_live_fields();
                    Mutation::Put(cur)
                }
                _ => Mutation::Keep,
            })
            .await?;

        match outcome {
            TxnOutcome::Deleted => info!(vm_id = %id, hostname, "Deleted drained VM"),
            TxnOutcome::Written => info!(vm_id = %id, hostname, "Cleared VM for replacement"),
            TxnOutcome::Unchanged => debug!(vm_id = %id, hostname, "VM already replaced"),
        }
        Ok(())
    }

    /// The VM if it still carries `hostname`.
    async fn current_vm(&self, id: &str, hostname: &str) -> Result<Option<Vm>, HandlerError> {
        match self.deps.store.get_vm(id).await? {
            Some(vm) if vm.hostname == hostname => Ok(Some(vm)),
            Some(vm) => {
                debug!(vm_id = %id, hostname, current = %vm.hostname, "Hostname changed; skipping");
                Ok(None)
            }
            None => {
                debug!(vm_id = %id, "VM not found");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use vmfleet_tasks::Queue;

    use super::super::testing::{harness, start, Harness};
    use super::*;
    use crate::providers::fake::FleetCall;
    use crate::providers::{ApiError, BotEvent, BOT_TERMINATE_EVENT};
    use crate::store::EntityStore;

    const URL: &str = "https://compute/p-0-abcd";

    async fn seed_vm(h: &Harness) -> Vm {
        let vm = Vm {
            id: "p-0".to_string(),
            config: "p".to_string(),
            hostname: "p-0-abcd".to_string(),
            swarming: "bots.example.com".to_string(),
            lifetime: 3600,
            timeout: 600,
            created: Some(start()),
            url: URL.to_string(),
            ..Default::default()
        };
        h.store.put_vm(&vm).await.unwrap();
        vm
    }

    #[tokio::test]
    async fn test_manage_bot_skips_without_url() {
        let h = harness();
        let mut vm = seed_vm(&h).await;
        vm.url.clear();
        h.store.put_vm(&vm).await.unwrap();

        h.handlers.manage_bot("p-0").await.unwrap();
        assert!(h.fleet.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_bot_within_timeout_waits() {
        let h = harness();
        seed_vm(&h).await;
        h.clock.advance(Duration::seconds(300));

        h.handlers.manage_bot("p-0").await.unwrap();
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_bot_after_timeout_destroys() {
        let h = harness();
        seed_vm(&h).await;
        h.clock.advance(Duration::seconds(601));

        h.handlers.manage_bot("p-0").await.unwrap();
        assert_eq!(
            h.queue.tasks(Queue::DestroyInstance).await,
            vec![Task::destroy_instance("p-0", URL)]
        );
    }

    #[tokio::test]
    async fn test_missing_bot_after_connecting_waits_until_lifetime() {
        let h = harness();
        let mut vm = seed_vm(&h).await;
        vm.connected = Some(start() + Duration::seconds(60));
        h.store.put_vm(&vm).await.unwrap();

        h.clock.advance(Duration::seconds(601));
        h.handlers.manage_bot("p-0").await.unwrap();
        assert!(h.queue.is_empty().await);

        h.clock.advance(Duration::seconds(3000));
        h.handlers.manage_bot("p-0").await.unwrap();
        assert_eq!(h.queue.tasks(Queue::DestroyInstance).await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_bot_drained_destroys() {
        let h = harness();
        let mut vm = seed_vm(&h).await;
        vm.drained = true;
        h.store.put_vm(&vm).await.unwrap();

        h.handlers.manage_bot("p-0").await.unwrap();
        assert_eq!(h.queue.tasks(Queue::DestroyInstance).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_bot_destroys() {
        let h = harness();
        seed_vm(&h).await;
        let bot = BotInfo {
            is_dead: true,
            ..BotInfo::alive("p-0-abcd", None)
        };
        h.fleet.set_bot("p-0-abcd", bot).await;

        h.handlers.manage_bot("p-0").await.unwrap();
        assert_eq!(h.queue.tasks(Queue::DestroyInstance).await.len(), 1);
    }

    #[tokio::test]
    async fn test_fleet_error_is_surfaced() {
        let h = harness();
        seed_vm(&h).await;
        h.fleet.push_get_error(ApiError::new(503, "unavailable")).await;

        let err = h.handlers.manage_bot("p-0").await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_alive_bot_stamps_connected_once() {
        let h = harness();
        seed_vm(&h).await;
        let first_seen = start() + Duration::seconds(90);
        h.fleet
            .set_bot("p-0-abcd", BotInfo::alive("p-0-abcd", Some(first_seen)))
            .await;
        h.clock.advance(Duration::seconds(120));

        h.handlers.manage_bot("p-0").await.unwrap();
        let vm = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert_eq!(vm.connected, Some(first_seen));
        assert!(h.queue.is_empty().await);

        h.fleet
            .set_bot("p-0-abcd", BotInfo::alive("p-0-abcd", Some(start())))
            .await;
        h.handlers.manage_bot("p-0").await.unwrap();
        let vm = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert_eq!(vm.connected, Some(first_seen));
    }

    #[tokio::test]
    async fn test_alive_bot_without_first_seen_uses_now() {
        let h = harness();
        seed_vm(&h).await;
        h.fleet
            .set_bot("p-0-abcd", BotInfo::alive("p-0-abcd", None))
            .await;
        h.clock.advance(Duration::seconds(45));

        h.handlers.manage_bot("p-0").await.unwrap();
        let vm = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert_eq!(vm.connected, Some(start() + Duration::seconds(45)));
    }

    #[tokio::test]
    async fn test_terminate_event_destroys() {
        let h = harness();
        seed_vm(&h).await;
        h.fleet
            .set_bot("p-0-abcd", BotInfo::alive("p-0-abcd", None))
            .await;
        h.fleet
            .push_event("p-0-abcd", BotEvent::new(BOT_TERMINATE_EVENT))
            .await;

        h.handlers.manage_bot("p-0").await.unwrap();
        assert_eq!(
            h.queue.tasks(Queue::DestroyInstance).await,
            vec![Task::destroy_instance("p-0", URL)]
        );
        assert!(h.queue.tasks(Queue::TerminateBot).await.is_empty());
    }

    #[tokio::test]
    async fn test_lifetime_exceeded_requests_termination() {
        let h = harness();
        seed_vm(&h).await;
        h.fleet
            .set_bot("p-0-abcd", BotInfo::alive("p-0-abcd", None))
            .await;
        h.clock.advance(Duration::seconds(3601));

        h.handlers.manage_bot("p-0").await.unwrap();
        assert_eq!(
            h.queue.tasks(Queue::TerminateBot).await,
            vec![Task::terminate_bot("p-0", "p-0-abcd")]
        );
        assert!(h.queue.tasks(Queue::DestroyInstance).await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_bot_fenced_and_tolerates_not_found() {
        let h = harness();
        seed_vm(&h).await;

        h.handlers.terminate_bot("p-0", "p-0-old1").await.unwrap();
        assert!(h.fleet.calls().await.is_empty());

        h.handlers.terminate_bot("p-0", "p-0-abcd").await.unwrap();
        assert_eq!(
            h.fleet.calls().await,
            vec![FleetCall::Terminate {
                hostname: "p-0-abcd".to_string()
            }]
        );

        h.fleet
            .push_terminate_error(ApiError::new(500, "backend"))
            .await;
        assert!(h.handlers.terminate_bot("p-0", "p-0-abcd").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_bot_clears_vm() {
        let h = harness();
        let mut vm = seed_vm(&h).await;
        vm.connected = Some(start());
        h.store.put_vm(&vm).await.unwrap();
        h.fleet
            .set_bot("p-0-abcd", BotInfo::alive("p-0-abcd", None))
            .await;

        h.handlers.delete_bot("p-0", "p-0-abcd").await.unwrap();

        assert!(h.fleet.bot("p-0-abcd").await.is_none());
        let vm = h.store.get_vm("p-0").await.unwrap().unwrap();
        assert!(vm.hostname.is_empty() && vm.url.is_empty());
        assert!(vm.created.is_none() && vm.connected.is_none());
        assert_eq!(vm.config, "p");

        // Redelivery finds the hostname changed.
        h.handlers.delete_bot("p-0", "p-0-abcd").await.unwrap();
        assert_eq!(h.fleet.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_bot_removes_drained_vm() {
        let h = harness();
        let mut vm = seed_vm(&h).await;
        vm.drained = true;
        h.store.put_vm(&vm).await.unwrap();

        // Not registered is treated as already deleted.
        h.handlers.delete_bot("p-0", "p-0-abcd").await.unwrap();
        assert!(h.store.get_vm("p-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_bot_error_keeps_vm() {
        let h = harness();
        let vm = seed_vm(&h).await;
        h.fleet.push_delete_error(ApiError::new(503, "down")).await;

        assert!(h.handlers.delete_bot("p-0", "p-0-abcd").await.is_err());
        assert_eq!(h.store.get_vm("p-0").await.unwrap().unwrap(), vm);
    }
}
