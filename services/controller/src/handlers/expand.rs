//! Config expansion.

use tracing::{info, instrument, warn};
use vmfleet_model::vm_id;
use vmfleet_tasks::{CreateVm, Task};

use super::{HandlerError, Handlers};
use crate::store::Mutation;

impl Handlers {
    /// Recompute a config's desired amount and enqueue one CreateVm per slot.
    ///
    /// The amount is written only when it changed. The CreateVm tasks are
    /// enqueued every time so deleted slots get recreated.
    #[instrument(skip(self))]
    pub async fn expand_config(&self, id: &str) -> Result<(), HandlerError> {
        let Some(mut config) = self.deps.store.get_config(id).await? else {
            warn!(config_id = %id, "Config not found; nothing to expand");
            return Err(HandlerError::ConfigNotFound(id.to_string()));
        };

        let now = self.deps.clock.now();
        let amount = config
            .compute_amount(now)
            .map_err(|source| HandlerError::InvalidAmount {
                id: id.to_string(),
                source,
            })?;

        if amount != config.current_amount {
            let outcome = self
                .deps
                .store
                .transact_config(id, &|current| match current {
                    Some(c) if c.current_amount != amount => {
                        let mut c = c.clone();
                        c.current_amount = amount;
                        Mutation::Put(c)
                    }
                    _ => Mutation::Keep,
                })
                .await?;
            info!(
                config_id = %id,
                from = config.current_amount,
                to = amount,
                written = outcome.changed(),
                "Updated current amount"
            );
            config.current_amount = amount;
        }

        let attributes = config.attributes.clone().resolve_zone();
        let tasks: Vec<Task> = (0..config.current_amount)
            .map(|index| {
                Task::CreateVm(CreateVm {
                    id: vm_id(&config.prefix, index),
                    config: config.id.clone(),
                    index,
                    attributes: attributes.clone(),
                    prefix: config.prefix.clone(),
                    lifetime: config.lifetime,
                    timeout: config.timeout,
                    swarming: config.swarming.clone(),
                    revision: config.revision.clone(),
                    configured: now,
                })
            })
            .collect();

        let count = tasks.len();
        if count > 0 {
            self.deps.dispatcher.add_tasks(tasks).await?;
        }
        info!(config_id = %id, count, "Enqueued VM creation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vmfleet_model::{Amount, DayOfWeek, Schedule, TimeOfDay};
    use vmfleet_tasks::{Queue, Task};

    use super::super::testing::{config, harness};
    use super::*;
    use crate::clock::Clock;
    use crate::store::EntityStore;

    #[tokio::test]
    async fn test_expand_fixed_amount() {
        let h = harness();
        h.store.put_config(&config("p", 3)).await.unwrap();

        h.handlers.expand_config("p").await.unwrap();

        let stored = h.store.get_config("p").await.unwrap().unwrap();
        assert_eq!(stored.current_amount, 3);

        let tasks = h.queue.tasks(Queue::CreateVm).await;
        assert_eq!(tasks.len(), 3);
        for (i, task) in tasks.iter().enumerate() {
            let Task::CreateVm(t) = task else {
                panic!("unexpected task {task:?}");
            };
            assert_eq!(t.id, format!("p-{i}"));
            assert_eq!(t.index, i as i32);
            assert_eq!(t.config, "p");
            assert_eq!(
                t.attributes.machine_type,
                "zones/us-central1-b/machineTypes/n1-standard-2"
            );
            assert_eq!(t.configured, h.clock.now());
        }
    }

    #[tokio::test]
    async fn test_expand_reenqueues_when_unchanged() {
        let h = harness();
        let mut c = config("p", 2);
        c.current_amount = 2;
        h.store.put_config(&c).await.unwrap();

        h.handlers.expand_config("p").await.unwrap();
        assert_eq!(h.queue.tasks(Queue::CreateVm).await.len(), 2);
    }

    #[tokio::test]
    async fn test_expand_with_start_in_dst_gap() {
        let h = harness();
        let mut c = config("p", 0);
        c.amount = Amount {
            min: 2,
            max: 2,
            change: vec![Schedule {
                min: 4,
                max: 4,
                length: 8 * 3600,
                start: TimeOfDay {
                    day: DayOfWeek::Sunday,
                    location: "America/New_York".to_string(),
                    time: "02:30".to_string(),
                },
            }],
        };
        h.store.put_config(&c).await.unwrap();
        // Monday 2024-03-11 12:00Z, the day after the spring-forward.
        h.clock
            .advance(chrono::Duration::days(70) + chrono::Duration::hours(12));

        h.handlers.expand_config("p").await.unwrap();
        assert_eq!(h.store.get_config("p").await.unwrap().unwrap().current_amount, 2);
        assert_eq!(h.queue.tasks(Queue::CreateVm).await.len(), 2);
    }

    #[tokio::test]
    async fn test_expand_shrinks_outside_schedule() {
        let h = harness();
        let mut c = config("p", 0);
        // 2024-01-01 is a Monday; the harness clock starts at midnight.
        c.amount = Amount {
            min: 1,
            max: 1,
            change: vec![Schedule {
                min: 4,
                max: 4,
                length: 3600,
                start: TimeOfDay {
                    day: DayOfWeek::Monday,
                    location: String::new(),
                    time: "00:00".to_string(),
                },
            }],
        };
        c.current_amount = 2;
        h.store.put_config(&c).await.unwrap();

        h.handlers.expand_config("p").await.unwrap();
        assert_eq!(h.store.get_config("p").await.unwrap().unwrap().current_amount, 4);

        h.clock.advance(chrono::Duration::hours(2));
        h.queue.take_all().await;
        h.handlers.expand_config("p").await.unwrap();
        assert_eq!(h.store.get_config("p").await.unwrap().unwrap().current_amount, 1);
        assert_eq!(h.queue.tasks(Queue::CreateVm).await.len(), 1);
    }

    #[tokio::test]
    async fn test_expand_missing_config_is_permanent() {
        let h = harness();
        let err = h.handlers.expand_config("nope").await.unwrap_err();
        assert!(matches!(err, HandlerError::ConfigNotFound(_)));
        assert!(err.is_permanent());
        assert!(h.queue.is_empty().await);
    }
}
