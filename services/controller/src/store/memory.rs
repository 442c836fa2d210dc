//! In-memory entity store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use vmfleet_model::{Config, Project, Vm};

use super::{
    decode, encode, ConfigTxn, Entity, EntityStore, Mutation, StoreError, TxnOutcome, VmQuery,
    VmTxn,
};

/// Entity store held in process memory.
///
/// Bodies are kept as JSON, as the Postgres store keeps them, so unknown
/// properties survive a round trip. One lock guards everything, which makes
/// every transaction atomic.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    rows: Mutex<BTreeMap<(&'static str, String), serde_json::Value>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get<T: Entity>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let rows = self.rows.lock().await;
        rows.get(&(T::KIND, id.to_string()))
            .map(|body| decode(id, body.clone()))
            .transpose()
    }

    async fn put<T: Entity>(&self, entity: &T) -> Result<(), StoreError> {
        let body = encode(entity)?;
        self.rows
            .lock()
            .await
            .insert((T::KIND, entity.entity_id().to_string()), body);
        Ok(())
    }

    async fn delete<T: Entity>(&self, id: &str) -> Result<(), StoreError> {
        self.rows.lock().await.remove(&(T::KIND, id.to_string()));
        Ok(())
    }

    async fn list<T: Entity>(&self) -> Result<Vec<T>, StoreError> {
        let rows = self.rows.lock().await;
        rows.iter()
            .filter(|((kind, _), _)| *kind == T::KIND)
            .map(|((_, id), body)| decode(id, body.clone()))
            .collect()
    }

    async fn transact<T: Entity>(
        &self,
        id: &str,
        f: &(dyn Fn(Option<&T>) -> Mutation<T> + Send + Sync),
    ) -> Result<TxnOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let key = (T::KIND, id.to_string());
        let current: Option<T> = rows
            .get(&key)
            .map(|body| decode(id, body.clone()))
            .transpose()?;

        match f(current.as_ref()) {
            Mutation::Keep => Ok(TxnOutcome::Unchanged),
            Mutation::Put(entity) => {
                rows.insert(key, encode(&entity)?);
                Ok(TxnOutcome::Written)
            }
            Mutation::Delete => Ok(match rows.remove(&key) {
                Some(_) => TxnOutcome::Deleted,
                None => TxnOutcome::Unchanged,
            }),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_config(&self, id: &str) -> Result<Option<Config>, StoreError> {
        self.get(id).await
    }

    async fn put_config(&self, config: &Config) -> Result<(), StoreError> {
        self.put(config).await
    }

    async fn delete_config(&self, id: &str) -> Result<(), StoreError> {
        self.delete::<Config>(id).await
    }

    async fn list_configs(&self) -> Result<Vec<Config>, StoreError> {
        self.list().await
    }

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>, StoreError> {
        self.get(id).await
    }

    async fn put_vm(&self, vm: &Vm) -> Result<(), StoreError> {
        self.put(vm).await
    }

    async fn delete_vm(&self, id: &str) -> Result<(), StoreError> {
        self.delete::<Vm>(id).await
    }

    async fn query_vms(&self, query: &VmQuery) -> Result<Vec<Vm>, StoreError> {
        let vms: Vec<Vm> = self.list().await?;
        Ok(vms.into_iter().filter(|vm| query.matches(vm)).collect())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        self.get(id).await
    }

    async fn put_project(&self, project: &Project) -> Result<(), StoreError> {
        self.put(project).await
    }

    async fn delete_project(&self, id: &str) -> Result<(), StoreError> {
        self.delete::<Project>(id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.list().await
    }

    async fn transact_config(&self, id: &str, f: ConfigTxn<'_>) -> Result<TxnOutcome, StoreError> {
        self.transact(id, f).await
    }

    async fn transact_vm(&self, id: &str, f: VmTxn<'_>) -> Result<TxnOutcome, StoreError> {
        self.transact(id, f).await
    }
}
