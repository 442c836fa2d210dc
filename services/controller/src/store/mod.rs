//! Entity store.
//!
//! Holds configs, VMs, and projects. Every handler write goes through a
//! single-entity transaction: the closure sees the committed entity (or
//! `None`) and returns the [`Mutation`] to apply. Conflicting concurrent
//! transactions never both commit.
//!
//! Two implementations:
//! - [`MemoryEntityStore`] for tests and development
//! - [`crate::db::PgEntityStore`] backed by Postgres

mod memory;

pub use memory::MemoryEntityStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use vmfleet_model::{Config, Project, Vm};

/// Entity store errors. All of them are worth retrying.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transaction created the same entity first.
    #[error("concurrent write to {kind} {id}")]
    Conflict { kind: &'static str, id: String },

    /// The stored body could not be (de)serialized.
    #[error("serialization error for {kind} {id}: {message}")]
    Serialization {
        kind: &'static str,
        id: String,
        message: String,
    },

    /// The backend failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// What a transaction closure wants done with the entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    /// Leave the entity as it is.
    Keep,
    /// Write this value (insert or overwrite).
    Put(T),
    /// Remove the entity.
    Delete,
}

/// What a transaction committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Unchanged,
    Written,
    Deleted,
}

impl TxnOutcome {
    pub fn changed(self) -> bool {
        self != TxnOutcome::Unchanged
    }
}

/// Transaction closure over a config.
pub type ConfigTxn<'a> = &'a (dyn Fn(Option<&Config>) -> Mutation<Config> + Send + Sync);

/// Transaction closure over a VM.
pub type VmTxn<'a> = &'a (dyn Fn(Option<&Vm>) -> Mutation<Vm> + Send + Sync);

/// Field predicates for VM range queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmQuery {
    /// Only VMs owned by this config.
    pub config: Option<String>,
    /// Only VMs with (`true`) or without (`false`) a compute instance.
    pub has_url: Option<bool>,
}

impl VmQuery {
    pub fn for_config(config: impl Into<String>) -> Self {
        Self {
            config: Some(config.into()),
            has_url: None,
        }
    }

    pub fn with_url(has_url: bool) -> Self {
        Self {
            config: None,
            has_url: Some(has_url),
        }
    }

    pub fn matches(&self, vm: &Vm) -> bool {
        if let Some(config) = &self.config {
            if &vm.config != config {
                return false;
            }
        }
        if let Some(has_url) = self.has_url {
            if vm.url.is_empty() == has_url {
                return false;
            }
        }
        true
    }
}

/// Persistent store for controller entities.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_config(&self, id: &str) -> Result<Option<Config>, StoreError>;
    async fn put_config(&self, config: &Config) -> Result<(), StoreError>;
    async fn delete_config(&self, id: &str) -> Result<(), StoreError>;
    async fn list_configs(&self) -> Result<Vec<Config>, StoreError>;

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>, StoreError>;
    async fn put_vm(&self, vm: &Vm) -> Result<(), StoreError>;
    async fn delete_vm(&self, id: &str) -> Result<(), StoreError>;
    async fn query_vms(&self, query: &VmQuery) -> Result<Vec<Vm>, StoreError>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError>;
    async fn put_project(&self, project: &Project) -> Result<(), StoreError>;
    async fn delete_project(&self, id: &str) -> Result<(), StoreError>;
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    /// Atomically read, decide, and write one config.
    async fn transact_config(&self, id: &str, f: ConfigTxn<'_>) -> Result<TxnOutcome, StoreError>;

    /// Atomically read, decide, and write one VM.
    async fn transact_vm(&self, id: &str, f: VmTxn<'_>) -> Result<TxnOutcome, StoreError>;
}

/// A stored entity kind.
pub(crate) trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;

    fn entity_id(&self) -> &str;

    /// Owning config, for indexed VM queries.
    fn config_ref(&self) -> Option<&str> {
        None
    }

    /// Instance handle, for indexed VM queries.
    fn url_ref(&self) -> Option<&str> {
        None
    }
}

impl Entity for Config {
    const KIND: &'static str = "config";

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for Vm {
    const KIND: &'static str = "vm";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn config_ref(&self) -> Option<&str> {
        Some(&self.config)
    }

    fn url_ref(&self) -> Option<&str> {
        Some(&self.url)
    }
}

impl Entity for Project {
    const KIND: &'static str = "project";

    fn entity_id(&self) -> &str {
        &self.id
    }
}

pub(crate) fn encode<T: Entity>(entity: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(entity).map_err(|e| StoreError::Serialization {
        kind: T::KIND,
        id: entity.entity_id().to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn decode<T: Entity>(id: &str, body: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Serialization {
        kind: T::KIND,
        id: id.to_string(),
        message: e.to_string(),
    })
}
