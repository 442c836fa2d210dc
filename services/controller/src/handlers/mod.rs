//! Task handlers.
//!
//! One handler per task kind, selected by an explicit match in
//! [`Handlers::handle`]. Every handler is idempotent: delivery is
//! at-least-once, so a handler may run again after it (or a predecessor)
//! already committed its effect.
//!
//! ## Fencing
//!
//! Teardown tasks carry the `url` or `hostname` they were issued for. A
//! handler that finds the VM with a different value does nothing, so a
//! late task from a previous incarnation cannot touch a replaced VM.
//!
//! ## Errors
//!
//! [`HandlerError::is_permanent`] decides between retrying a delivery and
//! giving up on it.

mod bots;
mod expand;
mod instances;
mod reports;
mod vms;

use thiserror::Error;
use tracing::instrument;
use vmfleet_model::ModelError;
use vmfleet_tasks::{Task, TaskError};

use crate::deps::Deps;
use crate::dispatch::DispatchError;
use crate::providers::ApiError;
use crate::store::StoreError;

/// Handler failures.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The task payload is malformed.
    #[error("invalid task: {0}")]
    InvalidTask(#[from] TaskError),

    /// The config a task refers to no longer exists.
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    /// The config's amount specification cannot be evaluated.
    #[error("invalid amount for config {id}: {source}")]
    InvalidAmount {
        id: String,
        #[source]
        source: ModelError,
    },

    /// The provider rejected an instance; the VM was removed so the slot
    /// can be recreated.
    #[error("instance creation failed for {id}: {message}")]
    InstanceCreationFailed { id: String, message: String },

    /// An accepted provider operation reported errors.
    #[error("operation failed for {id}: {message}")]
    OperationFailed { id: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Provider(#[from] ApiError),
}

impl HandlerError {
    /// Whether redelivering the task cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            HandlerError::InvalidTask(_)
            | HandlerError::ConfigNotFound(_)
            | HandlerError::InvalidAmount { .. }
            | HandlerError::InstanceCreationFailed { .. } => true,
            HandlerError::Dispatch(e) => e.is_permanent(),
            HandlerError::OperationFailed { .. }
            | HandlerError::Store(_)
            | HandlerError::Provider(_) => false,
        }
    }
}

/// The controller's task handlers.
#[derive(Clone)]
pub struct Handlers {
    deps: Deps,
}

impl Handlers {
    pub fn new(deps: Deps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &Deps {
        &self.deps
    }

    /// Run the handler for `task`.
    #[instrument(skip(self, task), fields(queue = %task.queue(), id = %task.entity_id()))]
    pub async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        task.validate()?;
        match task {
            Task::ExpandConfig(t) => self.expand_config(&t.id).await,
            Task::CreateVm(t) => self.create_vm(t).await,
            Task::CreateInstance(t) => self.create_instance(&t.id).await,
            Task::ManageBot(t) => self.manage_bot(&t.id).await,
            Task::TerminateBot(t) => self.terminate_bot(&t.id, &t.hostname).await,
            Task::DestroyInstance(t) => self.destroy_instance(&t.id, &t.url).await,
            Task::DeleteBot(t) => self.delete_bot(&t.id, &t.hostname).await,
            Task::CountVms(t) => self.count_vms(&t.id).await,
            Task::ReportQuota(t) => self.report_quota(&t.id).await,
        }
    }

    async fn enqueue(&self, task: Task) -> Result<(), HandlerError> {
        self.deps.dispatcher.add_tasks(vec![task]).await?;
        Ok(())
    }
}
