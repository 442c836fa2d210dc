//! Task payload definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmfleet_model::VmAttributes;

use crate::error::TaskError;

// =============================================================================
// Queues
// =============================================================================

/// Named queue; one per payload kind, independently rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Queue {
    ExpandConfig,
    CreateVm,
    CreateInstance,
    ManageBot,
    TerminateBot,
    DestroyInstance,
    DeleteBot,
    CountVms,
    ReportQuota,
}

impl Queue {
    /// Every queue, in pipeline order.
    pub const ALL: [Queue; 9] = [
        Queue::ExpandConfig,
        Queue::CreateVm,
        Queue::CreateInstance,
        Queue::ManageBot,
        Queue::TerminateBot,
        Queue::DestroyInstance,
        Queue::DeleteBot,
        Queue::CountVms,
        Queue::ReportQuota,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::ExpandConfig => "expand-config",
            Queue::CreateVm => "create-vm",
            Queue::CreateInstance => "create-instance",
            Queue::ManageBot => "manage-bot",
            Queue::TerminateBot => "terminate-bot",
            Queue::DestroyInstance => "destroy-instance",
            Queue::DeleteBot => "delete-bot",
            Queue::CountVms => "count-vms",
            Queue::ReportQuota => "report-quota",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Queue {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Queue::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| TaskError::UnknownQueue(s.to_string()))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Recompute a config's amount and enqueue its slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandConfig {
    pub id: String,
}

/// Create the VM entity for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVm {
    pub id: String,
    pub config: String,
    pub index: i32,
    pub attributes: VmAttributes,
    pub prefix: String,
    pub lifetime: i64,
    pub timeout: i64,
    pub swarming: String,
    pub revision: String,
    pub configured: DateTime<Utc>,
}

/// Create the compute instance backing a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstance {
    pub id: String,
}

/// Evaluate a VM's bot and decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageBot {
    pub id: String,
}

/// Ask a bot to shut down gracefully. Fenced on `hostname`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateBot {
    pub id: String,
    pub hostname: String,
}

/// Delete a VM's compute instance. Fenced on `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyInstance {
    pub id: String,
    pub url: String,
}

/// Delete a bot registration and clear the VM. Fenced on `hostname`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBot {
    pub id: String,
    pub hostname: String,
}

/// Publish VM count gauges for a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountVms {
    pub id: String,
}

/// Publish quota gauges for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQuota {
    pub id: String,
}

// =============================================================================
// Task
// =============================================================================

/// A unit of work for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    ExpandConfig(ExpandConfig),
    CreateVm(CreateVm),
    CreateInstance(CreateInstance),
    ManageBot(ManageBot),
    TerminateBot(TerminateBot),
    DestroyInstance(DestroyInstance),
    DeleteBot(DeleteBot),
    CountVms(CountVms),
    ReportQuota(ReportQuota),
}

impl Task {
    pub fn expand_config(config_id: impl Into<String>) -> Self {
        Task::ExpandConfig(ExpandConfig {
            id: config_id.into(),
        })
    }

    pub fn create_instance(vm_id: impl Into<String>) -> Self {
        Task::CreateInstance(CreateInstance { id: vm_id.into() })
    }

    pub fn manage_bot(vm_id: impl Into<String>) -> Self {
        Task::ManageBot(ManageBot { id: vm_id.into() })
    }

    pub fn terminate_bot(vm_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Task::TerminateBot(TerminateBot {
            id: vm_id.into(),
            hostname: hostname.into(),
        })
    }

    pub fn destroy_instance(vm_id: impl Into<String>, url: impl Into<String>) -> Self {
        Task::DestroyInstance(DestroyInstance {
            id: vm_id.into(),
            url: url.into(),
        })
    }

    pub fn delete_bot(vm_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Task::DeleteBot(DeleteBot {
            id: vm_id.into(),
            hostname: hostname.into(),
        })
    }

    pub fn count_vms(config_id: impl Into<String>) -> Self {
        Task::CountVms(CountVms {
            id: config_id.into(),
        })
    }

    pub fn report_quota(project_id: impl Into<String>) -> Self {
        Task::ReportQuota(ReportQuota {
            id: project_id.into(),
        })
    }

    /// The queue this payload kind is delivered on.
    pub fn queue(&self) -> Queue {
        match self {
            Task::ExpandConfig(_) => Queue::ExpandConfig,
            Task::CreateVm(_) => Queue::CreateVm,
            Task::CreateInstance(_) => Queue::CreateInstance,
            Task::ManageBot(_) => Queue::ManageBot,
            Task::TerminateBot(_) => Queue::TerminateBot,
            Task::DestroyInstance(_) => Queue::DestroyInstance,
            Task::DeleteBot(_) => Queue::DeleteBot,
            Task::CountVms(_) => Queue::CountVms,
            Task::ReportQuota(_) => Queue::ReportQuota,
        }
    }

    /// The entity id the task targets.
    pub fn entity_id(&self) -> &str {
        match self {
            Task::ExpandConfig(t) => &t.id,
            Task::CreateVm(t) => &t.id,
            Task::CreateInstance(t) => &t.id,
            Task::ManageBot(t) => &t.id,
            Task::TerminateBot(t) => &t.id,
            Task::DestroyInstance(t) => &t.id,
            Task::DeleteBot(t) => &t.id,
            Task::CountVms(t) => &t.id,
            Task::ReportQuota(t) => &t.id,
        }
    }

    /// Reject payloads no handler could act on.
    pub fn validate(&self) -> Result<(), TaskError> {
        let name = self.queue().as_str();
        require(name, "id", self.entity_id())?;
        match self {
            Task::CreateVm(t) => {
                require(name, "config", &t.config)?;
                require(name, "prefix", &t.prefix)?;
                if t.index < 0 {
                    return Err(TaskError::InvalidField {
                        task: name,
                        field: "index",
                        message: format!("must be non-negative, got {}", t.index),
                    });
                }
                Ok(())
            }
            Task::TerminateBot(t) => require(name, "hostname", &t.hostname),
            Task::DeleteBot(t) => require(name, "hostname", &t.hostname),
            Task::DestroyInstance(t) => require(name, "url", &t.url),
            _ => Ok(()),
        }
    }
}

fn require(task: &'static str, field: &'static str, value: &str) -> Result<(), TaskError> {
    if value.is_empty() {
        return Err(TaskError::MissingField { task, field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_queue_names_round_trip() {
        for queue in Queue::ALL {
            assert_eq!(queue.as_str().parse::<Queue>().unwrap(), queue);
        }
        assert!("bogus".parse::<Queue>().is_err());
    }

    #[rstest]
    #[case(Task::expand_config(""), "id")]
    #[case(Task::terminate_bot("p-0", ""), "hostname")]
    #[case(Task::delete_bot("", "h"), "id")]
    #[case(Task::destroy_instance("p-0", ""), "url")]
    fn test_validate_missing_fields(#[case] task: Task, #[case] field: &str) {
        match task.validate() {
            Err(TaskError::MissingField { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected missing {field}, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_negative_index() {
        let task = Task::CreateVm(CreateVm {
            id: "p--1".to_string(),
            config: "p".to_string(),
            index: -1,
            attributes: VmAttributes::default(),
            prefix: "p".to_string(),
            lifetime: 0,
            timeout: 0,
            swarming: String::new(),
            revision: String::new(),
            configured: Utc::now(),
        });
        assert!(matches!(
            task.validate(),
            Err(TaskError::InvalidField { field: "index", .. })
        ));
    }

    #[test]
    fn test_task_wire_shape() {
        let task = Task::destroy_instance("p-0", "https://compute/p-0-abcd");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "destroy_instance");
        assert_eq!(json["url"], "https://compute/p-0-abcd");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.queue(), Queue::DestroyInstance);
    }
}
