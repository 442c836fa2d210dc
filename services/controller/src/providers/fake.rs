//! In-process providers for tests and local development.
//!
//! Both fakes record every call and can be scripted to fail. [`FakeCompute`]
//! deduplicates inserts by request id like the real API does.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ApiError, BotEvent, BotInfo, BotProvider, ComputeProvider, InsertInstance, Instance,
    InstanceAccessConfig, InstanceNetworkInterface, Operation, OperationError, OperationStatus,
    Region,
};
use crate::clock::{Clock, SystemClock};

/// A call made to [`FakeCompute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeCall {
    Insert { name: String, request_id: Uuid },
    Delete { name: String, request_id: Uuid },
    Get { name: String },
    ListRegions { project: String },
}

struct ComputeState {
    instances: BTreeMap<String, Instance>,
    seen_inserts: BTreeSet<Uuid>,
    /// Inserts acknowledged as pending, by request id.
    pending_inserts: BTreeMap<Uuid, InsertInstance>,
    calls: Vec<ComputeCall>,
    insert_status: OperationStatus,
    delete_status: OperationStatus,
    insert_operation_errors: Vec<OperationError>,
    insert_errors: VecDeque<ApiError>,
    delete_errors: VecDeque<ApiError>,
    get_errors: VecDeque<ApiError>,
    regions: BTreeMap<String, Vec<Region>>,
}

/// Scriptable in-memory compute provider.
pub struct FakeCompute {
    state: Mutex<ComputeState>,
    clock: Arc<dyn Clock>,
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl FakeCompute {
    /// Instances are stamped with creation times from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ComputeState {
                instances: BTreeMap::new(),
                seen_inserts: BTreeSet::new(),
                pending_inserts: BTreeMap::new(),
                calls: Vec::new(),
                insert_status: OperationStatus::Done,
                delete_status: OperationStatus::Done,
                insert_operation_errors: Vec::new(),
                insert_errors: VecDeque::new(),
                delete_errors: VecDeque::new(),
                get_errors: VecDeque::new(),
                regions: BTreeMap::new(),
            }),
            clock,
        }
    }

    /// Status reported by subsequent inserts; instances only appear once
    /// an insert reports `Done`.
    pub async fn set_insert_status(&self, status: OperationStatus) {
        self.state.lock().await.insert_status = status;
    }

    pub async fn set_delete_status(&self, status: OperationStatus) {
        self.state.lock().await.delete_status = status;
    }

    /// Errors embedded in subsequent insert operations.
    pub async fn set_insert_operation_errors(&self, errors: Vec<OperationError>) {
        self.state.lock().await.insert_operation_errors = errors;
    }

    /// Fail the next insert with `err`.
    pub async fn push_insert_error(&self, err: ApiError) {
        self.state.lock().await.insert_errors.push_back(err);
    }

    /// Fail the next delete with `err`.
    pub async fn push_delete_error(&self, err: ApiError) {
        self.state.lock().await.delete_errors.push_back(err);
    }

    /// Fail the next instance lookup with `err`.
    pub async fn push_get_error(&self, err: ApiError) {
        self.state.lock().await.get_errors.push_back(err);
    }

    pub async fn set_regions(&self, project: &str, regions: Vec<Region>) {
        self.state
            .lock()
            .await
            .regions
            .insert(project.to_string(), regions);
    }

    /// Finish every insert that was acknowledged as pending, as the real
    /// API does in the background. Returns how many instances appeared.
    pub async fn complete_pending_inserts(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending_inserts);
        let mut created = 0;
        for (request_id, request) in pending {
            if !state.seen_inserts.insert(request_id) {
                continue;
            }
            let link = Self::self_link(&request.project, &request.zone, &request.name);
            let instance = build_instance(&request, link, now);
            state.instances.insert(request.name.clone(), instance);
            created += 1;
        }
        created
    }

    pub async fn instance(&self, name: &str) -> Option<Instance> {
        self.state.lock().await.instances.get(name).cloned()
    }

    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    pub async fn calls(&self) -> Vec<ComputeCall> {
        self.state.lock().await.calls.clone()
    }

    fn self_link(project: &str, zone: &str, name: &str) -> String {
        format!("https://compute.example/projects/{project}/zones/{zone}/instances/{name}")
    }
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn insert_instance(&self, request: &InsertInstance) -> Result<Operation, ApiError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.calls.push(ComputeCall::Insert {
            name: request.name.clone(),
            request_id: request.request_id,
        });

        if let Some(err) = state.insert_errors.pop_front() {
            return Err(err);
        }
        let target_link = Self::self_link(&request.project, &request.zone, &request.name);
        if !state.insert_operation_errors.is_empty() {
            return Ok(Operation {
                status: OperationStatus::Done,
                errors: state.insert_operation_errors.clone(),
                target_link,
            });
        }
        if state.insert_status != OperationStatus::Done {
            state
                .pending_inserts
                .insert(request.request_id, request.clone());
            return Ok(Operation {
                status: state.insert_status,
                errors: Vec::new(),
                target_link,
            });
        }

        if state.seen_inserts.insert(request.request_id) {
            state.pending_inserts.remove(&request.request_id);
            let instance = build_instance(request, target_link.clone(), now);
            state.instances.insert(request.name.clone(), instance);
        }

        Ok(Operation {
            target_link,
            ..Operation::done()
        })
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        request_id: Uuid,
    ) -> Result<Operation, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(ComputeCall::Delete {
            name: name.to_string(),
            request_id,
        });

        if let Some(err) = state.delete_errors.pop_front() {
            return Err(err);
        }
        if !state.instances.contains_key(name) {
            return Err(ApiError::not_found(format!("instance {name} not found")));
        }
        let target_link = Self::self_link(project, zone, name);
        if state.delete_status != OperationStatus::Done {
            return Ok(Operation {
                status: state.delete_status,
                errors: Vec::new(),
                target_link,
            });
        }
        state.instances.remove(name);
        Ok(Operation {
            target_link,
            ..Operation::done()
        })
    }

    async fn get_instance(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
    ) -> Result<Instance, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(ComputeCall::Get {
            name: name.to_string(),
        });
        if let Some(err) = state.get_errors.pop_front() {
            return Err(err);
        }
        state
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("instance {name} not found")))
    }

    async fn list_regions(&self, project: &str) -> Result<Vec<Region>, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(ComputeCall::ListRegions {
            project: project.to_string(),
        });
        Ok(state.regions.get(project).cloned().unwrap_or_default())
    }
}

fn build_instance(request: &InsertInstance, self_link: String, now: DateTime<Utc>) -> Instance {
    let network_interfaces = request
        .attributes
        .network_interfaces
        .iter()
        .enumerate()
        .map(|(i, nic)| InstanceNetworkInterface {
            network_ip: format!("10.0.0.{}", i + 2),
            access_configs: nic
                .access_configs
                .iter()
                .map(|_| InstanceAccessConfig {
                    nat_ip: format!("203.0.113.{}", i + 2),
                })
                .collect(),
        })
        .collect();
    Instance {
        name: request.name.clone(),
        self_link,
        creation_timestamp: now,
        network_interfaces,
    }
}

/// A call made to [`FakeFleet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCall {
    Get { hostname: String },
    Events { hostname: String },
    Terminate { hostname: String },
    Delete { hostname: String },
}

#[derive(Default)]
struct FleetState {
    bots: BTreeMap<String, BotInfo>,
    events: BTreeMap<String, Vec<BotEvent>>,
    calls: Vec<FleetCall>,
    get_errors: VecDeque<ApiError>,
    terminate_errors: VecDeque<ApiError>,
    delete_errors: VecDeque<ApiError>,
}

/// Scriptable in-memory bot fleet. Bots are keyed by hostname only.
#[derive(Default)]
pub struct FakeFleet {
    state: Mutex<FleetState>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a bot.
    pub async fn set_bot(&self, hostname: &str, bot: BotInfo) {
        self.state
            .lock()
            .await
            .bots
            .insert(hostname.to_string(), bot);
    }

    pub async fn remove_bot(&self, hostname: &str) {
        self.state.lock().await.bots.remove(hostname);
    }

    pub async fn bot(&self, hostname: &str) -> Option<BotInfo> {
        self.state.lock().await.bots.get(hostname).cloned()
    }

    /// Record an event, newest first.
    pub async fn push_event(&self, hostname: &str, event: BotEvent) {
        self.state
            .lock()
            .await
            .events
            .entry(hostname.to_string())
            .or_default()
            .insert(0, event);
    }

    pub async fn push_get_error(&self, err: ApiError) {
        self.state.lock().await.get_errors.push_back(err);
    }

    pub async fn push_terminate_error(&self, err: ApiError) {
        self.state.lock().await.terminate_errors.push_back(err);
    }

    pub async fn push_delete_error(&self, err: ApiError) {
        self.state.lock().await.delete_errors.push_back(err);
    }

    pub async fn calls(&self) -> Vec<FleetCall> {
        self.state.lock().await.calls.clone()
    }
}

fn bot_not_found(hostname: &str) -> ApiError {
    ApiError::not_found(format!("bot {hostname} not found"))
}

#[async_trait]
impl BotProvider for FakeFleet {
    async fn get_bot(&self, _server: &str, hostname: &str) -> Result<BotInfo, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Get {
            hostname: hostname.to_string(),
        });
        if let Some(err) = state.get_errors.pop_front() {
            return Err(err);
        }
        state
            .bots
            .get(hostname)
            .cloned()
            .ok_or_else(|| bot_not_found(hostname))
    }

    async fn list_bot_events(
        &self,
        _server: &str,
        hostname: &str,
    ) -> Result<Vec<BotEvent>, ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Events {
            hostname: hostname.to_string(),
        });
        Ok(state.events.get(hostname).cloned().unwrap_or_default())
    }

    async fn terminate_bot(&self, _server: &str, hostname: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Terminate {
            hostname: hostname.to_string(),
        });
        if let Some(err) = state.terminate_errors.pop_front() {
            return Err(err);
        }
        if !state.bots.contains_key(hostname) {
            return Err(bot_not_found(hostname));
        }
        Ok(())
    }

    async fn delete_bot(&self, _server: &str, hostname: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.calls.push(FleetCall::Delete {
            hostname: hostname.to_string(),
        });
        if let Some(err) = state.delete_errors.pop_front() {
            return Err(err);
        }
        if state.bots.remove(hostname).is_none() {
            return Err(bot_not_found(hostname));
        }
        state.events.remove(hostname);
        Ok(())
    }
}
