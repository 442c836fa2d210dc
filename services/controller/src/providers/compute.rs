//! Compute provider: instance lifecycle and regional quotas.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use vmfleet_model::{Vm, VmAttributes};

use super::{error_from_response, ApiError};

/// Request to create one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertInstance {
    pub project: String,
    pub zone: String,
    /// Instance name; the VM's hostname.
    pub name: String,
    pub attributes: VmAttributes,
    /// Idempotency key; the provider deduplicates repeated requests.
    pub request_id: Uuid,
}

impl InsertInstance {
    /// The insert request for a VM's current incarnation.
    pub fn for_vm(vm: &Vm) -> Self {
        Self {
            project: vm.attributes.project.clone(),
            zone: vm.attributes.zone.clone(),
            name: vm.hostname.clone(),
            attributes: vm.attributes.clone(),
            request_id: vm.create_request_id(),
        }
    }
}

/// Progress of a long-running provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
}

/// Per-item error embedded in an otherwise accepted operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// A long-running provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub status: OperationStatus,
    pub errors: Vec<OperationError>,
    /// Resource the operation acts on.
    pub target_link: String,
}

impl Operation {
    pub fn done() -> Self {
        Self {
            status: OperationStatus::Done,
            errors: Vec::new(),
            target_link: String::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The embedded errors joined into one message.
    pub fn error_message(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A created instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    /// Instance handle, stored as the VM's `url`.
    pub self_link: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub network_interfaces: Vec<InstanceNetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceNetworkInterface {
    #[serde(rename = "networkIP")]
    pub network_ip: String,
    pub access_configs: Vec<InstanceAccessConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceAccessConfig {
    #[serde(rename = "natIP")]
    pub nat_ip: String,
}

/// One region and its quotas.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Region {
    pub name: String,
    pub quotas: Vec<Quota>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Quota {
    pub metric: String,
    pub limit: f64,
    pub usage: f64,
}

/// Compute instance provider.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Start creating an instance.
    async fn insert_instance(&self, request: &InsertInstance) -> Result<Operation, ApiError>;

    /// Start deleting an instance.
    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        request_id: Uuid,
    ) -> Result<Operation, ApiError>;

    async fn get_instance(&self, project: &str, zone: &str, name: &str)
        -> Result<Instance, ApiError>;

    /// Regions of a project with their quotas.
    async fn list_regions(&self, project: &str) -> Result<Vec<Region>, ApiError>;
}

// =============================================================================
// HTTP client
// =============================================================================

/// Compute v1 REST client.
pub struct GceClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl GceClient {
    /// Create a client against `base_url`, e.g.
    /// `https://compute.googleapis.com/compute/v1`.
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ComputeProvider for GceClient {
    async fn insert_instance(&self, request: &InsertInstance) -> Result<Operation, ApiError> {
        let path = format!(
            "/projects/{}/zones/{}/instances",
            request.project, request.zone
        );
        debug!(name = %request.name, request_id = %request.request_id, "Inserting instance");

        let body = InstanceBody::new(&request.name, &request.attributes);
        let op: OperationResource = Self::send(
            self.request(reqwest::Method::POST, &path)
                .query(&[("requestId", request.request_id.to_string())])
                .json(&body),
        )
        .await?;
        Ok(op.into())
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        request_id: Uuid,
    ) -> Result<Operation, ApiError> {
        let path = format!("/projects/{project}/zones/{zone}/instances/{name}");
        debug!(name, request_id = %request_id, "Deleting instance");

        let op: OperationResource = Self::send(
            self.request(reqwest::Method::DELETE, &path)
                .query(&[("requestId", request_id.to_string())]),
        )
        .await?;
        Ok(op.into())
    }

    async fn get_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Instance, ApiError> {
        let path = format!("/projects/{project}/zones/{zone}/instances/{name}");
        Self::send(self.request(reqwest::Method::GET, &path)).await
    }

    async fn list_regions(&self, project: &str) -> Result<Vec<Region>, ApiError> {
        let path = format!("/projects/{project}/regions");
        let list: RegionList = Self::send(self.request(reqwest::Method::GET, &path)).await?;
        Ok(list.items)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResource {
    status: OperationStatus,
    #[serde(default)]
    error: Option<OperationErrors>,
    #[serde(default)]
    target_link: String,
}

#[derive(Debug, Default, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationError>,
}

impl From<OperationResource> for Operation {
    fn from(op: OperationResource) -> Self {
        Self {
            status: op.status,
            errors: op.error.map(|e| e.errors).unwrap_or_default(),
            target_link: op.target_link,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegionList {
    #[serde(default)]
    items: Vec<Region>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceBody<'a> {
    name: &'a str,
    machine_type: &'a str,
    disks: Vec<AttachedDisk<'a>>,
    network_interfaces: Vec<NetworkInterfaceBody<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    service_accounts: Vec<ServiceAccountBody<'a>>,
    metadata: Items<MetadataItem<'a>>,
    tags: Items<&'a str>,
    #[serde(skip_serializing_if = "no_labels")]
    labels: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_blank")]
    min_cpu_platform: &'a str,
}

impl<'a> InstanceBody<'a> {
    fn new(name: &'a str, attrs: &'a VmAttributes) -> Self {
        Self {
            name,
            machine_type: &attrs.machine_type,
            disks: attrs
                .disks
                .iter()
                .enumerate()
                .map(|(i, disk)| AttachedDisk {
                    boot: i == 0,
                    auto_delete: true,
                    initialize_params: InitializeParams {
                        source_image: &disk.image,
                        disk_size_gb: disk.size_gb.to_string(),
                        disk_type: &disk.disk_type,
                    },
                })
                .collect(),
            network_interfaces: attrs
                .network_interfaces
                .iter()
                .map(|nic| NetworkInterfaceBody {
                    network: &nic.network,
                    subnetwork: &nic.subnetwork,
                    access_configs: nic
                        .access_configs
                        .iter()
                        .map(|ac| AccessConfigBody { kind: &ac.kind })
                        .collect(),
                })
                .collect(),
            service_accounts: attrs
                .service_accounts
                .iter()
                .map(|sa| ServiceAccountBody {
                    email: &sa.email,
                    scopes: &sa.scopes,
                })
                .collect(),
            metadata: Items {
                items: attrs
                    .metadata
                    .iter()
                    .map(|m| MetadataItem {
                        key: &m.key,
                        value: &m.value,
                    })
                    .collect(),
            },
            tags: Items {
                items: attrs.tags.iter().map(String::as_str).collect(),
            },
            labels: &attrs.labels,
            min_cpu_platform: &attrs.min_cpu_platform,
        }
    }
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

fn no_labels(labels: &&BTreeMap<String, String>) -> bool {
    labels.is_empty()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachedDisk<'a> {
    boot: bool,
    auto_delete: bool,
    initialize_params: InitializeParams<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams<'a> {
    #[serde(skip_serializing_if = "is_blank")]
    source_image: &'a str,
    disk_size_gb: String,
    #[serde(skip_serializing_if = "is_blank")]
    disk_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceBody<'a> {
    #[serde(skip_serializing_if = "is_blank")]
    network: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    subnetwork: &'a str,
    access_configs: Vec<AccessConfigBody<'a>>,
}

#[derive(Debug, Serialize)]
struct AccessConfigBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct ServiceAccountBody<'a> {
    email: &'a str,
    scopes: &'a [String],
}

#[derive(Debug, Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Serialize)]
struct MetadataItem<'a> {
    key: &'a str,
    value: &'a str,
}
