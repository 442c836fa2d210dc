//! Instance templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Placeholder replaced with the instance's zone.
pub const ZONE_PLACEHOLDER: &str = "{{.Zone}}";

/// Attributes of a compute instance, as configured on a [`Config`] and
/// copied, zone-resolved, onto each [`Vm`].
///
/// [`Config`]: crate::Config
/// [`Vm`]: crate::Vm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VmAttributes {
    pub project: String,
    pub zone: String,
    /// e.g. `zones/{{.Zone}}/machineTypes/n1-standard-2`.
    pub machine_type: String,
    pub disks: Vec<Disk>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub service_accounts: Vec<ServiceAccount>,
    pub metadata: Vec<Metadata>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub min_cpu_platform: String,
}

impl VmAttributes {
    /// Substitute the zone placeholder in the machine type and disk types.
    ///
    /// Substitution is idempotent.
    #[must_use]
    pub fn resolve_zone(mut self) -> Self {
        self.machine_type = self.machine_type.replace(ZONE_PLACEHOLDER, &self.zone);
        for disk in &mut self.disks {
            disk.disk_type = disk.disk_type.replace(ZONE_PLACEHOLDER, &self.zone);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Disk {
    pub image: String,
    pub size_gb: i64,
    /// e.g. `zones/{{.Zone}}/diskTypes/pd-ssd`.
    pub disk_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkInterfaceSpec {
    pub network: String,
    pub subnetwork: String,
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccessConfig {
    /// e.g. `ONE_TO_ONE_NAT`.
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Metadata {
    pub key: String,
    pub value: String,
}
