//! VM slots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attributes::VmAttributes;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 4;

/// One numbered machine slot belonging to a config.
///
/// `url` non-empty means a compute instance exists for exactly this
/// `hostname`. `hostname` non-empty means a bot registration may exist.
/// Once `drained` is set it stays set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Vm {
    pub id: String,
    /// Owning config id.
    pub config: String,
    pub index: i32,
    pub hostname: String,
    pub attributes: VmAttributes,
    pub prefix: String,
    pub revision: String,
    pub swarming: String,
    pub lifetime: i64,
    pub timeout: i64,
    pub configured: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub connected: Option<DateTime<Utc>>,
    pub drained: bool,
    /// Compute instance handle.
    pub url: String,
    pub network_interfaces: Vec<NetworkInterface>,
    /// Stored properties this version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Vm {
    /// Whether the VM has outlived its lifetime.
    pub fn lifetime_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.deadline_passed(self.lifetime, now)
    }

    /// Whether the VM has had longer than its timeout to connect.
    pub fn timeout_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.deadline_passed(self.timeout, now)
    }

    fn deadline_passed(&self, secs: i64, now: DateTime<Utc>) -> bool {
        match self.created {
            Some(created) if secs > 0 => created + chrono::Duration::seconds(secs) < now,
            _ => false,
        }
    }

    /// Reset the fields describing the current incarnation.
    ///
    /// Leaves identity, template, and `drained` untouched so the slot can
    /// be re-armed with a fresh hostname.
    pub fn clear_live_fields(&mut self) {
        self.hostname.clear();
        self.url.clear();
        self.created = None;
        self.connected = None;
        self.network_interfaces.clear();
    }

    /// Provider request id for creating this VM's instance.
    pub fn create_request_id(&self) -> Uuid {
        request_id("create", &self.hostname)
    }

    /// Provider request id for destroying this VM's instance.
    pub fn destroy_request_id(&self) -> Uuid {
        request_id("destroy", &self.hostname)
    }
}

/// Resolved network interface of a created instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkInterface {
    pub internal_ip: String,
    pub external_ip: Option<String>,
}

/// The id of slot `index` of the config with `prefix`.
pub fn vm_id(prefix: &str, index: i32) -> String {
    format!("{prefix}-{index}")
}

/// A fresh hostname for slot `index`: `{prefix}-{index}-{xxxx}`.
pub fn generate_hostname(prefix: &str, index: i32) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| char::from(SUFFIX_CHARSET[rng.random_range(0..SUFFIX_CHARSET.len())]))
        .collect();
    format!("{prefix}-{index}-{suffix}")
}

/// Deterministic idempotency key for a provider operation on `hostname`.
///
/// Name-based (SHA-1) UUID of `"{op}-{hostname}"`, so redelivered tasks
/// present the same key and the provider deduplicates them.
pub fn request_id(op: &str, hostname: &str) -> Uuid {
    Uuid::new_v5(&Uuid::nil(), format!("{op}-{hostname}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_hostname_format() {
        let hostname = generate_hostname("bot", 7);
        let suffix = hostname.strip_prefix("bot-7-").expect("prefix");
        assert_eq!(suffix.len(), 4);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_request_id_deterministic() {
        assert_eq!(request_id("create", "h-0-abcd"), request_id("create", "h-0-abcd"));
        assert_ne!(request_id("create", "h-0-abcd"), request_id("destroy", "h-0-abcd"));
        assert_ne!(request_id("create", "h-0-abcd"), request_id("create", "h-0-abce"));
    }

    #[test]
    fn test_deadlines() {
        let created = Utc::now() - chrono::Duration::seconds(100);
        let vm = Vm {
            created: Some(created),
            lifetime: 50,
            timeout: 0,
            ..Default::default()
        };
        assert!(vm.lifetime_exceeded(Utc::now()));
        assert!(!vm.timeout_exceeded(Utc::now()));

        let fresh = Vm {
            created: None,
            lifetime: 1,
            ..Default::default()
        };
        assert!(!fresh.lifetime_exceeded(Utc::now()));
    }

    #[test]
    fn test_clear_live_fields_keeps_drained() {
        let mut vm = Vm {
            id: "p-0".to_string(),
            hostname: "p-0-abcd".to_string(),
            url: "https://compute/p-0-abcd".to_string(),
            created: Some(Utc::now()),
            connected: Some(Utc::now()),
            drained: true,
            ..Default::default()
        };
        vm.clear_live_fields();
        assert!(vm.hostname.is_empty());
        assert!(vm.url.is_empty());
        assert!(vm.created.is_none() && vm.connected.is_none());
        assert!(vm.drained);
        assert_eq!(vm.id, "p-0");
    }

    #[test]
    fn test_unknown_properties_round_trip() {
        let json = serde_json::json!({
            "id": "p-0",
            "config": "p",
            "legacy_field": {"nested": true},
        });
        let vm: Vm = serde_json::from_value(json).unwrap();
        assert_eq!(vm.extra["legacy_field"]["nested"], true);
        let back = serde_json::to_value(&vm).unwrap();
        assert_eq!(back["legacy_field"]["nested"], true);
    }
}
