use serde::{Deserialize, Serialize};

/// A quota-reporting target.
///
/// The controller only reads projects; quota reporting republishes the
/// provider's numbers for the listed metrics and regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Project {
    pub id: String,
    /// Cloud project name.
    pub project: String,
    pub metrics: Vec<String>,
    pub regions: Vec<String>,
}

impl Project {
    /// Whether the `(region, metric)` pair was requested.
    pub fn wants(&self, region: &str, metric: &str) -> bool {
        self.regions.iter().any(|r| r == region) && self.metrics.iter().any(|m| m == metric)
    }
}
