pub mod cloud;
pub mod collector;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod reporter;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud::CloudInformation;
use crate::connectivity::Connectivity;

/// Version reported to the ingest endpoint with every report.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One reading of host resource utilization, taken once per tick.
///
/// All values are percentages in `[0, 100]`, rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "memory")]
    pub memory_percent: f64,
    #[serde(rename = "disk")]
    pub disk_percent: f64,
    #[serde(skip, default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent: normalize_percent(cpu_percent),
            memory_percent: normalize_percent(memory_percent),
            disk_percent: normalize_percent(disk_percent),
            collected_at: Utc::now(),
        }
    }
}

/// Clamps a percentage into `[0, 100]` and rounds it to two decimals.
pub fn normalize_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

/// Static facts about the host, detected once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInformation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

/// Body of the POST sent to the ingest endpoint.
///
/// `cpu`, `memory` and `disk` are always present; everything else is omitted
/// when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(flatten)]
    pub sample: Sample,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Connectivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(flatten)]
    pub host: HostInformation,
    #[serde(flatten)]
    pub cloud: CloudInformation,
}

impl Report {
    pub fn new(sample: Sample) -> Self {
        Self {
            sample,
            status: None,
            agent_version: Some(AGENT_VERSION.to_string()),
            host: HostInformation::default(),
            cloud: CloudInformation::default(),
        }
    }

    pub fn with_status(mut self, status: Option<Connectivity>) -> Self {
        self.status = status;
        self
    }

    pub fn with_host(mut self, host: HostInformation) -> Self {
        self.host = host;
        self
    }

    pub fn with_cloud(mut self, cloud: CloudInformation) -> Self {
        self.cloud = cloud;
        self
    }
}
