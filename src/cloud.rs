//! One-shot cloud environment detection
//!
//! At startup the agent asks the well-known instance metadata services which
//! provider it runs on and what instance type it is. Every lookup has a short
//! timeout, so a host outside any cloud only pays a few seconds once.
//!
//! ```text
//! GCP → AWS → Azure → DigitalOcean → unknown
//! instance type: metadata, else heuristic, else unavailable
//! ```

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use crate::AGENT_VERSION;
use crate::config::ConfigError;

pub const GOOGLE_METADATA_URL: &str = "http://metadata.google.internal";

pub const LINK_LOCAL_METADATA_URL: &str = "http://169.254.169.254";

pub const METADATA_TIMEOUT: Duration = Duration::from_secs(1);

const AZURE_INSTANCE_PATH: &str = "/metadata/instance?api-version=2021-02-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Gcp,
    Aws,
    Azure,
    DigitalOcean,
    Unknown,
}

/// Where the reported instance type came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Metadata,
    Heuristic,
    Unavailable,
}

/// Cloud facts sent with every report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInformation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<CloudProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_detection_source: Option<DetectionSource>,
}

/// Logical CPUs and total memory, used when metadata has no instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostShape {
    pub cpus: usize,
    pub memory_bytes: u64,
}

/// Queries instance metadata services.
#[derive(Debug, Clone)]
pub struct CloudDetector {
    client: Client,
    google_url: String,
    link_local_url: String,
}

impl CloudDetector {
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_endpoints(GOOGLE_METADATA_URL, LINK_LOCAL_METADATA_URL)
    }

    /// Points the lookups at other metadata hosts.
    pub fn with_endpoints(
        google_url: impl Into<String>,
        link_local_url: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .user_agent(format!("montime-agent/{AGENT_VERSION}"))
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            client,
            google_url: google_url.into().trim_end_matches('/').to_string(),
            link_local_url: link_local_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Detects provider and instance type. Never fails, unreachable services
    /// only narrow down what is known.
    #[instrument(skip_all)]
    pub async fn detect(&self, shape: HostShape) -> CloudInformation {
        let provider = self.provider().await;
        info!(cloud_provider = ?provider, "detected cloud provider");

        let (instance_type, source) = match self.instance_type(provider).await {
            Some(instance_type) => (Some(instance_type), DetectionSource::Metadata),
            None => match heuristic_instance_type(provider, shape) {
                Some(instance_type) => (Some(instance_type), DetectionSource::Heuristic),
                None => (None, DetectionSource::Unavailable),
            },
        };
        info!(instance_type = ?instance_type, source = ?source, "detected instance type");

        CloudInformation {
            cloud_provider: Some(provider),
            instance_type,
            cloud_detection_source: Some(source),
        }
    }

    async fn provider(&self) -> CloudProvider {
        if self
            .get(&self.google_url, "/", Some(("Metadata-Flavor", "Google")))
            .await
            .is_some()
        {
            return CloudProvider::Gcp;
        }

        if self
            .get(&self.link_local_url, "/latest/meta-data/instance-id", None)
            .await
            .is_some()
        {
            return CloudProvider::Aws;
        }

        if let Some(body) = self
            .get(&self.link_local_url, AZURE_INSTANCE_PATH, Some(("Metadata", "true")))
            .await
            && body.contains("compute")
        {
            return CloudProvider::Azure;
        }

        if let Some(body) = self.get(&self.link_local_url, "/metadata/v1.json", None).await
            && body.contains("droplet_id")
        {
            return CloudProvider::DigitalOcean;
        }

        CloudProvider::Unknown
    }

    async fn instance_type(&self, provider: CloudProvider) -> Option<String> {
        let instance_type = match provider {
            CloudProvider::Aws => self
                .get(&self.link_local_url, "/latest/meta-data/instance-type", None)
                .await?
                .trim()
                .to_string(),
            CloudProvider::Gcp => {
                let body = self
                    .get(
                        &self.google_url,
                        "/computeMetadata/v1/instance/machine-type",
                        Some(("Metadata-Flavor", "Google")),
                    )
                    .await?;
                // projects/<id>/machineTypes/<type>
                body.trim().rsplit('/').next()?.to_string()
            }
            CloudProvider::Azure => {
                let body = self
                    .get(&self.link_local_url, AZURE_INSTANCE_PATH, Some(("Metadata", "true")))
                    .await?;
                azure_vm_size(&body)?
            }
            CloudProvider::DigitalOcean | CloudProvider::Unknown => return None,
        };

        Some(instance_type).filter(|instance_type| !instance_type.is_empty())
    }

    /// Body of a 200 response, `None` for anything else.
    async fn get(&self, base: &str, path: &str, header: Option<(&str, &str)>) -> Option<String> {
        let url = format!("{base}{path}");
        let mut request = self.client.get(url.as_str());
        if let Some((name, value)) = header {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .inspect_err(|e| trace!("metadata lookup {url} failed: {e}"))
            .ok()?;

        if response.status() != StatusCode::OK {
            debug!("metadata lookup {url} answered {}", response.status());
            return None;
        }

        response.text().await.ok()
    }
}

fn azure_vm_size(body: &str) -> Option<String> {
    let instance: serde_json::Value = serde_json::from_str(body).ok()?;
    instance["compute"]["vmSize"].as_str().map(str::to_string)
}

/// Guesses an instance type from the host size where the provider's metadata
/// does not expose one.
pub fn heuristic_instance_type(provider: CloudProvider, shape: HostShape) -> Option<String> {
    match provider {
        CloudProvider::DigitalOcean if shape.cpus > 0 => {
            let memory_gb = (shape.memory_bytes as f64 / (1u64 << 30) as f64).round() as u64;
            Some(format!("s-{}vcpu-{memory_gb}gb", shape.cpus))
        }
        _ => None,
    }
}
