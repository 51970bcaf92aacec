use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{instrument, trace};

/// Outbound network reachability of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Up,
    Down,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Never fails: anything that goes wrong counts as [`Connectivity::Down`].
    async fn check(&self) -> Connectivity;
}

/// Sends a single ICMP echo with the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProbe {
    host: String,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for PingProbe {
    #[instrument(skip(self), fields(host = %self.host))]
    async fn check(&self) -> Connectivity {
        let status = Command::new("ping")
            .args(["-c", "1", "-W", "2", self.host.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) if status.success() => Connectivity::Up,
            Ok(Ok(status)) => {
                trace!("ping exited with {status}");
                Connectivity::Down
            }
            Ok(Err(e)) => {
                trace!("failed to run ping: {e}");
                Connectivity::Down
            }
            Err(_) => {
                trace!("ping timed out after {:?}", self.timeout);
                Connectivity::Down
            }
        }
    }
}
