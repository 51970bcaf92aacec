use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;
use tracing::{instrument, trace};

use crate::cloud::HostShape;
use crate::{HostInformation, Sample};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("no CPUs reported by the operating system")]
    NoCpus,

    #[error("total memory reported as zero")]
    MemoryUnavailable,

    #[error("no filesystem mounted at {}", .0.display())]
    MountNotFound(PathBuf),

    #[error("filesystem at {} reports zero capacity", .0.display())]
    DiskUnavailable(PathBuf),

    #[error("{0}")]
    Other(String),
}

/// Source of one [`Sample`] per tick.
#[async_trait]
pub trait MetricsSource: Send {
    async fn collect(&mut self) -> Result<Sample, CollectionError>;
}

/// Reads CPU, memory and root disk utilization through `sysinfo`.
///
/// CPU usage is the average over `cpu_window` between two refreshes, single
/// refreshes are too noisy to report.
#[derive(Debug)]
pub struct SystemCollector {
    system: System,
    disks: Disks,
    cpu_window: Duration,
    mount_point: PathBuf,
}

impl SystemCollector {
    pub fn new(cpu_window: Duration) -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            cpu_window: cpu_window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
            mount_point: PathBuf::from("/"),
        }
    }

    /// Reports disk usage for `mount_point` instead of `/`.
    pub fn with_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = mount_point.into();
        self
    }

    /// Operating system facts, read once at startup.
    pub fn host_information() -> HostInformation {
        HostInformation {
            os_type: Some(std::env::consts::OS.to_string()),
            os_name: System::long_os_version(),
            os_version: System::os_version(),
        }
    }

    /// Logical CPU count and total memory of the host.
    pub fn host_shape() -> HostShape {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );

        HostShape {
            cpus: system.cpus().len(),
            memory_bytes: system.total_memory(),
        }
    }

    async fn cpu_percent(&mut self) -> Result<f64, CollectionError> {
        self.system.refresh_cpu_usage();
        tokio::time::sleep(self.cpu_window).await;
        self.system.refresh_cpu_usage();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(CollectionError::NoCpus);
        }

        let cpu_usage_sum = cpus.iter().map(|cpu| cpu.cpu_usage() as f64).sum::<f64>();
        Ok(cpu_usage_sum / cpus.len() as f64)
    }

    fn memory_percent(&mut self) -> Result<f64, CollectionError> {
        self.system.refresh_memory();
        percentage(self.system.used_memory(), self.system.total_memory())
            .ok_or(CollectionError::MemoryUnavailable)
    }

    fn disk_percent(&mut self) -> Result<f64, CollectionError> {
        self.disks.refresh(true);

        let disk = self
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == self.mount_point.as_path())
            .ok_or_else(|| CollectionError::MountNotFound(self.mount_point.clone()))?;

        disk_usage(
            disk.total_space(),
            disk.available_space(),
            &self.mount_point,
        )
    }
}

#[async_trait]
impl MetricsSource for SystemCollector {
    #[instrument(skip_all)]
    async fn collect(&mut self) -> Result<Sample, CollectionError> {
        let cpu = self.cpu_percent().await?;
        let memory = self.memory_percent()?;
        let disk = self.disk_percent()?;

        trace!(cpu, memory, disk, "sampled host resources");

        Ok(Sample::new(cpu, memory, disk))
    }
}

/// `used / total` as a percentage, `None` when `total` is zero.
pub fn percentage(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(used.min(total) as f64 / total as f64 * 100.0)
}

fn disk_usage(total: u64, available: u64, mount_point: &Path) -> Result<f64, CollectionError> {
    percentage(total.saturating_sub(available), total)
        .ok_or_else(|| CollectionError::DiskUnavailable(mount_point.to_path_buf()))
}
