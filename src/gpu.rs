//! GPU inventory.
//!
//! The scheduler reasons over a snapshot of per-GPU free/total memory. The
//! inventory is a small capability trait so tests inject synthetic GPUs;
//! production shells out to `nvidia-smi`.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: usize,
    pub free_mb: u64,
    pub total_mb: u64,
}

#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("gpu inventory unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected gpu inventory output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait GpuAllocator: Send + Sync {
    async fn get_gpus(&self) -> Result<Vec<GpuInfo>, GpuError>;
}

/// Inventory via `nvidia-smi --query-gpu=memory.free,memory.total`.
pub struct NvidiaSmiAllocator {
    binary: String,
}

impl NvidiaSmiAllocator {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        NvidiaSmiAllocator {
            binary: binary.into(),
        }
    }
}

impl Default for NvidiaSmiAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuAllocator for NvidiaSmiAllocator {
    async fn get_gpus(&self) -> Result<Vec<GpuInfo>, GpuError> {
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=memory.free,memory.total",
                "--format=csv,nounits,noheader",
            ])
            .output()
            .await
            .map_err(|e| GpuError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(GpuError::Unavailable(format!(
                "{} exited with {}",
                self.binary, output.status
            )));
        }

        parse_smi_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// One line per GPU: `"freeMB, totalMB"`.
fn parse_smi_output(stdout: &str) -> Result<Vec<GpuInfo>, GpuError> {
    let mut gpus = Vec::new();
    for (index, line) in stdout.trim().lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 2 {
            return Err(GpuError::Malformed(line.to_string()));
        }
        let free_mb: u64 = parts[0]
            .trim()
            .parse()
            .map_err(|_| GpuError::Malformed(format!("invalid free memory {:?}", parts[0])))?;
        let total_mb: u64 = parts[1]
            .trim()
            .parse()
            .map_err(|_| GpuError::Malformed(format!("invalid total memory {:?}", parts[1])))?;
        gpus.push(GpuInfo {
            index,
            free_mb,
            total_mb,
        });
    }
    Ok(gpus)
}

/// Fixed inventory for tests and GPU-less development hosts. The snapshot
/// can be replaced at runtime to simulate memory pressure changes.
pub struct StaticGpuAllocator {
    gpus: Mutex<Vec<GpuInfo>>,
}

impl StaticGpuAllocator {
    pub fn new(gpus: Vec<GpuInfo>) -> Self {
        StaticGpuAllocator {
            gpus: Mutex::new(gpus),
        }
    }

    pub fn set_gpus(&self, gpus: Vec<GpuInfo>) {
        *self.gpus.lock().expect("static allocator lock poisoned") = gpus;
    }
}

#[async_trait]
impl GpuAllocator for StaticGpuAllocator {
    async fn get_gpus(&self) -> Result<Vec<GpuInfo>, GpuError> {
        Ok(self
            .gpus
            .lock()
            .expect("static allocator lock poisoned")
            .clone())
    }
}
