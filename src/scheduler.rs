//! Admission control, GPU placement, and eviction selection.
//!
//! A single mutex serializes placement decisions; they are cheap next to
//! subprocess startup. The scheduler sees every process in the system
//! through an injected provider, so `Starting` processes reserve their
//! target GPU and double placement cannot happen.

use crate::config::FitPolicy;
use crate::gpu::{GpuAllocator, GpuError, GpuInfo};
use crate::process::{Process, ProcessState};
use dashmap::DashSet;
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("insufficient vram for scheduling")]
    InsufficientVram,

    #[error("insufficient host ram for scheduling")]
    InsufficientHostRam,

    #[error("unknown model memory footprint")]
    UnknownFootprint,

    #[error(transparent)]
    GpuInventory(#[from] GpuError),
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Global per-GPU VRAM cap in MB; 0 = uncapped.
    pub gpu_vram_cap_mb: u64,
    /// Per-GPU caps, indexed by GPU; take precedence over the global cap.
    pub gpu_vram_caps_mb: Vec<u64>,
    /// Host RAM budget in MB for non-spill processes; 0 disables admission.
    pub host_ram_cap_mb: u64,
}

/// Returns every process in the system, including starting and ready ones.
pub type ProcessProvider = Box<dyn Fn() -> Vec<Process> + Send + Sync>;

pub struct Scheduler {
    allocator: Arc<dyn GpuAllocator>,
    provider: ProcessProvider,
    options: SchedulerOptions,
    lock: Mutex<()>,
    warned: DashSet<String>,
}

struct Placement {
    gpu_index: usize,
    evict: Vec<Process>,
    free_mb: u64,
    occupant_count: usize,
}

impl Scheduler {
    pub fn new(
        allocator: Arc<dyn GpuAllocator>,
        provider: ProcessProvider,
        options: SchedulerOptions,
    ) -> Self {
        Scheduler {
            allocator,
            provider,
            options,
            lock: Mutex::new(()),
            warned: DashSet::new(),
        }
    }

    /// Admission and placement for a process about to start. Called from the
    /// process's pre-start hook, so the candidate is already `Starting`.
    pub async fn schedule(&self, process: &Process) -> Result<(), SchedulerError> {
        let policy = process.fit_policy();

        if policy != FitPolicy::Spill {
            self.ensure_host_ram_capacity(process)?;
        }

        match policy {
            FitPolicy::Spill => self.schedule_spill(process).await,
            FitPolicy::None => Ok(()),
            FitPolicy::EvictToFit | FitPolicy::CpuMoe => self.place_on_gpu(process, policy).await,
        }
    }

    /// Spill processes offload across every GPU; no VRAM admission.
    async fn schedule_spill(&self, process: &Process) -> Result<(), SchedulerError> {
        let gpus = match self.allocator.get_gpus().await {
            Ok(gpus) => gpus,
            Err(e) => {
                self.warn_once(
                    "gpu-inventory",
                    &format!("GPU inventory unavailable ({e}); spill process gets no device list"),
                );
                return Ok(());
            }
        };
        if !gpus.is_empty() {
            let visible: Vec<String> = gpus.iter().map(|g| g.index.to_string()).collect();
            process.insert_runtime_env("CUDA_VISIBLE_DEVICES", visible.join(","));
        }
        Ok(())
    }

    async fn place_on_gpu(
        &self,
        process: &Process,
        policy: FitPolicy,
    ) -> Result<(), SchedulerError> {
        let _guard = self.lock.lock().await;

        let gpus = match self.allocator.get_gpus().await {
            Ok(gpus) => gpus,
            Err(e) => {
                // Recoverable: without an inventory there is no VRAM
                // admission to enforce.
                self.warn_once(
                    "gpu-inventory",
                    &format!("GPU inventory unavailable ({e}); skipping VRAM admission"),
                );
                return Ok(());
            }
        };
        let gpus = self.apply_vram_caps(gpus);

        let required_mb = process.measured_vram_mb();
        if required_mb == 0 && policy == FitPolicy::CpuMoe {
            // CPU-only weights; the kv cache hint arrives with the first
            // real measurement.
            return Ok(());
        }

        if gpus.is_empty() {
            return Err(SchedulerError::InsufficientVram);
        }

        if required_mb == 0 {
            self.warn_once(
                process.id(),
                &format!(
                    "{} has no VRAM measurement; placing on the freest GPU without evicting",
                    process.id()
                ),
            );
            let freest = gpus
                .iter()
                .max_by(|a, b| a.free_mb.cmp(&b.free_mb).then(b.index.cmp(&a.index)))
                .expect("gpus is non-empty");
            assign(process, freest.index);
            return Ok(());
        }

        let running = (self.provider)();
        let mut placements: Vec<Placement> = Vec::new();
        for gpu in &gpus {
            let occupants = occupants_on_gpu(&running, gpu.index, process.id());
            if let Some(evict) = select_evictions(&occupants, gpu.free_mb, required_mb) {
                placements.push(Placement {
                    gpu_index: gpu.index,
                    evict,
                    free_mb: gpu.free_mb,
                    occupant_count: occupants.len(),
                });
            }
        }

        if placements.is_empty() {
            return Err(SchedulerError::InsufficientVram);
        }

        placements.sort_by(|a, b| {
            a.evict
                .len()
                .cmp(&b.evict.len())
                .then(a.occupant_count.cmp(&b.occupant_count))
                .then(b.free_mb.cmp(&a.free_mb))
                .then(a.gpu_index.cmp(&b.gpu_index))
        });
        let chosen = placements.into_iter().next().expect("non-empty placements");

        for evicted in &chosen.evict {
            info!(
                candidate = %process.id(),
                evicted = %evicted.id(),
                gpu = chosen.gpu_index,
                vram_mb = evicted.measured_vram_mb(),
                "Evicting idle process to make room"
            );
            counter!("modelmux_evictions_total", "model" => evicted.id().to_string())
                .increment(1);
            // Completes once the evictee has observed Stopped.
            evicted.stop_immediately().await;
        }

        debug!(
            model = %process.id(),
            gpu = chosen.gpu_index,
            required_mb,
            free_mb = chosen.free_mb,
            evictions = chosen.evict.len(),
            "Placed on GPU"
        );
        assign(process, chosen.gpu_index);
        Ok(())
    }

    /// Host-RAM admission. Unknown footprints warn and admit: refusing to
    /// run a model we cannot account for would wedge it forever.
    fn ensure_host_ram_capacity(&self, process: &Process) -> Result<(), SchedulerError> {
        let cap_mb = self.options.host_ram_cap_mb;
        if cap_mb == 0 {
            return Ok(());
        }

        let required_mb = process.measured_cpu_mb();
        if required_mb == 0 {
            self.warn_once(
                process.id(),
                &format!(
                    "{} has no host RAM measurement; admitting despite hostRamCapMB",
                    process.id()
                ),
            );
            return Ok(());
        }

        let mut total_mb = 0u64;
        for other in (self.provider)() {
            if other.id() == process.id() {
                continue;
            }
            if !matches!(
                other.state(),
                ProcessState::Ready | ProcessState::Starting
            ) {
                continue;
            }
            if other.fit_policy() == FitPolicy::Spill {
                continue;
            }
            let cpu_mb = other.measured_cpu_mb();
            if cpu_mb == 0 {
                // One unknown occupant makes the total unknowable.
                return Ok(());
            }
            total_mb += cpu_mb;
        }

        if total_mb + required_mb > cap_mb {
            info!(
                model = %process.id(),
                required_mb,
                running_mb = total_mb,
                cap_mb,
                "Rejecting start: host RAM budget exceeded"
            );
            return Err(SchedulerError::InsufficientHostRam);
        }
        Ok(())
    }

    /// Cap both total and free at the configured per-GPU limit.
    fn apply_vram_caps(&self, gpus: Vec<GpuInfo>) -> Vec<GpuInfo> {
        gpus.into_iter()
            .map(|mut gpu| {
                let cap = self
                    .options
                    .gpu_vram_caps_mb
                    .get(gpu.index)
                    .copied()
                    .filter(|&c| c > 0)
                    .or_else(|| Some(self.options.gpu_vram_cap_mb).filter(|&c| c > 0));
                if let Some(cap) = cap {
                    gpu.total_mb = gpu.total_mb.min(cap);
                    gpu.free_mb = gpu.free_mb.min(cap);
                }
                gpu
            })
            .collect()
    }

    fn warn_once(&self, key: &str, message: &str) {
        if self.warned.insert(key.to_string()) {
            warn!("{message}");
        }
    }
}

fn assign(process: &Process, gpu_index: usize) {
    process.set_assigned_gpu(gpu_index as i32);
    process.insert_runtime_env("CUDA_VISIBLE_DEVICES", gpu_index.to_string());
}

/// Processes occupying a GPU: assigned to it and `Ready` or `Starting`.
/// `Starting` counts so a concurrent start cannot be double-placed.
fn occupants_on_gpu(processes: &[Process], gpu_index: usize, candidate_id: &str) -> Vec<Process> {
    processes
        .iter()
        .filter(|p| {
            p.id() != candidate_id
                && p.assigned_gpu() == gpu_index as i32
                && matches!(p.state(), ProcessState::Ready | ProcessState::Starting)
        })
        .cloned()
        .collect()
}

/// Eviction plan for one GPU, or `None` when the candidate cannot fit.
///
/// Occupants with unknown footprints make the GPU unaccountable; busy
/// occupants are never evictable. Idle occupants are taken LRU-first until
/// the freed memory covers the requirement.
fn select_evictions(
    occupants: &[Process],
    free_mb: u64,
    required_mb: u64,
) -> Option<Vec<Process>> {
    if occupants.iter().any(|p| p.measured_vram_mb() == 0) {
        return None;
    }

    if free_mb >= required_mb {
        return Some(Vec::new());
    }

    let mut idle: Vec<Process> = occupants
        .iter()
        .filter(|p| p.in_flight() == 0)
        .cloned()
        .collect();
    idle.sort_by_key(|p| p.last_request_handled());

    let mut reclaimed_mb = free_mb;
    let mut evict = Vec::new();
    for process in idle {
        reclaimed_mb += process.measured_vram_mb();
        evict.push(process);
        if reclaimed_mb >= required_mb {
            return Some(evict);
        }
    }
    None
}
