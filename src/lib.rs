//! # modelmux
//!
//! GPU-aware model-serving supervisor and OpenAI-compatible reverse proxy.
//!
//! Requests name a logical model; modelmux makes sure a subprocess serving
//! that model is running (starting it on demand, evicting idle models when
//! VRAM or host RAM runs short, and stopping models that sit idle past
//! their TTL) and streams bytes between client and upstream.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        modelmux                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ ProxyManager                                       │  │
//! │  │ - extracts model from request                      │  │
//! │  │ - swaps exclusive process groups                   │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │          │                                               │
//! │  ┌───────▼───────┐   pre-start hook   ┌───────────────┐  │
//! │  │ ProcessGroup  │───────────────────▶│ Scheduler     │  │
//! │  │ └─ Process    │                    │ - host RAM    │  │
//! │  │    state      │◀───────────────────│ - GPU place   │  │
//! │  │    machine    │  evict idle LRU    │ - evictions   │  │
//! │  └───────┬───────┘                    └───────┬───────┘  │
//! │          │ log pumps                          │          │
//! │  ┌───────▼───────┐                    ┌───────▼───────┐  │
//! │  │ MemoryTracker │                    │ GpuAllocator  │  │
//! │  │ (footprints)  │                    │ (nvidia-smi)  │  │
//! │  └───────────────┘                    └───────────────┘  │
//! │          ▼                  ▼                  ▼         │
//! │   [upstream:5800]    [upstream:5801]    [upstream:5802]  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod events;
pub mod gpu;
pub mod group;
pub mod logbuffer;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod process;
pub mod scheduler;
pub mod telemetry;

pub use config::{Config, ConfigError, FitPolicy, GroupConfig, LogStdout, ModelConfig};
pub use events::{Event, EventBus};
pub use gpu::{GpuAllocator, GpuError, GpuInfo, NvidiaSmiAllocator, StaticGpuAllocator};
pub use group::ProcessGroup;
pub use manager::ProxyManager;
pub use memory::{MemoryFootprint, MemoryTracker};
pub use metrics::TokenMetrics;
pub use process::{Process, ProcessError, ProcessState, StopStrategy};
pub use scheduler::{Scheduler, SchedulerError, SchedulerOptions};

use axum::Router;
use std::sync::Arc;

/// Build the complete modelmux stack: the axum router serving the HTTP
/// surface and the proxy manager behind it (for shutdown and event access).
pub fn build_app(config: Config, allocator: Arc<dyn GpuAllocator>) -> (Router, ProxyManager) {
    let manager = ProxyManager::new(config, allocator);
    let router = manager.router();
    (router, manager)
}
