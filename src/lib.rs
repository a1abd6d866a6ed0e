//! # hwc-dispatch
//!
//! Per-display composition job scheduler for hardware composers.
//!
//! For every connected display the host acquires a composition job,
//! describes the frame's visible layers, lets the HRT engine split them
//! between hardware inputs and a software-composed range, finalizes the job
//! and hands it to the display's dispatch worker. Fences flow through the
//! pipeline as move-only handles that are closed or transferred exactly
//! once.
//!
//! ## Architecture
//!
//! - `scheduler`: host-facing facade and cross-display coordination
//! - `cluster`: per-display pool, worker, finalizer and mirror channel
//! - `hrt`: two-tier hardware resource assignment
//! - `pool`: fixed-size composition job pools
//! - `worker`: FIFO dispatch thread with watermark backpressure
//! - `finalizer`: physical/virtual frame finalization and mirror coupling
//! - `hwrm`: hardware-resource manager interface and its simulator
//! - `fence`: fence handles backed by file descriptors or a test ledger
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hwc_dispatch::{DispatchConfig, DisplayInfo, Scheduler};
//! use hwc_dispatch::hwrm::sim::SimulatedResourceManager;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = DispatchConfig::load("~/.config/hwc-dispatch/dispatch.toml")?;
//!     let scheduler = Scheduler::new(config, Arc::new(SimulatedResourceManager::new()));
//!     let panel = scheduler.on_plug_in(DisplayInfo::physical(0, 4))?;
//!     scheduler.get_job(panel)?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod cpu;
pub mod display;
pub mod error;
pub mod fence;
pub mod finalizer;
pub mod handlers;
pub mod hrt;
pub mod hwrm;
pub mod job;
pub mod logging;
pub mod pool;
pub mod scheduler;
pub mod stats;
pub mod worker;

// Re-export main types for easy access
pub use cluster::SetJobOutcome;
pub use config::DispatchConfig;
pub use display::{DisplayId, DisplayInfo, DisplayKind, PixelFormat, SessionMode};
pub use error::{DispatchError, Result};
pub use fence::{FenceHandle, FenceLedger};
pub use finalizer::{FenceRole, OutboxEntry};
pub use hrt::{DisplayAssignment, HrtEngine, SoftwareRange};
pub use hwrm::HardwareResourceManager;
pub use job::{BufferDescriptor, BufferHandle, CompositionJob, PostState, VisibleLayer};
pub use scheduler::Scheduler;
pub use stats::ClusterStats;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
