//! # doat-core
//!
//! **Out-of-band benchmarking for DPDK applications.**
//!
//! `doat-core` runs a DPDK application under test alongside three passive
//! collectors (PCM hardware counters, BMC wall power and DPDK telemetry),
//! tears every process group down on every exit path, and turns the
//! resulting CSV artifacts into per-pass averages and a baseline vs modified
//! comparison.
//!
//! ## Quick Start
//!
//! ```no_run
//! use doat_core::{CpuTopology, RunConfig, RunController, ShellBackend, Supervisor, SystemEnvironment};
//!
//! let config = RunConfig::load("doat.toml".as_ref())?;
//! let placement = config.resolve_placement(&CpuTopology::detect()?)?;
//! let mut controller = RunController::new(
//!     config.clone(),
//!     SystemEnvironment::new(),
//!     Supervisor::new(ShellBackend::new()),
//!     config.tools.artifact_dir.clone(),
//! );
//! let outcome = controller.run(None)?;
//! println!("baseline artifacts in {}", outcome.baseline.dir.display());
//! # let _ = placement;
//! # Ok::<(), doat_core::DoatError>(())
//! ```
//!
//! ## Architecture
//!
//! Controller → Supervisor (process groups) → collectors write CSV →
//! Extractor → Series → Diff → Recommendation
//!
//! An optimisation run wraps a second pass in a [`ConfigPatch`] whose
//! [`PatchGuard`] restores the original build configuration however the
//! run ends.

pub mod analysis;
pub mod collectors;
pub mod config;
pub mod controller;
pub mod diff;
pub mod environment;
pub mod error;
pub mod extract;
pub mod mutation;
pub mod process;
pub mod report;
pub mod series;
pub mod shutdown;
pub mod telemetry;
pub mod topology;

pub use analysis::{Comparison, ExtractionPlan, PassMetrics, PassSeries};
pub use collectors::{PassArtifacts, PassLabel};
pub use config::{Placement, RunConfig};
pub use controller::{PassOutcome, RunController, RunOutcome, RunPhase};
pub use diff::{Blocker, Delta, DiffResult, Recommendation, diff, recommend, round_to};
pub use environment::{Environment, SystemEnvironment};
pub use error::{DoatError, Result};
pub use extract::{ColumnSchema, PCM_SCHEMA_V1, Table};
pub use mutation::{ConfigPatch, MemoryOptimisation, PatchGuard, plan_memory_optimisation};
pub use process::{ProcessBackend, ProcessState, Role, ShellBackend, Supervisor};
pub use report::{ResultsWriter, RunClock, RunResults, detect_machine_info};
pub use series::{MetricSeries, SeriesTag};
pub use shutdown::ShutdownRegistry;
pub use topology::{AffinityMask, CpuTopology};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
