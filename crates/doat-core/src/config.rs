//! Run configuration loaded from `doat.toml`.
//!
//! The file is read once per invocation and never mutated afterwards.
//!
//! ```toml
//! [doat]
//! startup_time = 10
//! test_runtime = 30
//! test_step_size = 1.0
//! server_port = 80
//!
//! [app]
//! dpdk_location = "/opt/dpdk"
//! app_cmd = "/opt/dpdk/build/app/dpdk-testpmd -l 2-3 -- --forward-mode=txonly"
//! telemetry = true
//! telemetry_port = 0
//!
//! [optimisation]
//! enabled = true
//! build_cmd = "ninja -C build"
//! mem_op = true
//!
//! [cpu]
//! test_core = 20
//! app_master = 2
//! app_cores = [3]
//!
//! [tools]
//! pcm_dir = "/opt/pcm/build/bin"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DoatError, Result};
use crate::topology::CpuTopology;

/// Complete, validated input to one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub doat: TimingConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    pub app: AppConfig,
    #[serde(default)]
    pub optimisation: OptimisationConfig,
    pub cpu: CpuConfig,
    pub tools: ToolsConfig,
}

/// Phase durations and sample cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    /// Seconds the target gets to settle before collectors start.
    pub startup_time: u64,
    /// Seconds of measurement.
    pub test_runtime: u64,
    /// Seconds between samples.
    pub test_step_size: f64,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportingConfig {
    pub project_name: Option<String>,
    pub tester_name: Option<String>,
    pub tester_email: Option<String>,
    /// Include the master core in per-core cache statistics.
    #[serde(default = "default_true")]
    pub include_master: bool,
    /// Delete the artifact directory when a run is abandoned.
    #[serde(default)]
    pub cleanup_on_abort: bool,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            project_name: None,
            tester_name: None,
            tester_email: None,
            include_master: true,
            cleanup_on_abort: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Root of the DPDK tree whose `config/rte_config.h` may be mutated.
    pub dpdk_location: PathBuf,
    /// Shell command that launches the target.
    pub app_cmd: String,
    #[serde(default)]
    pub telemetry: bool,
    pub telemetry_port: Option<u16>,
    /// Explicit telemetry socket; discovered when absent.
    pub telemetry_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimisationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Command run inside `dpdk_location` to rebuild DPDK and the app.
    pub build_cmd: Option<String>,
    #[serde(default)]
    pub mem_op: bool,
    #[serde(default)]
    pub cache_adjust: bool,
    #[serde(default = "default_new_cache")]
    pub new_cache: u32,
}

impl Default for OptimisationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            build_cmd: None,
            mem_op: false,
            cache_adjust: false,
            new_cache: default_new_cache(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuConfig {
    /// Core the harness pins itself to.
    pub test_core: usize,
    pub app_master: Option<usize>,
    pub app_cores: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Directory containing `pcm.x`.
    pub pcm_dir: PathBuf,
    #[serde(default = "default_power_sensor")]
    pub power_sensor: String,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

fn default_server_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

fn default_new_cache() -> u32 {
    256
}

fn default_power_sensor() -> String {
    "PS1 Input Power".to_string()
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("tmp")
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DoatError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DoatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.app_cmd.trim().is_empty() {
            return Err(DoatError::Config("app.app_cmd must not be empty".into()));
        }
        let step = self.doat.test_step_size;
        if !(step.is_finite() && step > 0.0) {
            return Err(DoatError::Config(format!(
                "doat.test_step_size must be positive, got {step}"
            )));
        }
        match Duration::try_from_secs_f64(step) {
            Ok(d) if !d.is_zero() => {}
            _ => {
                return Err(DoatError::Config(format!(
                    "doat.test_step_size {step} is not a usable number of seconds"
                )));
            }
        }
        if self.cpu.app_cores.is_empty() {
            return Err(DoatError::Config("cpu.app_cores must list at least one core".into()));
        }
        if self.app.telemetry && self.app.telemetry_port.is_none() {
            return Err(DoatError::Config(
                "app.telemetry is enabled but app.telemetry_port is not set".into(),
            ));
        }
        if self.optimisation.enabled
            && self
                .optimisation
                .build_cmd
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(DoatError::Config(
                "optimisation is enabled but optimisation.build_cmd is not set".into(),
            ));
        }
        Ok(())
    }

    pub fn settle_duration(&self) -> Duration {
        Duration::from_secs(self.doat.startup_time)
    }

    pub fn measure_duration(&self) -> Duration {
        Duration::from_secs(self.doat.test_runtime)
    }

    /// Sample step. Zero only for a config that never passed [`Self::validate`].
    pub fn step(&self) -> Duration {
        Duration::try_from_secs_f64(self.doat.test_step_size).unwrap_or_default()
    }

    /// Telemetry port when telemetry collection is enabled.
    pub fn telemetry_port(&self) -> Option<u16> {
        if self.app.telemetry {
            self.app.telemetry_port
        } else {
            None
        }
    }

    /// Master core to report on, if it exists and reporting includes it.
    pub fn reported_master(&self) -> Option<usize> {
        self.cpu.app_master.filter(|_| self.reporting.include_master)
    }

    /// Check every configured core against `topology` and find the socket
    /// the application runs on.
    pub fn resolve_placement(&self, topology: &CpuTopology) -> Result<Placement> {
        let test_socket = topology.socket_of(self.cpu.test_core)?;
        let mut sockets = Vec::with_capacity(self.cpu.app_cores.len() + 1);
        for &core in &self.cpu.app_cores {
            sockets.push(topology.socket_of(core)?);
        }
        let master = self.reported_master();
        if let Some(core) = master {
            sockets.push(topology.socket_of(core)?);
        }

        let app_socket = sockets[0];
        if sockets.iter().any(|&s| s != app_socket) {
            let what = if master.is_some() {
                "application cores and master core"
            } else {
                "application cores"
            };
            return Err(DoatError::Config(format!("{what} must be on the same socket")));
        }
        if test_socket == app_socket && topology.core_count() > 1 {
            log::warn!(
                "test core {} shares socket {app_socket} with the application",
                self.cpu.test_core
            );
        }

        Ok(Placement {
            app_socket,
            test_socket,
            app_cores: self.cpu.app_cores.clone(),
            master,
        })
    }
}

/// Where the application and the harness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub app_socket: u32,
    pub test_socket: u32,
    pub app_cores: Vec<usize>,
    pub master: Option<usize>,
}
