//! Run phase controller.
//!
//! One pass walks `Idle → TargetStarting → Settling → CollectorsStarting →
//! Measuring → TearingDown → Harvested`; any phase may jump to `Aborted`.
//! Teardown runs on every path out of a pass, including errors raised in
//! the middle of the sequence. An optimisation run chains a baseline pass,
//! a patched rebuild, a modified pass and an unconditional revert.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collectors::{PROBE_ORDER, PassArtifacts, PassLabel, collector_specs, shell_quote};
use crate::config::RunConfig;
use crate::environment::Environment;
use crate::error::{DoatError, Result};
use crate::mutation::ConfigPatch;
use crate::process::{ProcessBackend, ProcessHandle, ProcessState, Role, Supervisor};
use crate::shutdown::ShutdownRegistry;

/// Time collectors get to start before their liveness is probed.
pub const COLLECTOR_STARTUP_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    Idle,
    TargetStarting,
    Settling,
    CollectorsStarting,
    Measuring,
    TearingDown,
    Harvested,
    Aborted,
}

impl RunPhase {
    /// The phase that follows on success.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::TargetStarting),
            Self::TargetStarting => Some(Self::Settling),
            Self::Settling => Some(Self::CollectorsStarting),
            Self::CollectorsStarting => Some(Self::Measuring),
            Self::Measuring => Some(Self::TearingDown),
            Self::TearingDown => Some(Self::Harvested),
            Self::Harvested | Self::Aborted => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Harvested | Self::Aborted)
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        if to == Self::Aborted {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::TargetStarting => write!(f, "target-starting"),
            Self::Settling => write!(f, "settling"),
            Self::CollectorsStarting => write!(f, "collectors-starting"),
            Self::Measuring => write!(f, "measuring"),
            Self::TearingDown => write!(f, "tearing-down"),
            Self::Harvested => write!(f, "harvested"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One recorded phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub pass: PassLabel,
    pub from: RunPhase,
    pub to: RunPhase,
}

/// How a pass that ran to the end of its window turned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Artifacts are ready for extraction.
    Complete(PassArtifacts),
    /// The pass finished mechanically but its data must not be used.
    Invalid { artifacts: PassArtifacts, reason: String },
}

/// Artifacts of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub baseline: PassArtifacts,
    pub modified: Option<PassArtifacts>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct RunController<E: Environment, B: ProcessBackend> {
    config: RunConfig,
    env: E,
    supervisor: Supervisor<B>,
    artifact_dir: PathBuf,
    registry: Option<ShutdownRegistry>,
    phase: RunPhase,
    pass: PassLabel,
    transitions: Vec<PhaseTransition>,
}

impl<E: Environment, B: ProcessBackend> RunController<E, B> {
    pub fn new(config: RunConfig, env: E, supervisor: Supervisor<B>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            env,
            supervisor,
            artifact_dir: artifact_dir.into(),
            registry: None,
            phase: RunPhase::Idle,
            pass: PassLabel::Baseline,
            transitions: Vec::new(),
        }
    }

    /// Register configuration patches for restore on abnormal exit.
    pub fn with_registry(mut self, registry: ShutdownRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn supervisor(&self) -> &Supervisor<B> {
        &self.supervisor
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn transition(&mut self, to: RunPhase) {
        debug_assert!(
            self.phase.can_transition_to(to),
            "illegal transition {} -> {to}",
            self.phase
        );
        log::info!("{} pass: {} -> {to}", self.pass, self.phase);
        self.transitions.push(PhaseTransition {
            pass: self.pass,
            from: self.phase,
            to,
        });
        self.phase = to;
    }

    fn require_alive(&mut self, handle: ProcessHandle) -> Result<()> {
        if self.supervisor.is_alive(handle) {
            return Ok(());
        }
        log::error!(
            "{} (process group {}) is not running during {}",
            handle.role,
            handle.group,
            self.phase
        );
        Err(DoatError::LivenessLost {
            role: handle.role,
            phase: self.phase,
        })
    }

    /// Run one pass. Every process spawned during the pass has been
    /// signalled by the time this returns, whatever the result.
    pub fn start_pass(&mut self, label: PassLabel) -> Result<PassOutcome> {
        self.pass = label;
        self.phase = RunPhase::Idle;
        let artifacts = PassArtifacts::new(&self.artifact_dir, label);

        let result = std::fs::create_dir_all(&self.artifact_dir)
            .map_err(DoatError::from)
            .and_then(|()| self.drive(&artifacts));

        match result {
            Ok(target_died) => {
                self.transition(RunPhase::TearingDown);
                let teardown = self.supervisor.teardown();
                if target_died {
                    self.transition(RunPhase::Aborted);
                    teardown?;
                    let reason = format!("{} died during the test", Role::Target);
                    log::error!("{label} pass invalid: {reason}");
                    return Ok(PassOutcome::Invalid { artifacts, reason });
                }
                if let Err(e) = teardown {
                    self.transition(RunPhase::Aborted);
                    return Err(e);
                }
                self.transition(RunPhase::Harvested);
                Ok(PassOutcome::Complete(artifacts))
            }
            Err(e) => {
                if let Err(teardown) = self.supervisor.teardown() {
                    log::error!("teardown after abort failed: {teardown}");
                }
                self.transition(RunPhase::Aborted);
                Err(e)
            }
        }
    }

    /// Launch → settle → collectors → measure. Returns whether the target
    /// died during the measure window.
    fn drive(&mut self, artifacts: &PassArtifacts) -> Result<bool> {
        self.transition(RunPhase::TargetStarting);
        let command = self.config.app.app_cmd.clone();
        let target = self.supervisor.spawn(Role::Target, &command)?;
        let probe = self.env.poll_interval();
        self.env.pause(probe);
        self.require_alive(target)?;

        self.transition(RunPhase::Settling);
        let settle = self.config.settle_duration();
        self.env.wait(settle, "Starting application");
        self.require_alive(target)?;

        self.transition(RunPhase::CollectorsStarting);
        let program = self.env.client_program();
        let mut collectors = Vec::new();
        for spec in collector_specs(&self.config, artifacts, &program) {
            collectors.push(self.supervisor.spawn(spec.role, &spec.command)?);
        }
        self.env.pause(COLLECTOR_STARTUP_GRACE);
        for role in PROBE_ORDER {
            if let Some(&handle) = collectors.iter().find(|h| h.role == role) {
                self.require_alive(handle)?;
            }
        }

        self.transition(RunPhase::Measuring);
        let measure = self.config.measure_duration();
        self.env.wait(measure, "Running test");
        let target_died = !self.supervisor.is_alive(target);
        if target_died {
            log::error!("{} died during the measure window", Role::Target);
        }
        Ok(target_died)
    }

    fn require_complete(outcome: PassOutcome) -> Result<PassArtifacts> {
        match outcome {
            PassOutcome::Complete(artifacts) => Ok(artifacts),
            PassOutcome::Invalid { reason, .. } => Err(DoatError::PassInvalid { reason }),
        }
    }

    /// Baseline pass, then with a patch: rebuild, modified pass, revert and
    /// rebuild again. The patch is reverted on every path.
    pub fn run(&mut self, patch: Option<&ConfigPatch>) -> Result<RunOutcome> {
        self.env.pin_to_core(self.config.cpu.test_core)?;
        let result = self.run_pinned(patch);
        if let Err(e) = self.env.unpin() {
            log::warn!("cannot restore harness affinity: {e}");
        }
        result
    }

    fn run_pinned(&mut self, patch: Option<&ConfigPatch>) -> Result<RunOutcome> {
        let baseline = self
            .start_pass(PassLabel::Baseline)
            .and_then(Self::require_complete)?;
        let Some(patch) = patch else {
            return Ok(RunOutcome {
                baseline,
                modified: None,
            });
        };

        log::info!("modifying DPDK configuration");
        let mut guard = patch.apply(self.registry.as_ref())?;
        let modified = self.modified_pass();

        log::info!("setting DPDK configuration back to original");
        let revert = guard.revert();
        let rebuild = match &revert {
            Ok(()) => self
                .env
                .unpin()
                .map_err(DoatError::from)
                .and_then(|()| self.rebuild()),
            Err(_) => Ok(()),
        };

        match modified {
            Ok(modified) => {
                revert?;
                rebuild?;
                Ok(RunOutcome {
                    baseline,
                    modified: Some(modified),
                })
            }
            Err(e) => {
                if let Err(revert) = revert {
                    log::error!("{revert}");
                }
                if let Err(rebuild) = rebuild {
                    log::error!("rebuild with original configuration failed: {rebuild}");
                }
                Err(e)
            }
        }
    }

    fn modified_pass(&mut self) -> Result<PassArtifacts> {
        self.env.unpin()?;
        self.rebuild()?;
        self.env.pin_to_core(self.config.cpu.test_core)?;
        self.start_pass(PassLabel::Modified).and_then(Self::require_complete)
    }

    /// Rebuild DPDK and the application, polling until the build exits.
    pub fn rebuild(&mut self) -> Result<()> {
        let dpdk = self.config.app.dpdk_location.clone();
        let build_cmd = self
            .config
            .optimisation
            .build_cmd
            .clone()
            .ok_or_else(|| DoatError::Config("optimisation.build_cmd is not set".into()))?;
        let command = format!("cd {}; {build_cmd}", shell_quote(&dpdk.to_string_lossy()));

        log::info!("rebuilding DPDK and the application");
        let handle = self.supervisor.spawn(Role::Builder, &command)?;
        let interval = self.env.poll_interval();
        let mut tick = 0usize;
        let status = loop {
            match self.supervisor.state(handle) {
                ProcessState::Running => {
                    let elapsed = interval.saturating_mul(u32::try_from(tick).unwrap_or(u32::MAX));
                    self.env.build_progress(elapsed, tick);
                    self.env.pause(interval);
                    tick += 1;
                }
                ProcessState::Exited(code) => break code,
            }
        };
        self.supervisor.kill_group(handle)?;

        if status != Some(0) {
            let detail = match status {
                Some(code) => format!("build command exited with status {code}"),
                None => "build command was terminated by a signal".to_string(),
            };
            return Err(DoatError::Mutation { path: dpdk, detail });
        }
        log::info!("rebuild finished after {tick} polls");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_transitions() {
        let mut phase = RunPhase::Idle;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_transition_to(next));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(phase, RunPhase::Harvested);
    }

    #[test]
    fn test_any_live_phase_may_abort() {
        for phase in [
            RunPhase::Idle,
            RunPhase::TargetStarting,
            RunPhase::Settling,
            RunPhase::CollectorsStarting,
            RunPhase::Measuring,
            RunPhase::TearingDown,
        ] {
            assert!(phase.can_transition_to(RunPhase::Aborted));
        }
        assert!(!RunPhase::Harvested.can_transition_to(RunPhase::Aborted));
        assert!(!RunPhase::Aborted.can_transition_to(RunPhase::Aborted));
    }

    #[test]
    fn test_no_skipping_phases() {
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Measuring));
        assert!(!RunPhase::Measuring.can_transition_to(RunPhase::Settling));
        assert!(!RunPhase::TearingDown.can_transition_to(RunPhase::Idle));
    }

    #[test]
    fn test_phase_display_is_kebab_case() {
        assert_eq!(RunPhase::CollectorsStarting.to_string(), "collectors-starting");
        assert_eq!(
            serde_json::to_string(&RunPhase::TearingDown).unwrap(),
            "\"tearing-down\""
        );
    }
}
