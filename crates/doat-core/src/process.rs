//! Process-group supervision for the target application and its collectors.
//!
//! Every command runs as the leader of its own process group, so a single
//! `killpg` reaches the shell, the program it launched and anything that
//! program forked. The [`Supervisor`] owns the bookkeeping: which groups
//! were spawned, which have already been signalled, and the order in which
//! teardown reaches them.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{DoatError, Result};
use crate::shutdown::ShutdownRegistry;

/// Process group id as seen by the OS.
pub type GroupId = i32;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// What a supervised process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// The application under test.
    Target,
    /// Hardware performance counter sampler (PCM).
    HwCounterSampler,
    /// Wall power sampler (IPMI).
    PowerSampler,
    /// DPDK telemetry socket client.
    TelemetryClient,
    /// Rebuild of the target under a mutated configuration.
    Builder,
}

impl Role {
    pub fn is_collector(self) -> bool {
        matches!(
            self,
            Self::HwCounterSampler | Self::PowerSampler | Self::TelemetryClient
        )
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target => write!(f, "target"),
            Self::HwCounterSampler => write!(f, "hw-counter-sampler"),
            Self::PowerSampler => write!(f, "power-sampler"),
            Self::TelemetryClient => write!(f, "telemetry-client"),
            Self::Builder => write!(f, "builder"),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Observed state of a spawned group leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited; carries the exit code when the process was not killed by a signal.
    Exited(Option<i32>),
}

/// OS operations the supervisor needs. [`ShellBackend`] is the real one.
pub trait ProcessBackend {
    /// Start `command` as the leader of a new process group.
    fn spawn_group(&mut self, command: &str) -> io::Result<GroupId>;

    /// Non-blocking liveness check. Unknown or reaped groups are `Exited`.
    fn poll(&mut self, group: GroupId) -> ProcessState;

    /// Send the termination signal to every member of the group.
    /// A group that no longer exists is not an error.
    fn signal_group(&mut self, group: GroupId) -> io::Result<()>;
}

/// Runs commands through `sh -c` with output discarded.
pub struct ShellBackend {
    children: HashMap<GroupId, Child>,
    working_dir: Option<PathBuf>,
    reap_grace: Duration,
}

impl ShellBackend {
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            working_dir: None,
            reap_grace: Duration::from_secs(2),
        }
    }

    /// Run every command from `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// How long a signalled leader gets to exit before it is sent `SIGKILL`.
    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    /// Wait for a signalled leader to exit, escalating if it lingers.
    fn reap(&mut self, group: GroupId) {
        let Some(mut child) = self.children.remove(&group) else {
            return;
        };
        let deadline = Instant::now() + self.reap_grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        log::warn!("process group {group} ignored SIGTERM, sending SIGKILL");
        // SAFETY: killpg has no memory-safety preconditions.
        unsafe {
            libc::killpg(group, libc::SIGKILL);
        }
        let _ = child.wait();
    }
}

impl Default for ShellBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend for ShellBackend {
    fn spawn_group(&mut self, command: &str) -> io::Result<GroupId> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn()?;
        let group = GroupId::try_from(child.id())
            .map_err(|_| io::Error::other("child pid does not fit a process group id"))?;
        self.children.insert(group, child);
        Ok(group)
    }

    fn poll(&mut self, group: GroupId) -> ProcessState {
        let Some(child) = self.children.get_mut(&group) else {
            return ProcessState::Exited(None);
        };
        match child.try_wait() {
            Ok(None) => ProcessState::Running,
            Ok(Some(status)) => ProcessState::Exited(status.code()),
            Err(_) => ProcessState::Exited(None),
        }
    }

    fn signal_group(&mut self, group: GroupId) -> io::Result<()> {
        // SAFETY: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(group, libc::SIGTERM) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        self.reap(group);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Caller-side reference to a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    slot: usize,
    pub group: GroupId,
    pub role: Role,
}

/// One spawned process group.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub role: Role,
    pub group: GroupId,
    pub command: String,
    signalled: bool,
}

impl ManagedProcess {
    /// Whether the termination signal has already been sent.
    pub fn signalled(&self) -> bool {
        self.signalled
    }
}

/// Owns the spawn / monitor / kill lifecycle of a set of process groups.
///
/// Every group spawned through [`Supervisor::spawn`] is signalled exactly
/// once: by [`Supervisor::kill_group`], by [`Supervisor::teardown`], or when
/// the supervisor is dropped.
pub struct Supervisor<B: ProcessBackend> {
    backend: B,
    processes: Vec<ManagedProcess>,
    registry: Option<ShutdownRegistry>,
}

impl<B: ProcessBackend> Supervisor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            processes: Vec::new(),
            registry: None,
        }
    }

    /// Mirror live groups into `registry` so a signal handler can reach them.
    pub fn with_registry(mut self, registry: ShutdownRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn spawn(&mut self, role: Role, command: &str) -> Result<ProcessHandle> {
        let group = self
            .backend
            .spawn_group(command)
            .map_err(|source| DoatError::SpawnFailed { role, source })?;
        if let Some(registry) = &self.registry {
            registry.track_group(group);
        }
        log::info!("spawned {role} as process group {group}");
        log::debug!("{role} command: {command}");

        let slot = self.processes.len();
        self.processes.push(ManagedProcess {
            role,
            group,
            command: command.to_string(),
            signalled: false,
        });
        Ok(ProcessHandle { slot, group, role })
    }

    /// Non-blocking. A process that has exited, or was already killed, is not alive.
    pub fn is_alive(&mut self, handle: ProcessHandle) -> bool {
        self.state(handle) == ProcessState::Running
    }

    pub fn state(&mut self, handle: ProcessHandle) -> ProcessState {
        match self.processes.get(handle.slot) {
            Some(p) if p.group == handle.group && !p.signalled => self.backend.poll(p.group),
            _ => ProcessState::Exited(None),
        }
    }

    /// Signal the whole group. Calling this again for the same handle is a no-op.
    pub fn kill_group(&mut self, handle: ProcessHandle) -> Result<()> {
        match self.processes.get(handle.slot) {
            Some(p) if p.group == handle.group => self.signal_slot(handle.slot),
            _ => Ok(()),
        }
    }

    /// Signal every group not yet signalled: targets first, then the rest in
    /// spawn order. All groups are attempted; the first failure is returned.
    pub fn teardown(&mut self) -> Result<()> {
        let mut order: Vec<usize> = (0..self.processes.len())
            .filter(|&i| self.processes[i].role == Role::Target)
            .collect();
        order.extend((0..self.processes.len()).filter(|&i| self.processes[i].role != Role::Target));

        let mut first_err = None;
        for slot in order {
            if let Err(e) = self.signal_slot(slot) {
                first_err.get_or_insert(e);
            }
        }
        self.processes.clear();
        first_err.map_or(Ok(()), Err)
    }

    fn signal_slot(&mut self, slot: usize) -> Result<()> {
        let Some(process) = self.processes.get_mut(slot) else {
            return Ok(());
        };
        if process.signalled {
            return Ok(());
        }
        process.signalled = true;
        let (role, group) = (process.role, process.group);
        if let Some(registry) = &self.registry {
            registry.release_group(group);
        }
        log::info!("terminating {role} (process group {group})");
        self.backend.signal_group(group).map_err(DoatError::Io)
    }

    /// Processes spawned since the last teardown.
    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: ProcessBackend> Drop for Supervisor<B> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("teardown on drop failed: {e}");
        }
    }
}
