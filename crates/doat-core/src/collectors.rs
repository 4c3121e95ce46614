//! Command lines and artifact paths of the three collectors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::process::Role;
use crate::telemetry::format_elapsed;

/// Order in which collectors are probed after the startup grace period.
/// The first dead one is reported.
pub const PROBE_ORDER: [Role; 3] = [Role::PowerSampler, Role::HwCounterSampler, Role::TelemetryClient];

/// Extra seconds the telemetry client samples past the measure window, so
/// it is still running when the final liveness probe happens.
pub const TELEMETRY_OVERRUN_SECS: u64 = 2;

/// Which of the two passes of an optimisation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassLabel {
    Baseline,
    Modified,
}

impl PassLabel {
    /// File name suffix keeping the two passes' artifacts apart.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Baseline => "",
            Self::Modified => "_op",
        }
    }
}

impl std::fmt::Display for PassLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// Artifact paths of one pass. Each collector owns exactly one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassArtifacts {
    pub dir: PathBuf,
    pub label: PassLabel,
}

impl PassArtifacts {
    pub fn new(dir: impl Into<PathBuf>, label: PassLabel) -> Self {
        Self {
            dir: dir.into(),
            label,
        }
    }

    fn file(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{}.csv", self.label.suffix()))
    }

    pub fn pcm(&self) -> PathBuf {
        self.file("pcm")
    }

    pub fn power(&self) -> PathBuf {
        self.file("wallpower")
    }

    pub fn telemetry(&self) -> PathBuf {
        self.file("telemetry")
    }

    pub fn for_role(&self, role: Role) -> Option<PathBuf> {
        match role {
            Role::HwCounterSampler => Some(self.pcm()),
            Role::PowerSampler => Some(self.power()),
            Role::TelemetryClient => Some(self.telemetry()),
            Role::Target | Role::Builder => None,
        }
    }
}

/// Quote `s` for `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-=:,+@".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// A collector ready to hand to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSpec {
    pub role: Role,
    pub command: String,
}

pub fn hw_counter_command(pcm_dir: &Path, step: Duration, artifact: &Path) -> String {
    format!(
        "{} {} -csv={}",
        quote_path(&pcm_dir.join("pcm.x")),
        format_elapsed(step),
        quote_path(artifact)
    )
}

/// Sample the BMC power sensor once per step into `power,time` rows.
pub fn power_command(sensor: &str, step: Duration, artifact: &Path) -> String {
    let out = quote_path(artifact);
    let pattern = shell_quote(sensor);
    format!(
        "printf 'power,time\\n' > {out}; while true; do \
         ipmitool sdr | grep {pattern} | cut -c 20- | cut -f1 -d 'W' | tr -d '\\n' | sed 's/.$//' >> {out}; \
         printf ',' >> {out}; date +%s >> {out}; sleep {step}; done",
        step = format_elapsed(step)
    )
}

pub fn telemetry_command(
    program: &Path,
    artifact: &Path,
    run_time: Duration,
    step: Duration,
    port: u16,
    socket: Option<&Path>,
) -> String {
    let mut command = format!(
        "{} telemetry-client --csv {} --run-time {} --step {} --port {port}",
        quote_path(program),
        quote_path(artifact),
        format_elapsed(run_time),
        format_elapsed(step),
    );
    if let Some(socket) = socket {
        command.push_str(" --socket ");
        command.push_str(&quote_path(socket));
    }
    command
}

/// Every enabled collector, in spawn order: hardware counters, power,
/// then telemetry.
pub fn collector_specs(config: &RunConfig, artifacts: &PassArtifacts, program: &Path) -> Vec<CollectorSpec> {
    let step = config.step();
    let mut specs = vec![
        CollectorSpec {
            role: Role::HwCounterSampler,
            command: hw_counter_command(&config.tools.pcm_dir, step, &artifacts.pcm()),
        },
        CollectorSpec {
            role: Role::PowerSampler,
            command: power_command(&config.tools.power_sensor, step, &artifacts.power()),
        },
    ];
    if let Some(port) = config.telemetry_port() {
        let run_time = config.measure_duration() + Duration::from_secs(TELEMETRY_OVERRUN_SECS);
        specs.push(CollectorSpec {
            role: Role::TelemetryClient,
            command: telemetry_command(
                program,
                &artifacts.telemetry(),
                run_time,
                step,
                port,
                config.app.telemetry_socket.as_deref(),
            ),
        });
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[doat]
startup_time = 5
test_runtime = 10
test_step_size = 1.0

[app]
dpdk_location = "/opt/dpdk"
app_cmd = "./testpmd"
telemetry = true
telemetry_port = 1

[cpu]
test_core = 0
app_cores = [3]

[tools]
pcm_dir = "/opt/pcm"
"#;

    #[test]
    fn test_probe_order_is_power_counters_telemetry() {
        assert_eq!(
            PROBE_ORDER,
            [Role::PowerSampler, Role::HwCounterSampler, Role::TelemetryClient]
        );
    }

    #[test]
    fn test_artifact_suffixes() {
        let base = PassArtifacts::new("tmp", PassLabel::Baseline);
        let op = PassArtifacts::new("tmp", PassLabel::Modified);
        assert_eq!(base.pcm(), PathBuf::from("tmp/pcm.csv"));
        assert_eq!(op.pcm(), PathBuf::from("tmp/pcm_op.csv"));
        assert_eq!(op.power(), PathBuf::from("tmp/wallpower_op.csv"));
        assert_eq!(op.telemetry(), PathBuf::from("tmp/telemetry_op.csv"));
        assert_eq!(base.for_role(Role::Target), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/opt/pcm/pcm.x"), "/opt/pcm/pcm.x");
        assert_eq!(shell_quote("PS1 Input Power"), "'PS1 Input Power'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_specs_in_spawn_order() {
        let config = RunConfig::from_toml_str(CONFIG).unwrap();
        let artifacts = PassArtifacts::new("tmp", PassLabel::Baseline);
        let specs = collector_specs(&config, &artifacts, Path::new("/usr/bin/doat"));
        let roles: Vec<Role> = specs.iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![Role::HwCounterSampler, Role::PowerSampler, Role::TelemetryClient]
        );
        assert_eq!(specs[0].command, "/opt/pcm/pcm.x 1 -csv=tmp/pcm.csv");
        assert!(specs[1].command.starts_with("printf 'power,time\\n' > tmp/wallpower.csv"));
        assert!(specs[1].command.contains("grep 'PS1 Input Power'"));
        assert_eq!(
            specs[2].command,
            "/usr/bin/doat telemetry-client --csv tmp/telemetry.csv --run-time 12 --step 1 --port 1"
        );
    }

    #[test]
    fn test_telemetry_disabled_has_two_collectors() {
        let text = CONFIG.replace("telemetry = true", "telemetry = false");
        let config = RunConfig::from_toml_str(&text).unwrap();
        let specs = collector_specs(&config, &PassArtifacts::new("tmp", PassLabel::Modified), Path::new("doat"));
        assert_eq!(specs.len(), 2);
        assert!(specs[0].command.ends_with("-csv=tmp/pcm_op.csv"));
    }

    #[test]
    fn test_explicit_socket_is_forwarded() {
        let cmd = telemetry_command(
            Path::new("doat"),
            Path::new("t.csv"),
            Duration::from_secs(3),
            Duration::from_millis(500),
            0,
            Some(Path::new("/var/run/dpdk/rte/dpdk_telemetry.v2")),
        );
        assert!(cmd.ends_with("--step 0.5 --port 0 --socket /var/run/dpdk/rte/dpdk_telemetry.v2"));
    }
}
