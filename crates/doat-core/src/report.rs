//! Results of a finished run: `results.json` plus a plain `index.html`.
//!
//! # Storage Format
//!
//! The artifact directory of a run ends up containing:
//! - `pcm.csv`, `wallpower.csv`, `telemetry.csv` from the baseline pass
//! - the same with an `_op` suffix from the modified pass, if any
//! - `results.json` with run metadata, the config, per-pass metrics and the
//!   comparison
//! - `index.html`, a summary table over the same data

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{Comparison, ExtractionPlan, PassMetrics, PassSeries};
use crate::config::{Placement, RunConfig};
use crate::controller::RunOutcome;
use crate::diff::Recommendation;
use crate::error::Result;
use crate::mutation::MemoryOptimisation;
use crate::topology::CpuTopology;

pub const RESULTS_FILE: &str = "results.json";
pub const INDEX_FILE: &str = "index.html";

// ---------------------------------------------------------------------------
// Machine info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub kernel: String,
    pub cpu_model: String,
    pub logical_cores: usize,
    pub sockets: usize,
}

/// Best-effort description of the machine under test.
pub fn detect_machine_info(topology: &CpuTopology) -> MachineInfo {
    let os = read_trimmed("/etc/os-release")
        .and_then(|s| {
            s.lines()
                .find_map(|l| l.strip_prefix("PRETTY_NAME="))
                .map(|v| v.trim_matches('"').to_string())
        })
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    let kernel = read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default();
    let cpu_model = read_trimmed("/proc/cpuinfo")
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split_once(':'))
                .map(|(_, v)| v.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    MachineInfo {
        os,
        kernel,
        cpu_model,
        logical_cores: topology.core_count(),
        sockets: topology.socket_count(),
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

// ---------------------------------------------------------------------------
// Run metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub machine: MachineInfo,
    pub project_name: Option<String>,
    pub tester_name: Option<String>,
    pub tester_email: Option<String>,
    pub doat_version: String,
}

/// Wall clock for one invocation, started before the first pass.
#[derive(Debug, Clone)]
pub struct RunClock {
    id: String,
    started_at: SystemTime,
    started: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn finish(&self, machine: MachineInfo, config: &RunConfig) -> RunMeta {
        let since_epoch = |t: SystemTime| t.duration_since(UNIX_EPOCH).unwrap_or_default();
        RunMeta {
            id: self.id.clone(),
            started_at: format_iso8601(since_epoch(self.started_at)),
            ended_at: format_iso8601(since_epoch(SystemTime::now())),
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            machine,
            project_name: config.reporting.project_name.clone(),
            tester_name: config.reporting.tester_name.clone(),
            tester_email: config.reporting.tester_email.clone(),
            doat_version: crate::VERSION.to_string(),
        }
    }
}

/// `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_iso8601(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}

/// Gregorian date of a day count since 1970-01-01 (Howard Hinnant's
/// `civil_from_days`).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Everything `results.json` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub meta: RunMeta,
    pub config: RunConfig,
    pub placement: Placement,
    pub optimisation: Option<MemoryOptimisation>,
    pub baseline: PassMetrics,
    pub modified: Option<PassMetrics>,
    pub comparison: Option<Comparison>,
}

impl RunResults {
    /// Extract, summarise and compare the artifacts of `outcome`.
    pub fn analyse(
        meta: RunMeta,
        config: &RunConfig,
        placement: &Placement,
        outcome: &RunOutcome,
        optimisation: Option<MemoryOptimisation>,
    ) -> Result<Self> {
        let plan = ExtractionPlan::new(config, placement);
        let baseline = PassSeries::load(&outcome.baseline, &plan)?;
        let modified = outcome
            .modified
            .as_ref()
            .map(|artifacts| PassSeries::load(artifacts, &plan))
            .transpose()?;
        let comparison = modified
            .as_ref()
            .map(|m| Comparison::between(&baseline, m))
            .transpose()?;

        Ok(Self {
            meta,
            config: config.clone(),
            placement: placement.clone(),
            optimisation,
            baseline: PassMetrics::summarize(&baseline),
            modified: modified.as_ref().map(PassMetrics::summarize),
            comparison,
        })
    }
}

/// Writes the finished results next to the pass artifacts.
pub struct ResultsWriter {
    dir: PathBuf,
}

impl ResultsWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, results: &RunResults) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(self.dir.join(RESULTS_FILE), json)?;
        std::fs::write(self.dir.join(INDEX_FILE), render_html(results))?;
        log::info!("results written to {}", self.dir.display());
        Ok(self.dir.join(RESULTS_FILE))
    }

    pub fn load(dir: &Path) -> Result<RunResults> {
        let text = std::fs::read_to_string(dir.join(RESULTS_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn row(html: &mut String, cells: &[String]) {
    html.push_str("<tr>");
    for cell in cells {
        let _ = write!(html, "<td>{}</td>", escape_html(cell));
    }
    html.push_str("</tr>\n");
}

fn pass_rows(html: &mut String, m: &PassMetrics) {
    let label = m.label.to_string();
    row(html, &[label.clone(), "read bandwidth (MB/s)".into(), m.bandwidth.read_avg.to_string()]);
    row(html, &[label.clone(), "write bandwidth (MB/s)".into(), m.bandwidth.write_avg.to_string()]);
    for c in m.cores.iter().chain(m.master.iter()) {
        row(html, &[label.clone(), format!("core {} L3 hit (%)", c.core), c.l3_hit_avg.to_string()]);
        row(html, &[label.clone(), format!("core {} L2 hit (%)", c.core), c.l2_hit_avg.to_string()]);
        row(html, &[label.clone(), format!("core {} L3 misses", c.core), c.l3_miss_avg.to_string()]);
        row(html, &[label.clone(), format!("core {} L2 misses", c.core), c.l2_miss_avg.to_string()]);
    }
    row(html, &[label.clone(), "power (W)".into(), m.power_avg.to_string()]);
    if let Some(t) = &m.telemetry {
        row(html, &[label.clone(), "throughput (Gbps)".into(), t.avg_throughput.to_string()]);
        row(html, &[label.clone(), "packet rate (pps)".into(), t.avg_packet_rate.to_string()]);
        row(html, &[label.clone(), "rx dropped".into(), t.rx_dropped.to_string()]);
    }
    row(html, &[label, "data points".into(), m.datapoints.total().to_string()]);
}

/// Standalone summary page.
pub fn render_html(results: &RunResults) -> String {
    let title = results
        .meta
        .project_name
        .clone()
        .unwrap_or_else(|| "DOAT report".to_string());
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{0}</title></head><body>\n<h1>{0}</h1>\n",
        escape_html(&title)
    );
    let _ = writeln!(
        html,
        "<p>Run {} started {} on {} ({})</p>",
        escape_html(&results.meta.id),
        escape_html(&results.meta.started_at),
        escape_html(&results.meta.machine.cpu_model),
        escape_html(&results.meta.machine.os)
    );

    html.push_str("<table>\n<tr><th>pass</th><th>metric</th><th>value</th></tr>\n");
    pass_rows(&mut html, &results.baseline);
    if let Some(modified) = &results.modified {
        pass_rows(&mut html, modified);
    }
    html.push_str("</table>\n");

    if let Some(cmp) = &results.comparison {
        html.push_str("<h2>Comparison</h2>\n<table>\n<tr><th>series</th><th>baseline</th><th>modified</th><th>change</th></tr>\n");
        let telemetry = cmp.telemetry.iter().flat_map(|t| [&t.throughput, &t.packet_rate]);
        for d in [&cmp.read, &cmp.write, &cmp.power]
            .into_iter()
            .chain(&cmp.cores)
            .chain(&cmp.master)
            .chain(telemetry)
        {
            row(
                &mut html,
                &[
                    d.tag.to_string(),
                    d.baseline_avg.to_string(),
                    d.modified_avg.to_string(),
                    d.delta.to_string(),
                ],
            );
        }
        html.push_str("</table>\n");
        match &cmp.recommendation {
            Recommendation::Recommended => {
                html.push_str("<p>It is recommended to change from ring mempools to stack mempools.</p>\n");
            }
            Recommendation::NotRecommended(blockers) => {
                html.push_str("<p>It is recommended not to change from ring mempools to stack mempools:</p>\n<ul>\n");
                for blocker in blockers {
                    let _ = writeln!(html, "<li>{}</li>", escape_html(&blocker.to_string()));
                }
                html.push_str("</ul>\n");
            }
        }
    }
    html.push_str("</body></html>\n");
    html
}
