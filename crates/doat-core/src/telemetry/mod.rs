//! DPDK telemetry collector.
//!
//! The client talks to the application's `dpdk_telemetry.v2` endpoint over a
//! Unix sequential-packet socket and writes one CSV row per step:
//!
//! 1. read the endpoint's greeting, register a callback path, learn
//!    `max_output_len`
//! 2. request `/ethdev/xstats,<port>` every step while `elapsed <= run_time`
//! 3. unregister on every exit path

mod client;
mod socket;

pub use client::{
    CollectorOptions, INITIAL_READ_LEN, TelemetrySession, run_collector, unique_client_path,
};
pub use socket::SeqPacketSocket;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DoatError, Result};

pub const TELEMETRY_VERSION: &str = "v2";

/// Counters recorded per sample, in CSV column order.
pub const METRICS: [&str; 12] = [
    "tx_good_packets",
    "tx_good_bytes",
    "rx_errors",
    "tx_errors",
    "rx_dropped_packets",
    "tx_size_64_packets",
    "tx_size_65_to_127_packets",
    "tx_size_128_to_255_packets",
    "tx_size_256_to_511_packets",
    "tx_size_512_to_1023_packets",
    "tx_size_1024_to_1522_packets",
    "tx_size_1523_to_max_packets",
];

/// Packet size buckets, matching the `tx_size_*` entries of [`METRICS`].
pub const PACKET_SIZE_BUCKETS: [(&str, &str); 7] = [
    ("tx_size_64_packets", "64"),
    ("tx_size_65_to_127_packets", "65 to 127"),
    ("tx_size_128_to_255_packets", "128 to 255"),
    ("tx_size_256_to_511_packets", "256 to 511"),
    ("tx_size_512_to_1023_packets", "512 to 1023"),
    ("tx_size_1024_to_1522_packets", "1024 to 1522"),
    ("tx_size_1523_to_max_packets", "1523 to max"),
];

/// Where in the exchange a protocol failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolStage {
    Connect,
    Register,
    Request,
    Reply,
    Parse,
    Unregister,
}

impl std::fmt::Display for ProtocolStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Register => write!(f, "register"),
            Self::Request => write!(f, "request"),
            Self::Reply => write!(f, "reply"),
            Self::Parse => write!(f, "parse"),
            Self::Unregister => write!(f, "unregister"),
        }
    }
}

pub(crate) fn protocol_error(stage: ProtocolStage, detail: impl std::fmt::Display) -> DoatError {
    DoatError::Protocol {
        stage,
        detail: detail.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Socket discovery
// ---------------------------------------------------------------------------

fn sockets_under(root: &Path) -> Vec<PathBuf> {
    let file_name = format!("dpdk_telemetry.{TELEMETRY_VERSION}");
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path().join(&file_name))
        .filter(|p| p.exists())
        .collect();
    found.sort();
    found
}

/// Telemetry sockets of running DPDK processes: root-owned instances under
/// `/var/run/dpdk`, then per-user instances under `$XDG_RUNTIME_DIR/dpdk`
/// (falling back to `/tmp/dpdk`).
pub fn discover_sockets(xdg_runtime_dir: Option<&str>) -> Vec<PathBuf> {
    let mut found = sockets_under(Path::new("/var/run/dpdk"));
    let user_root = Path::new(xdg_runtime_dir.unwrap_or("/tmp")).join("dpdk");
    found.extend(sockets_under(&user_root));
    found
}

// ---------------------------------------------------------------------------
// Sampling plan
// ---------------------------------------------------------------------------

/// How long and how often to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPlan {
    pub run_time: Duration,
    pub step: Duration,
    pub port: u16,
}

impl SamplingPlan {
    pub fn new(run_time: Duration, step: Duration, port: u16) -> Result<Self> {
        if step.is_zero() {
            return Err(DoatError::Config("telemetry step must be positive".into()));
        }
        Ok(Self {
            run_time,
            step,
            port,
        })
    }

    /// Index of the last sample: the first tick at or past `run_time`.
    pub fn last_tick(&self) -> u64 {
        let run = self.run_time.as_nanos();
        let step = self.step.as_nanos();
        run.div_ceil(step) as u64
    }

    /// Samples taken at `0, step, 2*step, ...` up to and including the
    /// first one at or past `run_time`.
    pub fn sample_count(&self) -> u64 {
        self.last_tick() + 1
    }

    pub fn elapsed_at(&self, tick: u64) -> Duration {
        self.step.saturating_mul(u32::try_from(tick).unwrap_or(u32::MAX))
    }
}

/// Seconds with at most millisecond precision and no trailing zeros.
pub fn format_elapsed(elapsed: Duration) -> String {
    let text = format!("{:.3}", elapsed.as_secs_f64());
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() {
        "0".to_string()
    } else {
        text.to_string()
    }
}

// ---------------------------------------------------------------------------
// CSV output
// ---------------------------------------------------------------------------

/// Writes `time,<METRICS...>` rows, flushing after each one so a killed
/// collector leaves complete rows behind.
pub struct TelemetryCsvWriter<W: Write> {
    out: csv::Writer<W>,
    rows: u64,
}

impl TelemetryCsvWriter<std::fs::File> {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::new(std::fs::File::create(path)?)
    }
}

impl<W: Write> TelemetryCsvWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut out = csv::WriterBuilder::new().has_headers(false).from_writer(inner);
        out.write_record(std::iter::once("time").chain(METRICS))?;
        out.flush()?;
        Ok(Self { out, rows: 0 })
    }

    pub fn write_row(&mut self, elapsed: Duration, values: &[u64]) -> Result<()> {
        let record = std::iter::once(format_elapsed(elapsed))
            .chain(values.iter().map(u64::to_string));
        self.out.write_record(record)?;
        self.out.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> Result<W> {
        self.out
            .into_inner()
            .map_err(|e| DoatError::Io(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_metrics_include_every_size_bucket() {
        for (metric, _) in PACKET_SIZE_BUCKETS {
            assert!(METRICS.contains(&metric), "{metric} missing from METRICS");
        }
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(SamplingPlan::new(Duration::from_secs(1), Duration::ZERO, 0).is_err());
    }

    #[test]
    fn test_zero_run_time_takes_one_sample() {
        let plan = SamplingPlan::new(Duration::ZERO, Duration::from_secs(1), 0).unwrap();
        assert_eq!(plan.sample_count(), 1);
        assert_eq!(plan.elapsed_at(0), Duration::ZERO);
    }

    #[test]
    fn test_inexact_division_samples_past_end() {
        let plan =
            SamplingPlan::new(Duration::from_secs(1), Duration::from_millis(300), 0).unwrap();
        assert_eq!(plan.sample_count(), 5);
        assert_eq!(plan.elapsed_at(plan.last_tick()), Duration::from_millis(1200));
    }

    #[test]
    fn test_exact_division_includes_end() {
        let plan =
            SamplingPlan::new(Duration::from_secs(10), Duration::from_millis(250), 0).unwrap();
        assert_eq!(plan.sample_count(), 41);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "0");
        assert_eq!(format_elapsed(Duration::from_millis(250)), "0.25");
        assert_eq!(format_elapsed(Duration::from_secs(3)), "3");
        assert_eq!(format_elapsed(Duration::from_millis(300) * 3), "0.9");
    }

    #[test]
    fn test_csv_writer_header_and_rows() {
        let mut writer = TelemetryCsvWriter::new(Vec::new()).unwrap();
        writer
            .write_row(Duration::from_millis(500), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])
            .unwrap();
        assert_eq!(writer.rows(), 1);
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            format!("time,{}", METRICS.join(","))
        );
        assert_eq!(lines.next().unwrap(), "0.5,1,2,3,4,5,6,7,8,9,10,11,12");
    }

    #[test]
    fn test_csv_writer_flushes_each_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("telemetry.csv");
        let mut writer = TelemetryCsvWriter::create(&path).unwrap();
        writer.write_row(Duration::ZERO, &[0; 12]).unwrap();
        // Still open: both lines must already be on disk.
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_csv_writer_rejects_short_row() {
        let mut writer = TelemetryCsvWriter::new(Vec::new()).unwrap();
        assert!(writer.write_row(Duration::ZERO, &[1, 2]).is_err());
        assert_eq!(writer.rows(), 0);
    }

    #[test]
    fn test_discover_sockets_under_runtime_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let instance = tmp.path().join("dpdk").join("rte");
        std::fs::create_dir_all(&instance).unwrap();
        std::fs::write(instance.join("dpdk_telemetry.v2"), b"").unwrap();
        std::fs::create_dir_all(tmp.path().join("dpdk").join("stale")).unwrap();

        let found = discover_sockets(tmp.path().to_str());
        assert!(found.contains(&instance.join("dpdk_telemetry.v2")));
        assert!(!found.iter().any(|p| p.starts_with(tmp.path().join("dpdk/stale"))));
    }

    proptest! {
        #[test]
        fn prop_sample_count_is_ceil_plus_one(run_ms in 0u64..100_000, step_ms in 1u64..5_000) {
            let plan = SamplingPlan::new(
                Duration::from_millis(run_ms),
                Duration::from_millis(step_ms),
                0,
            ).unwrap();
            let expected = run_ms.div_ceil(step_ms) + 1;
            prop_assert_eq!(plan.sample_count(), expected);
            // The last sample is at or past the end, the one before is not.
            prop_assert!(plan.elapsed_at(plan.last_tick()) >= plan.run_time);
            if plan.last_tick() > 0 {
                prop_assert!(plan.elapsed_at(plan.last_tick() - 1) < plan.run_time);
            }
        }
    }
}
