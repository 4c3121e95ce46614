//! Tagged metric series built from extracted columns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DoatError, Result};
use crate::extract::{ColumnSchema, PcmField, Table, core_anchor, socket_anchor};
use crate::telemetry::{METRICS, PACKET_SIZE_BUCKETS};

/// What a series measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "core", rename_all = "kebab-case")]
pub enum SeriesTag {
    SocketBandwidthRead,
    SocketBandwidthWrite,
    CacheL3Miss(usize),
    CacheL2Miss(usize),
    CacheL3Hit(usize),
    CacheL2Hit(usize),
    Power,
    /// Cumulative GB sent since the first sample.
    TelemetryBytes,
    /// Cumulative packets sent since the first sample.
    TelemetryPackets,
    /// Gbps per step.
    Throughput,
    /// Packets per second per step.
    PacketRate,
}

/// How two averages of a series are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    /// Relative change of a rate or bandwidth, in percent.
    Percent,
    /// Plain difference of values that are already normalised.
    Absolute,
}

impl SeriesTag {
    pub fn delta_kind(self) -> DeltaKind {
        match self {
            Self::SocketBandwidthRead
            | Self::SocketBandwidthWrite
            | Self::CacheL3Miss(_)
            | Self::CacheL2Miss(_)
            | Self::Power => DeltaKind::Percent,
            Self::CacheL3Hit(_)
            | Self::CacheL2Hit(_)
            | Self::TelemetryBytes
            | Self::TelemetryPackets
            | Self::Throughput
            | Self::PacketRate => DeltaKind::Absolute,
        }
    }

    /// Decimal places averages are reported with.
    pub fn average_decimals(self) -> i32 {
        match self {
            Self::SocketBandwidthRead | Self::SocketBandwidthWrite | Self::Throughput => 2,
            Self::TelemetryPackets | Self::PacketRate => 0,
            _ => 1,
        }
    }

    /// Decimal places deltas are reported with.
    pub fn delta_decimals(self) -> i32 {
        match self {
            Self::Throughput => 2,
            Self::TelemetryPackets | Self::PacketRate => 0,
            _ => 1,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::SocketBandwidthRead | Self::SocketBandwidthWrite => "MB/s",
            Self::CacheL3Miss(_) | Self::CacheL2Miss(_) => "misses",
            Self::CacheL3Hit(_) | Self::CacheL2Hit(_) => "%",
            Self::Power => "W",
            Self::TelemetryBytes => "GB",
            Self::TelemetryPackets => "packets",
            Self::Throughput => "Gbps",
            Self::PacketRate => "pps",
        }
    }
}

impl std::fmt::Display for SeriesTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SocketBandwidthRead => write!(f, "socket-bandwidth-read"),
            Self::SocketBandwidthWrite => write!(f, "socket-bandwidth-write"),
            Self::CacheL3Miss(core) => write!(f, "cache-l3-miss[{core}]"),
            Self::CacheL2Miss(core) => write!(f, "cache-l2-miss[{core}]"),
            Self::CacheL3Hit(core) => write!(f, "cache-l3-hit[{core}]"),
            Self::CacheL2Hit(core) => write!(f, "cache-l2-hit[{core}]"),
            Self::Power => write!(f, "power"),
            Self::TelemetryBytes => write!(f, "telemetry-bytes"),
            Self::TelemetryPackets => write!(f, "telemetry-packets"),
            Self::Throughput => write!(f, "throughput"),
            Self::PacketRate => write!(f, "packet-rate"),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricSeries
// ---------------------------------------------------------------------------

/// A non-empty, read-only sequence of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSeries")]
pub struct MetricSeries {
    tag: SeriesTag,
    step_secs: f64,
    samples: Vec<f64>,
    /// Explicit time axis in seconds, when the collector records one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    times: Option<Vec<f64>>,
}

/// Deserialized form, checked through [`MetricSeries::new`].
#[derive(Deserialize)]
struct RawSeries {
    tag: SeriesTag,
    step_secs: f64,
    samples: Vec<f64>,
    #[serde(default)]
    times: Option<Vec<f64>>,
}

impl TryFrom<RawSeries> for MetricSeries {
    type Error = DoatError;

    fn try_from(raw: RawSeries) -> Result<Self> {
        let step = Duration::try_from_secs_f64(raw.step_secs).map_err(|e| {
            DoatError::SeriesMismatch {
                detail: format!("{} has step {}: {e}", raw.tag, raw.step_secs),
            }
        })?;
        let series = Self::new(raw.tag, step, raw.samples)?;
        match raw.times {
            Some(times) => series.with_times(times),
            None => Ok(series),
        }
    }
}

impl MetricSeries {
    pub fn new(tag: SeriesTag, step: Duration, samples: Vec<f64>) -> Result<Self> {
        if samples.is_empty() {
            return Err(DoatError::EmptySeries { tag: tag.to_string() });
        }
        Ok(Self {
            tag,
            step_secs: step.as_secs_f64(),
            samples,
            times: None,
        })
    }

    /// Attach a recorded time axis. It must have one entry per sample.
    pub fn with_times(mut self, times: Vec<f64>) -> Result<Self> {
        if times.len() != self.samples.len() {
            return Err(DoatError::SeriesMismatch {
                detail: format!(
                    "{} has {} samples but {} timestamps",
                    self.tag,
                    self.samples.len(),
                    times.len()
                ),
            });
        }
        self.times = Some(times);
        Ok(self)
    }

    pub fn tag(&self) -> SeriesTag {
        self.tag
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn last(&self) -> f64 {
        self.samples[self.samples.len() - 1]
    }

    /// Seconds since the first sample.
    pub fn times(&self) -> Vec<f64> {
        match &self.times {
            Some(times) => times.clone(),
            None => (0..self.samples.len())
                .map(|i| i as f64 * self.step_secs)
                .collect(),
        }
    }
}

/// `values[i] - values[0]`.
pub fn rebase(values: &[f64]) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    values.iter().map(|v| v - first).collect()
}

/// Per-step rate of a cumulative counter. Element 0 has no predecessor and
/// copies element 1; a single sample yields `[0.0]`.
pub fn per_step_rate(cumulative: &[f64], step_secs: f64, scale: f64) -> Vec<f64> {
    if cumulative.len() < 2 {
        return vec![0.0; cumulative.len()];
    }
    let mut rates: Vec<f64> = std::iter::once(0.0)
        .chain(cumulative.windows(2).map(|w| (w[1] - w[0]) * scale / step_secs))
        .collect();
    rates[0] = rates[1];
    rates
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Cache series of one core.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreSeries {
    pub core: usize,
    pub l3_miss: MetricSeries,
    pub l2_miss: MetricSeries,
    pub l3_hit: MetricSeries,
    pub l2_hit: MetricSeries,
}

/// Everything read from one PCM artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmSeries {
    pub read: MetricSeries,
    pub write: MetricSeries,
    pub cores: Vec<CoreSeries>,
    pub master: Option<CoreSeries>,
    pub datapoints: usize,
}

fn core_series(
    table: &Table,
    schema: &ColumnSchema,
    core: usize,
    socket: u32,
    step: Duration,
) -> Result<CoreSeries> {
    let anchor = core_anchor(core, socket);
    let column = |field, tag| MetricSeries::new(tag, step, table.extract(schema, &anchor, field)?);
    Ok(CoreSeries {
        core,
        l3_miss: column(PcmField::L3Miss, SeriesTag::CacheL3Miss(core))?,
        l2_miss: column(PcmField::L2Miss, SeriesTag::CacheL2Miss(core))?,
        l3_hit: column(PcmField::L3Hit, SeriesTag::CacheL3Hit(core))?,
        l2_hit: column(PcmField::L2Hit, SeriesTag::CacheL2Hit(core))?,
    })
}

impl PcmSeries {
    pub fn from_table(
        table: &Table,
        schema: &ColumnSchema,
        socket: u32,
        cores: &[usize],
        master: Option<usize>,
        step: Duration,
    ) -> Result<Self> {
        let anchor = socket_anchor(socket);
        let read = MetricSeries::new(
            SeriesTag::SocketBandwidthRead,
            step,
            table.extract(schema, &anchor, PcmField::SocketRead)?,
        )?;
        let write = MetricSeries::new(
            SeriesTag::SocketBandwidthWrite,
            step,
            table.extract(schema, &anchor, PcmField::SocketWrite)?,
        )?;
        let cores = cores
            .iter()
            .map(|&core| core_series(table, schema, core, socket, step))
            .collect::<Result<Vec<_>>>()?;
        let master = master
            .map(|core| core_series(table, schema, core, socket, step))
            .transpose()?;
        Ok(Self {
            read,
            write,
            cores,
            master,
            datapoints: table.datapoints(),
        })
    }
}

/// Wall power with its time axis rebased to the first reading.
pub fn power_series(table: &Table, step: Duration) -> Result<MetricSeries> {
    let power = table.named("power")?;
    let times = rebase(&table.named("time")?);
    MetricSeries::new(SeriesTag::Power, step, power)?.with_times(times)
}

/// Counter totals and derived series from one telemetry artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySeries {
    pub bytes: MetricSeries,
    pub packets: MetricSeries,
    pub throughput: MetricSeries,
    pub packet_rate: MetricSeries,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    /// Last-row value of every `tx_size_*` bucket, labelled.
    pub size_distribution: Vec<(String, u64)>,
    pub datapoints: usize,
}

impl TelemetrySeries {
    pub fn from_table(table: &Table, step: Duration) -> Result<Self> {
        let step_secs = step.as_secs_f64();
        let times = table.named("time")?;
        let last = |name: &str| -> Result<u64> {
            let values = table.named(name)?;
            let value = values.last().copied().ok_or_else(|| {
                DoatError::malformed(table.path(), "telemetry artifact has no samples")
            })?;
            Ok(value as u64)
        };
        for metric in METRICS {
            table.locate(metric, 0)?;
        }

        let bytes = rebase(&table.named("tx_good_bytes")?);
        let packets = rebase(&table.named("tx_good_packets")?);
        let throughput = per_step_rate(&bytes, step_secs, 8.0 / 1e9);
        let packet_rate = per_step_rate(&packets, step_secs, 1.0);
        let gigabytes = bytes.iter().map(|b| b / 1e9).collect();

        let size_distribution = PACKET_SIZE_BUCKETS
            .iter()
            .map(|(metric, label)| Ok((label.to_string(), last(metric)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            bytes: MetricSeries::new(SeriesTag::TelemetryBytes, step, gigabytes)?
                .with_times(times.clone())?,
            packets: MetricSeries::new(SeriesTag::TelemetryPackets, step, packets)?
                .with_times(times.clone())?,
            throughput: MetricSeries::new(SeriesTag::Throughput, step, throughput)?
                .with_times(times.clone())?,
            packet_rate: MetricSeries::new(SeriesTag::PacketRate, step, packet_rate)?
                .with_times(times)?,
            rx_errors: last("rx_errors")?,
            tx_errors: last("tx_errors")?,
            rx_dropped: last("rx_dropped_packets")?,
            size_distribution,
            datapoints: table.datapoints(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_csv(rows: &[(f64, u64, u64, u64)]) -> String {
        let mut text = format!("time,{}\n", METRICS.join(","));
        for &(t, packets, bytes, dropped) in rows {
            text.push_str(&format!(
                "{t},{packets},{bytes},0,0,{dropped},1,2,3,4,5,6,7\n"
            ));
        }
        text
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(SeriesTag::SocketBandwidthRead.to_string(), "socket-bandwidth-read");
        assert_eq!(SeriesTag::CacheL3Miss(4).to_string(), "cache-l3-miss[4]");
        assert_eq!(SeriesTag::TelemetryPackets.to_string(), "telemetry-packets");
    }

    #[test]
    fn test_empty_series_rejected() {
        assert!(matches!(
            MetricSeries::new(SeriesTag::Power, Duration::from_secs(1), vec![]),
            Err(DoatError::EmptySeries { .. })
        ));
    }

    #[test]
    fn test_deserialize_goes_through_checks() {
        let s = MetricSeries::new(SeriesTag::Power, Duration::from_secs(1), vec![250.0, 260.0])
            .unwrap()
            .with_times(vec![0.0, 1.5])
            .unwrap();
        let mut json = serde_json::to_value(&s).unwrap();
        assert_eq!(serde_json::from_value::<MetricSeries>(json.clone()).unwrap(), s);

        json["samples"] = serde_json::json!([]);
        json["times"] = serde_json::json!([]);
        assert!(serde_json::from_value::<MetricSeries>(json.clone()).is_err());

        json["samples"] = serde_json::json!([1.0]);
        json["times"] = serde_json::json!([0.0, 1.0]);
        assert!(serde_json::from_value::<MetricSeries>(json).is_err());
    }

    #[test]
    fn test_default_time_axis_follows_step() {
        let s = MetricSeries::new(SeriesTag::Power, Duration::from_millis(500), vec![1.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(s.times(), vec![0.0, 0.5, 1.0]);
        assert_eq!(s.mean(), 2.0);
        assert_eq!(s.max(), 3.0);
    }

    #[test]
    fn test_rate_copies_first_element() {
        let rates = per_step_rate(&[0.0, 10.0, 30.0], 1.0, 1.0);
        assert_eq!(rates, vec![10.0, 10.0, 20.0]);
        assert_eq!(per_step_rate(&[5.0], 1.0, 1.0), vec![0.0]);
        assert!(per_step_rate(&[], 1.0, 1.0).is_empty());
    }

    // -----------------------------------------------------------------------
    // Artifact builders
    // -----------------------------------------------------------------------

    #[test]
    fn test_power_time_axis_is_rebased() {
        let table = Table::parse("wallpower.csv", "power,time\n100,1700000000\n110,1700000001\n").unwrap();
        let power = power_series(&table, Duration::from_secs(1)).unwrap();
        assert_eq!(power.times(), vec![0.0, 1.0]);
        assert_eq!(power.mean(), 105.0);
    }

    #[test]
    fn test_telemetry_derived_series() {
        let text = telemetry_csv(&[
            (0.0, 1_000, 1_000_000_000, 0),
            (1.0, 2_000, 2_250_000_000, 0),
            (2.0, 4_000, 3_500_000_000, 3),
        ]);
        let table = Table::parse("telemetry.csv", &text).unwrap();
        let t = TelemetrySeries::from_table(&table, Duration::from_secs(1)).unwrap();

        assert_eq!(t.packets.samples(), &[0.0, 1000.0, 3000.0]);
        assert_eq!(t.packet_rate.samples(), &[1000.0, 1000.0, 2000.0]);
        assert!((t.throughput.samples()[0] - 10.0).abs() < 1e-9);
        assert!((t.bytes.max() - 2.5).abs() < 1e-9);
        assert_eq!(t.rx_dropped, 3);
        assert_eq!(t.size_distribution[0], ("64".to_string(), 1));
        assert_eq!(t.size_distribution[6], ("1523 to max".to_string(), 7));
    }

    #[test]
    fn test_single_telemetry_sample_has_zero_rate() {
        let table = Table::parse("telemetry.csv", &telemetry_csv(&[(0.0, 5, 64, 0)])).unwrap();
        let t = TelemetrySeries::from_table(&table, Duration::from_secs(1)).unwrap();
        assert_eq!(t.throughput.samples(), &[0.0]);
        assert_eq!(t.packet_rate.len(), 1);
    }

    #[test]
    fn test_telemetry_missing_counter_column() {
        let table = Table::parse("telemetry.csv", "time,tx_good_packets\n0,1\n").unwrap();
        assert!(matches!(
            TelemetrySeries::from_table(&table, Duration::from_secs(1)),
            Err(DoatError::ColumnNotFound { .. })
        ));
    }
}
