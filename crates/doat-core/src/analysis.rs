//! Per-pass summaries and the baseline/modified comparison.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collectors::{PassArtifacts, PassLabel};
use crate::config::{Placement, RunConfig};
use crate::diff::{
    DiffResult, Recommendation, RecommendationInput, diff, diff_averages, recommend, round_to,
};
use crate::error::Result;
use crate::extract::{ColumnSchema, PCM_SCHEMA_V1, Table};
use crate::series::{CoreSeries, MetricSeries, PcmSeries, TelemetrySeries, power_series};

/// What to read out of a pass's artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    pub schema: ColumnSchema,
    pub socket: u32,
    pub cores: Vec<usize>,
    pub master: Option<usize>,
    pub step: Duration,
    pub telemetry: bool,
}

impl ExtractionPlan {
    pub fn new(config: &RunConfig, placement: &Placement) -> Self {
        Self {
            schema: PCM_SCHEMA_V1,
            socket: placement.app_socket,
            cores: placement.app_cores.clone(),
            master: placement.master,
            step: config.step(),
            telemetry: config.telemetry_port().is_some(),
        }
    }
}

/// Every series extracted from one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSeries {
    pub label: PassLabel,
    pub pcm: PcmSeries,
    pub power: MetricSeries,
    pub power_datapoints: usize,
    pub telemetry: Option<TelemetrySeries>,
}

impl PassSeries {
    pub fn load(artifacts: &PassArtifacts, plan: &ExtractionPlan) -> Result<Self> {
        let pcm_table = Table::read_pcm(&artifacts.pcm())?;
        let pcm = PcmSeries::from_table(
            &pcm_table,
            &plan.schema,
            plan.socket,
            &plan.cores,
            plan.master,
            plan.step,
        )?;
        let power_table = Table::read(&artifacts.power())?;
        let power = power_series(&power_table, plan.step)?;
        let telemetry = if plan.telemetry {
            let table = Table::read(&artifacts.telemetry())?;
            Some(TelemetrySeries::from_table(&table, plan.step)?)
        } else {
            None
        };
        Ok(Self {
            label: artifacts.label,
            pcm,
            power,
            power_datapoints: power_table.datapoints(),
            telemetry,
        })
    }
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSummary {
    /// MB/s
    pub read_avg: f64,
    pub write_avg: f64,
    pub write_read_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreCacheSummary {
    pub core: usize,
    pub l3_miss_avg: f64,
    pub l2_miss_avg: f64,
    /// Percent
    pub l3_hit_avg: f64,
    pub l2_hit_avg: f64,
}

impl CoreCacheSummary {
    fn from_series(series: &CoreSeries) -> Self {
        let avg = |s: &MetricSeries| round_to(s.mean(), s.tag().average_decimals());
        Self {
            core: series.core,
            l3_miss_avg: avg(&series.l3_miss),
            l2_miss_avg: avg(&series.l2_miss),
            l3_hit_avg: avg(&series.l3_hit),
            l2_hit_avg: avg(&series.l2_hit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketSizeCount {
    pub size: String,
    pub packets: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub packet_sizes: Vec<PacketSizeCount>,
    pub transferred_gb: f64,
    pub transferred_packets: u64,
    pub avg_packet_rate: f64,
    /// Gbps
    pub avg_throughput: f64,
}

impl TelemetrySummary {
    fn from_series(t: &TelemetrySeries) -> Self {
        Self {
            rx_errors: t.rx_errors,
            tx_errors: t.tx_errors,
            rx_dropped: t.rx_dropped,
            packet_sizes: t
                .size_distribution
                .iter()
                .map(|(size, packets)| PacketSizeCount {
                    size: size.clone(),
                    packets: *packets,
                })
                .collect(),
            transferred_gb: round_to(t.bytes.max(), 1),
            transferred_packets: t.packets.max() as u64,
            avg_packet_rate: round_to(t.packet_rate.mean(), 0),
            avg_throughput: round_to(t.throughput.mean(), 2),
        }
    }

    /// Log the counters that should have stayed at zero.
    pub fn warn_on_faults(&self, label: PassLabel) {
        if self.rx_errors != 0 {
            log::warn!("{label}: RX errors occurred during the test (rx_errors: {})", self.rx_errors);
        }
        if self.tx_errors != 0 {
            log::warn!("{label}: TX errors occurred during the test (tx_errors: {})", self.tx_errors);
        }
        if self.rx_dropped != 0 {
            log::warn!(
                "{label}: RX packets were dropped during the test (rx_dropped_packets: {})",
                self.rx_dropped
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoints {
    pub pcm: usize,
    pub power: usize,
    pub telemetry: usize,
}

impl DataPoints {
    pub fn total(&self) -> usize {
        self.pcm + self.power + self.telemetry
    }
}

/// Everything reported about one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassMetrics {
    pub label: PassLabel,
    pub bandwidth: BandwidthSummary,
    pub cores: Vec<CoreCacheSummary>,
    pub master: Option<CoreCacheSummary>,
    /// Watts
    pub power_avg: f64,
    pub telemetry: Option<TelemetrySummary>,
    pub datapoints: DataPoints,
}

impl PassMetrics {
    pub fn summarize(series: &PassSeries) -> Self {
        let read_avg = round_to(series.pcm.read.mean(), 2);
        let write_avg = round_to(series.pcm.write.mean(), 2);
        let write_read_ratio = (read_avg != 0.0).then(|| round_to(write_avg / read_avg, 2));
        let telemetry = series.telemetry.as_ref().map(TelemetrySummary::from_series);
        if let Some(t) = &telemetry {
            t.warn_on_faults(series.label);
        }

        Self {
            label: series.label,
            bandwidth: BandwidthSummary {
                read_avg,
                write_avg,
                write_read_ratio,
            },
            cores: series.pcm.cores.iter().map(CoreCacheSummary::from_series).collect(),
            master: series.pcm.master.as_ref().map(CoreCacheSummary::from_series),
            power_avg: round_to(series.power.mean(), 1),
            telemetry,
            datapoints: DataPoints {
                pcm: series.pcm.datapoints,
                power: series.power_datapoints,
                telemetry: series.telemetry.as_ref().map_or(0, |t| t.datapoints),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Absolute change of a counter total between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub baseline: u64,
    pub modified: u64,
    pub delta: i64,
}

impl CounterDelta {
    fn new(baseline: u64, modified: u64) -> Self {
        Self {
            baseline,
            modified,
            delta: modified as i64 - baseline as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryComparison {
    pub rx_errors: CounterDelta,
    pub tx_errors: CounterDelta,
    pub rx_dropped: CounterDelta,
    pub transferred_gb: DiffResult,
    pub transferred_packets: DiffResult,
    pub packet_rate: DiffResult,
    pub throughput: DiffResult,
}

/// Baseline against modified, series by series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub read: DiffResult,
    pub write: DiffResult,
    pub cores: Vec<DiffResult>,
    pub master: Vec<DiffResult>,
    pub power: DiffResult,
    pub telemetry: Option<TelemetryComparison>,
    pub recommendation: Recommendation,
}

fn diff_cores(baseline: &CoreSeries, modified: &CoreSeries) -> Result<Vec<DiffResult>> {
    Ok(vec![
        diff(&baseline.l3_miss, &modified.l3_miss)?,
        diff(&baseline.l2_miss, &modified.l2_miss)?,
        diff(&baseline.l3_hit, &modified.l3_hit)?,
        diff(&baseline.l2_hit, &modified.l2_hit)?,
    ])
}

impl Comparison {
    pub fn between(baseline: &PassSeries, modified: &PassSeries) -> Result<Self> {
        let read = diff(&baseline.pcm.read, &modified.pcm.read)?;
        let write = diff(&baseline.pcm.write, &modified.pcm.write)?;

        let mut cores = Vec::new();
        for (b, m) in baseline.pcm.cores.iter().zip(&modified.pcm.cores) {
            cores.extend(diff_cores(b, m)?);
        }
        let master = match (&baseline.pcm.master, &modified.pcm.master) {
            (Some(b), Some(m)) => diff_cores(b, m)?,
            _ => Vec::new(),
        };
        let power = diff(&baseline.power, &modified.power)?;

        let telemetry = match (&baseline.telemetry, &modified.telemetry) {
            (Some(b), Some(m)) => Some(TelemetryComparison {
                rx_errors: CounterDelta::new(b.rx_errors, m.rx_errors),
                tx_errors: CounterDelta::new(b.tx_errors, m.tx_errors),
                rx_dropped: CounterDelta::new(b.rx_dropped, m.rx_dropped),
                transferred_gb: diff_averages(b.bytes.tag(), b.bytes.max(), m.bytes.max()),
                transferred_packets: diff_averages(
                    b.packets.tag(),
                    b.packets.max(),
                    m.packets.max(),
                ),
                packet_rate: diff(&b.packet_rate, &m.packet_rate)?,
                throughput: diff(&b.throughput, &m.throughput)?,
            }),
            _ => None,
        };

        let recommendation = recommend(&RecommendationInput {
            read: read.delta,
            write: write.delta,
            throughput: telemetry.as_ref().map(|t| t.throughput.delta),
            modified_rx_dropped: telemetry.as_ref().map(|t| t.rx_dropped.modified),
        });
        match &recommendation {
            Recommendation::Recommended => log::info!("configuration change is recommended"),
            Recommendation::NotRecommended(blockers) => {
                for blocker in blockers {
                    log::info!("configuration change not recommended: {blocker}");
                }
            }
        }

        Ok(Self {
            read,
            write,
            cores,
            master,
            power,
            telemetry,
            recommendation,
        })
    }
}
