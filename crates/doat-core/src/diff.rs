//! Baseline vs modified comparison and the adoption recommendation.
//!
//! Averages are rounded to their reported precision before deltas are taken,
//! and deltas are rounded before the recommendation thresholds are applied.
//! A modified read bandwidth 24.95% below baseline therefore reports as
//! `-25.0` and does not clear the strict `< -25` threshold.

use serde::{Deserialize, Serialize};

use crate::error::{DoatError, Result};
use crate::series::{DeltaKind, MetricSeries, SeriesTag};

/// Bandwidth must drop by more than this (percent) to recommend a change.
pub const BANDWIDTH_THRESHOLD_PCT: f64 = -25.0;
/// Throughput may not fall by this many Gbps or more.
pub const THROUGHPUT_TOLERANCE_GBPS: f64 = -0.2;

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;
    // Keep -0.0 out of reports.
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Change from baseline to modified.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Delta {
    Percent(f64),
    Absolute(f64),
    /// A percentage change from a zero baseline.
    Undefined,
}

impl Delta {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Percent(v) | Self::Absolute(v) => Some(v),
            Self::Undefined => None,
        }
    }
}

impl std::fmt::Display for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Percent(v) => write!(f, "{v:+}%"),
            Self::Absolute(v) => write!(f, "{v:+}"),
            Self::Undefined => write!(f, "n/a"),
        }
    }
}

/// Averages of one series in both passes and their delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub tag: SeriesTag,
    pub baseline_avg: f64,
    pub modified_avg: f64,
    pub delta: Delta,
}

/// Compare two already-computed averages of `tag`.
pub fn diff_averages(tag: SeriesTag, baseline: f64, modified: f64) -> DiffResult {
    let baseline_avg = round_to(baseline, tag.average_decimals());
    let modified_avg = round_to(modified, tag.average_decimals());
    let decimals = tag.delta_decimals();
    let delta = match tag.delta_kind() {
        DeltaKind::Absolute => Delta::Absolute(round_to(modified_avg - baseline_avg, decimals)),
        DeltaKind::Percent if baseline_avg == 0.0 => {
            if modified_avg == 0.0 {
                Delta::Percent(0.0)
            } else {
                Delta::Undefined
            }
        }
        DeltaKind::Percent => Delta::Percent(round_to(
            (modified_avg - baseline_avg) / baseline_avg * 100.0,
            decimals,
        )),
    };
    DiffResult {
        tag,
        baseline_avg,
        modified_avg,
        delta,
    }
}

/// Compare the mean of two series of the same tag.
pub fn diff(baseline: &MetricSeries, modified: &MetricSeries) -> Result<DiffResult> {
    if baseline.tag() != modified.tag() {
        return Err(DoatError::SeriesMismatch {
            detail: format!("cannot compare {} with {}", baseline.tag(), modified.tag()),
        });
    }
    Ok(diff_averages(baseline.tag(), baseline.mean(), modified.mean()))
}

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

/// Inputs to the adoption rule, taken from the rounded comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommendationInput {
    pub read: Delta,
    pub write: Delta,
    /// `None` when telemetry was not collected.
    pub throughput: Option<Delta>,
    pub modified_rx_dropped: Option<u64>,
}

/// A condition that kept a change from being recommended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum Blocker {
    ReadBandwidth { delta: Delta },
    WriteBandwidth { delta: Delta },
    ThroughputRegression { delta: Delta },
    DroppedPackets { count: u64 },
    TelemetryUnavailable,
}

impl std::fmt::Display for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadBandwidth { delta } => {
                write!(f, "read bandwidth changed by {delta}, needs < {BANDWIDTH_THRESHOLD_PCT}%")
            }
            Self::WriteBandwidth { delta } => {
                write!(f, "write bandwidth changed by {delta}, needs < {BANDWIDTH_THRESHOLD_PCT}%")
            }
            Self::ThroughputRegression { delta } => {
                write!(f, "throughput changed by {delta} Gbps, needs > {THROUGHPUT_TOLERANCE_GBPS}")
            }
            Self::DroppedPackets { count } => write!(f, "{count} packets dropped"),
            Self::TelemetryUnavailable => write!(f, "no telemetry to check throughput and drops"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "blockers", rename_all = "kebab-case")]
pub enum Recommendation {
    Recommended,
    NotRecommended(Vec<Blocker>),
}

impl Recommendation {
    pub fn is_recommended(&self) -> bool {
        matches!(self, Self::Recommended)
    }
}

fn below(delta: Delta, threshold: f64) -> bool {
    delta.value().is_some_and(|v| v < threshold)
}

/// All four conditions must hold: both bandwidth deltas below the
/// threshold, no material throughput regression, no dropped packets.
pub fn recommend(input: &RecommendationInput) -> Recommendation {
    let mut blockers = Vec::new();
    if !below(input.read, BANDWIDTH_THRESHOLD_PCT) {
        blockers.push(Blocker::ReadBandwidth { delta: input.read });
    }
    if !below(input.write, BANDWIDTH_THRESHOLD_PCT) {
        blockers.push(Blocker::WriteBandwidth { delta: input.write });
    }
    match (input.throughput, input.modified_rx_dropped) {
        (Some(throughput), Some(dropped)) => {
            if !throughput.value().is_some_and(|v| v > THROUGHPUT_TOLERANCE_GBPS) {
                blockers.push(Blocker::ThroughputRegression { delta: throughput });
            }
            if dropped != 0 {
                blockers.push(Blocker::DroppedPackets { count: dropped });
            }
        }
        _ => blockers.push(Blocker::TelemetryUnavailable),
    }

    if blockers.is_empty() {
        Recommendation::Recommended
    } else {
        Recommendation::NotRecommended(blockers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn series(tag: SeriesTag, samples: Vec<f64>) -> MetricSeries {
        MetricSeries::new(tag, Duration::from_secs(1), samples).unwrap()
    }

    fn passing() -> RecommendationInput {
        RecommendationInput {
            read: Delta::Percent(-30.0),
            write: Delta::Percent(-30.0),
            throughput: Some(Delta::Absolute(0.1)),
            modified_rx_dropped: Some(0),
        }
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.25, 1), 1.3);
        assert_eq!(round_to(-1.25, 1), -1.3);
        assert_eq!(round_to(2.345, 0), 2.0);
        assert!(round_to(-0.01, 1).is_sign_positive());
    }

    #[test]
    fn test_percent_delta_sign_follows_change() {
        let d = diff(
            &series(SeriesTag::SocketBandwidthRead, vec![100.0, 100.0]),
            &series(SeriesTag::SocketBandwidthRead, vec![60.0, 80.0]),
        )
        .unwrap();
        assert_eq!(d.baseline_avg, 100.0);
        assert_eq!(d.modified_avg, 70.0);
        assert_eq!(d.delta, Delta::Percent(-30.0));

        let up = diff_averages(SeriesTag::Power, 200.0, 210.0);
        assert_eq!(up.delta, Delta::Percent(5.0));
    }

    #[test]
    fn test_hit_ratio_delta_is_absolute() {
        let d = diff_averages(SeriesTag::CacheL3Hit(2), 80.04, 75.0);
        assert_eq!(d.baseline_avg, 80.0);
        assert_eq!(d.delta, Delta::Absolute(-5.0));
    }

    #[test]
    fn test_throughput_delta_is_modified_minus_baseline() {
        let d = diff_averages(SeriesTag::Throughput, 9.876, 9.5);
        assert_eq!(d.baseline_avg, 9.88);
        assert_eq!(d.delta, Delta::Absolute(-0.38));
    }

    #[test]
    fn test_zero_baseline() {
        assert_eq!(
            diff_averages(SeriesTag::CacheL2Miss(0), 0.0, 0.0).delta,
            Delta::Percent(0.0)
        );
        assert_eq!(
            diff_averages(SeriesTag::CacheL2Miss(0), 0.0, 12.0).delta,
            Delta::Undefined
        );
    }

    #[test]
    fn test_mismatched_tags_rejected() {
        let err = diff(
            &series(SeriesTag::SocketBandwidthRead, vec![1.0]),
            &series(SeriesTag::SocketBandwidthWrite, vec![1.0]),
        )
        .unwrap_err();
        assert!(matches!(err, DoatError::SeriesMismatch { .. }));
    }

    // -----------------------------------------------------------------------
    // Recommendation truth table
    // -----------------------------------------------------------------------

    #[test]
    fn test_all_conditions_met_recommends() {
        assert!(recommend(&passing()).is_recommended());
    }

    #[test]
    fn test_each_failed_condition_blocks() {
        let mut input = passing();
        input.read = Delta::Percent(-20.0);
        assert!(!recommend(&input).is_recommended());

        let mut input = passing();
        input.write = Delta::Percent(-25.0);
        assert!(!recommend(&input).is_recommended());

        let mut input = passing();
        input.throughput = Some(Delta::Absolute(-0.2));
        assert!(!recommend(&input).is_recommended());

        let mut input = passing();
        input.modified_rx_dropped = Some(1);
        assert_eq!(
            recommend(&input),
            Recommendation::NotRecommended(vec![Blocker::DroppedPackets { count: 1 }])
        );
    }

    #[test]
    fn test_missing_telemetry_blocks() {
        let mut input = passing();
        input.throughput = None;
        input.modified_rx_dropped = None;
        assert_eq!(
            recommend(&input),
            Recommendation::NotRecommended(vec![Blocker::TelemetryUnavailable])
        );
    }

    #[test]
    fn test_undefined_delta_blocks() {
        let mut input = passing();
        input.read = Delta::Undefined;
        assert!(!recommend(&input).is_recommended());
    }

    #[test]
    fn test_rounding_boundary_is_rejected() {
        // 75.05 vs 100: -24.95% rounds to -25.0, which is not below -25.
        let d = diff_averages(SeriesTag::SocketBandwidthRead, 100.0, 75.05);
        assert_eq!(d.delta, Delta::Percent(-25.0));
        let mut input = passing();
        input.read = d.delta;
        assert!(!recommend(&input).is_recommended());
    }

    proptest! {
        #[test]
        fn prop_identical_series_have_zero_delta(
            samples in proptest::collection::vec(0.0f64..1e9, 1..50),
            pick in 0usize..6,
        ) {
            let tag = [
                SeriesTag::SocketBandwidthRead,
                SeriesTag::CacheL3Miss(1),
                SeriesTag::CacheL2Hit(1),
                SeriesTag::Power,
                SeriesTag::Throughput,
                SeriesTag::PacketRate,
            ][pick];
            let s = series(tag, samples);
            let d = diff(&s, &s).unwrap();
            prop_assert_eq!(d.delta.value(), Some(0.0));
        }

        #[test]
        fn prop_percent_sign_matches_direction(base in 1.0f64..1e6, factor in 0.01f64..3.0) {
            let modified = base * factor;
            let d = diff_averages(SeriesTag::SocketBandwidthWrite, base, modified);
            let v = d.delta.value().unwrap();
            if d.modified_avg > d.baseline_avg {
                prop_assert!(v >= 0.0);
            } else if d.modified_avg < d.baseline_avg {
                prop_assert!(v <= 0.0);
            } else {
                prop_assert_eq!(v, 0.0);
            }
        }
    }
}
