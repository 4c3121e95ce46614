pub mod check;
pub mod compare;
pub mod run;
pub mod serve;
pub mod telemetry_client;

use std::path::Path;
use std::time::Duration;

use doat_core::analysis::{CoreCacheSummary, PassMetrics};
use doat_core::{DoatError, Recommendation, Result, RunConfig, RunResults};

/// Print the error and its remediation hint, then exit non-zero.
pub fn exit_with_error(e: &DoatError) -> ! {
    eprintln!("Error: {e}");
    if let Some(hint) = e.remediation() {
        eprintln!("Hint: {hint}");
    }
    std::process::exit(1);
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let config = RunConfig::load(path)?;
    log::debug!("loaded configuration from {}", path.display());
    Ok(config)
}

/// Seconds from the command line as a duration.
pub fn seconds(what: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| DoatError::Config(format!("{what} must be a non-negative number of seconds, got {value}")))
}

fn print_cores(title: &str, cores: &[CoreCacheSummary]) {
    for c in cores {
        println!(
            "  {title} {:<4} L3 hit {:>5.1}%  L2 hit {:>5.1}%  L3 miss {:>12.1}  L2 miss {:>12.1}",
            c.core, c.l3_hit_avg, c.l2_hit_avg, c.l3_miss_avg, c.l2_miss_avg
        );
    }
}

fn print_pass(metrics: &PassMetrics) {
    println!("{} pass", metrics.label);
    println!(
        "  Memory bandwidth  read {:.2} MB/s  write {:.2} MB/s",
        metrics.bandwidth.read_avg, metrics.bandwidth.write_avg
    );
    if let Some(ratio) = metrics.bandwidth.write_read_ratio {
        println!("  Write/read ratio  {ratio:.2}");
    }
    print_cores("core", &metrics.cores);
    if let Some(master) = &metrics.master {
        print_cores("master", std::slice::from_ref(master));
    }
    println!("  Wall power        {:.1} W", metrics.power_avg);
    if let Some(t) = &metrics.telemetry {
        println!(
            "  Throughput        {:.2} Gbps  {:.0} pps  ({:.1} GB, {} packets)",
            t.avg_throughput, t.avg_packet_rate, t.transferred_gb, t.transferred_packets
        );
        println!(
            "  Errors            rx {}  tx {}  dropped {}",
            t.rx_errors, t.tx_errors, t.rx_dropped
        );
    }
    println!("  Data points       {}", metrics.datapoints.total());
}

/// Human-readable summary of a finished run.
pub fn print_summary(results: &RunResults) {
    println!();
    print_pass(&results.baseline);
    if let Some(modified) = &results.modified {
        println!();
        print_pass(modified);
    }

    let Some(cmp) = &results.comparison else {
        return;
    };
    println!();
    println!("Changes");
    for d in [&cmp.read, &cmp.write, &cmp.power] {
        println!("  {:<28} {:>12} -> {:<12} {}", d.tag, d.baseline_avg, d.modified_avg, d.delta);
    }
    if let Some(t) = &cmp.telemetry {
        let throughput = &t.throughput;
        println!(
            "  {:<28} {:>12} -> {:<12} {}",
            throughput.tag, throughput.baseline_avg, throughput.modified_avg, throughput.delta
        );
        println!("  {:<28} {:+}", "rx dropped", t.rx_dropped.delta);
    }
    println!();
    match &cmp.recommendation {
        Recommendation::Recommended => {
            println!("It is recommended to change from ring mempools to stack mempools.");
        }
        Recommendation::NotRecommended(blockers) => {
            println!("It is recommended not to change from ring mempools to stack mempools:");
            for blocker in blockers {
                println!("  - {blocker}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_accepts_fractions() {
        assert_eq!(seconds("step", 0.5).unwrap(), Duration::from_millis(500));
        assert_eq!(seconds("run time", 0.0).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_seconds_rejects_negative_and_nan() {
        assert!(matches!(seconds("step", -1.0), Err(DoatError::Config(_))));
        assert!(seconds("step", f64::NAN).is_err());
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_config(&tmp.path().join("doat.toml")).unwrap_err();
        assert!(err.to_string().contains("doat.toml"));
    }
}
