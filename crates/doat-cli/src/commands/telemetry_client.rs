//! `doat telemetry-client`: the telemetry collector process.

use std::path::{Path, PathBuf};

use doat_core::{Environment, Result, SystemEnvironment};
use doat_core::telemetry::{CollectorOptions, SamplingPlan, discover_sockets, run_collector};

pub fn run(
    csv: &Path,
    run_time: f64,
    step: f64,
    port: u16,
    socket: Option<PathBuf>,
    read_timeout: f64,
) -> Result<()> {
    let plan = SamplingPlan::new(
        super::seconds("--run-time", run_time)?,
        super::seconds("--step", step)?,
        port,
    )?;
    let sockets = match socket {
        Some(path) => vec![path],
        None => discover_sockets(SystemEnvironment::new().var("XDG_RUNTIME_DIR").as_deref()),
    };
    let options = CollectorOptions {
        plan,
        csv_path: csv.to_path_buf(),
        sockets,
        read_timeout: Some(super::seconds("--read-timeout", read_timeout)?),
    };

    let rows = run_collector(&options)?;
    log::info!("telemetry collector wrote {rows} rows to {}", csv.display());
    Ok(())
}
