//! `doat compare`: analyse artifacts that are already on disk.

use std::path::Path;

use doat_core::{
    CpuTopology, PassArtifacts, PassLabel, Result, ResultsWriter, RunClock, RunOutcome,
    RunResults, detect_machine_info,
};

pub fn run(
    config_path: &Path,
    baseline: Option<&Path>,
    modified: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let topology = CpuTopology::detect()?;
    let placement = config.resolve_placement(&topology)?;

    let default_dir = config.tools.artifact_dir.as_path();
    let baseline_dir = baseline.unwrap_or(default_dir);
    let modified_dir = modified.unwrap_or(default_dir);
    let outcome = RunOutcome {
        baseline: PassArtifacts::new(baseline_dir, PassLabel::Baseline),
        modified: Some(PassArtifacts::new(modified_dir, PassLabel::Modified)),
    };

    let clock = RunClock::start();
    let meta = clock.finish(detect_machine_info(&topology), &config);
    let results = RunResults::analyse(meta, &config, &placement, &outcome, None)?;

    let out_dir = output.unwrap_or(baseline_dir);
    let path = ResultsWriter::new(out_dir).write(&results)?;
    super::print_summary(&results);
    println!();
    println!("Results written to {}", path.display());
    Ok(())
}
