//! `doat run`: baseline pass, optional optimisation pass, analysis.

use std::path::Path;

use doat_core::{
    CpuTopology, Result, ResultsWriter, RunClock, RunController, RunResults, ShellBackend,
    ShutdownRegistry, Supervisor, SystemEnvironment, detect_machine_info,
    plan_memory_optimisation,
};

/// Kill live groups, restore patched files and exit on SIGINT/SIGTERM/SIGHUP.
fn install_abort_handler(registry: ShutdownRegistry) -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Interrupted, cleaning up . . .");
        let report = registry.abandon();
        eprintln!(
            "  {} process group(s) signalled, {} file(s) restored",
            report.groups_signalled, report.files_restored
        );
        for failure in &report.failures {
            eprintln!("  cleanup failed: {failure}");
        }
        std::process::exit(130);
    })
    .map_err(|e| doat_core::DoatError::Config(format!("cannot install signal handler: {e}")))
}

pub fn run(config_path: &Path, output: Option<&Path>, no_optimise: bool) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(dir) = output {
        config.tools.artifact_dir = dir.to_path_buf();
    }
    if no_optimise {
        config.optimisation.enabled = false;
    }

    let topology = CpuTopology::detect()?;
    let placement = config.resolve_placement(&topology)?;
    let optimisation = plan_memory_optimisation(&config)?;
    let artifact_dir = config.tools.artifact_dir.clone();

    let registry = ShutdownRegistry::new();
    if config.reporting.cleanup_on_abort {
        registry.track_scratch_dir(&artifact_dir);
    }
    install_abort_handler(registry.clone())?;

    println!("DOAT v{}", doat_core::VERSION);
    println!("  Application socket {}  cores {:?}", placement.app_socket, placement.app_cores);
    println!("  Artifacts          {}", artifact_dir.display());
    match &optimisation {
        Some(plan) => println!("  Optimisation       stack mempool ({})", plan.patch.path.display()),
        None => println!("  Optimisation       off"),
    }
    println!();

    let clock = RunClock::start();
    let supervisor = Supervisor::new(ShellBackend::new()).with_registry(registry.clone());
    let mut controller = RunController::new(
        config.clone(),
        SystemEnvironment::new(),
        supervisor,
        &artifact_dir,
    )
    .with_registry(registry);
    let outcome = controller.run(optimisation.as_ref().map(|o| &o.patch));
    drop(controller);
    let outcome = outcome?;

    let meta = clock.finish(detect_machine_info(&topology), &config);
    let results = RunResults::analyse(meta, &config, &placement, &outcome, optimisation)?;
    let path = ResultsWriter::new(&artifact_dir).write(&results)?;
    super::print_summary(&results);
    println!();
    println!("Results written to {}", path.display());
    Ok(())
}
