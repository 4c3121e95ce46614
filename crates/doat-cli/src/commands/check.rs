//! `doat check`: validate the configuration and print the resolved plan.

use std::path::Path;

use doat_core::collectors::{PassArtifacts, collector_specs};
use doat_core::telemetry::format_elapsed;
use doat_core::{CpuTopology, PassLabel, Result, plan_memory_optimisation};

pub fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let topology = CpuTopology::detect()?;
    let placement = config.resolve_placement(&topology)?;

    println!("Configuration {} is valid", config_path.display());
    println!();
    println!("Timing");
    println!("  Settle   {}s", config.doat.startup_time);
    println!("  Measure  {}s", config.doat.test_runtime);
    println!("  Step     {}s", format_elapsed(config.step()));
    println!();
    println!("Placement");
    println!("  Harness core     {} (socket {})", config.cpu.test_core, placement.test_socket);
    println!("  Application      cores {:?} on socket {}", placement.app_cores, placement.app_socket);
    if let Some(master) = placement.master {
        println!("  Master core      {master}");
    }
    println!();

    let program = std::env::current_exe()?;
    let artifacts = PassArtifacts::new(&config.tools.artifact_dir, PassLabel::Baseline);
    println!("Collectors (spawn order)");
    for spec in collector_specs(&config, &artifacts, &program) {
        println!("  {:<20} {}", spec.role, spec.command);
    }
    println!();

    println!("Optimisation");
    if !config.optimisation.enabled {
        println!("  disabled");
        return Ok(());
    }
    match plan_memory_optimisation(&config)? {
        Some(plan) => {
            println!("  Patch {}", plan.patch.path.display());
            for r in &plan.patch.replacements {
                println!("    {}", r.line);
            }
            if let Some(cache) = plan.new_cache {
                let was = plan
                    .original_cache
                    .map_or_else(|| "unset".to_string(), |c| c.to_string());
                println!("  Mempool cache {was} -> {cache}");
            }
        }
        None => println!("  no applicable optimisation step"),
    }
    Ok(())
}
