use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use std::process::ExitCode;

use gap_richness::cli::Args;
use gap_richness::{Result, RichnessPipeline, RunReport};

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== GAP Species Richness ===");

    match run(&args) {
        Ok(report) if report.is_clean() => {
            info!("=== Done! ===");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            warn!(
                "=== Done with {} validation mismatches ===",
                report.mismatches.len()
            );
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<RunReport> {
    let config = args.to_config()?;
    let species = args.species_list()?;

    info!("Group: {}", config.group_name);
    info!("Season: {}", config.season);
    info!("Species: {} (interval {})", species.len(), config.interval);
    if config.resume {
        info!("Resuming from {}", config.output_root.display());
    }

    let pipeline = RichnessPipeline::from_config(config)?;
    let report = pipeline.run(&species)?;

    info!("Richness raster: {}", report.final_raster.display());
    info!("Species table: {}", report.species_table.display());
    info!(
        "{} species included, {} excluded",
        report.included.len(),
        report.excluded.len()
    );
    for excluded in &report.excluded {
        warn!("\t{} excluded ({:?}): {}", excluded.species, excluded.kind, excluded.message);
    }

    Ok(report)
}
