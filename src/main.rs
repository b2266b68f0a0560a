// main.rs

use anyhow::{anyhow, Error, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::time::Instant;

use phenoscan::providers::{GenotypeProvider, UnitFilter};
use phenoscan::scheduler::{TaskSpec, TaskStatus, UnitSelection};
use phenoscan::simulate::{simulate_cohort, windowed_sets, SimulationConfig};
use phenoscan::stats::WeightScheme;
use phenoscan::store::{OrderBy, ResultQuery};
use phenoscan::{Experiment, ExperimentOptions};

fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting phenoscan with args: {:?}", cli_args);

    let cpu = cli_args.cpu.unwrap_or_else(num_cpus::get);
    info!("Using {} workers per task.", cpu);

    // --- 1. Simulate the cohort ---
    let sim_config = SimulationConfig {
        n_samples: cli_args.samples,
        n_variants: cli_args.variants,
        seed: cli_args.seed,
    };
    info!(
        "Simulating cohort: {} samples x {} variants (seed {}).",
        sim_config.n_samples, sim_config.n_variants, sim_config.seed
    );
    let cohort = simulate_cohort(&sim_config)?;

    // --- 2. Declare the tasks ---
    let unit_filter = UnitFilter {
        min_maf: Some(cli_args.maf),
    };
    let variant_names = cohort.genotypes.list_units(&unit_filter);
    info!(
        "{} variants pass the MAF floor of {}.",
        variant_names.len(),
        cli_args.maf
    );
    let tasks = vec![
        TaskSpec::linear("glm_linear").with_units(UnitSelection::AllVariants(unit_filter)),
        TaskSpec::logistic("glm_logistic").with_units(UnitSelection::AllVariants(unit_filter)),
        TaskSpec::skat("skat_windows", windowed_sets(&variant_names, cli_args.set_size))
            .with_weights(WeightScheme::RareBeta),
    ];

    // --- 3. Build and run the experiment ---
    let options = ExperimentOptions {
        cpu,
        exclusion_threshold: cli_args.exclusion_threshold,
        correction: Default::default(),
        db_path: cli_args.out.clone(),
    };
    let mut experiment = Experiment::new(
        "phenoscan_demo",
        &cohort.genotypes,
        &cohort.phenotypes,
        &cohort.variables,
        tasks,
        options,
    )?;

    let pb_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({percent}%) {msg}",
        )
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let progress = ProgressBar::new(0).with_style(pb_style);

    let summary = experiment.run_with(|task, done, total| {
        if progress.length() != Some(total) {
            progress.set_length(total);
            progress.set_position(0);
        }
        progress.set_message(task.to_string());
        progress.set_position(done);
    })?;
    progress.finish_with_message("all tasks drained");

    // --- 4. Report ---
    for (task_name, status) in &summary.tasks {
        match status {
            TaskStatus::Completed { n_success, n_failed } => {
                println!(
                    "task {}: completed ({} succeeded, {} failed)",
                    task_name, n_success, n_failed
                );
                match experiment.threshold(task_name, cli_args.alpha) {
                    Ok(threshold) => {
                        println!(
                            "  corrected threshold at alpha {}: {:.3e}",
                            cli_args.alpha, threshold
                        );
                        let hits = experiment.store().query(
                            &ResultQuery::task(task_name)
                                .order_by(OrderBy::PValue, true)
                                .p_threshold(threshold),
                        )?;
                        println!("  {} associations below the threshold", hits.len());
                        for row in hits.iter().take(cli_args.top) {
                            println!(
                                "    {} ~ {}: coefficient {} p {:.3e} (n = {})",
                                row.entity_name,
                                row.phenotype,
                                row.coefficient
                                    .map_or_else(|| "-".to_string(), |c| format!("{:.4}", c)),
                                row.p_value.unwrap_or(f64::NAN),
                                row.n
                            );
                        }
                    }
                    Err(e) => warn!("No threshold for task '{}': {}", task_name, e),
                }
            }
            TaskStatus::Failed { cause } => {
                println!("task {}: FAILED ({})", task_name, cause);
            }
            other => {
                println!("task {}: unexpected terminal status {:?}", task_name, other);
            }
        }
    }

    for set in &experiment.exclusions().sets {
        println!(
            "exclusions for {}: related to [{}], {} controls removed",
            set.phenotype,
            set.related.join(", "),
            set.n_excluded
        );
    }

    info!(
        "phenoscan finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

mod cli {
    use std::path::PathBuf;
    use clap::Parser; // For the derive macro to find Parser

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Variant-phenotype association experiments over a simulated cohort.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Cohort size to simulate.
        #[arg(short = 'n', long, default_value_t = 500)]
        pub(crate) samples: usize,

        /// Number of variants to simulate.
        #[arg(short = 'm', long, default_value_t = 50)]
        pub(crate) variants: usize,

        /// Optional SQLite path for the result store (in-memory if absent).
        #[arg(short, long = "out")]
        pub(crate) out: Option<PathBuf>,

        #[arg(long, default_value_t = 42)]
        pub(crate) seed: u64,

        /// Worker pool size per task; defaults to the machine CPU count.
        #[arg(short = 't', long)]
        pub(crate) cpu: Option<usize>,

        #[arg(long, default_value_t = 0.05)]
        pub(crate) alpha: f64,

        #[arg(long, default_value_t = 0.01)]
        pub(crate) maf: f64,

        /// |r| at or above this marks phenotypes as related.
        #[arg(long, default_value_t = 0.8)]
        pub(crate) exclusion_threshold: f64,

        /// Variants per window for the set test.
        #[arg(long, default_value_t = 10)]
        pub(crate) set_size: usize,

        /// Associations to print per task.
        #[arg(long, default_value_t = 5)]
        pub(crate) top: usize,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}
