//! Fine-tuning launcher CLI
//!
//! Resolves and submits distributed fine-tuning experiments to Slurm.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use finetune_config::resolve_layout;
use finetune_launcher::{
    JobArgs, Manifest, ManifestCache, Outcome, RecordStore, SelectArgs, SlurmBackend,
    launch::experiment_name, resolve, submit,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "finetune-launcher", about = "Distributed fine-tuning launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and submit a fine-tuning experiment
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Command that runs a task file inside the container
        #[arg(long, default_value = "finetune-runtime", env = "FINETUNE_RUNTIME")]
        entrypoint: String,

        /// Path to sbatch
        #[arg(long, default_value = "sbatch")]
        sbatch: PathBuf,

        /// Path to scancel, used to withdraw jobs when a later submission fails
        #[arg(long, default_value = "scancel")]
        scancel: PathBuf,
    },

    /// Print the resolved layout and experiment name
    Layout {
        #[command(flatten)]
        select: SelectArgs,

        /// List every tuple in the layout table instead
        #[arg(long)]
        list: bool,
    },

    /// Show recorded runs of an experiment
    Status {
        /// Experiment and log directory
        #[arg(short, long, env = "NEMORUN_HOME")]
        log_dir: PathBuf,

        /// Experiment name
        name: String,
    },

    /// Write the manifest of a packed dataset cache directory
    SealCache {
        /// Directory holding the packed files
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber spinners
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            job,
            entrypoint,
            sbatch,
            scancel,
        } => {
            let cache = ManifestCache::from_env(&job.nemo_home());
            let resolved = resolve(&job, &cache)?;

            let backend = SlurmBackend::new(sbatch).with_scancel(scancel);
            match submit(resolved, backend, &entrypoint).await? {
                Outcome::DryRun(plan) => print!("{plan}"),
                Outcome::Submitted(record) => {
                    println!();
                    println!("=== Submitted {} ===", record.id);
                    for job in &record.jobs {
                        println!(
                            "  - {}: {}",
                            job.name,
                            job.slurm_job_id.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        }

        Commands::Layout { select, list } => {
            let table = select.layout_table()?;
            if list {
                println!("=== Known layouts ===");
                for key in table.keys() {
                    println!("  - {key}");
                }
                return Ok(());
            }

            let preset = select.preset()?;
            let layout = resolve_layout(
                &table,
                &select.layout_key(),
                &select.overrides,
                select.gpus_per_node,
            )?;

            println!("=== {} ===", select.layout_key());
            println!("Nodes: {} x {} GPUs", layout.num_nodes, select.gpus_per_node);
            println!("Batch: mbs {} / gbs {}", layout.mbs, layout.gbs);
            println!(
                "Parallel: tp {} pp {} cp {} vp {} ep {}",
                layout.tp, layout.pp, layout.cp, layout.vp, layout.ep
            );
            println!("CUDA graphs: {}", layout.enable_cuda_graphs);
            println!(
                "Experiment: {}",
                experiment_name(select.finetuning, &preset, select.compute_dtype, &layout)
            );
        }

        Commands::Status { log_dir, name } => {
            let records = RecordStore::list(&log_dir, &name)?;

            if records.is_empty() {
                println!("No runs recorded for {name}.");
                return Ok(());
            }

            println!("=== {name} ===");
            println!();

            for record in &records {
                println!(
                    "{}: {:?} (created {})",
                    record.id, record.status, record.created_at
                );
                for job in &record.jobs {
                    print!("  {}", job.name);
                    if let Some(id) = &job.slurm_job_id {
                        print!(" [job {id}]");
                    }
                    if let Some(dep) = &job.dependency {
                        print!(" [after {dep}]");
                    }
                    println!();
                }
                for error in &record.errors {
                    println!("  Error: {error}");
                }
            }
        }

        Commands::SealCache { dir } => {
            let manifest = Manifest::seal(&dir)?;
            println!("Sealed {} ({} files)", dir.display(), manifest.files.len());
        }
    }

    Ok(())
}
