use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "prepflow")]
#[command(version, about = "Branch-per-task fMRIPrep orchestration over a versioned BIDS store")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to prepflow.toml
    #[arg(long, global = true, default_value = "prepflow.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one task-array instance: resolve a unit, compute, replicate
    Run {
        /// Explicit unit id (wins over list file and enumeration)
        #[arg(short, long)]
        unit: Option<String>,

        /// File with one unit id per line, indexed by the task index
        #[arg(long)]
        unit_list: Option<PathBuf>,

        /// Restrict enumeration to one source dataset
        #[arg(long)]
        dataset: Option<String>,

        /// Restrict enumeration to one source site
        #[arg(long)]
        site: Option<String>,

        /// 1-based array index (default: SLURM_ARRAY_TASK_ID)
        #[arg(long)]
        task_index: Option<usize>,

        /// Scheduler job id (default: SLURM_ARRAY_JOB_ID)
        #[arg(long)]
        job_id: Option<String>,

        /// Diagnostic run: branch under test/<purpose>/ instead of job/
        #[arg(long)]
        test_purpose: Option<String>,
    },
    /// Reconcile outstanding task branches into trunk
    Merge {
        /// Operator clone of the derivatives store (must be on trunk)
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Populate the shared reference dataset under the advisory lock
    Prefetch,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = dispatch(&cli) {
        eprintln!("{} {err:#}", style("error:").red().bold());
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run {
            unit,
            unit_list,
            dataset,
            site,
            task_index,
            job_id,
            test_purpose,
        } => cmd::cmd_run(
            &cli.config,
            prepflow::coordinator::RunOptions {
                unit: unit.clone(),
                list_file: unit_list.clone(),
                dataset: dataset.clone(),
                site: site.clone(),
                job_id: job_id.clone(),
                task_index: *task_index,
                test_purpose: test_purpose.clone(),
            },
        ),
        Commands::Merge { repo } => cmd::cmd_merge(&cli.config, repo),
        Commands::Prefetch => cmd::cmd_prefetch(&cli.config),
    }
}
