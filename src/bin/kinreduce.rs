use clap::{Parser, Subcommand};
use itertools::Itertools;
use kinreduce::array_store::{ArrayData, ArrayReader};
use kinreduce::chemistry::{ChemistryEngine, MassActionModel, ModelCache};
use kinreduce::config::{ReducingTaskConfig, RunConfig};
use kinreduce::reducers::ReducersManager;
use kinreduce::{ReduceResult, logging};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kinreduce")]
#[command(about = "Skeletal reduction of chemical kinetics models", long_about = None)]
struct Cli {
    /// Increase log level, can be repeated
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Disable colorized output
    #[arg(long, global = true)]
    no_colorized_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce the model over sampled states at the given thresholds
    Reduce {
        /// JSON reducing task
        #[arg(long)]
        task: PathBuf,
        /// JSON mechanism, overrides the model path of the task
        #[arg(long)]
        model: Option<PathBuf>,
        /// Array files with sampled states, one per condition
        #[arg(long, num_args = 1.., required = true)]
        states: Vec<PathBuf>,
        #[arg(long, num_args = 1.., required = true)]
        threshold: Vec<f64>,
        /// Concurrent graph builds, 0 for cores - 1
        #[arg(long, default_value_t = 0)]
        build_threads: usize,
        /// Concurrent reductions, 0 for cores - 1
        #[arg(long, default_value_t = 0)]
        reduce_threads: usize,
        /// Seconds to wait for each answer, unlimited when absent
        #[arg(long)]
        timeout: Option<f64>,
        /// Directory for intermediate files
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
    },
    /// Print the arrays stored in an array file
    Inspect { file: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, !cli.no_colorized_logs);

    let result = match cli.command {
        Commands::Reduce {
            task,
            model,
            states,
            threshold,
            build_threads,
            reduce_threads,
            timeout,
            tmp_dir,
        } => {
            let timeout = timeout.map(Duration::from_secs_f64);
            let run = RunConfig {
                build_threads,
                reduce_threads,
                verbosity: cli.verbose,
                colorized: !cli.no_colorized_logs,
                build_timeout: timeout,
                reduce_timeout: timeout,
                ..RunConfig::default()
            };
            reduce(task, model, states, threshold, tmp_dir, run)
        }
        Commands::Inspect { file } => inspect(file),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn reduce(
    task: PathBuf,
    model: Option<PathBuf>,
    states: Vec<PathBuf>,
    thresholds: Vec<f64>,
    tmp_dir: Option<PathBuf>,
    run: RunConfig,
) -> ReduceResult<()> {
    let task = ReducingTaskConfig::load(&task)?;
    let model_path = model.unwrap_or_else(|| task.model.clone());

    let cache = ModelCache::new();
    let model = cache.get_or_insert_with(&model_path, MassActionModel::load)?;
    info!(
        "Loaded model with {} species and {} reactions",
        model.n_species(),
        model.n_reactions()
    );
    let (sources, baseline) = task.species_indices(model.species_names())?;
    let names = model.species_names().to_vec();

    let tmp = match tmp_dir {
        Some(dir) => tempfile::tempdir_in(dir)?,
        None => tempfile::tempdir()?,
    };
    let engine: Arc<dyn ChemistryEngine> = model;
    let mut manager = ReducersManager::new(
        engine,
        task.method,
        states,
        sources,
        baseline,
        tmp.path(),
        run.reducer_settings(),
    )?;

    manager.scoped(|manager| {
        for threshold in thresholds {
            let retained = manager.reduce(threshold)?;
            println!(
                "{}\t{}\t{}",
                threshold,
                retained.len(),
                retained.iter().map(|i| &names[i]).join(" ")
            );
        }
        Ok(())
    })
}

fn inspect(file: PathBuf) -> ReduceResult<()> {
    for (i, array) in ArrayReader::open(&file)?.enumerate() {
        let array = array?;
        let values = match array.data() {
            ArrayData::F64(values) => values.iter().join(", "),
            ArrayData::Index(values) => values.iter().join(", "),
        };
        println!("[{}] {} {:?}: {}", i, array.data().kind(), array.shape(), values);
    }
    Ok(())
}
