use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{
    error::Error,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use treesearch_runner::{
    config::{
        FasttreeConfig, GarliConfig, IqtreeConfig, OptimizerConfig, PipelineConfig, RaxmlConfig,
    },
    controller::collect_results,
    database::SharedConnection,
    optimizer::{Optimizer, Optimizers},
    pipeline::{Phase, Pipeline, PipelineError, PipelineState},
    report,
    scheduler::Schedulers,
    util::{error_chain, format_duration},
};

#[derive(Parser, Debug)]
#[command(version, about = "Runs phylogenetic tree search pipelines on batch schedulers")]
struct Cli {
    /// Log more, repeat for trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Log errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Store {
    /// State database of the pipelines
    #[arg(long, default_value = "treesearch.db")]
    database: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new pipeline and drive it until it is completed or failed
    Run { config: PathBuf },
    /// Continue a stored pipeline where it stopped
    Resume {
        run_id: String,
        #[command(flatten)]
        store: Store,
    },
    /// List the active pipelines, or show one in detail
    Status {
        run_id: Option<String>,
        #[command(flatten)]
        store: Store,
    },
    /// Kill the active batch of a pipeline and mark the pipeline failed
    Abort {
        run_id: String,
        #[arg(long, default_value = "operator abort")]
        reason: String,
        #[command(flatten)]
        store: Store,
    },
    /// Regenerate the reports of a stored pipeline
    Report {
        run_id: String,
        /// Defaults to the working directory of the pipeline
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        store: Store,
    },
    /// Rank the results found in an optimizer output directory
    Collect {
        #[arg(value_enum)]
        kind: OptimizerKind,
        dir: PathBuf,
        /// Defaults to the scanned directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a config and probe its optimizer programs
    Check { config: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OptimizerKind {
    Raxml,
    Garli,
    Iqtree,
    Fasttree,
}

impl OptimizerKind {
    fn name(self) -> &'static str {
        match self {
            Self::Raxml => "raxml",
            Self::Garli => "garli",
            Self::Iqtree => "iqtree",
            Self::Fasttree => "fasttree",
        }
    }

    fn config(self) -> OptimizerConfig {
        match self {
            Self::Raxml => OptimizerConfig::Raxml(RaxmlConfig::default()),
            Self::Garli => OptimizerConfig::Garli(GarliConfig::default()),
            Self::Iqtree => OptimizerConfig::Iqtree(IqtreeConfig::default()),
            Self::Fasttree => OptimizerConfig::Fasttree(FasttreeConfig::default()),
        }
    }
}

type CliResult = Result<ExitCode, Box<dyn Error>>;

fn load_state(store: &SharedConnection, run_id: &str) -> Result<PipelineState, Box<dyn Error>> {
    Ok(store
        .load(run_id)?
        .ok_or_else(|| PipelineError::UnknownRun(run_id.to_owned()))?)
}

fn outcome(state: &PipelineState) -> ExitCode {
    match state.phase {
        Phase::Completed => {
            if let Some(ref summary) = state.summary {
                println!(
                    "{} {} {}",
                    summary.best.score,
                    format_duration(summary.longest_elapsed),
                    summary.best.tree.to_string_lossy()
                );
            }
            ExitCode::SUCCESS
        }
        Phase::Failed { ref reason, .. } => {
            error!(run_id = %state.run_id, "Pipeline failed: {reason}");
            ExitCode::FAILURE
        }
        ref phase => {
            warn!(
                run_id = %state.run_id,
                phase = %phase,
                "Pipeline stopped before reaching a terminal phase"
            );
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Path) -> CliResult {
    let settings = PipelineConfig::load_checked(config)?;
    let store = SharedConnection::open(&settings.database.path)?;
    let mut scheduler = Schedulers::load(&settings.scheduler);

    let mut pipeline = Pipeline::start(settings, store, &mut scheduler)?;
    Ok(outcome(pipeline.run()?))
}

fn resume(run_id: &str, database: &Path) -> CliResult {
    let store = SharedConnection::open(database)?;
    let state = load_state(&store, run_id)?;
    let mut scheduler = Schedulers::load(&state.settings.scheduler);

    let mut pipeline = Pipeline::resume(state, store, &mut scheduler);
    Ok(outcome(pipeline.run()?))
}

fn status(run_id: Option<&str>, database: &Path) -> CliResult {
    let store = SharedConnection::open(database)?;

    let Some(run_id) = run_id else {
        let records = store.load_active()?;
        if records.is_empty() {
            info!("No active pipelines");
        }
        for record in records {
            println!(
                "{:<24} {:<18} {}",
                record.run_id,
                record.phase,
                record.updated_at.to_rfc3339()
            );
        }
        return Ok(ExitCode::SUCCESS);
    };

    let state = load_state(&store, run_id)?;
    println!("run_id:  {}", state.run_id);
    println!("phase:   {}", state.phase);
    if let Phase::Failed { ref reason, .. } = state.phase {
        println!("reason:  {reason}");
    }
    println!("updated: {}", state.updated_at.to_rfc3339());

    for stage in &state.settings.stages {
        match state.stage_results.get(&stage.name) {
            Some(set) => println!(
                "{:<12} {}/{} results, best {} after {}",
                stage.name,
                set.results.len(),
                set.submitted_count,
                set.best().score,
                format_duration(set.longest_elapsed)
            ),
            None => println!("{:<12} -", stage.name),
        }
    }
    if let Some(ref batch) = state.active_batch {
        println!(
            "active:  job {} tracking {}/{} replicas in {}",
            batch.job,
            batch.replica_ids.len(),
            batch.submitted_count(),
            batch.output_dir.to_string_lossy()
        );
    }

    Ok(ExitCode::SUCCESS)
}

fn abort(run_id: &str, reason: &str, database: &Path) -> CliResult {
    let store = SharedConnection::open(database)?;
    let state = load_state(&store, run_id)?;
    let mut scheduler = Schedulers::load(&state.settings.scheduler);

    Pipeline::resume(state, store, &mut scheduler).abort(reason)?;

    Ok(ExitCode::SUCCESS)
}

fn write_reports(run_id: &str, out: Option<PathBuf>, database: &Path) -> CliResult {
    let store = SharedConnection::open(database)?;
    let state = load_state(&store, run_id)?;
    let out = out.unwrap_or_else(|| state.settings.working_dir.clone());

    let written = report::write_all(&out, &state)?;
    info!(files = written, out = %out.to_string_lossy(), "Regenerated reports");

    Ok(ExitCode::SUCCESS)
}

fn collect(kind: OptimizerKind, dir: &Path, out: Option<PathBuf>) -> CliResult {
    let optimizer = Optimizers::load(&kind.config());
    let replicas = optimizer.discover(dir)?;
    let set = collect_results(
        &optimizer,
        dir,
        &replicas,
        Duration::ZERO,
        replicas.len(),
        replicas.len(),
    )?;

    let out = out.unwrap_or_else(|| dir.to_path_buf());
    report::write_stage(&out, kind.name(), &set)?;
    println!(
        "{} {} {}",
        set.best().score,
        format_duration(set.longest_elapsed),
        set.best().tree.to_string_lossy()
    );

    Ok(ExitCode::SUCCESS)
}

fn check(config: &Path) -> CliResult {
    let mut settings = PipelineConfig::load(config)?;
    let mut contains_error = settings.preflight_checks();

    for stage in &settings.stages {
        let optimizer = Optimizers::load(&stage.optimizer);
        match optimizer.probe_version() {
            Ok(version) => info!(
                stage = %stage.name,
                program = %optimizer.program().to_string_lossy(),
                version = %version,
                "Optimizer found"
            ),
            Err(e) => {
                error!(stage = %stage.name, "{}", error_chain(&e));
                contains_error = true;
            }
        }
    }

    if contains_error {
        Ok(ExitCode::FAILURE)
    } else {
        info!(run_id = %settings.run_id, stages = settings.stages.len(), "Config is usable");
        Ok(ExitCode::SUCCESS)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::ERROR,
        (false, 0) => LevelFilter::INFO,
        (false, 1) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Command::Run { config } => run(&config),
        Command::Resume { run_id, store } => resume(&run_id, &store.database),
        Command::Status { run_id, store } => status(run_id.as_deref(), &store.database),
        Command::Abort {
            run_id,
            reason,
            store,
        } => abort(&run_id, &reason, &store.database),
        Command::Report { run_id, out, store } => write_reports(&run_id, out, &store.database),
        Command::Collect { kind, dir, out } => collect(kind, &dir, out),
        Command::Check { config } => check(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", error_chain(e.as_ref()));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_arguments() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_collect() {
        let cli =
            Cli::try_parse_from(["treesearch", "-v", "collect", "iqtree", "/data/out"]).unwrap();

        assert_eq!(cli.verbose, 1);
        assert!(matches!(
            cli.command,
            Command::Collect {
                kind: OptimizerKind::Iqtree,
                ..
            }
        ));
    }
}
