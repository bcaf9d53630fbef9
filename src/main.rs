use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use converge::artifacts::ArtifactStore;
use converge::coordinator::{run_status, Coordinator, RunOutcome};
use converge::state::{AttemptStatus, CoordinatorState, RunId, RunStatus, TaskSpec};
use converge::{ConvergeError, Overrides, Settings};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "converge")]
#[command(
    author,
    version,
    about = "Best-of-N convergence orchestrator - drive environments toward a target"
)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (holds converge.toml and the default artifacts dir)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Explicit configuration file (overrides <project>/converge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run N attempts at a task and select the best
    Run {
        /// Natural language description of the target
        task: String,

        /// Number of independent attempts
        #[arg(short = 'n', long)]
        attempts: Option<usize>,

        /// Maximum iterations per attempt
        #[arg(short = 'k', long)]
        iterations: Option<u32>,

        /// Score an attempt must reach to count as converged
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Number of parallel workers (environment instances)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Baseline identifier every attempt resets to
        #[arg(long)]
        baseline: Option<String>,

        /// Reference file handed to the judge (repeatable)
        #[arg(long = "reference", value_name = "PATH")]
        references: Vec<PathBuf>,

        /// Where run directories are written
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },

    /// Continue an interrupted run from its checkpoints
    Resume {
        /// Run identifier printed by `run`
        run_id: String,

        /// Where run directories are written
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },

    /// Show attempt statuses, scores and the selection of a run
    Status {
        /// Run identifier printed by `run`
        run_id: String,

        /// Where run directories are written
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_format);

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = dispatch(cli.command, &project_path, cli.config.as_deref()).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }

    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "converge=debug,info"
    } else {
        "converge=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn dispatch(
    command: Commands,
    project_path: &Path,
    config_path: Option<&Path>,
) -> converge::Result<()> {
    match command {
        Commands::Run {
            task,
            attempts,
            iterations,
            threshold,
            workers,
            baseline,
            references,
            artifacts_dir,
        } => {
            let mut settings = load_settings(project_path, config_path)?;
            settings.apply(&Overrides {
                attempts,
                workers,
                max_iterations: iterations,
                threshold,
                baseline,
                artifacts_dir,
            });
            resolve_artifacts_dir(&mut settings, project_path);

            let coordinator = Coordinator::from_settings(settings)?;
            let task = TaskSpec::new(task).with_references(references);
            let cancel = cancel_on_shutdown();

            let outcome = coordinator.run(task, cancel).await?;
            print_outcome(&outcome);
            outcome.verdict()?;
        }

        Commands::Resume {
            run_id,
            artifacts_dir,
        } => {
            let mut settings = load_settings(project_path, config_path)?;
            settings.apply(&Overrides {
                artifacts_dir,
                ..Overrides::default()
            });
            resolve_artifacts_dir(&mut settings, project_path);

            // The run keeps the settings it started with
            let run_id = RunId::from_string(run_id);
            let store = ArtifactStore::new(&settings.run.artifacts_dir);
            let meta = store
                .read_run_meta(&run_id)?
                .ok_or_else(|| ConvergeError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            let mut run_settings = meta.settings;
            run_settings.run.artifacts_dir = settings.run.artifacts_dir;

            let coordinator = Coordinator::from_settings(run_settings)?;
            let cancel = cancel_on_shutdown();

            let outcome = coordinator.resume(&run_id, cancel).await?;
            print_outcome(&outcome);
            outcome.verdict()?;
        }

        Commands::Status {
            run_id,
            artifacts_dir,
            json,
        } => {
            let mut settings = load_settings(project_path, config_path)?;
            settings.apply(&Overrides {
                artifacts_dir,
                ..Overrides::default()
            });
            resolve_artifacts_dir(&mut settings, project_path);

            let state = run_status(&settings.run.artifacts_dir, &RunId::from_string(run_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print_state(&state);
            }
        }
    }

    Ok(())
}

fn load_settings(project_path: &Path, config_path: Option<&Path>) -> converge::Result<Settings> {
    match config_path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(project_path),
    }
}

fn resolve_artifacts_dir(settings: &mut Settings, project_path: &Path) {
    if settings.run.artifacts_dir.is_relative() {
        settings.run.artifacts_dir = project_path.join(&settings.run.artifacts_dir);
    }
}

/// Root cancellation token, cancelled on Ctrl-C or SIGTERM.
fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => {
                warn!("Shutdown signal received, cancelling run");
                token.cancel();
            }
            Err(e) => warn!("Cannot install signal handlers: {}", e),
        }
    });
    cancel
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    print_state(&outcome.state);

    if let Some(selection) = &outcome.selection {
        println!("   {}", selection.rationale.dimmed());
    }
    println!(
        "\n{} {}",
        "Summary:".cyan().bold(),
        outcome.summary_path.display()
    );
}

fn print_state(state: &CoordinatorState) {
    let status = match state.status {
        RunStatus::Completed => state.status.to_string().green(),
        RunStatus::Running => state.status.to_string().yellow(),
        RunStatus::Failed | RunStatus::Cancelled => state.status.to_string().red(),
    };
    println!("\n{} {} ({})", "Run:".cyan().bold(), state.run_id, status);
    println!("   Task: {}", state.task.description);
    println!("{}", "─".repeat(60));

    for config in &state.configs {
        let id = &config.attempt_id;
        if let Some(result) = state.completed.get(id) {
            let marker = if state.selected.as_ref() == Some(id) {
                "*".green().bold()
            } else {
                " ".normal()
            };
            let status = match result.status {
                AttemptStatus::Converged => result.status.to_string().green(),
                AttemptStatus::BudgetExhausted | AttemptStatus::Stagnant => {
                    result.status.to_string().yellow()
                }
                _ => result.status.to_string().red(),
            };
            println!(
                " {} {:<12} {:<12} {:<18} score {:.3}  iterations {}",
                marker,
                id.as_str(),
                result.strategy,
                status,
                result.final_score,
                result.iterations_run
            );
            if let Some(failure) = &result.failure {
                println!("     {}", failure.dimmed());
            }
        } else if state.running.contains(id) {
            println!(
                "   {:<12} {:<12} {}",
                id.as_str(),
                config.strategy,
                "running".yellow()
            );
        } else {
            println!(
                "   {:<12} {:<12} {}",
                id.as_str(),
                config.strategy,
                "pending".dimmed()
            );
        }
    }

    println!("{}", "─".repeat(60));
    match &state.selected {
        Some(id) => {
            let score = state.completed.get(id).map_or(0.0, |r| r.final_score);
            println!("{} {} ({:.3})", "Selected:".green().bold(), id, score);
        }
        None => println!("{} none", "Selected:".yellow().bold()),
    }
}
