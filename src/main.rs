use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use flowcast::artifacts::{self, FileArtifactSink};
use flowcast::config::{Config, Location};
use flowcast::db::{Database, SqliteCache};
use flowcast::execution::cache::{CacheStore, TaskCache};
use flowcast::execution::clock::{Clock, SystemClock};
use flowcast::execution::flow::{Flow, FlowArgs, FlowRun, RunStatus, StepOutcome};
use flowcast::execution::RunContext;
use flowcast::forecast::OpenMeteoClient;
use flowcast::notifications::{self, Notifier};
use flowcast::pipelines::{self, Services};
use flowcast::storage::LocalObjectStore;

/// Default site for the hourly forecast
const FORECAST_LOCATION: Location = Location {
    lat: 50.7913957952127,
    lon: -1.9014254856972352,
};
/// San Diego
const DEFAULT_LOCATION: Location = Location {
    lat: 32.72,
    lon: -117.16,
};

#[derive(Parser)]
#[command(name = "flowcast")]
#[command(about = "Weather pipelines on a small task orchestration kernel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: flowcast.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Ignore cached task results and do not store new ones
    #[arg(long, global = true)]
    no_cache: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the hourly forecast, save it as csv and publish the next hour
    Forecast(LocationArgs),

    /// Print current temperature, humidity and precipitation probability
    Conditions(LocationArgs),

    /// Check configured locations for bad weather
    Alert {
        /// Only check this location
        location: Option<String>,
    },

    /// Save the current temperature to a timestamped file and upload it
    Publish(LocationArgs),

    /// Show recent runs
    Runs {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: i32,

        /// Only show runs of this flow
        #[arg(long)]
        flow: Option<String>,

        /// Show the steps of one run
        #[arg(long)]
        id: Option<String>,
    },

    /// Inspect or maintain the task cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// List recorded artifacts, or show the latest one for KEY
    Artifacts { key: Option<String> },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache statistics
    Stats,
    /// Remove every cached result
    Clear,
    /// Remove expired entries
    Prune,
}

#[derive(Args)]
struct LocationArgs {
    /// Latitude in degrees
    #[arg(long, allow_negative_numbers = true, requires = "lon")]
    lat: Option<f64>,

    /// Longitude in degrees
    #[arg(long, allow_negative_numbers = true, requires = "lat")]
    lon: Option<f64>,

    /// Named location from flowcast.toml
    #[arg(short, long, conflicts_with_all = ["lat", "lon"])]
    location: Option<String>,
}

impl LocationArgs {
    fn resolve(&self, config: &Config, default: Location) -> Result<Location> {
        if let Some(name) = &self.location {
            return config
                .location(name)
                .with_context(|| format!("Location '{}' is not configured", name));
        }
        Ok(match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Location { lat, lon },
            _ => default,
        })
    }
}

fn main() {
    init_tracing();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowcast=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every run succeeded
#[tokio::main]
async fn run() -> Result<bool> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Forecast(location) => {
            let app = App::new(config, cli.no_cache)?;
            let at = location.resolve(&app.config, FORECAST_LOCATION)?;
            let flow = pipelines::forecast::flow(&app.services)?;
            let run = app.run_flow(&flow, pipelines::location_args(at.lat, at.lon)).await?;

            if let Some(artifact) = run.artifacts.first() {
                println!("\n{}", artifact.content);
            }
            Ok(run.is_success())
        }
        Commands::Conditions(location) => {
            let app = App::new(config, cli.no_cache)?;
            let at = location.resolve(&app.config, DEFAULT_LOCATION)?;
            let flow = pipelines::conditions::flow(&app.services)?;
            let run = app.run_flow(&flow, pipelines::location_args(at.lat, at.lon)).await?;

            if let Some(report) = run.output_of(pipelines::conditions::REPORT).and_then(|v| v.as_str()) {
                println!("\n{}", report);
            }
            Ok(run.is_success())
        }
        Commands::Alert { location } => {
            let app = App::new(config, cli.no_cache)?;
            cmd_alert(&app, location).await
        }
        Commands::Publish(location) => {
            let app = App::new(config, cli.no_cache)?;
            let at = location.resolve(&app.config, DEFAULT_LOCATION)?;
            let flow = pipelines::publish::flow(&app.services)?;
            let run = app.run_flow(&flow, pipelines::location_args(at.lat, at.lon)).await?;
            Ok(run.is_success())
        }
        Commands::Runs { limit, flow, id } => {
            cmd_runs(&config, limit, flow, id)?;
            Ok(true)
        }
        Commands::Cache { action } => {
            cmd_cache(&config, action)?;
            Ok(true)
        }
        Commands::Artifacts { key } => {
            cmd_artifacts(&config, key)?;
            Ok(true)
        }
    }
}

/// Shared state for pipeline commands
struct App {
    config: Config,
    clock: Arc<dyn Clock>,
    cache: Arc<TaskCache>,
    artifacts: Arc<FileArtifactSink>,
    notifier: Arc<dyn Notifier>,
    services: Services,
}

impl App {
    fn new(config: Config, no_cache: bool) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let cache = if config.cache.enabled && !no_cache {
            match SqliteCache::open(&config.cache.path, clock.clone()) {
                Ok(store) => TaskCache::new(Arc::new(store)),
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "persistent cache unavailable, using memory");
                    TaskCache::in_memory(clock.clone())
                }
            }
        } else {
            TaskCache::disabled()
        };

        let provider = Arc::new(OpenMeteoClient::from_config(&config.provider)?);
        let notifier = notifications::from_config(&config.notifications)?;
        let store = Arc::new(LocalObjectStore::new(&config.storage.dir));
        let services = Services::new(&config, provider, notifier.clone(), store, clock.clone());

        Ok(Self {
            artifacts: Arc::new(FileArtifactSink::new(&config.output.artifacts_dir)),
            cache: Arc::new(cache),
            clock,
            notifier,
            services,
            config,
        })
    }

    async fn run_flow(&self, flow: &Flow, args: FlowArgs) -> Result<FlowRun> {
        let token = CancellationToken::new();
        let ctx = RunContext::new(self.cache.clone())
            .with_artifacts(self.artifacts.clone())
            .with_clock(self.clock.clone())
            .with_cancellation(token.clone());

        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping after the current step");
                token.cancel();
            }
        });

        println!(
            "{} {} {}",
            "▶".cyan(),
            flow.name().bold(),
            ctx.run_id().dimmed()
        );

        let run = flow.run(&args, &ctx).await;
        ctrl_c.abort();
        let run = run?;

        print_summary(&run);

        if let Err(e) = self.archive(&run) {
            tracing::warn!(error = %format!("{:#}", e), "failed to record run history");
        }

        if let Err(e) = notifications::send_run_summary(
            &self.config.notifications,
            self.notifier.as_ref(),
            &run,
            &self.config.project.name,
        )
        .await
        {
            tracing::warn!(error = %format!("{:#}", e), "failed to send run summary");
        }

        Ok(run)
    }

    fn archive(&self, run: &FlowRun) -> Result<()> {
        let db = Database::open(&self.config.cache.path)?;
        db.record_run(run)
    }
}

async fn cmd_alert(app: &App, only: Option<String>) -> Result<bool> {
    let locations: Vec<(String, Location)> = match only {
        Some(name) => {
            let location = app
                .config
                .location(&name)
                .with_context(|| format!("Location '{}' is not configured", name))?;
            vec![(name, location)]
        }
        None => app.config.locations.iter().map(|(n, l)| (n.clone(), *l)).collect(),
    };

    if locations.is_empty() {
        println!("  {}", "No locations configured".dimmed());
        return Ok(true);
    }

    let flow = pipelines::alert::flow(&app.services)?;
    let mut all_succeeded = true;

    for (name, location) in locations {
        let args = pipelines::alert::args(&name, location.lat, location.lon);
        let run = app.run_flow(&flow, args).await?;

        if run.record(pipelines::alert::REPORT).is_some() {
            println!("  {} {}", "☔".yellow(), format!("Bad weather in {}", name).yellow());
        } else if run.is_success() {
            println!("  {} {}", "☀".green(), format!("Weather is fine in {}", name).dimmed());
        }

        all_succeeded &= run.is_success();
        if run.status == RunStatus::Cancelled {
            break;
        }
    }

    Ok(all_succeeded)
}

fn print_summary(run: &FlowRun) {
    for record in &run.records {
        match &record.outcome {
            StepOutcome::Succeeded { cached: true, .. } => {
                println!("  {} {} {}", "✓".green(), record.step, "(cached)".cyan());
            }
            StepOutcome::Succeeded { attempts, .. } if *attempts > 1 => {
                println!(
                    "  {} {} ({}ms, {} attempts)",
                    "✓".green(),
                    record.step,
                    record.duration_ms,
                    attempts.to_string().yellow()
                );
            }
            StepOutcome::Succeeded { .. } => {
                println!("  {} {} ({}ms)", "✓".green(), record.step, record.duration_ms);
            }
            StepOutcome::Failed { cause, attempts } => {
                println!(
                    "  {} {}: {} (after {} attempt(s))",
                    "✗".red(),
                    record.step.red(),
                    cause,
                    attempts
                );
            }
            StepOutcome::Aborted { upstream } => {
                println!(
                    "  {} {} {}",
                    "⊘".yellow(),
                    record.step.dimmed(),
                    format!("(aborted, {} failed)", upstream).dimmed()
                );
            }
        }
    }

    println!("{}", "─".repeat(50).dimmed());

    let cached = run
        .records
        .iter()
        .filter(|r| matches!(r.outcome, StepOutcome::Succeeded { cached: true, .. }))
        .count();
    let retried = if run.attempts > 1 {
        format!(", {} flow attempts", run.attempts)
    } else {
        String::new()
    };

    match run.status {
        RunStatus::Succeeded => println!(
            "{} {} succeeded: {} step(s), {} cached ({}ms{})",
            "✓".green().bold(),
            run.flow,
            run.records.len(),
            cached.to_string().cyan(),
            run.duration_ms(),
            retried
        ),
        RunStatus::PartiallyFailed | RunStatus::Failed => {
            println!(
                "{} {} {} ({}ms{})",
                "✗".red().bold(),
                run.flow,
                run.status.as_str().replace('_', " "),
                run.duration_ms(),
                retried
            );
            if let Some(failure) = run.first_failure() {
                if let StepOutcome::Failed { cause, attempts } = &failure.outcome {
                    println!(
                        "\n{} {}: {} (after {} attempt(s))",
                        "Failed step:".red(),
                        failure.step,
                        cause,
                        attempts
                    );
                }
            }
        }
        RunStatus::Cancelled => println!(
            "{} {} cancelled after {} step(s)",
            "!".yellow().bold(),
            run.flow,
            run.records.len()
        ),
    }
}

fn cmd_runs(config: &Config, limit: i32, flow: Option<String>, id: Option<String>) -> Result<()> {
    let db = Database::open(&config.cache.path)?;

    if let Some(id) = id {
        let summary = db
            .get_run_summary(&id)?
            .with_context(|| format!("Run '{}' not found", id))?;

        println!(
            "\n{} {} {}",
            summary.run.flow.bold(),
            summary.run.status.as_str(),
            summary.run.id.dimmed()
        );
        for step in summary.steps {
            let detail = step
                .error
                .or_else(|| step.upstream.map(|u| format!("{} failed", u)))
                .or_else(|| step.value.map(|v| v.to_string()))
                .unwrap_or_default();
            let cached = if step.cached { " (cached)".cyan().to_string() } else { String::new() };
            println!(
                "  {} {}{} {}",
                step.status.dimmed(),
                step.step,
                cached,
                truncate(&detail, 80).dimmed()
            );
        }
        return Ok(());
    }

    let runs = match flow {
        Some(flow) => db.get_recent_runs_for_flow(&flow, limit)?,
        None => db.get_recent_runs(limit)?,
    };

    if runs.is_empty() {
        println!("  {}", "No runs recorded".dimmed());
        return Ok(());
    }

    for run in runs {
        let status = match run.status {
            RunStatus::Succeeded => run.status.as_str().green(),
            RunStatus::Cancelled => run.status.as_str().yellow(),
            _ => run.status.as_str().red(),
        };
        println!(
            "  {} {:<12} {:<16} {}ms {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.flow.cyan(),
            status,
            run.duration_ms(),
            run.id.dimmed()
        );
    }

    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}…", text.chars().take(max).collect::<String>())
    }
}

fn cmd_cache(config: &Config, action: CacheAction) -> Result<()> {
    let store = SqliteCache::open(&config.cache.path, Arc::new(SystemClock))?;

    match action {
        CacheAction::Stats => {
            let stats = store.stats()?;
            println!("\n{} {}", "Cache:".bold(), config.cache.path.display());
            println!("  {} {}", "entries:".dimmed(), stats.total_entries);
            println!("  {} {}", "valid:".dimmed(), stats.valid_entries.to_string().green());
            println!("  {} {}", "expired:".dimmed(), stats.expired_entries.to_string().yellow());
            if !stats.tasks_with_cache.is_empty() {
                println!("  {} {}", "tasks:".dimmed(), stats.tasks_with_cache.join(", "));
            }
        }
        CacheAction::Clear => {
            let removed = store.clear()?;
            println!("{} Removed {} cached result(s)", "✓".green(), removed);
        }
        CacheAction::Prune => {
            let removed = store.prune_expired()?;
            println!("{} Removed {} expired result(s)", "✓".green(), removed);
        }
    }

    Ok(())
}

fn cmd_artifacts(config: &Config, key: Option<String>) -> Result<()> {
    let dir = &config.output.artifacts_dir;

    if let Some(key) = key {
        let artifact = artifacts::latest_artifact(dir, &key)?
            .with_context(|| format!("No artifact recorded for '{}'", key))?;
        println!(
            "{} {} {}\n",
            artifact.key.bold(),
            artifact.produced_at.format("%Y-%m-%d %H:%M:%S"),
            artifact.run_id.dimmed()
        );
        println!("{}", artifact.content);
        return Ok(());
    }

    let all = artifacts::load_artifacts(dir)?;
    if all.is_empty() {
        println!("  {}", "No artifacts recorded".dimmed());
        return Ok(());
    }

    for artifact in all {
        println!(
            "  {} {:<20} {} {}",
            artifact.produced_at.format("%Y-%m-%d %H:%M:%S"),
            artifact.key.cyan(),
            artifact.description,
            artifact.run_id.dimmed()
        );
    }

    Ok(())
}
