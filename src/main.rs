use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use refresh_golem::agent::{install_signal_handlers, is_shutdown_requested, kill_all_children, CliGenerator};
use refresh_golem::analysis::AnalysisPipeline;
use refresh_golem::catalog::{Catalog, JsonlCatalog};
use refresh_golem::config::{self, GolemConfig};
use refresh_golem::draft::DraftPipeline;
use refresh_golem::lease::LeaseManager;
use refresh_golem::log::{self as golem_log, parse_log_level};
use refresh_golem::metrics::CommandMetricsSource;
use refresh_golem::orchestrator::{BatchOrchestrator, OrchestratorSettings};
use refresh_golem::preflight::{run_preflight, PreflightScope};
use refresh_golem::processor::{ItemProcessor, ProcessorSettings};
use refresh_golem::queue::{StoreTaskQueue, TaskQueue};
use refresh_golem::reconcile::StatusReconciler;
use refresh_golem::records::Records;
use refresh_golem::store::{SqliteStore, Store};
use refresh_golem::types::{parse_job_status, JobStatus, Progress, ReviewDecision, TrackedItem};
use refresh_golem::worker::{RunMode, Worker, WorkerSettings, WorkerSummary};
use refresh_golem::worklog;

#[derive(Parser)]
#[command(name = "refresh-golem", about = "Resumable content prioritization and refresh workflows")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/refresh-golem.toml).
    /// When specified, config-relative paths (state, catalog, worklog)
    /// resolve from the config file's parent directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state directory and a default config
    Init,
    /// Start a prioritization job and schedule its first batch
    Start,
    /// Process queued batch tasks
    Work {
        /// Exit once the queue is empty instead of polling for new tasks
        #[arg(long)]
        until_idle: bool,
    },
    /// Start a prioritization job and work it to completion
    Run,
    /// Print the current job snapshot as JSON
    Progress {
        /// Fail unless the current job has this status
        /// (running, complete, cancelled, failed, timeout)
        #[arg(long, value_parser = parse_job_status)]
        expect: Option<JobStatus>,
    },
    /// Refresh metrics and priority for one item
    Score {
        /// Item ID
        item_id: String,
    },
    /// Cancel the running prioritization job
    Cancel,
    /// Reset orphaned in-progress statuses and time out stale jobs
    Reconcile,
    /// Analyze one item
    Analyze {
        /// Item ID
        item_id: String,
    },
    /// Generate a rewrite draft for one item
    Draft {
        /// Item ID
        item_id: String,
    },
    /// Approve or reject a completed draft
    Review {
        /// Item ID
        item_id: String,
        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,
        #[arg(long)]
        reject: bool,
        /// Write the approved draft content to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List tracked items by display order
    Status {
        /// Maximum number of rows to print
        #[arg(long, default_value = "25")]
        limit: usize,
    },
    /// Drop every record kept for an item removed from the catalog
    Forget {
        /// Item ID
        item_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => golem_log::init(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;

    let (config_path, config_base) = match &cli.config {
        Some(p) => (
            Some(p.clone()),
            p.parent().unwrap_or(Path::new(".")).to_path_buf(),
        ),
        None => (None, root.to_path_buf()),
    };

    let result = match cli.command {
        Commands::Init => handle_init(&config_base, config_path.as_deref()),
        command => match App::open(config_path.as_deref(), &config_base) {
            Ok(app) => dispatch(&app, command).await,
            Err(e) => Err(e),
        },
    };

    kill_all_children();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(app: &App, command: Commands) -> Result<(), String> {
    match command {
        Commands::Init => Ok(()),
        Commands::Start => handle_start(app).await,
        Commands::Work { until_idle } => {
            let mode = if until_idle {
                RunMode::UntilIdle
            } else {
                RunMode::Forever
            };
            handle_work(app, mode).await.map(|_| ())
        }
        Commands::Run => handle_run(app).await,
        Commands::Progress { expect } => handle_progress(app, expect),
        Commands::Score { item_id } => handle_score(app, &item_id).await,
        Commands::Cancel => handle_cancel(app),
        Commands::Reconcile => handle_reconcile(app),
        Commands::Analyze { item_id } => handle_analyze(app, &item_id).await,
        Commands::Draft { item_id } => handle_draft(app, &item_id).await,
        Commands::Review {
            item_id,
            approve,
            output,
            ..
        } => {
            let decision = if approve {
                ReviewDecision::Approved
            } else {
                ReviewDecision::Rejected
            };
            handle_review(app, &item_id, decision, output.as_deref()).await
        }
        Commands::Status { limit } => handle_status(app, limit),
        Commands::Forget { item_id } => handle_forget(app, &item_id),
    }
}

/// Everything a command needs, wired from config.
struct App {
    base: PathBuf,
    config: GolemConfig,
    store: Arc<dyn Store>,
    records: Records,
    catalog: Arc<dyn Catalog>,
    queue: Arc<dyn TaskQueue>,
    source: Arc<CommandMetricsSource>,
}

impl App {
    fn open(config_path: Option<&Path>, base: &Path) -> Result<Self, String> {
        let config = match config_path {
            Some(path) => config::load_config_from(path)?,
            None => config::load_config(base)?,
        };
        let sqlite = SqliteStore::open(&config.state_dir(base))?;
        debug!(dir = %sqlite.dir().display(), "Opened state store");
        let store: Arc<dyn Store> = Arc::new(sqlite);
        let catalog: Arc<dyn Catalog> = Arc::new(JsonlCatalog::new(&config.catalog_path(base)));
        let source = Arc::new(CommandMetricsSource::new(
            config.metrics.command.clone(),
            config.metrics.timeout(),
        ));
        Ok(Self {
            base: base.to_path_buf(),
            records: Records::new(Arc::clone(&store)),
            queue: Arc::new(StoreTaskQueue::new(Arc::clone(&store))),
            store,
            catalog,
            source,
            config,
        })
    }

    fn preflight(&self, scope: PreflightScope) -> Result<(), String> {
        run_preflight(&self.config, &self.base, scope).map_err(|errors| {
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn processor(&self) -> ItemProcessor<CommandMetricsSource> {
        ItemProcessor::new(
            self.records.clone(),
            Arc::clone(&self.source),
            ProcessorSettings::from_config(&self.config),
        )
    }

    fn orchestrator(&self) -> BatchOrchestrator<CommandMetricsSource> {
        BatchOrchestrator::new(
            self.records.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.queue),
            self.processor(),
            OrchestratorSettings::from_config(&self.config),
        )
    }

    fn leases(&self) -> LeaseManager {
        LeaseManager::new(Arc::clone(&self.store))
    }

    fn reconciler(&self) -> StatusReconciler {
        StatusReconciler::new(self.records.clone(), self.leases(), self.config.reconcile.grace())
    }

    fn generator(&self) -> Arc<CliGenerator> {
        Arc::new(CliGenerator::new(
            self.config.generator.command.clone(),
            self.config.generator.model.clone(),
        ))
    }

    fn drafts(&self) -> DraftPipeline<CliGenerator> {
        DraftPipeline::new(
            self.records.clone(),
            self.leases(),
            Arc::clone(&self.catalog),
            self.generator(),
            self.config.lease.draft(),
            self.config.generator.clone(),
        )
    }

    fn log_work(&self, subject: &str, action: &str, outcome: &str, summary: &str) {
        if let Err(e) = worklog::write_entry(
            &self.config.worklog_dir(&self.base),
            subject,
            action,
            outcome,
            summary,
        ) {
            warn!("Failed to write worklog: {}", e);
        }
    }
}

fn handle_init(base: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base.join(config::CONFIG_FILE));

    let config = if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        config::load_config_from(&config_path)?
    } else {
        fs::write(&config_path, config::DEFAULT_CONFIG_TOML)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
        println!("Created: {}", config_path.display());
        GolemConfig::default()
    };

    let state_dir = config.state_dir(base);
    fs::create_dir_all(&state_dir)
        .map_err(|e| format!("Failed to create {}: {}", state_dir.display(), e))?;
    println!("Initialized refresh-golem in {}", base.display());
    println!("  State: {}", state_dir.display());
    println!(
        "  Next: export the catalog to {} and set metrics.command",
        config.catalog_path(base).display()
    );
    Ok(())
}

async fn handle_start(app: &App) -> Result<(), String> {
    app.preflight(PreflightScope::Prioritize)?;
    let started = app.orchestrator().start().await?;
    println!(
        "Started {} ({} items in {} batches)",
        started.job_id, started.total_items, started.total_batches
    );
    println!("Run `refresh-golem work --until-idle` to process it.");
    Ok(())
}

/// Spawn a monitor that turns a shutdown signal into cancellation.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });
    cancel
}

async fn handle_work(app: &App, mode: RunMode) -> Result<WorkerSummary, String> {
    install_signal_handlers()?;
    let worker = Worker::new(
        Arc::new(app.orchestrator()),
        Arc::clone(&app.queue),
        WorkerSettings::from_config(&app.config),
    )
    .with_reconciler(app.reconciler());

    let summary = worker.run(shutdown_token(), mode).await?;
    println!(
        "Worker stopped ({:?}): {} completed, {} retried, {} exhausted",
        summary.halt_reason, summary.tasks_completed, summary.tasks_retried, summary.tasks_exhausted
    );
    Ok(summary)
}

async fn handle_run(app: &App) -> Result<(), String> {
    handle_start(app).await?;
    handle_work(app, RunMode::UntilIdle).await?;

    let progress = app.orchestrator().progress();
    print_json(&progress.to_json())?;

    if let Progress::Active(job) = &progress {
        app.log_work(
            &job.job_id,
            "Prioritization run",
            job.status.as_str(),
            &format!(
                "{}/{} items processed, {} succeeded, {} cache hits, {} errors",
                job.processed_count,
                job.total_items,
                job.success_count,
                job.cache_hit_count,
                job.errors.len()
            ),
        );
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn handle_progress(app: &App, expect: Option<JobStatus>) -> Result<(), String> {
    let progress = app.orchestrator().progress();
    print_json(&progress.to_json())?;
    let Some(expected) = expect else {
        return Ok(());
    };
    match &progress {
        Progress::Active(job) if job.status == expected => Ok(()),
        Progress::Active(job) => Err(format!(
            "Job {} is {}, expected {}",
            job.job_id, job.status, expected
        )),
        Progress::Idle => Err(format!("No job recorded, expected {}", expected)),
        Progress::Unavailable(reason) => Err(format!("Progress unavailable: {}", reason)),
    }
}

async fn handle_score(app: &App, item_id: &str) -> Result<(), String> {
    app.preflight(PreflightScope::Prioritize)?;
    let outcome = app
        .processor()
        .process_id(app.catalog.as_ref(), item_id)
        .await;
    if let Some(error) = outcome.error {
        return Err(format!("Scoring {} failed: {}", item_id, error));
    }
    let score = outcome
        .score
        .ok_or_else(|| format!("No score produced for {}", item_id))?;
    println!(
        "{}: priority {} (age {}, decline {}, potential {}){}",
        item_id,
        score.priority,
        score.content_age,
        score.traffic_decline,
        score.traffic_potential,
        if outcome.cache_hit { " [cached metrics]" } else { "" }
    );
    Ok(())
}

fn handle_cancel(app: &App) -> Result<(), String> {
    let outcome = app.orchestrator().cancel()?;
    println!(
        "Cancelled {} ({} queued batches removed)",
        outcome.job_id, outcome.removed_tasks
    );
    app.log_work(&outcome.job_id, "Prioritization run", "cancelled", "Cancelled from the CLI");
    Ok(())
}

fn handle_reconcile(app: &App) -> Result<(), String> {
    if let Some(job) = app.orchestrator().sweep_stale()? {
        println!("Timed out stale job {}", job.job_id);
    }
    let report = app.reconciler().reconcile()?;
    println!(
        "Inspected {} in-progress rows, {} still running, {} reset",
        report.inspected,
        report.still_running,
        report.resets.len()
    );
    for reset in &report.resets {
        println!(
            "  {} {} -> {:?}{}",
            reset.item_id,
            reset.operation.as_str(),
            reset.target,
            if reset.audit_row { " (audit record)" } else { "" }
        );
    }
    Ok(())
}

async fn handle_analyze(app: &App, item_id: &str) -> Result<(), String> {
    app.preflight(PreflightScope::Generate)?;
    install_signal_handlers()?;
    let pipeline = AnalysisPipeline::new(
        app.records.clone(),
        app.leases(),
        Arc::clone(&app.catalog),
        app.processor(),
        app.generator(),
        app.config.lease.analysis(),
        app.config.generator.clone(),
    );

    match pipeline.analyze(item_id).await {
        Ok(record) => {
            println!("{}: {} findings", item_id, record.issue_count);
            for finding in &record.findings {
                println!("  [{}] {}: {}", finding.severity, finding.category, finding.summary);
            }
            println!("Cost: ${:.4}", record.cost_usd);
            app.log_work(
                item_id,
                "Analysis",
                "completed",
                &format!("{} findings, ${:.4}", record.issue_count, record.cost_usd),
            );
            Ok(())
        }
        Err(e) => {
            if !e.is_contention() {
                app.log_work(item_id, "Analysis", "error", &e.to_string());
            }
            Err(e.into())
        }
    }
}

async fn handle_draft(app: &App, item_id: &str) -> Result<(), String> {
    app.preflight(PreflightScope::Generate)?;
    install_signal_handlers()?;
    let pipeline = app.drafts();

    match pipeline.create_draft(item_id).await {
        Ok(record) => {
            if let Some(artifact) = pipeline.artifact(item_id)? {
                println!("{}", artifact.diff.render());
                println!(
                    "\n{}: +{} -{} lines, cost ${:.4}",
                    item_id, artifact.diff.added, artifact.diff.removed, record.cost_usd
                );
            }
            println!("Review with `refresh-golem review {} --approve|--reject`", item_id);
            app.log_work(
                item_id,
                "Draft",
                "completed",
                &format!("Draft ready for review, ${:.4}", record.cost_usd),
            );
            Ok(())
        }
        Err(e) => {
            if !e.is_contention() {
                app.log_work(item_id, "Draft", "error", &e.to_string());
            }
            Err(e.into())
        }
    }
}

async fn handle_review(
    app: &App,
    item_id: &str,
    decision: ReviewDecision,
    output: Option<&Path>,
) -> Result<(), String> {
    let outcome = app.drafts().review(item_id, decision).await?;

    let approved = outcome.artifact.as_ref().filter(|_| decision == ReviewDecision::Approved);
    if let (Some(path), Some(artifact)) = (output, approved) {
        fs::write(path, &artifact.content)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        println!("Wrote approved draft to {}", path.display());
    }

    let verdict = match decision {
        ReviewDecision::Approved => "approved",
        ReviewDecision::Rejected => "rejected",
    };
    println!("Draft for {} {}", item_id, verdict);
    app.log_work(item_id, "Draft review", verdict, "Draft resolved, item returned to pending");
    info!(item_id, verdict, "Review recorded");
    Ok(())
}

fn handle_status(app: &App, limit: usize) -> Result<(), String> {
    let mut items = app.records.tracked_items()?;
    if items.is_empty() {
        println!("No tracked items. Run `refresh-golem run` to score the catalog.");
        return Ok(());
    }

    items.sort_by(|a, b| {
        let order_a = a.display_order.unwrap_or(u32::MAX);
        let order_b = b.display_order.unwrap_or(u32::MAX);
        order_a
            .cmp(&order_b)
            .then_with(|| b.priority_score.cmp(&a.priority_score))
            .then_with(|| a.item_id.cmp(&b.item_id))
    });

    println!(
        "{:<6} {:<24} {:<8} {:<5} {:<5} {:<5} {:<12} {:<12}",
        "RANK", "ID", "PRIORITY", "AGE", "DECL", "POT", "ANALYSIS", "DRAFT"
    );
    println!("{}", "-".repeat(84));

    for item in items.iter().take(limit) {
        print_status_row(item);
    }

    println!("\n{} item(s) tracked", items.len());
    Ok(())
}

fn print_status_row(item: &TrackedItem) {
    let rank = item
        .display_order
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());
    let flag = if item.score_error.is_some() { "!" } else { "" };
    println!(
        "{:<6} {:<24} {:<8} {:<5} {:<5} {:<5} {:<12} {:<12}",
        rank,
        truncate_id(&item.item_id, 24),
        format!("{}{}", item.priority_score, flag),
        item.content_age_score,
        item.traffic_decline_score,
        item.traffic_potential_score,
        item.analysis_status.as_str(),
        item.draft_status.as_str(),
    );
}

fn truncate_id(id: &str, max_len: usize) -> String {
    if id.chars().count() <= max_len {
        return id.to_string();
    }
    let truncated: String = id.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", truncated)
}

fn handle_forget(app: &App, item_id: &str) -> Result<(), String> {
    if app.records.remove_item(item_id)? {
        println!("Removed records for {}", item_id);
    } else {
        println!("No tracked records for {}", item_id);
    }
    Ok(())
}
