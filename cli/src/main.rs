use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use intake::db::job_repo::JobFilter;
use intake::{load_config, Database, JobStatus, Orchestrator, SessionSpec};
use log::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// intake - exam submission ingestion
#[derive(Parser, Debug)]
#[command(name = "intake")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "intake.json")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest an uploaded archive for an exam session
    Ingest {
        /// The uploaded archive
        archive: PathBuf,

        /// Exam session the submissions belong to
        #[arg(long)]
        exam_session: String,

        /// Exam the session is for
        #[arg(long)]
        exam_id: String,

        /// Glob every student is expected to submit (repeatable)
        #[arg(long = "require")]
        required_files: Vec<String>,

        /// Naming pattern overriding the configured one
        #[arg(long)]
        naming_pattern: Option<String>,

        /// JSON object mapping student ids to display names
        #[arg(long)]
        roster: Option<PathBuf>,

        /// Return after queueing instead of waiting for the report
        #[arg(long)]
        no_wait: bool,
    },

    /// Show one job report, or list jobs
    #[command(alias = "ls")]
    Status {
        /// Job id
        job_id: Option<String>,

        /// Filter by job status
        #[arg(long)]
        status: Option<String>,

        /// Filter by exam session
        #[arg(long)]
        exam_session: Option<String>,

        /// Number of jobs to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: u64,
    },

    /// Resume queued and interrupted jobs
    Resume,

    /// Run a finished job's archive again as a new job
    Retry {
        /// Job id
        job_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs)?;

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let db_path = config
        .database_path()
        .ok_or_else(|| anyhow!("Could not determine the database location; set database_path"))?;
    let db = Database::open(&db_path).context("Failed to open database")?;
    let orchestrator = Orchestrator::from_config(&config, db);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .context("Failed to install Ctrl-C handler")?;
    }

    let result = run(&orchestrator, cli.command, &interrupted);

    orchestrator.shutdown();
    orchestrator.wait();
    result
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_writer(std::io::stderr)),
        )?;
    } else {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )?;
    }

    // Library code logs through the log facade
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn run(orchestrator: &Orchestrator, command: Commands, interrupted: &AtomicBool) -> Result<()> {
    match command {
        Commands::Ingest {
            archive,
            exam_session,
            exam_id,
            required_files,
            naming_pattern,
            roster,
            no_wait,
        } => {
            let mut session = SessionSpec::new(exam_session, exam_id);
            if !required_files.is_empty() {
                session = session.with_required_files(required_files);
            }
            if let Some(pattern) = naming_pattern {
                session = session.with_naming_pattern(pattern);
            }
            if let Some(path) = roster {
                session.roster = read_roster(&path)?;
            }

            let archive_name = archive
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| anyhow!("{} is not a file", archive.display()))?;
            let mut reader = File::open(&archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;

            let job_id = orchestrator.submit(session, &archive_name, &mut reader)?;
            info!("Submitted job {}", job_id);
            if no_wait {
                println!("{}", job_id);
                return Ok(());
            }
            wait_and_report(orchestrator, vec![job_id], interrupted)
        }
        Commands::Status {
            job_id: Some(job_id),
            ..
        } => print_report(orchestrator, &job_id),
        Commands::Status {
            job_id: None,
            status,
            exam_session,
            limit,
        } => {
            let filter = JobFilter {
                status,
                exam_session_id: exam_session,
                limit: Some(limit),
                offset: None,
            };
            let (rows, total) = orchestrator.list_jobs(&filter)?;
            for row in &rows {
                println!(
                    "{}  {:<9}  {}  {}  {} file(s)",
                    row.id, row.status, row.exam_session_id, row.archive_name, row.total_files
                );
            }
            println!("{} of {} job(s)", rows.len(), total);
            Ok(())
        }
        Commands::Resume => {
            let resumed = orchestrator.resume_incomplete()?;
            if resumed.is_empty() {
                println!("No incomplete jobs");
                return Ok(());
            }
            wait_and_report(orchestrator, resumed, interrupted)
        }
        Commands::Retry { job_id } => {
            let new_id = orchestrator.retry(&job_id)?;
            info!("Job {} retried as {}", job_id, new_id);
            wait_and_report(orchestrator, vec![new_id], interrupted)
        }
    }
}

fn read_roster(path: &Path) -> Result<HashMap<String, String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("Invalid roster {}", path.display()))
}

/// Waits until every job in `job_ids` reports back or Ctrl-C is pressed,
/// then prints the reports of the finished ones.
fn wait_and_report(
    orchestrator: &Orchestrator,
    job_ids: Vec<String>,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut pending: HashSet<String> = job_ids.iter().cloned().collect();

    while !pending.is_empty() {
        if interrupted.load(Ordering::Relaxed) {
            warn!(
                "Interrupted; {} job(s) will continue on the next `intake resume`",
                pending.len()
            );
            orchestrator.shutdown();
            break;
        }
        if let Some(outcome) = orchestrator.recv_outcome_timeout(Duration::from_millis(200)) {
            if pending.remove(&outcome.job_id) && !outcome.status.is_terminal() {
                warn!("Job {} stopped while {}", outcome.job_id, outcome.status);
            }
        }
    }

    let mut failed = 0;
    for job_id in job_ids.iter().filter(|id| !pending.contains(*id)) {
        let result = orchestrator.get_result(job_id)?;
        if result.status == JobStatus::Failed {
            failed += 1;
        }
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if failed > 0 {
        return Err(anyhow!("{} job(s) failed", failed));
    }
    Ok(())
}

fn print_report(orchestrator: &Orchestrator, job_id: &str) -> Result<()> {
    let result = orchestrator.get_result(job_id)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
