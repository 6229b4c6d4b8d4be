//! LMSH - classroom and LMS reconciliation CLI
//!
//! The `lmsh` command provisions classrooms and assignments on the hosting
//! platform and propagates grades back to the LMS.
//!
//! ## Commands
//!
//! - `classroom create`: create, adopt or update a classroom
//! - `assignment create`: create, adopt or update an assignment
//! - `assignment grade`: push new grades for an assignment to the LMS
//! - `sync`: reconcile every classroom and assignment in a manifest
//! - `status`: list stored reconciliation records

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use lmsh_core::domain::validation::parse_due_date;
use lmsh_core::obs::RunSpan;
use lmsh_core::{
    merge_lms_roster, AssignmentSpec, CancelToken, ClassroomSpec, CommandHook, EngineConfig,
    EntityKind, GradePipeline, HostingPlatform, ItemOutcome, Lms, Manifest, PropagationReport,
    PropagationRequest, ReconciliationEngine, ReconciliationRecord, ReconciliationResult,
    RetryingLms, StateStore, SubmissionOutcome, SyncReport,
};
use lmsh_remote::{GitHubClassroom, RestLms};
use lmsh_state::{StoreConfig, SurrealStateStore};
use serde::Serialize;
use tracing::{warn, Level};

#[derive(Debug, Parser)]
#[command(name = "lmsh")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Classroom and LMS reconciliation (LMSH)", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Format of command results on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the LMSH version
    Version,

    /// Classroom operations
    Classroom {
        #[command(subcommand)]
        action: ClassroomAction,
    },

    /// Assignment operations
    Assignment {
        #[command(subcommand)]
        action: AssignmentAction,
    },

    /// Reconcile every classroom and assignment declared in a manifest
    Sync {
        /// Path to the manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// List stored reconciliation records
    Status {
        /// Only list records of this kind
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Version => "version",
            Commands::Classroom { .. } => "classroom.create",
            Commands::Assignment {
                action: AssignmentAction::Create { .. },
            } => "assignment.create",
            Commands::Assignment {
                action: AssignmentAction::Grade { .. },
            } => "assignment.grade",
            Commands::Sync { .. } => "sync",
            Commands::Status { .. } => "status",
        }
    }
}

#[derive(Debug, Subcommand)]
enum ClassroomAction {
    /// Create a classroom, or adopt and update the one already provisioned
    Create {
        /// Display name
        #[arg(long)]
        name: String,

        /// LMS course code
        #[arg(long)]
        course_code: String,

        /// Hosting organization
        #[arg(long)]
        org_id: String,

        #[arg(long)]
        description: Option<String>,

        /// Student login to enroll (repeatable)
        #[arg(long = "student")]
        students: Vec<String>,

        /// Also enroll every student on the LMS course roster
        #[arg(long)]
        roster_from_lms: bool,
    },
}

#[derive(Debug, Subcommand)]
enum AssignmentAction {
    /// Create an assignment, or adopt and update the one already provisioned
    Create {
        /// Classroom course code, remote id or display name
        #[arg(long)]
        classroom_id: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        course_code: String,

        #[arg(long)]
        org_id: String,

        #[arg(long)]
        description: Option<String>,

        /// Due date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_due_date)]
        due_date: Option<NaiveDate>,

        /// Maximum points (default: LMSH_DEFAULT_POINTS)
        #[arg(long)]
        points: Option<u32>,

        /// Starter template repository (owner/repo)
        #[arg(long)]
        template: Option<String>,

        /// Assignment key (default: slug of the title)
        #[arg(long)]
        key: Option<String>,
    },

    /// Propagate new grades for an assignment to the LMS
    Grade {
        /// Assignment key or remote id
        #[arg(long)]
        assignment_id: String,

        /// Only propagate this student's submission
        #[arg(long)]
        student_id: Option<String>,

        /// Score submissions with the configured grading hook
        #[arg(long)]
        auto: bool,

        /// Disambiguate assignments with the same key
        #[arg(long)]
        course_code: Option<String>,

        #[arg(long)]
        org_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Classroom,
    Assignment,
    Submission,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Classroom => EntityKind::Classroom,
            KindArg::Assignment => EntityKind::Assignment,
            KindArg::Submission => EntityKind::Submission,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    lmsh_core::telemetry::init_tracing(cli.json_logs, level);

    if let Commands::Version = cli.command {
        println!("lmsh {}", lmsh_core::VERSION);
        return Ok(ExitCode::SUCCESS);
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let _run = RunSpan::enter(cli.command.name(), &run_id);

    let config = EngineConfig::from_env().context("Invalid LMSH_* configuration")?;
    let store = open_store().await?;
    let cancel = cancel_on_ctrl_c();
    let output = cli.output;

    let success = match cli.command {
        Commands::Version => true,
        Commands::Classroom {
            action:
                ClassroomAction::Create {
                    name,
                    course_code,
                    org_id,
                    description,
                    students,
                    roster_from_lms,
                },
        } => {
            let lms: Option<Arc<dyn Lms>> = if roster_from_lms {
                Some(Arc::new(RetryingLms::new(lms()?, config.retry.clone())))
            } else {
                None
            };
            let engine = ReconciliationEngine::new(hosting()?, store, config);
            let spec = ClassroomSpec::new(org_id, course_code, name)
                .with_description(description)
                .with_students(students);
            let result = cmd_classroom_create(&engine, lms.as_deref(), spec, &cancel).await?;
            emit(output, &result, render_result)?;
            true
        }
        Commands::Assignment { action } => match action {
            AssignmentAction::Create {
                classroom_id,
                title,
                course_code,
                org_id,
                description,
                due_date,
                points,
                template,
                key,
            } => {
                let mut spec = AssignmentSpec::new(org_id, course_code, title)
                    .with_description(description)
                    .with_due_date(due_date)
                    .with_points(points)
                    .with_template(template);
                if let Some(key) = key {
                    spec = spec.with_key(key);
                }
                let engine = ReconciliationEngine::new(hosting()?, store, config);
                let result = cmd_assignment_create(&engine, &classroom_id, spec, &cancel).await?;
                emit(output, &result, render_result)?;
                true
            }
            AssignmentAction::Grade {
                assignment_id,
                student_id,
                auto,
                course_code,
                org_id,
            } => {
                let pipeline = grade_pipeline(hosting()?, lms()?, store, config, auto)?;
                let request = PropagationRequest::new(assignment_id)
                    .scoped(org_id, course_code)
                    .for_student(student_id)
                    .auto(auto);
                let report = cmd_assignment_grade(&pipeline, &request, &cancel).await?;
                emit(output, &report, render_propagation)?;
                report.is_success()
            }
        },
        Commands::Sync { manifest } => {
            let engine = ReconciliationEngine::new(hosting()?, store, config);
            let report = cmd_sync(&engine, &manifest, &cancel).await?;
            emit(output, &report, render_sync)?;
            report.is_success()
        }
        Commands::Status { kind } => {
            let records = cmd_status(store.as_ref(), kind.map(EntityKind::from)).await?;
            emit(output, &records, |records| render_status(records))?;
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn open_store() -> Result<Arc<dyn StateStore>> {
    let config = StoreConfig::from_env();
    let store = SurrealStateStore::connect(&config)
        .await
        .with_context(|| format!("Failed to open state store at {}", config.describe()))?;
    Ok(Arc::new(store))
}

fn hosting() -> Result<Arc<dyn HostingPlatform>> {
    let github = GitHubClassroom::from_env().context("Failed to configure the GitHub adapter")?;
    Ok(Arc::new(github))
}

fn lms() -> Result<Arc<dyn Lms>> {
    let lms = RestLms::from_env().context("Failed to configure the LMS adapter")?;
    Ok(Arc::new(lms))
}

/// Cancel between steps on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}

fn grade_pipeline(
    hosting: Arc<dyn HostingPlatform>,
    lms: Arc<dyn Lms>,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    auto: bool,
) -> Result<GradePipeline> {
    let hook = config
        .grading_hook
        .as_ref()
        .map(CommandHook::from_config)
        .transpose()
        .context("Invalid LMSH_GRADING_HOOK")?;
    let pipeline = GradePipeline::new(hosting, lms, store, config);
    match hook {
        Some(hook) => Ok(pipeline.with_hook(Arc::new(hook))),
        None => {
            if auto {
                warn!("--auto without LMSH_GRADING_HOOK, using platform scores");
            }
            Ok(pipeline)
        }
    }
}

/// Create or update a classroom, optionally enrolling the LMS roster.
async fn cmd_classroom_create(
    engine: &ReconciliationEngine,
    lms: Option<&dyn Lms>,
    mut spec: ClassroomSpec,
    cancel: &CancelToken,
) -> Result<ReconciliationResult> {
    if let Some(lms) = lms {
        let course_code = spec.course_code.clone();
        spec = merge_lms_roster(lms, spec)
            .await
            .with_context(|| format!("Failed to read the LMS roster of {course_code}"))?;
    }
    Ok(engine.reconcile_classroom(&spec, cancel).await?)
}

/// Create or update an assignment.
///
/// `classroom_id` must name the classroom recorded for the assignment's
/// organization and course.
async fn cmd_assignment_create(
    engine: &ReconciliationEngine,
    classroom_id: &str,
    spec: AssignmentSpec,
    cancel: &CancelToken,
) -> Result<ReconciliationResult> {
    Ok(engine
        .reconcile_assignment_in(classroom_id, &spec, cancel)
        .await?)
}

async fn cmd_assignment_grade(
    pipeline: &GradePipeline,
    request: &PropagationRequest,
    cancel: &CancelToken,
) -> Result<PropagationReport> {
    Ok(pipeline.propagate(request, cancel).await?)
}

async fn cmd_sync(
    engine: &ReconciliationEngine,
    manifest: &Path,
    cancel: &CancelToken,
) -> Result<SyncReport> {
    let manifest = Manifest::from_path(manifest)
        .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
    Ok(engine.sync(&manifest, cancel).await?)
}

async fn cmd_status(
    store: &dyn StateStore,
    kind: Option<EntityKind>,
) -> Result<Vec<ReconciliationRecord>> {
    let mut records = store.list(kind).await?;
    records.sort_by_key(|r| r.key.storage_id());
    Ok(records)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => print!("{}", text(value)),
    }
    Ok(())
}

fn render_result(result: &ReconciliationResult) -> String {
    let mut out = format!(
        "{} {} (remote id {}, revision {})\n",
        result.action.as_str(),
        result.key,
        result.remote_id,
        result.revision
    );
    if let Some(url) = &result.remote_url {
        out.push_str(&format!("  url: {url}\n"));
    }
    if !result.changed.is_empty() {
        out.push_str(&format!("  changed: {}\n", result.changed.join(", ")));
    }
    out
}

fn render_sync(report: &SyncReport) -> String {
    let mut out = String::new();
    let mut total = 0;
    for item in report.plans.iter().flat_map(|plan| plan.items()) {
        total += 1;
        let (status, detail) = match &item.outcome {
            ItemOutcome::Reconciled(result) => {
                (result.action.as_str(), format!("-> {}", result.remote_id))
            }
            ItemOutcome::Failed { category, error } => ("failed", format!("[{category}] {error}")),
            ItemOutcome::Skipped { reason } => ("skipped", reason.clone()),
        };
        out.push_str(&format!("{status:<10} {} {detail}\n", item.key));
    }
    out.push_str(&format!("{total} item(s), {} failure(s)\n", report.failures()));
    out
}

fn render_propagation(report: &PropagationReport) -> String {
    let mut out = format!(
        "{}{}: {} propagated, {} failed\n",
        report.assignment,
        if report.auto { " (auto)" } else { "" },
        report.propagated(),
        report.failed()
    );
    for submission in &report.submissions {
        let detail = match &submission.outcome {
            SubmissionOutcome::Propagated { score } => format!(" {score}"),
            SubmissionOutcome::Skipped { reason } => format!(" {reason}"),
            SubmissionOutcome::Failed { category, error } => format!(" [{category}] {error}"),
            _ => String::new(),
        };
        let revision: String = submission.revision.chars().take(12).collect();
        out.push_str(&format!(
            "  {:<20} {:<12} {}{}{}\n",
            submission.student,
            revision,
            submission.outcome.as_str(),
            detail,
            if submission.non_idempotent {
                " (no revision marker)"
            } else {
                ""
            }
        ));
    }
    out
}

fn render_status(records: &[ReconciliationRecord]) -> String {
    if records.is_empty() {
        return "no records\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        out.push_str(&format!(
            "{:<48} {:<32} {} {}\n",
            record.key,
            record.remote_id,
            record.last_synced_at.format("%Y-%m-%dT%H:%M:%SZ"),
            record.last_error.as_deref().unwrap_or("-")
        ));
    }
    out
}
