//! lmshd: scheduled grade propagation and the HTTP API.
//!
//! Runs the grade propagation pipeline for every `--assignment` on a fixed
//! interval, and with `--listen` serves the HTTP API from [`api`], until
//! interrupted. Ctrl-C stops the daemon between steps.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use lmsh_core::obs::RunSpan;
use lmsh_core::{
    CancelToken, CommandHook, EngineConfig, GradePipeline, HostingPlatform, Lms, LmshError,
    PropagationReport, PropagationRequest, ReconciliationEngine, RetryingLms, StateStore,
};
use lmsh_remote::{GitHubClassroom, RestLms};
use lmsh_state::{StoreConfig, SurrealStateStore};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};

mod api;

#[derive(Parser)]
#[command(name = "lmshd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Propagate grades to the LMS on a schedule", long_about = None)]
struct Args {
    /// Assignment key or remote id (repeatable)
    #[arg(long = "assignment", required_unless_present = "listen")]
    assignments: Vec<String>,

    /// Serve the HTTP API on this address
    #[arg(long, env = "LMSHD_LISTEN")]
    listen: Option<SocketAddr>,

    /// Seconds between propagation rounds
    #[arg(long, env = "LMSHD_INTERVAL_SECS", default_value_t = 300)]
    interval_secs: u64,

    /// Score submissions with the configured grading hook
    #[arg(long)]
    auto: bool,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,

    /// Disambiguate assignments with the same key
    #[arg(long)]
    course_code: Option<String>,

    #[arg(long)]
    org_id: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn requests(&self) -> Vec<PropagationRequest> {
        self.assignments
            .iter()
            .map(|id| {
                PropagationRequest::new(id.clone())
                    .scoped(self.org_id.clone(), self.course_code.clone())
                    .auto(self.auto)
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    lmsh_core::telemetry::init_tracing(args.json_logs, level);

    if args.interval_secs == 0 {
        anyhow::bail!("--interval-secs must be greater than zero");
    }

    let config = EngineConfig::from_env().context("Invalid LMSH_* configuration")?;
    let store_config = StoreConfig::from_env();
    let store = SurrealStateStore::connect(&store_config)
        .await
        .with_context(|| format!("Failed to open state store at {}", store_config.describe()))?;
    let hosting =
        GitHubClassroom::from_env().context("Failed to configure the GitHub adapter")?;
    let lms = RestLms::from_env().context("Failed to configure the LMS adapter")?;

    let hook = config
        .grading_hook
        .as_ref()
        .map(CommandHook::from_config)
        .transpose()
        .context("Invalid LMSH_GRADING_HOOK")?;
    if args.auto && hook.is_none() {
        warn!("--auto without LMSH_GRADING_HOOK, using platform scores");
    }
    let hosting: Arc<dyn HostingPlatform> = Arc::new(hosting);
    let lms: Arc<dyn Lms> = Arc::new(lms);
    let store: Arc<dyn StateStore> = Arc::new(store);
    let mut pipeline = GradePipeline::new(hosting.clone(), lms.clone(), store.clone(), config.clone());
    if let Some(hook) = hook {
        pipeline = pipeline.with_hook(Arc::new(hook));
    }
    let pipeline = Arc::new(pipeline);

    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            token.cancel();
        }
    });

    let http = match args.listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to listen on {addr}"))?;
            let state = api::AppState {
                engine: Arc::new(ReconciliationEngine::new(hosting, store, config.clone())),
                pipeline: pipeline.clone(),
                lms: Arc::new(RetryingLms::new(lms, config.retry.clone())),
                cancel: cancel.clone(),
            };
            info!(addr = %addr, "serving HTTP API");
            Some(tokio::spawn(api::serve_http(listener, state, cancel.clone())))
        }
        None => None,
    };

    info!(
        assignments = args.assignments.len(),
        interval_secs = args.interval_secs,
        auto = args.auto,
        store = %store_config.describe(),
        "lmshd started"
    );
    if !args.assignments.is_empty() {
        let rounds = serve(
            &pipeline,
            &args.requests(),
            Duration::from_secs(args.interval_secs),
            args.once,
            &cancel,
        )
        .await;
        info!(rounds, "propagation stopped");
        if args.once {
            cancel.cancel();
        }
    }
    if let Some(http) = http {
        http.await
            .context("HTTP server task failed")?
            .context("HTTP server failed")?;
    }
    info!("lmshd stopped");
    Ok(())
}

/// Run rounds every `interval` until cancelled (or after one round with
/// `once`). Returns the number of rounds started.
async fn serve(
    pipeline: &GradePipeline,
    requests: &[PropagationRequest],
    interval: Duration,
    once: bool,
    cancel: &CancelToken,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rounds = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        rounds += 1;
        let run_id = uuid::Uuid::new_v4().to_string();
        let results = {
            let _run = RunSpan::enter("propagate", &run_id);
            run_round(pipeline, requests, cancel).await
        };
        log_round(rounds, &results);
        if once || cancel.is_cancelled() {
            break;
        }
    }
    rounds
}

/// Propagate every assignment concurrently; one failing assignment does not
/// stop the others.
async fn run_round(
    pipeline: &GradePipeline,
    requests: &[PropagationRequest],
    cancel: &CancelToken,
) -> Vec<(String, Result<PropagationReport, LmshError>)> {
    join_all(requests.iter().map(|request| async move {
        let result = pipeline.propagate(request, cancel).await;
        (request.assignment_id.clone(), result)
    }))
    .await
}

fn log_round(round: u64, results: &[(String, Result<PropagationReport, LmshError>)]) {
    for (assignment, result) in results {
        match result {
            Ok(report) if report.is_success() => info!(
                round,
                assignment = %assignment,
                propagated = report.propagated(),
                "round finished"
            ),
            Ok(report) => warn!(
                round,
                assignment = %assignment,
                propagated = report.propagated(),
                failed = report.failed(),
                "round finished with failures"
            ),
            Err(err) => error!(
                round,
                assignment = %assignment,
                category = err.category(),
                error = %err,
                "round failed"
            ),
        }
    }
}
