//! Workload reconciler CLI.
//!
//! `mend reconcile` drives an unhealthy deployment back to health with a
//! bounded, policy-driven remediation loop; `mend status` observes and
//! classifies without touching anything.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use mend::report::{self, OutputFormat};
use mend::{
    classify, FinalState, HealthState, KubeOrchestrator, Orchestrator, Policy, ReconcileOptions,
    Reconciler, ShellRebuilder, WorkloadRef, WorkloadSnapshot,
};

/// Policy-driven workload reconciler
#[derive(Parser)]
#[command(name = "mend")]
#[command(about = "Policy-driven workload reconciler - drives unhealthy deployments back to health")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (json or text)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile a workload until healthy or the attempt budget runs out
    Reconcile {
        /// Namespace the workload lives in
        #[arg(long)]
        namespace: String,

        /// Label selector identifying the workload's pods (e.g. app=flask-app)
        #[arg(long)]
        selector: String,

        /// Maximum reconciliation attempts before giving up
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
        max_attempts: u32,

        /// Seconds to sleep between attempts
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,

        /// Overall wall-clock budget in seconds (unset = bounded by attempts only)
        #[arg(long)]
        deadline: Option<u64>,

        /// Remediation policy file (YAML); defaults to the built-in policy
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Shell command that rebuilds and republishes the workload image
        /// (receives the image reference in $MEND_IMAGE)
        #[arg(long)]
        rebuild_cmd: Option<String>,

        /// Image reference handed to the rebuild hook
        #[arg(long)]
        image: Option<String>,
    },
    /// Observe and classify a workload once, without remediating
    Status {
        /// Namespace the workload lives in
        #[arg(long)]
        namespace: String,

        /// Label selector identifying the workload's pods
        #[arg(long)]
        selector: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "mend=debug" } else { "mend=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // Logs go to stderr so stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code_for(state: FinalState) -> ExitCode {
    match state {
        FinalState::Healthy => ExitCode::SUCCESS,
        FinalState::Failed => ExitCode::from(1),
        FinalState::Degraded => ExitCode::from(2),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Reconcile {
            namespace,
            selector,
            max_attempts,
            poll_interval,
            deadline,
            policy,
            rebuild_cmd,
            image,
        } => {
            let policy = match policy {
                Some(path) => Policy::from_yaml_file(&path)?,
                None => Policy::default_policy(),
            };

            let orchestrator = KubeOrchestrator::connect()
                .await
                .context("failed to initialize the orchestrator client")?;
            let rebuilder = rebuild_cmd.map(ShellRebuilder::new);

            let options = ReconcileOptions {
                max_attempts,
                poll_interval: Duration::from_secs(poll_interval),
                deadline: deadline.map(Duration::from_secs),
                image,
            };
            let workload = WorkloadRef::new(namespace, selector);

            let mut reconciler = Reconciler::new(&orchestrator, policy, options);
            if let Some(rebuilder) = rebuilder.as_ref() {
                reconciler = reconciler.with_rebuilder(rebuilder);
            }

            let outcome = reconciler.run(&workload).await?;
            println!("{}", report::render_outcome(&outcome, cli.format)?);
            Ok(exit_code_for(outcome.final_state))
        }
        Commands::Status {
            namespace,
            selector,
        } => {
            let orchestrator = KubeOrchestrator::connect()
                .await
                .context("failed to initialize the orchestrator client")?;
            let pods = orchestrator
                .list_pods(&namespace, &selector)
                .await
                .context("failed to list pods")?;
            let workloads = orchestrator
                .list_workloads(&namespace, &selector)
                .await
                .context("failed to list deployments")?;

            let snapshot = WorkloadSnapshot { pods, workloads };
            let state = classify(&snapshot);
            println!("{}", report::render_status(&snapshot, state, cli.format)?);
            Ok(if state == HealthState::Healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red());
            ExitCode::from(1)
        }
    }
}
