//! nbgridd — the nbgrid daemon.
//!
//! Runs the scheduler, the control-queue dispatchers, the execution
//! janitor and one controller per cluster in one process. Machines of
//! `local` providers get their agents in-process.
//!
//! # Usage
//!
//! ```text
//! nbgridd standalone --data-dir /var/lib/nbgrid --cluster-file clusters.yaml \
//!                    --workflows workflows.yaml
//! nbgridd check-config --cluster-file clusters.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nbgrid_agent::{CommandExecutor, NotebookExecutor};
use nbgrid_cluster::ClusterConfig;
use nbgrid_core::{Settings, SystemClock};
use nbgrid_state::StateStore;
use nbgridd::{Daemon, Manifest};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nbgridd", about = "nbgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in this process.
    Standalone {
        /// Data directory for the embedded database.
        #[arg(long, env = "NB_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Cluster file; without one no machines are managed.
        #[arg(long, env = "NB_CLUSTER_FILE")]
        cluster_file: Option<PathBuf>,

        /// Workflow manifest applied before the loops start.
        #[arg(long)]
        workflows: Option<PathBuf>,

        /// Notebook executor program. Defaults to `docker run` of the
        /// workflow's runtime image.
        #[arg(long)]
        executor: Option<String>,

        /// Arguments of the executor program; `{field}` placeholders are
        /// filled from the run job.
        #[arg(long = "executor-arg")]
        executor_args: Vec<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Load and validate a cluster file and its inventory, then exit.
    CheckConfig {
        #[arg(long, env = "NB_CLUSTER_FILE")]
        cluster_file: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nbgrid=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("loading settings")?;

    match cli.command {
        Command::Standalone {
            data_dir,
            cluster_file,
            workflows,
            executor,
            executor_args,
            log_json,
        } => {
            if let Some(dir) = data_dir {
                settings.data_dir = dir;
            }
            if cluster_file.is_some() {
                settings.cluster_file = cluster_file;
            }
            settings.log_json |= log_json;
            init_tracing(settings.log_json);

            let executor: Arc<dyn NotebookExecutor> = match executor {
                Some(program) => Arc::new(CommandExecutor::new(program, executor_args)),
                None => Arc::new(CommandExecutor::docker(
                    settings.docker_uid,
                    settings.docker_gid,
                )),
            };
            run_standalone(settings, workflows, executor).await
        }
        Command::CheckConfig { cluster_file } => {
            init_tracing(settings.log_json);
            let config = ClusterConfig::load(&cluster_file)?;
            for (name, spec) in &config.file.clusters {
                info!(
                    cluster = %name,
                    machine = %spec.machine,
                    provider = %spec.provider,
                    queues = ?spec.qnames,
                    min = spec.policy.min_nodes,
                    max = spec.policy.max_nodes,
                    "cluster ok"
                );
            }
            info!(
                machines = config.inventory.machines.len(),
                volumes = config.inventory.volumes.len(),
                providers = config.inventory.providers.len(),
                "inventory ok"
            );
            Ok(())
        }
    }
}

async fn run_standalone(
    settings: Settings,
    workflows: Option<PathBuf>,
    executor: Arc<dyn NotebookExecutor>,
) -> anyhow::Result<()> {
    info!("nbgrid daemon starting in standalone mode");

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;
    let db_path = settings.database_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let cluster = match &settings.cluster_file {
        Some(path) => Some(ClusterConfig::load(path)?),
        None => None,
    };
    let clock = SystemClock::shared();
    let daemon = Daemon::new(settings, store.clone(), cluster, clock.clone(), executor)?;

    if let Some(path) = workflows {
        let report = Manifest::load(&path)?.apply(&store, daemon.scheduler(), &clock)?;
        info!(
            projects_created = report.projects_created,
            workflows_created = report.workflows_created,
            workflows_updated = report.workflows_updated,
            "workflow manifest applied"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await?;
    info!("nbgrid daemon stopped");
    Ok(())
}
