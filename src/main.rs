//! node-auto-repair-operator — repairs faulty nodes in a Kubernetes
//! cluster.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use naro::aws::InstanceRebooter;
use naro::clock::{Clock, SystemClock};
use naro::detector::zscore::extractors::DockerDaemonInstability;
use naro::detector::zscore::{self, Z_SCORE_99};
use naro::detector::{AnomalyDetector, AnomalyDetectorFactory, AnomalyHandler, DetectorController};
use naro::events::{ClusterNodeFetcher, NodeEventController, NodeEventEmitter};
use naro::kubernetes::{EvictionDrainer, RepairTainter};
use naro::repair::{NodeRepairer, RepairConfiguration, RepairController};
use naro::{NodeTimePeriodSummary, Store};

const AWS_REQUIRED_ENV: &[&str] = &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_REGION"];

#[derive(Parser)]
#[command(name = "node-auto-repair-operator")]
#[command(about = "node-auto-repair-operator repairs faulty nodes in a Kubernetes cluster")]
#[command(version)]
struct Cli {
    /// The path to the embedded database
    #[arg(long, default_value = "/tmp/naro.db", env = "NARO_DB", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Exports the database as a JSON file
    ExportDb {
        /// Where to export the database to
        #[arg(
            long,
            default_value = "/tmp/node-auto-repair-operator-export.json",
            env = "NARO_FILE"
        )]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("naro=debug,info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::ExportDb { file }) => export_db(&cli.db, &file),
        None => run(&cli.db).await,
    }
}

async fn run(db_path: &Path) -> anyhow::Result<()> {
    info!("starting node-auto-repair-operator");
    info!(db = %db_path.display(), "using database");

    let store = Arc::new(Store::open(db_path).context("error opening store")?);

    let client = kube::Client::try_default()
        .await
        .context("error creating Kubernetes client")?;

    for var in AWS_REQUIRED_ENV {
        if std::env::var_os(var).is_none() {
            anyhow::bail!("missing required environment variable {var}");
        }
    }
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    let ec2 = aws_sdk_ec2::Client::new(&aws_config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let event_controller = Arc::new(NodeEventController::new(
        Arc::new(ClusterNodeFetcher::new(client.clone())),
        Arc::clone(&store),
    ));
    let event_emitter = Arc::new(NodeEventEmitter::new(
        client.clone(),
        vec![event_controller],
    ));
    event_emitter.start();

    let drainer = Arc::new(EvictionDrainer::new(client.clone()));
    let tainter = Arc::new(RepairTainter::new(client.clone()));
    let repairer = NodeRepairer::new(Arc::clone(&clock), Arc::clone(&store), drainer, tainter);

    let repair_configuration = RepairConfiguration {
        name: "default".to_string(),
        version: "0.0.1".to_string(),
        ordered_strategies: vec![Arc::new(InstanceRebooter::new(ec2))],
    };
    let repair_controller = Arc::new(RepairController::new(
        Arc::clone(&clock),
        repair_configuration,
        Arc::clone(&store),
        repairer,
    ));

    let zscore_factory: AnomalyDetectorFactory = Box::new(|| {
        Ok(Box::new(zscore::Detector::new(
            Z_SCORE_99,
            Box::new(DockerDaemonInstability::new()),
        )) as Box<dyn AnomalyDetector>)
    });

    let detector_controller = Arc::new(DetectorController::new(
        chrono::Duration::hours(24),
        chrono::Duration::hours(24),
        Duration::from_secs(60),
        vec![zscore_factory],
        Arc::clone(&store),
        clock,
        vec![repair_controller as Arc<dyn AnomalyHandler>],
    ));
    detector_controller.start();

    wait_for_shutdown_signal().await?;

    info!("exiting");
    info!("stopping NodeEventEmitter");
    event_emitter.stop().await;
    info!("stopping DetectorController");
    detector_controller.stop().await;

    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("error installing SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("error installing SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("error installing SIGQUIT handler")?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }

    Ok(())
}

fn export_db(db_path: &Path, file: &Path) -> anyhow::Result<()> {
    info!(db = %db_path.display(), "using database");
    info!(file = %file.display(), "exporting database");

    let store = Store::open(db_path).context("error opening store")?;

    #[derive(Serialize)]
    struct Export {
        node_time_period_summaries: Vec<NodeTimePeriodSummary>,
    }

    let now = Utc::now();
    let export = Export {
        node_time_period_summaries: store
            .get_node_time_period_summaries(now - chrono::Duration::days(365), now)?,
    };

    let out = std::fs::File::create(file).context("error creating export file")?;
    serde_json::to_writer_pretty(out, &export).context("error encoding export")?;

    Ok(())
}
