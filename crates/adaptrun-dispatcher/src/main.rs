//! adaptrun dispatcher daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lapin::{Connection, ConnectionProperties};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adaptrun_dispatcher::config::{Config, LaunchMode, LauncherSettings};
use adaptrun_dispatcher::consumer;
use adaptrun_dispatcher::dispatch::Dispatcher;
use adaptrun_dispatcher::launcher::{Launcher, PodLauncher, SubprocessLauncher};
use adaptrun_dispatcher::reply::ReplyPublisher;
use adaptrun_dispatcher::transfer::ArtifactStore;

#[derive(Parser)]
#[command(name = "adaptrun-dispatcher", about = "File adaptation dispatcher")]
struct Cli {
    /// Execution strategy for adaptation requests.
    #[arg(long, value_enum, env = "LAUNCH_STRATEGY", default_value = "subprocess")]
    launcher: LaunchMode,

    /// Optional env file to load before reading configuration.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adaptrun_dispatcher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env(cli.launcher)?;

    info!(
        broker = %config.broker.request_queue_host,
        mode = ?cli.launcher,
        "starting adaptrun dispatcher"
    );

    let connection =
        Connection::connect(&config.amqp_uri(), ConnectionProperties::default()).await?;
    let publisher_channel = connection.create_channel().await?;
    let consumer_channel = connection.create_channel().await?;
    consumer::bind_topology(&consumer_channel).await?;

    let store = Arc::new(ArtifactStore::new(&config.storage));
    let replies = Arc::new(ReplyPublisher::new(publisher_channel));

    let launcher: Arc<dyn Launcher> = match &config.launcher {
        LauncherSettings::Subprocess(processor) => Arc::new(SubprocessLauncher::new(processor)),
        LauncherSettings::Pod(pod) => {
            let client = kube::Client::try_default().await?;
            Arc::new(PodLauncher::new(
                client,
                pod,
                &config.mounts,
                &config.resources,
            )?)
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        launcher,
        replies,
        config.context_settings(),
    ));

    consumer::serve(consumer_channel, dispatcher).await?;

    Ok(())
}
