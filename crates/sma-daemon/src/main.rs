mod backup;
mod bus;
mod compose;
mod dbus;
mod discovery;
mod error;
mod gpio;
mod handlers;
mod lms;
mod mixer;
mod pollers;
mod power;
mod process;
mod publish;
mod reconnect;
mod recovery;
mod registry;
mod router;
mod session;
mod supervisor;
mod updater;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sma_proto::config::Config;
use sma_proto::platform::{self, ImagePlatform};
use sma_proto::protocol::Topics;
use sma_proto::state::ChannelTable;
use sma_proto::store::{ConfigStore, EnvFileStore};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bus::MqttConnector;
use crate::compose::ContainerRuntime;
use crate::process::Runner;
use crate::session::{Device, Services};

/// How long to listen for broker and media-server discovery replies.
const DISCOVERY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "sma-supervisor", about = "Amplifier appliance supervisor")]
struct Args {
    /// Daemon configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Node id used in every topic, instead of the MAC-derived one.
    #[arg(long)]
    node_id: Option<String>,
    /// Compose `.env` file holding the persisted settings.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    init_logging(&config)?;
    info!(
        "Config loaded from: {:?}",
        args.config.clone().unwrap_or_else(Config::config_path)
    );

    if let Some(env_file) = args.env_file {
        config.compose.env_file = env_file;
    }
    let node_id = args
        .node_id
        .or_else(|| config.bus.node_id.clone())
        .unwrap_or_else(platform::node_id);
    info!("node id {}", node_id);

    let store: Arc<dyn ConfigStore> = Arc::new(EnvFileStore::new(&config.compose.env_file));
    let timeout = Duration::from_secs(config.calls.timeout_secs);
    let runner = Runner::new(timeout);
    let dbus = dbus::SystemBus::new(timeout);

    let gpio = Arc::new(gpio::GpiodBus::new(dbus.clone()));
    let channel_count = config.channels.count;
    gpio::init_lines(gpio.as_ref(), store.as_ref(), channel_count).await;

    discovery::normalise_endpoints(
        store.as_ref(),
        &discovery::NetworkDiscovery::new(DISCOVERY_WAIT),
    )
    .await?;

    let runtime = Arc::new(compose::DockerCompose::new(
        runner.clone(),
        config.compose.env_file.clone(),
    )?);
    let services = Services {
        runtime: runtime.clone(),
        gpio,
        power: Arc::new(power::SystemPower::new(runner.clone(), dbus)),
        mixer: Arc::new(
            mixer::AlsaMixer::new(runner.clone(), config.mixer.clone())
                .context("mixer configuration")?,
        ),
        backup: Arc::new(backup::SshBackup::new(
            runner.clone(),
            store.clone(),
            config.backup.clone(),
            &node_id,
        )),
        updater: Arc::new(updater::WatchtowerTrigger::new(timeout)?),
        store: store.clone(),
    };

    let channels = ChannelTable::from_store(channel_count, store.as_ref());
    channels.load_names_from_dir(&config.channels.name_dir).await;

    let platform = ImagePlatform::host();
    match &platform {
        Some(p) => info!("image platform {}", p),
        None => warn!("no image platform for {}, registry checks off", std::env::consts::ARCH),
    }

    if let Err(e) = runtime.prune().await {
        warn!("image prune: {}", e);
    }

    let connector = Arc::new(MqttConnector::new(
        &node_id,
        Duration::from_secs(config.bus.keep_alive_secs),
        Duration::from_secs(config.bus.connect_timeout_secs),
    ));
    let device = Arc::new(Device {
        topics: Topics::new(
            config.bus.discovery_prefix.clone(),
            node_id,
            config.bus.presence_topic.clone(),
        ),
        channels,
        platform,
        config,
    });

    info!("Supervisor initialised, running reconnect loop");
    reconnect::ReconnectManager::new(
        connector,
        Arc::new(lms::LmsFactory::new(timeout)),
        services,
        device,
    )
    .run()
    .await
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let file_layer = match &config.log.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(log_file)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,sma_daemon=debug,sma_proto=debug")
            }),
        )
        .init();
    Ok(())
}
