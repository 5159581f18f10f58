//! One connected session: the bus and media-server clients, the device
//! context, and the command loop that owns the session's background tasks.
//!
//! ```text
//!   run()
//!     ├── republish_all            catalog + every state topic
//!     ├── subscribe                do/set wildcards + presence topic
//!     ├── TaskSupervisor::start    pollers bound to this session
//!     └── loop over BusEvent
//!           ├── presence "online"  → republish_all, restart container poller
//!           ├── command            → Router::dispatch
//!           └── Lost / closed      → end
//!   cancel_all before returning
//! ```

use std::sync::Arc;

use sma_proto::config::Config;
use sma_proto::platform::ImagePlatform;
use sma_proto::protocol::{EntityKind, Topics};
use sma_proto::state::ChannelTable;
use sma_proto::store::ConfigStore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backup::BackupService;
use crate::bus::{Bus, BusEvent};
use crate::compose::ContainerRuntime;
use crate::gpio::GpioService;
use crate::lms::MediaServerClient;
use crate::mixer::AudioMixer;
use crate::power::PowerService;
use crate::publish;
use crate::router::{Flow, Router};
use crate::supervisor::{TaskName, TaskSupervisor};
use crate::updater::UpdateTrigger;

/// Process-wide collaborators, shared by every session.
#[derive(Clone)]
pub struct Services {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub gpio: Arc<dyn GpioService>,
    pub power: Arc<dyn PowerService>,
    pub mixer: Arc<dyn AudioMixer>,
    pub backup: Arc<dyn BackupService>,
    pub updater: Arc<dyn UpdateTrigger>,
    pub store: Arc<dyn ConfigStore>,
}

/// Device context that outlives sessions.
pub struct Device {
    pub topics: Topics,
    pub config: Config,
    pub channels: ChannelTable,
    /// `None` on hosts with no known image platform; registry checks are
    /// skipped there.
    pub platform: Option<ImagePlatform>,
}

impl Device {
    pub fn channel_count(&self) -> u8 {
        self.config.channels.count
    }
}

#[derive(Clone)]
pub struct Session {
    pub bus: Arc<dyn Bus>,
    pub media: Arc<dyn MediaServerClient>,
    pub services: Services,
    pub device: Arc<Device>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Transport failed; retry after the backoff.
    Lost(String),
    /// Endpoints changed; reconnect right away.
    Reconnect,
    /// The host is going down; stop the daemon.
    Halt,
}

impl Session {
    pub fn topics(&self) -> &Topics {
        &self.device.topics
    }

    pub fn store(&self) -> &dyn ConfigStore {
        self.services.store.as_ref()
    }

    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) {
        if let Err(e) = self.bus.publish(topic, payload, retain).await {
            warn!("session: {}", e);
        }
    }

    pub async fn publish_state(&self, kind: EntityKind, object: &str, payload: &str) {
        let topic = self.device.topics.state(kind, object);
        self.publish(&topic, payload, false).await;
    }

    /// Power off every player; failures are logged per channel.
    pub async fn power_off_players(&self) {
        for channel in 1..=self.device.channel_count() {
            if let Err(e) = self.media.power_off_player(channel).await {
                warn!("session: power off player {}: {}", channel, e);
            }
        }
    }
}

/// Run the session until its transport ends or a command ends it.
pub async fn run(
    session: Session,
    events: &mut mpsc::Receiver<BusEvent>,
    router: &Router,
) -> SessionEnd {
    publish::republish_all(&session).await;

    let mut subscriptions = session.topics().subscriptions();
    subscriptions.push(session.topics().presence().to_string());
    for topic in &subscriptions {
        if let Err(e) = session.bus.subscribe(topic).await {
            warn!("session: {}", e);
            return SessionEnd::Lost(e.to_string());
        }
    }

    let mut supervisor = TaskSupervisor::new();
    supervisor.start(&session);
    info!(
        "session: up, {} background tasks, listening on {}",
        supervisor.running().len(),
        subscriptions.join(", ")
    );

    let end = loop {
        let msg = match events.recv().await {
            Some(BusEvent::Message(msg)) => msg,
            Some(BusEvent::Lost(e)) => break SessionEnd::Lost(e.to_string()),
            None => break SessionEnd::Lost("event stream closed".to_string()),
        };

        if msg.topic == session.topics().presence() {
            if msg.payload == "online" {
                info!("session: automation hub online, republishing");
                publish::republish_all(&session).await;
                supervisor.restart(TaskName::ContainerState, &session).await;
            } else {
                debug!("session: presence {:?}", msg.payload);
            }
            continue;
        }

        match router.dispatch(&session, &mut supervisor, &msg).await {
            Flow::Continue => {}
            Flow::End(end) => break end,
        }
    };

    let cancelled = supervisor.cancel_all().await;
    debug!("session: ended ({:?}), {} tasks cancelled", end, cancelled);
    end
}
