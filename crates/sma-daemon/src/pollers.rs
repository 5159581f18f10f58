//! The session's background loops. Each one is work → sleep → repeat, and
//! only notices cancellation while sleeping.

use std::time::Duration;

use sma_proto::protocol::{channel_object, channel_suffixed, EntityKind};
use sma_proto::state::container_name;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::recovery::DacMonitor;
use crate::registry;
use crate::session::Session;
use crate::supervisor::TaskName;

pub async fn run(name: TaskName, session: Session, cancel: CancellationToken) {
    debug!("{}: running", name);
    match name {
        TaskName::ContainerState => container_state(&session, &cancel).await,
        TaskName::PlayerNames => player_names(&session, &cancel).await,
        TaskName::Registry => registry_versions(&session, &cancel).await,
        TaskName::DacMonitor => DacMonitor::new(&session).run(&cancel).await,
    }
    debug!("{}: cancelled", name);
}

/// Sleep for `interval`; true when cancelled instead.
pub async fn sleep_or_cancel(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

// ── container state ───────────────────────────────────────────────────────────

/// Edge-triggered container state: a projection is published only when it
/// differs from the last value published for it.
#[derive(Debug, Default)]
pub struct ContainerStatePoller {
    supervisor: Option<bool>,
    channels: Vec<Option<bool>>,
}

impl ContainerStatePoller {
    pub fn new(channels: u8) -> Self {
        Self {
            supervisor: None,
            channels: vec![None; channels as usize],
        }
    }

    pub async fn tick(&mut self, session: &Session) {
        let status = match session.services.runtime.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("{}: {}", TaskName::ContainerState, e);
                return;
            }
        };
        let running = |name: &str| status.get(name).map(String::as_str) == Some("running");

        let supervisor_up = running("supervisor");
        if self.supervisor != Some(supervisor_up) {
            self.supervisor = Some(supervisor_up);
            session
                .publish_state(EntityKind::BinarySensor, "supervisor", on_off(supervisor_up))
                .await;
        }

        for (i, last) in self.channels.iter_mut().enumerate() {
            let channel = i as u8 + 1;
            let up = running(&container_name(channel));
            if *last != Some(up) {
                *last = Some(up);
                session
                    .publish_state(EntityKind::BinarySensor, &channel_object(channel), on_off(up))
                    .await;
            }
        }
    }
}

fn on_off(up: bool) -> &'static str {
    if up {
        "ON"
    } else {
        "OFF"
    }
}

async fn container_state(session: &Session, cancel: &CancellationToken) {
    let interval = Duration::from_secs(session.device.config.poll.container_state_secs);
    let mut poller = ContainerStatePoller::new(session.device.channel_count());
    loop {
        poller.tick(session).await;
        if sleep_or_cancel(cancel, interval).await {
            return;
        }
    }
}

// ── player names ──────────────────────────────────────────────────────────────

/// Ask the media server for every player's name; names edited in the
/// server's own UI show up here.
pub async fn poll_player_names(session: &Session) {
    for channel in 1..=session.device.channel_count() {
        match session.media.get_player_name(channel).await {
            Ok(Some(name)) => {
                if session.device.channels.set_player_name(channel, &name).await {
                    debug!("{}: channel {} is now {:?}", TaskName::PlayerNames, channel, name);
                    session
                        .publish_state(
                            EntityKind::Text,
                            &channel_suffixed(channel, "player_name"),
                            &name,
                        )
                        .await;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("{}: channel {}: {}", TaskName::PlayerNames, channel, e),
        }
    }
}

async fn player_names(session: &Session, cancel: &CancellationToken) {
    let interval = Duration::from_secs(session.device.config.poll.player_name_secs);
    loop {
        poll_player_names(session).await;
        if sleep_or_cancel(cancel, interval).await {
            return;
        }
    }
}

// ── registry versions ─────────────────────────────────────────────────────────

pub async fn check_registry(session: &Session) {
    let platform = match &session.device.platform {
        Some(p) => p,
        None => {
            debug!("{}: no image platform for this host", TaskName::Registry);
            return;
        }
    };
    for watched in &session.device.config.compose.watched_services {
        let checked =
            registry::check_service(session.services.runtime.as_ref(), platform, &watched.service)
                .await;
        match checked {
            Ok(Some(state)) => match serde_json::to_string(&state) {
                Ok(payload) => {
                    session
                        .publish_state(
                            EntityKind::Update,
                            &format!("update_{}", watched.logical),
                            &payload,
                        )
                        .await
                }
                Err(e) => warn!("{}: {}", TaskName::Registry, e),
            },
            Ok(None) => {}
            Err(e) => warn!("{}: {}: {}", TaskName::Registry, watched.service, e),
        }
    }
}

async fn registry_versions(session: &Session, cancel: &CancellationToken) {
    let interval = Duration::from_secs(session.device.config.poll.registry_secs);
    loop {
        check_registry(session).await;
        if sleep_or_cancel(cancel, interval).await {
            return;
        }
    }
}
