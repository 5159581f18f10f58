//! Startup endpoint resolution.
//!
//! A stored address always wins and only gets its default port filled in.
//! Without one, the broker is browsed for over mDNS (`_mqtt._tcp.local.`) and
//! the media server is found with its UDP broadcast; whatever answers first
//! is written back to the store.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use sma_proto::keys;
use sma_proto::store::ConfigStore;
use tracing::{debug, info};

use crate::bus::{split_host_port, DEFAULT_MQTT_PORT};
use crate::error::CallError;
use crate::lms::{self, DEFAULT_LMS_PORT};

pub const MQTT_SERVICE: &str = "_mqtt._tcp.local.";

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn broker(&self) -> Result<Option<(String, u16)>, CallError>;
    async fn media_server(&self) -> Result<Option<(String, u16)>, CallError>;
}

/// Discovery on the local network, listening `wait` for each service.
pub struct NetworkDiscovery {
    wait: Duration,
}

impl NetworkDiscovery {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }
}

#[async_trait]
impl Discovery for NetworkDiscovery {
    async fn broker(&self) -> Result<Option<(String, u16)>, CallError> {
        browse_ipv4(MQTT_SERVICE, self.wait).await
    }

    async fn media_server(&self) -> Result<Option<(String, u16)>, CallError> {
        lms::discover(self.wait).await
    }
}

/// First resolved instance of `service` with an IPv4 address.
async fn browse_ipv4(service: &str, wait: Duration) -> Result<Option<(String, u16)>, CallError> {
    let daemon = ServiceDaemon::new()?;
    let events = daemon.browse(service)?;
    let deadline = tokio::time::Instant::now() + wait;

    let found = loop {
        match tokio::time::timeout_at(deadline, events.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                match info.get_addresses().iter().find(|a| a.is_ipv4()) {
                    Some(addr) => break Some((addr.to_string(), info.get_port())),
                    None => debug!("discovery: {} has no IPv4 address", info.get_fullname()),
                }
            }
            Ok(Ok(event)) => debug!("discovery: {:?}", event),
            Ok(Err(_)) | Err(_) => break None,
        }
    };

    if let Err(e) = daemon.shutdown() {
        debug!("discovery: mdns shutdown: {}", e);
    }
    Ok(found)
}

/// Give both endpoints a port, discovering whichever is not stored.
pub async fn normalise_endpoints(
    store: &dyn ConfigStore,
    discovery: &dyn Discovery,
) -> anyhow::Result<()> {
    let (host, port) = match store.read(keys::MQTT_HOST) {
        Some(raw) => split_host_port(&raw, DEFAULT_MQTT_PORT)
            .with_context(|| format!("bad {}: {:?}", keys::MQTT_HOST, raw))?,
        None => {
            info!("{} not set, browsing for {}", keys::MQTT_HOST, MQTT_SERVICE);
            match discovery.broker().await? {
                Some(found) => found,
                None => bail!("{} is not set and no broker was discovered", keys::MQTT_HOST),
            }
        }
    };
    store.write(keys::MQTT_HOST, &format!("{}:{}", host, port))?;

    let (host, port) = match store.read(keys::LMS_HOST) {
        Some(raw) => split_host_port(&raw, DEFAULT_LMS_PORT)
            .with_context(|| format!("bad {}: {:?}", keys::LMS_HOST, raw))?,
        None => {
            info!("{} not set, looking for a media server", keys::LMS_HOST);
            match discovery.media_server().await? {
                Some(found) => found,
                None => bail!("{} is not set and no media server answered", keys::LMS_HOST),
            }
        }
    };
    store.write(keys::LMS_HOST, &format!("{}:{}", host, port))?;
    Ok(())
}
