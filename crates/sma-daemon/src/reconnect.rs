//! Outermost loop: connect, run a session, tear it down, retry.

use std::sync::Arc;
use std::time::Duration;

use sma_proto::keys;
use tracing::{info, warn};

use crate::bus::{split_host_port, BrokerEndpoint, Connector};
use crate::lms::{MediaServerClient, MediaServerFactory, DEFAULT_LMS_PORT};
use crate::router::Router;
use crate::session::{self, Device, Services, Session, SessionEnd};

pub struct ReconnectManager {
    connector: Arc<dyn Connector>,
    media: Arc<dyn MediaServerFactory>,
    services: Services,
    device: Arc<Device>,
    router: Router,
    backoff: Duration,
}

impl ReconnectManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        media: Arc<dyn MediaServerFactory>,
        services: Services,
        device: Arc<Device>,
    ) -> Self {
        let backoff = Duration::from_secs(device.config.bus.reconnect_backoff_secs);
        Self {
            connector,
            media,
            services,
            device,
            router: Router::new(),
            backoff,
        }
    }

    /// Run sessions until one ends with the host going down.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            match self.run_once().await {
                SessionEnd::Halt => {
                    info!("reconnect: host going down, stopping");
                    return Ok(());
                }
                SessionEnd::Reconnect => {
                    info!("reconnect: endpoints changed, reconnecting");
                }
                SessionEnd::Lost(reason) => {
                    warn!(
                        "reconnect: {}; retrying in {}s",
                        reason,
                        self.backoff.as_secs()
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// One session, from reading the endpoints to closing the transport.
    pub async fn run_once(&self) -> SessionEnd {
        // Endpoints are re-read every time; handlers may have changed them.
        let store = self.services.store.as_ref();
        let endpoint = match BrokerEndpoint::from_store(store) {
            Ok(endpoint) => endpoint,
            Err(e) => return SessionEnd::Lost(e.to_string()),
        };
        let media = match self.media_client() {
            Ok(media) => media,
            Err(reason) => return SessionEnd::Lost(reason),
        };

        let mut connection = match self.connector.connect(&endpoint).await {
            Ok(connection) => connection,
            Err(e) => return SessionEnd::Lost(e.to_string()),
        };

        let session = Session {
            bus: connection.bus.clone(),
            media,
            services: self.services.clone(),
            device: self.device.clone(),
        };
        let end = session::run(session, &mut connection.events, &self.router).await;
        connection.close().await;
        end
    }

    fn media_client(&self) -> Result<Arc<dyn MediaServerClient>, String> {
        let raw = self
            .services
            .store
            .read(keys::LMS_HOST)
            .ok_or_else(|| format!("{} is not set", keys::LMS_HOST))?;
        let (host, port) = split_host_port(&raw, DEFAULT_LMS_PORT)
            .ok_or_else(|| format!("bad {}: {:?}", keys::LMS_HOST, raw))?;
        self.media.connect(&host, port).map_err(|e| e.to_string())
    }
}
