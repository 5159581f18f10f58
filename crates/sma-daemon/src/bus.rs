//! MQTT transport with a dedicated event-loop pump task.
//!
//! Architecture:
//!
//! ```text
//!   MqttConnector::connect()
//!         │
//!         ├── MqttBus        ← publish / subscribe, cheap to share
//!         └── pump task      ← polls the rumqttc event loop
//!                                ├── ConnAck          → connect() returns
//!                                ├── Publish          → BusEvent::Message
//!                                └── connection error → BusEvent::Lost, exit
//! ```
//!
//! The pump keeps the event loop polled while handlers run, so outgoing
//! publishes are flushed even while the command loop is busy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use sma_proto::keys;
use sma_proto::store::ConfigStore;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::BusError;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug)]
pub enum BusEvent {
    Message(InboundMessage),
    /// The transport is gone; no further events follow.
    Lost(BusError),
}

/// Publish/subscribe side of a connected session.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    async fn disconnect(&self);
}

/// A live transport: the bus handle plus its inbound event stream.
pub struct Connection {
    pub bus: Arc<dyn Bus>,
    pub events: mpsc::Receiver<BusEvent>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl Connection {
    pub fn new(bus: Arc<dyn Bus>, events: mpsc::Receiver<BusEvent>) -> Self {
        Self {
            bus,
            events,
            pump: None,
        }
    }

    pub async fn close(self) {
        self.bus.disconnect().await;
        if let Some(pump) = self.pump {
            pump.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Connection, BusError>;
}

// ── endpoint ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl BrokerEndpoint {
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self, BusError> {
        let raw = store
            .read(keys::MQTT_HOST)
            .ok_or_else(|| BusError::Connect(format!("{} is not set", keys::MQTT_HOST)))?;
        let (host, port) = split_host_port(&raw, DEFAULT_MQTT_PORT)
            .ok_or_else(|| BusError::Connect(format!("bad {}: {:?}", keys::MQTT_HOST, raw)))?;
        Ok(Self {
            host,
            port,
            user: store.read(keys::MQTT_USER),
            password: store.read(keys::MQTT_PASSWORD),
        })
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Split `host[:port]`, using `default_port` when the port is missing.
pub fn split_host_port(raw: &str, default_port: u16) -> Option<(String, u16)> {
    let raw = raw.trim();
    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (raw, default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

// ── rumqttc ───────────────────────────────────────────────────────────────────

pub struct MqttConnector {
    client_id_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(client_id_prefix: &str, keep_alive: Duration, connect_timeout: Duration) -> Self {
        Self {
            client_id_prefix: client_id_prefix.to_string(),
            keep_alive,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Connection, BusError> {
        let suffix: u32 = rand::thread_rng().gen();
        let client_id = format!("{}-{:08x}", self.client_id_prefix, suffix);

        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(user) = &endpoint.user {
            options.set_credentials(user.clone(), endpoint.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (connected_tx, connected_rx) = oneshot::channel();

        info!("bus: connecting to {}", endpoint);
        let pump = tokio::spawn(pump_task(eventloop, event_tx, connected_tx));

        let acked = tokio::time::timeout(self.connect_timeout, connected_rx).await;
        match acked {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                pump.abort();
                return Err(BusError::Connect(reason));
            }
            Ok(Err(_)) => {
                pump.abort();
                return Err(BusError::Connect("event loop exited".to_string()));
            }
            Err(_) => {
                pump.abort();
                return Err(BusError::Connect(format!(
                    "no acknowledgement within {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        }
        info!("bus: connected to {}", endpoint);

        let mut connection = Connection::new(Arc::new(MqttBus { client }), event_rx);
        connection.pump = Some(pump);
        Ok(connection)
    }
}

struct MqttBus {
    client: AsyncClient,
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("bus: disconnect: {}", e);
        }
    }
}

async fn pump_task(
    mut eventloop: EventLoop,
    event_tx: mpsc::Sender<BusEvent>,
    connected_tx: oneshot::Sender<Result<(), String>>,
) {
    let mut connected_tx = Some(connected_tx);
    let lost = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(tx) = connected_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = InboundMessage {
                    topic: p.topic.clone(),
                    payload: String::from_utf8_lossy(&p.payload).to_string(),
                };
                debug!("bus: <- {} {:?}", msg.topic, msg.payload);
                if !forward(&event_tx, msg) {
                    debug!("bus: session gone, pump exiting");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => match connected_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                None => break BusError::ConnectionLost(e.to_string()),
            },
        }
    };

    // Publishes blocked on the request queue fail once the loop is gone.
    drop(eventloop);
    warn!("bus: {}", lost);
    let _ = event_tx.send(BusEvent::Lost(lost)).await;
}

/// Hand a message to the session without waiting on it; the session may be
/// blocked on a publish that only this loop can drain. Returns `false` once
/// the session is gone.
fn forward(event_tx: &mpsc::Sender<BusEvent>, msg: InboundMessage) -> bool {
    match event_tx.try_send(BusEvent::Message(msg)) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            if let BusEvent::Message(msg) = event {
                warn!("bus: session busy, dropping message on {}", msg.topic);
            }
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
