//! Media server (Lyrion / Logitech Media Server) access.
//!
//! Player queries go through the JSON-RPC endpoint (`/jsonrpc.js`,
//! `slim.request`). Servers without a configured address are found with the
//! UDP discovery broadcast on port 3483.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sma_proto::state::player_id;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::CallError;

pub const DEFAULT_LMS_PORT: u16 = 9000;
const DISCOVERY_PORT: u16 = 3483;

#[async_trait]
pub trait MediaServerClient: Send + Sync {
    async fn get_player_name(&self, channel: u8) -> Result<Option<String>, CallError>;
    async fn set_player_name(&self, channel: u8, name: &str) -> Result<(), CallError>;
    async fn power_off_player(&self, channel: u8) -> Result<(), CallError>;
}

/// Builds the media-server client for a session from the configured address.
pub trait MediaServerFactory: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn MediaServerClient>, CallError>;
}

pub struct LmsFactory {
    timeout: Duration,
}

impl LmsFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl MediaServerFactory for LmsFactory {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn MediaServerClient>, CallError> {
        Ok(Arc::new(LmsClient::new(host, port, self.timeout)?))
    }
}

pub struct LmsClient {
    client: Client,
    url: String,
}

impl LmsClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, CallError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::http("media server client", e))?;
        Ok(Self {
            client,
            url: format!("http://{}:{}/jsonrpc.js", host, port),
        })
    }

    async fn request(&self, channel: u8, command: Value) -> Result<Value, CallError> {
        let player = player_id(channel);
        let body = json!({
            "id": 1,
            "method": "slim.request",
            "params": [player, command],
        });
        let what = format!("media server {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::http(&what, e))?;
        if !response.status().is_success() {
            return Err(CallError::parse(&what, format!("status {}", response.status())));
        }
        let data: Value = response.json().await.map_err(|e| CallError::http(&what, e))?;
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl MediaServerClient for LmsClient {
    async fn get_player_name(&self, channel: u8) -> Result<Option<String>, CallError> {
        let result = self.request(channel, json!(["name", "?"])).await?;
        Ok(result
            .get("_value")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set_player_name(&self, channel: u8, name: &str) -> Result<(), CallError> {
        self.request(channel, json!(["name", name])).await?;
        Ok(())
    }

    async fn power_off_player(&self, channel: u8) -> Result<(), CallError> {
        self.request(channel, json!(["power", "0"])).await?;
        Ok(())
    }
}

// ── discovery ─────────────────────────────────────────────────────────────────

/// Broadcast a discovery request and return the first server that answers
/// with its JSON-RPC port.
pub async fn discover(wait: Duration) -> Result<Option<(String, u16)>, CallError> {
    let io = |e: std::io::Error| CallError::Spawn {
        program: "media server discovery".to_string(),
        source: e,
    };
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.map_err(io)?;
    socket.set_broadcast(true).map_err(io)?;
    socket
        .send_to(b"eJSON\0", (Ipv4Addr::BROADCAST, DISCOVERY_PORT))
        .await
        .map_err(io)?;

    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = [0u8; 1024];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let (len, from): (usize, SocketAddr) = match received {
            Err(_) => return Ok(None),
            Ok(r) => r.map_err(io)?,
        };
        match parse_discovery_reply(&buf[..len]) {
            Some(port) => {
                info!("lms: discovered server at {}:{}", from.ip(), port);
                return Ok(Some((from.ip().to_string(), port)));
            }
            None => debug!("lms: ignoring discovery reply from {}", from),
        }
    }
}

/// `E` followed by TLVs of 4-byte tag, 1-byte length, value.
fn parse_discovery_reply(reply: &[u8]) -> Option<u16> {
    let mut rest = reply.strip_prefix(b"E")?;
    while rest.len() >= 5 {
        let (tag, len) = (&rest[..4], rest[4] as usize);
        let value = rest.get(5..5 + len)?;
        if tag == b"JSON" {
            return std::str::from_utf8(value).ok()?.parse().ok();
        }
        rest = &rest[5 + len..];
    }
    None
}
