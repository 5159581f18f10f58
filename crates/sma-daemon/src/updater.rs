use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::error::CallError;

/// Asks the per-service update agent (watchtower HTTP API) to pull and
/// recreate its containers.
#[async_trait]
pub trait UpdateTrigger: Send + Sync {
    async fn trigger(&self, port: u16, token: Option<&str>) -> Result<(), CallError>;
}

pub struct WatchtowerTrigger {
    client: Client,
}

impl WatchtowerTrigger {
    pub fn new(timeout: Duration) -> Result<Self, CallError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::http("update trigger client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpdateTrigger for WatchtowerTrigger {
    async fn trigger(&self, port: u16, token: Option<&str>) -> Result<(), CallError> {
        let url = format!("http://127.0.0.1:{}/v1/update", port);
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CallError::http(&url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallError::parse(&url, format!("status {}", status)));
        }
        info!("update: triggered via {} ({})", url, status);
        Ok(())
    }
}
