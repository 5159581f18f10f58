//! System-bus connection shared by the GPIO manager and logind clients.
//!
//! The connection is opened on first use, so a host without a system bus
//! only fails the calls that need one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use zbus::Connection;

use crate::error::CallError;

#[derive(Clone)]
pub struct SystemBus {
    connection: Arc<OnceCell<Connection>>,
    timeout: Duration,
}

impl SystemBus {
    pub fn new(timeout: Duration) -> Self {
        Self {
            connection: Arc::new(OnceCell::new()),
            timeout,
        }
    }

    pub async fn connection(&self) -> Result<Connection, CallError> {
        self.connection
            .get_or_try_init(|| self.call("system bus", Connection::system()))
            .await
            .cloned()
    }

    /// Run one D-Bus exchange under the collaborator timeout.
    pub async fn call<T, F>(&self, what: &str, exchange: F) -> Result<T, CallError>
    where
        F: Future<Output = zbus::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result.map_err(|source| CallError::DBus {
                what: what.to_string(),
                source,
            }),
            Err(_) => Err(CallError::Timeout {
                what: what.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stalled_exchange_times_out() {
        let bus = SystemBus::new(Duration::from_secs(30));
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = bus
            .call("io.gpiod1 GetValues", std::future::pending::<zbus::Result<()>>())
            .await;
        assert!(matches!(
            result,
            Err(CallError::Timeout { ref what, secs: 30 }) if what == "io.gpiod1 GetValues"
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn bus_errors_are_collaborator_failures() {
        let bus = SystemBus::new(Duration::from_secs(30));
        let result: Result<u32, _> = bus
            .call("login1 PowerOff", async {
                Err(zbus::Error::Failure("access denied".into()))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CallError::DBus { .. }));
        assert!(err.to_string().contains("login1 PowerOff"));
    }
}
