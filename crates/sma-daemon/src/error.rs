use thiserror::Error;

/// Loss or refusal of the pub/sub transport. Recovered by reconnecting.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },
    #[error("subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },
}

/// A collaborator (process or remote service) returned a non-success result.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{program}: failed to start: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program}: exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: i32,
        stderr: String,
    },
    #[error("{what}: timed out after {secs}s")]
    Timeout { what: String, secs: u64 },
    #[error("{what}: {source}")]
    Http {
        what: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{what}: {source}")]
    DBus {
        what: String,
        #[source]
        source: zbus::Error,
    },
    #[error("{what}: unexpected response: {detail}")]
    Parse { what: String, detail: String },
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("mdns: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

impl CallError {
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        CallError::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn http(what: impl Into<String>, source: reqwest::Error) -> Self {
        CallError::Http {
            what: what.into(),
            source,
        }
    }
}
