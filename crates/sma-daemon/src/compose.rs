//! Container runtime: `docker compose` for the appliance's services plus the
//! registry HTTP API for image digests and tags.
//!
//! Registry access follows the anonymous token flow:
//!
//! ```text
//!   GET https://<registry>/token?scope=repository:<org>/<repo>:pull  → token
//!   GET <api_base>/manifests/<tag>   (Bearer token, index media types)
//!   GET <api_base>/tags/list         (Bearer token)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sma_proto::platform::ImagePlatform;
use tracing::{debug, info};

use crate::error::CallError;
use crate::process::Runner;
use crate::registry::ImageRef;

const MANIFEST_ACCEPT: &str =
    "application/vnd.docker.distribution.manifest.v2+json,application/vnd.oci.image.index.v1+json";
const TOKEN_TTL: Duration = Duration::from_secs(240);

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Container name → state (`running`, `exited`, …).
    async fn status(&self) -> Result<HashMap<String, String>, CallError>;
    async fn up(&self, profile: &str, recreate: bool, service: Option<&str>)
        -> Result<(), CallError>;
    async fn is_local_build(&self, service: &str) -> Result<bool, CallError>;
    /// Image reference exactly as the compose file spells it.
    async fn resolve_image(&self, service: &str) -> Result<String, CallError>;
    /// Digest of the local image known under `image` (compose spelling).
    async fn local_digest(&self, image: &str) -> Result<Option<String>, CallError>;
    /// Digest of the manifest for `platform`; `None` when the registry has
    /// no such tag or platform.
    async fn remote_manifest_digest(
        &self,
        image: &ImageRef,
        platform: &ImagePlatform,
    ) -> Result<Option<String>, CallError>;
    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>, CallError>;
    async fn prune(&self) -> Result<(), CallError>;
}

pub struct DockerCompose {
    runner: Runner,
    env_file: PathBuf,
    client: Client,
    tokens: Mutex<HashMap<String, (Instant, String)>>,
}

impl DockerCompose {
    pub fn new(runner: Runner, env_file: PathBuf) -> Result<Self, CallError> {
        let client = Client::builder()
            .timeout(runner.timeout())
            .build()
            .map_err(|e| CallError::http("registry client", e))?;
        Ok(Self {
            runner,
            env_file,
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn compose_config(&self, rest: &[&str]) -> Result<String, CallError> {
        let env_file = self.env_file.to_string_lossy().to_string();
        let mut args = vec!["compose", "--env-file", env_file.as_str(), "config"];
        args.extend_from_slice(rest);
        Ok(self.runner.run("docker", &args).await?.stdout)
    }

    fn cached_token(&self, key: &str) -> Option<String> {
        let tokens = self.tokens.lock().ok()?;
        tokens
            .get(key)
            .filter(|(at, _)| at.elapsed() < TOKEN_TTL)
            .map(|(_, token)| token.clone())
    }

    async fn registry_token(&self, image: &ImageRef) -> Result<String, CallError> {
        let key = format!("{}/{}", image.registry, image.repository());
        if let Some(token) = self.cached_token(&key) {
            return Ok(token);
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let url = format!("https://{}/token", image.registry);
        let scope = format!("repository:{}:pull", image.repository());
        let response = self
            .client
            .get(&url)
            .query(&[
                ("service", image.registry.as_str()),
                ("scope", scope.as_str()),
                ("client_id", "shell"),
            ])
            .send()
            .await
            .map_err(|e| CallError::http(&url, e))?;
        if !response.status().is_success() {
            return Err(CallError::parse(&url, format!("status {}", response.status())));
        }
        let data: TokenResponse = response.json().await.map_err(|e| CallError::http(&url, e))?;

        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(key, (Instant::now(), data.token.clone()));
        }
        Ok(data.token)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCompose {
    async fn status(&self) -> Result<HashMap<String, String>, CallError> {
        let out = self
            .runner
            .run("docker", &["ps", "--format", "{{.Names}}:{{.State}}"])
            .await?;
        Ok(parse_ps(&out.stdout))
    }

    async fn up(
        &self,
        profile: &str,
        recreate: bool,
        service: Option<&str>,
    ) -> Result<(), CallError> {
        let env_file = self.env_file.to_string_lossy().to_string();
        let mut args = vec![
            "compose",
            "--env-file",
            env_file.as_str(),
            "--profile",
            profile,
            "up",
            "--detach",
        ];
        if recreate {
            args.push("--force-recreate");
        }
        if let Some(service) = service {
            args.push(service);
        }
        let out = self.runner.run("docker", &args).await?;
        info!(
            "compose: up {}{}",
            service.unwrap_or("(all)"),
            if recreate { " (recreate)" } else { "" }
        );
        debug!("compose: {}", out.stderr.trim());
        Ok(())
    }

    async fn is_local_build(&self, service: &str) -> Result<bool, CallError> {
        let json = self.compose_config(&["--format", "json", service]).await?;
        let doc: Value = serde_json::from_str(&json)
            .map_err(|e| CallError::parse("compose config", e.to_string()))?;
        let svc = doc
            .get("services")
            .and_then(|s| s.get(service))
            .ok_or_else(|| CallError::parse("compose config", format!("no service {}", service)))?;
        Ok(svc.get("build").is_some())
    }

    async fn resolve_image(&self, service: &str) -> Result<String, CallError> {
        let out = self.compose_config(&["--images", service]).await?;
        let image = out
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| CallError::parse("compose config --images", "empty output"))?;
        Ok(image.to_string())
    }

    async fn local_digest(&self, image: &str) -> Result<Option<String>, CallError> {
        let out = self
            .runner
            .run("docker", &["images", "-q", "--no-trunc", image])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    async fn remote_manifest_digest(
        &self,
        image: &ImageRef,
        platform: &ImagePlatform,
    ) -> Result<Option<String>, CallError> {
        let token = self.registry_token(image).await?;
        let url = format!("{}/manifests/{}", image.api_base(), image.tag);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| CallError::http(&url, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let doc: Value = response.json().await.map_err(|e| CallError::http(&url, e))?;
        Ok(platform_digest(&doc, platform, header_digest))
    }

    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>, CallError> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }

        let token = self.registry_token(image).await?;
        let url = format!("{}/tags/list", image.api_base());
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| CallError::http(&url, e))?;
        if !response.status().is_success() {
            return Err(CallError::parse(&url, format!("status {}", response.status())));
        }
        let list: TagList = response.json().await.map_err(|e| CallError::http(&url, e))?;
        Ok(list.tags)
    }

    async fn prune(&self) -> Result<(), CallError> {
        let out = self.runner.run("docker", &["image", "prune", "-f"]).await?;
        info!("compose: {}", out.stdout.trim());
        Ok(())
    }
}

/// `name:state` per line.
fn parse_ps(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .map(|(name, state)| (name.to_string(), state.to_string()))
        .collect()
}

/// Pick the manifest for `platform` out of an image index. A plain
/// single-platform manifest is identified by its content digest header.
fn platform_digest(
    doc: &Value,
    platform: &ImagePlatform,
    header_digest: Option<String>,
) -> Option<String> {
    if doc.get("errors").is_some() {
        return None;
    }
    let manifests = match doc.get("manifests").and_then(Value::as_array) {
        Some(m) => m,
        None => return header_digest,
    };
    manifests
        .iter()
        .find(|m| {
            let p = &m["platform"];
            p["os"].as_str() == Some(platform.os.as_str())
                && p["architecture"].as_str() == Some(platform.architecture.as_str())
                && match &platform.variant {
                    Some(v) => p["variant"].as_str() == Some(v.as_str()),
                    None => true,
                }
        })
        .and_then(|m| m["digest"].as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_container_states() {
        let status = parse_ps("supervisor:running\nsqueezelite1:exited\n\nsqueezelite2:running\n");
        assert_eq!(status.len(), 3);
        assert_eq!(status["supervisor"], "running");
        assert_eq!(status["squeezelite1"], "exited");
    }

    fn index() -> Value {
        json!({
            "schemaVersion": 2,
            "manifests": [
                { "digest": "sha256:amd", "platform": { "architecture": "amd64", "os": "linux" } },
                { "digest": "sha256:v7", "platform": { "architecture": "arm", "os": "linux", "variant": "v7" } },
                { "digest": "sha256:v8", "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" } },
            ]
        })
    }

    #[test]
    fn picks_manifest_for_host_platform() {
        let v7 = ImagePlatform::for_arch("armv7l").unwrap();
        assert_eq!(platform_digest(&index(), &v7, None).as_deref(), Some("sha256:v7"));

        let arm64 = ImagePlatform::for_arch("aarch64").unwrap();
        assert_eq!(platform_digest(&index(), &arm64, None).as_deref(), Some("sha256:v8"));
    }

    #[test]
    fn registry_errors_mean_absent() {
        let amd = ImagePlatform::for_arch("x86_64").unwrap();
        let doc = json!({ "errors": [{ "code": "MANIFEST_UNKNOWN" }] });
        assert_eq!(platform_digest(&doc, &amd, Some("sha256:x".into())), None);

        let single = json!({ "schemaVersion": 2, "config": {} });
        assert_eq!(
            platform_digest(&single, &amd, Some("sha256:single".into())).as_deref(),
            Some("sha256:single")
        );
    }
}
