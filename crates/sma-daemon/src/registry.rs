//! Image references, version tags and the installed/latest resolution the
//! registry poller publishes.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use sma_proto::platform::ImagePlatform;
use tracing::{debug, warn};

use crate::compose::ContainerRuntime;
use crate::error::CallError;

pub const DEFAULT_REGISTRY: &str = "ghcr.io";
pub const DEFAULT_ORG: &str = "library";
pub const FLOATING_TAG: &str = "latest";

/// `[registry/][org/]repo[:tag]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub org: String,
    pub repo: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let image = image.trim();
        let image = image.split_once('@').map_or(image, |(name, _)| name);
        let (name, tag) = match image.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (image, FLOATING_TAG),
        };

        let parts: Vec<&str> = name.split('/').collect();
        let (registry, org, repo) = match parts.as_slice() {
            [repo] => (DEFAULT_REGISTRY, DEFAULT_ORG.to_string(), repo.to_string()),
            [org, repo] => (DEFAULT_REGISTRY, org.to_string(), repo.to_string()),
            [registry, org, rest @ ..] => (*registry, org.to_string(), rest.join("/")),
            [] => (DEFAULT_REGISTRY, DEFAULT_ORG.to_string(), String::new()),
        };

        Self {
            registry: registry.to_string(),
            org,
            repo,
            tag: tag.to_string(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..self.clone()
        }
    }

    pub fn is_floating(&self) -> bool {
        self.tag == FLOATING_TAG
    }

    /// `org/repo`
    pub fn repository(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    /// Registry API base for this repository.
    pub fn api_base(&self) -> String {
        format!("https://{}/v2/{}", self.registry, self.repository())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository(), self.tag)
    }
}

/// A `v`-prefixed dotted-integer release tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTag {
    pub tag: String,
    parts: Vec<u64>,
}

impl VersionTag {
    pub fn parse(tag: &str) -> Option<Self> {
        let digits = tag.strip_prefix('v')?;
        let parts = digits
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            tag: tag.to_string(),
            parts,
        })
    }

    /// The version as published, without the `v`.
    pub fn version(&self) -> &str {
        &self.tag[1..]
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Release tags, newest first. `latest`, `main` and anything else that is
/// not a version are dropped.
pub fn sorted_versions(tags: &[String]) -> Vec<VersionTag> {
    let mut versions: Vec<VersionTag> = tags
        .iter()
        .filter(|t| t.as_str() != "latest" && t.as_str() != "main")
        .filter_map(|t| VersionTag::parse(t))
        .collect();
    versions.sort_by(|a, b| b.cmp(a));
    versions
}

/// Payload of an `update` entity; `None` serialises as `null` (unknown).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateState {
    pub installed_version: Option<String>,
    pub latest_version: Option<String>,
}

/// Check one compose service against its registry.
///
/// `Ok(None)` for locally built images, which have nothing to compare with.
pub async fn check_service(
    runtime: &dyn ContainerRuntime,
    platform: &ImagePlatform,
    service: &str,
) -> Result<Option<UpdateState>, CallError> {
    if runtime.is_local_build(service).await? {
        debug!("registry: {} is a local build", service);
        return Ok(None);
    }
    let reference = runtime.resolve_image(service).await?;
    let image = ImageRef::parse(&reference);

    let local = runtime.local_digest(&reference).await.unwrap_or_else(|e| {
        warn!("registry: local digest of {}: {}", reference, e);
        None
    });
    let remote = runtime
        .remote_manifest_digest(&image, platform)
        .await
        .unwrap_or_else(|e| {
            warn!("registry: remote digest of {}: {}", image, e);
            None
        });
    debug!(
        "registry: {} local={:?} remote={:?}",
        image, local, remote
    );

    let state = if image.is_floating() {
        let (installed, latest) =
            resolve_versions(runtime, &image, platform, local.as_deref(), remote.as_deref()).await;
        UpdateState {
            installed_version: installed,
            latest_version: latest,
        }
    } else {
        UpdateState {
            installed_version: local,
            latest_version: remote,
        }
    };
    Ok(Some(state))
}

/// Map the floating tag's local and remote digests to release versions by
/// walking the release tags newest first.
///
/// Stops as soon as every known digest has a version; a digest that matches
/// no release stays `None`.
pub async fn resolve_versions(
    runtime: &dyn ContainerRuntime,
    image: &ImageRef,
    platform: &ImagePlatform,
    local: Option<&str>,
    remote: Option<&str>,
) -> (Option<String>, Option<String>) {
    let mut installed = None;
    let mut latest = None;
    if local.is_none() && remote.is_none() {
        return (installed, latest);
    }

    let tags = match runtime.list_tags(image).await {
        Ok(tags) => tags,
        Err(e) => {
            warn!("registry: tags of {}: {}", image, e);
            return (installed, latest);
        }
    };

    for version in sorted_versions(&tags) {
        let digest = match runtime
            .remote_manifest_digest(&image.with_tag(&version.tag), platform)
            .await
        {
            Ok(Some(digest)) => digest,
            Ok(None) => continue,
            Err(e) => {
                debug!("registry: {}: {}", version.tag, e);
                continue;
            }
        };
        if installed.is_none() && local == Some(digest.as_str()) {
            installed = Some(version.version().to_string());
        }
        if latest.is_none() && remote == Some(digest.as_str()) {
            latest = Some(version.version().to_string());
        }
        let installed_done = local.is_none() || installed.is_some();
        let latest_done = remote.is_none() || latest.is_some();
        if installed_done && latest_done {
            break;
        }
    }
    (installed, latest)
}
