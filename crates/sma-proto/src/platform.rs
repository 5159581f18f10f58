use std::path::{Path, PathBuf};

/// Prefix of every derived node id.
pub const NODE_ID_PREFIX: &str = "sma";

const SYS_CLASS_NET: &str = "/sys/class/net";

pub fn config_dir() -> PathBuf {
    // Keep ~/.config/sma/ even where dirs would pick something else
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sma")
}

/// Node id used in every topic: `sma` followed by the 12 hex digits of the
/// primary interface MAC address.
///
/// Falls back to an all-zero MAC when no usable interface is found so the
/// daemon still has a stable identity inside minimal containers.
pub fn node_id() -> String {
    let mac = primary_mac_address(Path::new(SYS_CLASS_NET)).unwrap_or_default();
    node_id_from_mac(&mac)
}

pub fn node_id_from_mac(mac: &str) -> String {
    let mut hex: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if hex.len() != 12 {
        hex = "0".repeat(12);
    }
    format!("{}{}", NODE_ID_PREFIX, hex)
}

/// First non-loopback interface (sorted by name) with a non-zero MAC.
fn primary_mac_address(sys_net: &Path) -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir(sys_net)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n != "lo")
        .collect();
    names.sort();

    for name in names {
        let path = sys_net.join(&name).join("address");
        if let Ok(addr) = std::fs::read_to_string(&path) {
            let addr = addr.trim();
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                return Some(addr.to_string());
            }
        }
    }
    None
}

/// Container image platform matching the host CPU, as listed in an OCI
/// image index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlatform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl ImagePlatform {
    pub fn host() -> Option<Self> {
        Self::for_arch(std::env::consts::ARCH)
    }

    pub fn for_arch(arch: &str) -> Option<Self> {
        let (architecture, variant) = match arch {
            "aarch64" => ("arm64", None),
            "arm" | "armv7l" => ("arm", Some("v7")),
            "x86_64" => ("amd64", None),
            _ => return None,
        };
        Some(Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        })
    }
}

impl std::fmt::Display for ImagePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}
