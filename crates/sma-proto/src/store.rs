//! Persisted key/value settings shared with the compose stack.
//!
//! The backing file is the compose `.env` file, so every value written here
//! is also visible to the containers on their next (re)creation.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config store {path}: {message}")]
    Persist { path: PathBuf, message: String },
}

/// Read/update access to persisted settings.
///
/// Empty values read as absent.
pub trait ConfigStore: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

impl<'a> dyn ConfigStore + 'a {
    /// Read and parse a value, treating unparsable values as absent.
    pub fn read_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.read(key)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("config store: ignoring unparsable value for {}: {:?}", key, raw);
                None
            }
        }
    }

    pub fn read_or_empty(&self, key: &str) -> String {
        self.read(key).unwrap_or_default()
    }
}

// ── dotenv file ───────────────────────────────────────────────────────────────

pub struct EnvFileStore {
    path: PathBuf,
    // Serialises read-modify-write cycles between handlers on different workers.
    lock: Mutex<()>,
}

impl EnvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> HashMap<String, String> {
        let iter = match dotenvy::from_path_iter(&self.path) {
            Ok(iter) => iter,
            Err(e) => {
                debug!("config store: cannot open {:?}: {}", self.path, e);
                return HashMap::new();
            }
        };
        let mut values = HashMap::new();
        for item in iter {
            match item {
                Ok((k, v)) => {
                    values.insert(k, v);
                }
                Err(e) => warn!("config store: skipping bad line in {:?}: {}", self.path, e),
            }
        }
        values
    }

    fn rewrite(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let updated = replace_or_append(&content, key, value);

        // Temp file lives beside the target so the rename stays on one filesystem
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(updated.as_bytes()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| StoreError::Persist {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        // Containers read the file under another uid; temp files are created 0600
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o666))
                .map_err(io_err)?;
        }
        Ok(())
    }
}

impl ConfigStore for EnvFileStore {
    fn read(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load().remove(key).filter(|v| !v.is_empty())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        debug!("config store: {} updated", key);
        self.rewrite(key, value)
    }
}

/// Replace the first `KEY=` assignment (optionally `export`ed) or append one.
fn replace_or_append(content: &str, key: &str, value: &str) -> String {
    let mut out = String::with_capacity(content.len() + key.len() + value.len() + 2);
    let mut replaced = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let is_key = assignment
            .split_once('=')
            .map(|(k, _)| k.trim() == key)
            .unwrap_or(false);

        if is_key && !replaced && !trimmed.starts_with('#') {
            out.push_str(&assignment_line(key, value));
            replaced = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    if !replaced {
        out.push_str(&assignment_line(key, value));
    }
    out
}

/// `KEY=value`, quoted so the dotenv reader returns `value` unchanged.
///
/// Plain values stay bare. Anything else is single-quoted, which keeps `$`,
/// `#` and whitespace literal; values containing a single quote or a newline
/// fall back to double quotes with `\`, `"`, `$` and newlines escaped.
fn assignment_line(key: &str, value: &str) -> String {
    let bare = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-.:/@,;+%".contains(c));
    if bare {
        format!("{}={}\n", key, value)
    } else if !value.contains('\'') && !value.contains('\n') {
        format!("{}='{}'\n", key, value)
    } else {
        let mut escaped = String::with_capacity(value.len() + 8);
        for c in value.chars() {
            match c {
                '\\' | '"' | '$' => {
                    escaped.push('\\');
                    escaped.push(c);
                }
                '\n' => escaped.push_str("\\n"),
                c => escaped.push(c),
            }
        }
        format!("{}=\"{}\"\n", key, escaped)
    }
}

// ── in-memory ─────────────────────────────────────────────────────────────────

/// Volatile store, used when no env file is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(pairs: &[(&str, &str)]) -> Self {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
