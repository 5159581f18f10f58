//! Configuration backup: tar the configured paths, copy the archive to the
//! remote host over ssh, remove the local copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sma_proto::config::BackupConfig;
use sma_proto::keys;
use sma_proto::store::ConfigStore;
use tracing::info;

use crate::error::CallError;
use crate::process::Runner;

#[async_trait]
pub trait BackupService: Send + Sync {
    async fn create_local(&self) -> Result<PathBuf, CallError>;
    async fn copy_to_remote(&self, archive: &Path) -> Result<(), CallError>;
    async fn delete_local(&self, archive: &Path) -> Result<(), CallError>;
}

/// Remote side of a backup, read from the store at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Remote {
    host: String,
    port: String,
    user: String,
    password: Option<String>,
    folder: String,
}

impl Remote {
    fn from_store(store: &dyn ConfigStore) -> Result<Self, CallError> {
        let host = store
            .read(keys::BACKUP_SSH_HOST)
            .ok_or_else(|| CallError::NotConfigured(keys::BACKUP_SSH_HOST.to_string()))?;
        let user = store
            .read(keys::BACKUP_SSH_USER)
            .ok_or_else(|| CallError::NotConfigured(keys::BACKUP_SSH_USER.to_string()))?;
        Ok(Self {
            host,
            port: store
                .read(keys::BACKUP_SSH_PORT)
                .unwrap_or_else(|| "22".to_string()),
            user,
            password: store.read(keys::BACKUP_SSH_PASSWORD),
            folder: store.read(keys::BACKUP_SSH_FOLDER).unwrap_or_default(),
        })
    }

    /// `user@host:folder/`
    fn target(&self) -> String {
        let folder = self.folder.trim_end_matches('/');
        if folder.is_empty() {
            format!("{}@{}:", self.user, self.host)
        } else {
            format!("{}@{}:{}/", self.user, self.host, folder)
        }
    }
}

pub struct SshBackup {
    runner: Runner,
    store: Arc<dyn ConfigStore>,
    config: BackupConfig,
    node_id: String,
}

impl SshBackup {
    pub fn new(
        runner: Runner,
        store: Arc<dyn ConfigStore>,
        config: BackupConfig,
        node_id: &str,
    ) -> Self {
        Self {
            runner,
            store,
            config,
            node_id: node_id.to_string(),
        }
    }

    fn archive_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        self.config
            .staging_dir
            .join(format!("{}-backup-{}.tar.gz", self.node_id, stamp))
    }
}

#[async_trait]
impl BackupService for SshBackup {
    async fn create_local(&self) -> Result<PathBuf, CallError> {
        let archive = self.archive_path();
        let archive_s = archive.to_string_lossy().to_string();
        let paths: Vec<String> = self
            .config
            .paths
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        if paths.is_empty() {
            return Err(CallError::NotConfigured("backup paths".to_string()));
        }

        let mut args = vec!["-czf", archive_s.as_str()];
        args.extend(paths.iter().map(String::as_str));
        self.runner.run("tar", &args).await?;
        info!("backup: created {}", archive.display());
        Ok(archive)
    }

    async fn copy_to_remote(&self, archive: &Path) -> Result<(), CallError> {
        let remote = Remote::from_store(self.store.as_ref())?;
        let archive_s = archive.to_string_lossy().to_string();
        let target = remote.target();
        let scp_args = [
            "-P",
            remote.port.as_str(),
            "-o",
            "StrictHostKeyChecking=accept-new",
            archive_s.as_str(),
            target.as_str(),
        ];

        match &remote.password {
            Some(password) => {
                let mut args = vec!["-e", "scp"];
                args.extend(scp_args);
                self.runner
                    .run_with_env("sshpass", &args, &[("SSHPASS", password.as_str())])
                    .await?;
            }
            None => {
                let mut args = vec!["-o", "BatchMode=yes"];
                args.extend(scp_args);
                self.runner.run("scp", &args).await?;
            }
        }
        info!("backup: copied {} to {}", archive.display(), target);
        Ok(())
    }

    async fn delete_local(&self, archive: &Path) -> Result<(), CallError> {
        tokio::fs::remove_file(archive)
            .await
            .map_err(|source| CallError::Spawn {
                program: format!("rm {}", archive.display()),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sma_proto::store::MemoryStore;

    #[test]
    fn remote_from_store() {
        let store = MemoryStore::with(&[
            ("BACKUP_SSH_HOST", "nas"),
            ("BACKUP_SSH_USER", "pi"),
            ("BACKUP_SSH_FOLDER", "backups/sma/"),
        ]);
        let remote = Remote::from_store(&store).unwrap();
        assert_eq!(remote.port, "22");
        assert_eq!(remote.password, None);
        assert_eq!(remote.target(), "pi@nas:backups/sma/");

        assert!(matches!(
            Remote::from_store(&MemoryStore::new()),
            Err(CallError::NotConfigured(_))
        ));
    }

    #[test]
    fn archive_lands_in_staging_dir() {
        let config = BackupConfig {
            paths: vec![],
            staging_dir: PathBuf::from("/tmp/stage"),
        };
        let backup = SshBackup::new(
            Runner::new(std::time::Duration::from_secs(1)),
            Arc::new(MemoryStore::new()),
            config,
            "sma000000000001",
        );
        let path = backup.archive_path();
        assert!(path.starts_with("/tmp/stage"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("sma000000000001-backup-"));
        assert!(name.ends_with(".tar.gz"));
    }
}
