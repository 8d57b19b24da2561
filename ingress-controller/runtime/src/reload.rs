use crate::{core::Configuration, grpc::Reload};
use anyhow::{Context, Result};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Writes each fully reloaded configuration to a file as JSON.
///
/// The file is replaced atomically, so readers never observe a partial configuration.
#[derive(Clone, Debug)]
pub struct FileReload {
    path: PathBuf,
}

// === impl FileReload ===

impl FileReload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait::async_trait]
impl Reload for FileReload {
    async fn reload(&self, config: Arc<Configuration>) -> Result<()> {
        let json = config.to_json()?;
        let tmp = self.staging_path();
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), bytes = json.len(), "Wrote configuration");
        Ok(())
    }
}
