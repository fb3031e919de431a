use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{StateStorage, Subscribers};

/// Keeps all subscriptions in one pretty-printed JSON file, keyed by
/// subscriber id. Saves go through a temporary file and a rename so a crash
/// mid-write never leaves a truncated file behind.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut file_name = self.path.file_name().unwrap_or_default().to_os_string();
        file_name.push(".tmp");
        self.path.with_file_name(file_name)
    }
}

#[async_trait]
impl StateStorage for JsonFileStorage {
    async fn load(&self) -> Result<Subscribers> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "no subscription file yet, starting empty");
            return Ok(Subscribers::new());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    async fn save(&self, subscribers: &Subscribers) -> Result<()> {
        let contents = serde_json::to_string_pretty(subscribers)?;
        let temp_path = self.temp_path();

        tokio::fs::write(&temp_path, contents)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), subscribers = subscribers.len(), "saved subscriptions");
        Ok(())
    }
}
