use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

use crate::registry::PersistedState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable single-document snapshot of the registry. Pending deliveries are
/// never written; a restart abandons them.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }

    /// Load the last snapshot. A missing file is a fresh start, not an
    /// error; a corrupt file is reported so the caller can log and start
    /// fresh anyway.
    pub async fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
