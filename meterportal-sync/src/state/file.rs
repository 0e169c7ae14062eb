use std::{io::ErrorKind, path::PathBuf};

use meterportal_client::domain::StatisticId;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{PollConfig, PollConfigStore, Snapshot, StateError, WatermarkStore};

/// JSON state file, rewritten through a temp file and rename on every change.
///
/// A change is only visible to readers after it has reached disk, so a failed
/// write leaves both the file and the in-memory view untouched.
pub struct FileStateStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl FileStateStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let mut snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no state file yet, starting empty");
                Snapshot::default()
            }
            Err(e) => return Err(e.into()),
        };
        snapshot.sanitize();

        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl WatermarkStore for FileStateStore {
    async fn watermark(&self, statistic_id: &StatisticId) -> Result<Option<OffsetDateTime>, StateError> {
        Ok(self.snapshot.lock().await.watermark(statistic_id))
    }

    async fn advance(&self, statistic_id: &StatisticId, to: OffsetDateTime) -> Result<(), StateError> {
        let mut current = self.snapshot.lock().await;
        let mut next = current.clone();
        if !next.advance(statistic_id, to) {
            return Ok(());
        }
        self.persist(&next).await?;
        *current = next;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PollConfigStore for FileStateStore {
    async fn poll_config(&self, account_id: &str) -> Result<Option<PollConfig>, StateError> {
        Ok(self.snapshot.lock().await.poll_configs.get(account_id).copied())
    }

    async fn set_poll_config(&self, account_id: &str, config: PollConfig) -> Result<(), StateError> {
        let mut current = self.snapshot.lock().await;
        let mut next = current.clone();
        next.poll_configs.insert(account_id.to_string(), config);
        self.persist(&next).await?;
        *current = next;
        Ok(())
    }
}
