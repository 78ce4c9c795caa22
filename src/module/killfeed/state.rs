///! Persisted ingestion state with backup-file rotation
///!
///! Single-writer model: only the scheduler mutates the state file. `load`
///! never fails; the worst case is starting from a zero-value state and
///! reprocessing a bounded window of events.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Current on-disk shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Guild-feed watermark: processed through and including this id.
    pub cursor: i64,
    pub seen_kills: Vec<i64>,
    pub seen_deaths: Vec<i64>,
    #[serde(default)]
    pub saved_at: String,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            cursor: 0,
            seen_kills: Vec::new(),
            seen_deaths: Vec::new(),
            saved_at: String::new(),
        }
    }
}

/// Shape written by the predecessor bot. Kept readable so an upgrade does not
/// replay a whole feed page.
#[derive(Debug, Deserialize)]
struct LegacyState {
    last_event_id: i64,
    #[serde(default)]
    kill_ids: Vec<i64>,
    #[serde(default)]
    death_ids: Vec<i64>,
}

impl From<LegacyState> for PersistedState {
    fn from(legacy: LegacyState) -> Self {
        Self {
            cursor: legacy.last_event_id,
            seen_kills: legacy.kill_ids,
            seen_deaths: legacy.death_ids,
            saved_at: String::new(),
        }
    }
}

/// Explicit union of the accepted file shapes. The current shape is tried
/// first; anything matching neither falls through to the backup file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StateOnDisk {
    Current(PersistedState),
    Legacy(LegacyState),
}

impl From<StateOnDisk> for PersistedState {
    fn from(on_disk: StateOnDisk) -> Self {
        match on_disk {
            StateOnDisk::Current(state) => state,
            StateOnDisk::Legacy(legacy) => {
                info!("Loaded legacy state file shape, converting");
                legacy.into()
            }
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let backup_path = {
            let mut os = path.clone().into_os_string();
            os.push(".bak");
            PathBuf::from(os)
        };
        Self { path, backup_path }
    }

    /// Read primary, fall back to backup, fall back to zero-value state.
    pub async fn load(&self) -> PersistedState {
        match Self::try_read(&self.path).await {
            Ok(state) => {
                info!(
                    "Loaded state: cursor={}, {} seen kills, {} seen deaths",
                    state.cursor,
                    state.seen_kills.len(),
                    state.seen_deaths.len()
                );
                return state;
            }
            Err(e) => warn!("Primary state file unusable ({:#}), trying backup", e),
        }

        match Self::try_read(&self.backup_path).await {
            Ok(state) => {
                info!("Recovered state from backup: cursor={}", state.cursor);
                state
            }
            Err(e) => {
                warn!("Backup state file unusable ({:#}), starting fresh", e);
                PersistedState::default()
            }
        }
    }

    async fn try_read(path: &Path) -> Result<PersistedState> {
        let content = fs::read_to_string(path)
            .await
            .context(format!("Failed to read {:?}", path))?;
        if content.trim().is_empty() {
            anyhow::bail!("State file {:?} is empty", path);
        }
        let on_disk: StateOnDisk =
            serde_json::from_str(&content).context(format!("Failed to parse {:?}", path))?;
        Ok(on_disk.into())
    }

    /// Rotate primary to backup (best effort), then write the new state.
    /// The caller is expected to hand in already-trimmed, sorted sets.
    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create state directory")?;
        }

        if fs::try_exists(&self.path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(&self.path, &self.backup_path).await {
                warn!("Failed to rotate state backup: {}", e);
            }
        }

        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        fs::write(&self.path, content)
            .await
            .context(format!("Failed to write {:?}", self.path))?;

        debug!("Saved state: cursor={}", state.cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> PersistedState {
        PersistedState {
            cursor: 1000,
            seen_kills: vec![10, 20, 30],
            seen_deaths: vec![5, 6],
            saved_at: "2026-08-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        store.save(&sample_state()).await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded, sample_state());
    }

    #[tokio::test]
    async fn missing_files_yield_zero_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let loaded = store.load().await;
        assert_eq!(loaded, PersistedState::default());
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let backup = serde_json::to_string(&sample_state()).unwrap();
        std::fs::write(dir.path().join("state.json.bak"), backup).unwrap();
        std::fs::write(&path, "{ definitely not json").unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded, sample_state());
    }

    #[tokio::test]
    async fn empty_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let backup = serde_json::to_string(&sample_state()).unwrap();
        std::fs::write(dir.path().join("state.json.bak"), backup).unwrap();
        std::fs::write(&path, "   \n").unwrap();

        assert_eq!(store.load().await, sample_state());
    }

    #[tokio::test]
    async fn legacy_shape_is_converted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        std::fs::write(
            &path,
            r#"{"last_event_id": 555, "kill_ids": [1, 2], "death_ids": [3]}"#,
        )
        .unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.cursor, 555);
        assert_eq!(loaded.seen_kills, vec![1, 2]);
        assert_eq!(loaded.seen_deaths, vec![3]);
    }

    #[tokio::test]
    async fn save_rotates_previous_file_to_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let first = sample_state();
        let mut second = sample_state();
        second.cursor = 2000;

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let backup_content =
            std::fs::read_to_string(dir.path().join("state.json.bak")).unwrap();
        let backup: PersistedState = serde_json::from_str(&backup_content).unwrap();
        assert_eq!(backup, first);
        assert_eq!(store.load().await, second);
    }
}
