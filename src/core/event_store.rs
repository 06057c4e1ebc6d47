//! Append-only event store with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. Each run owns one directory under
//! `$GANTRY_HOME/runs/<run-id>/` holding `events.jsonl`, an `artifacts/`
//! tree, and a lock file that keeps two engine processes from driving the
//! same run.

use std::fs::File as StdFile;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, EventType, RunManifest};

/// File-based event store using JSONL format
pub struct EventStore {
    /// The run this store belongs to
    run_id: Uuid,

    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Held for the store's lifetime; exclusive per run directory
    _lock: Option<StdFile>,
}

impl EventStore {
    /// Create or open an event store for a run, taking the run-dir lock
    pub async fn open(run_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        Self::open_in(&base_dir, run_id).await
    }

    /// Create or open an event store under an explicit base directory
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let lock_path = run_dir.join(".lock");
        let lock = StdFile::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!("Run {} is already being driven by another process", run_id)
        })?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_id,
            run_dir,
            events_path,
            _lock: Some(lock),
        })
    }

    /// Open a store for read-only replay (no lock taken)
    pub async fn open_readonly(run_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        let run_dir = base_dir.join(run_id.to_string());

        if !run_dir.exists() {
            anyhow::bail!("Run {} not found", run_id);
        }

        Ok(Self {
            run_id,
            events_path: run_dir.join("events.jsonl"),
            run_dir,
            _lock: None,
        })
    }

    /// Get the base directory for all runs ($GANTRY_HOME/runs)
    pub fn base_directory() -> Result<PathBuf> {
        crate::config::runs_dir()
    }

    /// The run this store belongs to
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Write the run manifest (trigger metadata, pipeline name)
    pub async fn store_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let path = self.run_dir.join("run.json");
        let json = serde_json::to_vec_pretty(manifest).context("Failed to serialize manifest")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write manifest: {}", path.display()))
    }

    /// Load the run manifest, if one was written
    pub async fn load_manifest(&self) -> Result<Option<RunManifest>> {
        let path = self.run_dir.join("run.json");
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let manifest =
            serde_json::from_slice(&bytes).context("Failed to parse run manifest")?;
        Ok(Some(manifest))
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all run IDs in the base directory
    pub async fn list_runs() -> Result<Vec<Uuid>> {
        let base_dir = Self::base_directory()?;
        Self::list_runs_in(&base_dir).await
    }

    /// List all run IDs under an explicit base directory
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, TempDir, Uuid) {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        (store, temp_dir, run_id)
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let (store, _temp, run_id) = create_test_store().await;

        let event1 = Event::run_level(run_id, EventType::RunStarted, "pipeline 'ci' started");
        let event2 = Event::job_level(run_id, "test", EventType::JobStarted, "Job 'test' dispatched");

        store.append(&event1).await.unwrap();
        store.append(&event2).await.unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::JobStarted);
    }

    #[tokio::test]
    async fn test_event_replay_order() {
        let (store, _temp, run_id) = create_test_store().await;

        for i in 0..5 {
            let event = Event::job_level(
                run_id,
                format!("job{}", i),
                EventType::JobStarted,
                format!("Job {} dispatched", i),
            );
            store.append(&event).await.unwrap();
        }

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 5);

        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.job_id, Some(format!("job{}", i)));
        }
    }

    #[tokio::test]
    async fn test_run_dir_lock_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();

        let _store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        let second = EventStore::open_in(temp_dir.path(), run_id).await;

        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();

        {
            let _store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        }

        let reopened = EventStore::open_in(temp_dir.path(), run_id).await;
        assert!(reopened.is_ok());
    }

    #[tokio::test]
    async fn test_list_runs_in() {
        let temp_dir = TempDir::new().unwrap();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        {
            let _a = EventStore::open_in(temp_dir.path(), run_a).await.unwrap();
            let _b = EventStore::open_in(temp_dir.path(), run_b).await.unwrap();
        }
        // Non-run directories are ignored
        std::fs::create_dir(temp_dir.path().join("not-a-uuid")).unwrap();

        let mut runs = EventStore::list_runs_in(temp_dir.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![run_a, run_b];
        expected.sort();
        assert_eq!(runs, expected);
    }

    #[tokio::test]
    async fn test_last_event_of_type() {
        let (store, _temp, run_id) = create_test_store().await;

        store
            .append(&Event::run_level(run_id, EventType::RunStarted, "started"))
            .await
            .unwrap();
        store
            .append(&Event::job_level(run_id, "a", EventType::JobSucceeded, "a done"))
            .await
            .unwrap();
        store
            .append(&Event::job_level(run_id, "b", EventType::JobSucceeded, "b done"))
            .await
            .unwrap();

        let last = store
            .last_event_of_type(EventType::JobSucceeded)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.job_id.as_deref(), Some("b"));

        assert!(store
            .last_event_of_type(EventType::RunFailed)
            .await
            .unwrap()
            .is_none());
    }
}
