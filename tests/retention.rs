//! Artifact retention tests.
//!
//! Uses filetime to backdate run directories so the GC sweep can be tested
//! without waiting out a real retention window.

use std::time::Duration;

use filetime::FileTime;
use tempfile::TempDir;
use uuid::Uuid;

use gantry::core::ArtifactStore;
use gantry::domain::ArtifactHandle;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn backdate(path: &std::path::Path, days: u64) {
    let then = std::time::SystemTime::now() - DAY * days as u32;
    let mtime = FileTime::from_system_time(then);
    filetime::set_file_mtime(path, mtime).unwrap();
}

#[tokio::test]
async fn sweep_removes_only_expired_runs() {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::new(temp.path());

    let old_run = Uuid::new_v4();
    let fresh_run = Uuid::new_v4();

    store
        .put(ArtifactHandle::new(old_run, "build", "dist"), b"old")
        .await
        .unwrap();
    store
        .put(ArtifactHandle::new(fresh_run, "build", "dist"), b"fresh")
        .await
        .unwrap();

    backdate(&temp.path().join(old_run.to_string()), 40);

    let removed = store.sweep_expired(30 * DAY).await.unwrap();
    assert_eq!(removed, 1);

    assert!(store
        .get(&ArtifactHandle::new(old_run, "build", "dist"))
        .await
        .is_err());
    assert_eq!(
        store
            .get(&ArtifactHandle::new(fresh_run, "build", "dist"))
            .await
            .unwrap(),
        b"fresh"
    );
}

#[tokio::test]
async fn sweep_ignores_foreign_directories() {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::new(temp.path());

    let stray = temp.path().join("not-a-run");
    std::fs::create_dir(&stray).unwrap();
    backdate(&stray, 100);

    let removed = store.sweep_expired(30 * DAY).await.unwrap();
    assert_eq!(removed, 0);
    assert!(stray.exists());
}

#[tokio::test]
async fn sweep_on_missing_base_dir_is_a_noop() {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::new(temp.path().join("never-created"));

    let removed = store.sweep_expired(30 * DAY).await.unwrap();
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn zero_retention_expires_everything_stored_earlier() {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::new(temp.path());

    let run = Uuid::new_v4();
    store
        .put(ArtifactHandle::new(run, "build", "dist"), b"x")
        .await
        .unwrap();
    backdate(&temp.path().join(run.to_string()), 1);

    let removed = store.sweep_expired(Duration::ZERO).await.unwrap();
    assert_eq!(removed, 1);
}
