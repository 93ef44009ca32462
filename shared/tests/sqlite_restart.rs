#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use common::{FakeRemote, Rig};
use tasknotes_sync::storage::SqliteStorage;
use tasknotes_sync::{EntityKind, EntityPatch, EntityPayload, SyncStatus, Task};

#[tokio::test]
async fn queued_work_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let remote = FakeRemote::new();

    // 1. First session: offline edits
    let local_id = {
        let rig = Rig::with_config(
            Arc::new(SqliteStorage::new(&path)),
            remote.clone(),
            common::test_config(),
        )
        .await;
        let created = rig
            .pipeline
            .create(EntityPayload::Task(Task::new("before restart")))
            .await
            .unwrap();
        rig.pipeline
            .update(
                EntityKind::Task,
                &created.id,
                EntityPatch::task_title("edited offline"),
            )
            .await
            .unwrap();
        created.id
    };

    // 2. Second session sees the same cache and queue
    let rig = Rig::with_config(
        Arc::new(SqliteStorage::new(&path)),
        remote.clone(),
        common::test_config(),
    )
    .await;
    assert_eq!(rig.queue.len().await, 2);
    let tasks = rig.pipeline.list(EntityKind::Task).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, local_id);
    assert_eq!(tasks[0].payload.title(), "edited offline");

    // 3. Reconnect and converge
    rig.go_online().await;
    rig.drain().await;
    assert_eq!(remote.creates(), 1);
    assert!(rig.queue.is_empty().await);
    let tasks = rig.pipeline.list(EntityKind::Task).await.unwrap();
    assert_eq!(tasks[0].sync_status, SyncStatus::Synced);
    assert_eq!(
        remote.record(&tasks[0].id).unwrap().payload.title(),
        "edited offline"
    );
}

#[tokio::test]
async fn completed_actions_are_gone_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let remote = FakeRemote::new();

    {
        let rig = Rig::with_config(
            Arc::new(SqliteStorage::new(&path)),
            remote.clone(),
            common::test_config(),
        )
        .await;
        rig.pipeline
            .create(EntityPayload::Task(Task::new("t")))
            .await
            .unwrap();
        rig.go_online().await;
        rig.drain().await;
    }

    let rig = Rig::with_config(
        Arc::new(SqliteStorage::new(&path)),
        remote.clone(),
        common::test_config(),
    )
    .await;
    assert!(rig.queue.is_empty().await);
    rig.go_online().await;
    rig.drain().await;
    assert_eq!(remote.creates(), 1, "nothing is replayed twice");
}
