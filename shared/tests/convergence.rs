//! Random edit sessions across connectivity changes end with local and
//! remote state in agreement once the device stays online.

mod common;

use std::sync::Arc;

use common::Rig;
use proptest::prelude::*;
use tasknotes_sync::{
    EntityKind, EntityPatch, EntityPayload, MemoryStorage, Note, RemoteError, SyncStatus,
};

#[derive(Debug, Clone)]
enum Op {
    Create,
    Rename(usize),
    Delete(usize),
    Online,
    Offline,
    Drain,
    ServerHiccup,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Create),
        3 => any::<usize>().prop_map(Op::Rename),
        2 => any::<usize>().prop_map(Op::Delete),
        1 => Just(Op::Online),
        1 => Just(Op::Offline),
        1 => Just(Op::Drain),
        1 => Just(Op::ServerHiccup),
    ]
}

const MAX_HICCUPS: usize = 3;

async fn run_session(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let rig = Rig::new(Arc::new(MemoryStorage::new())).await;
    let mut online = false;
    let mut hiccups = 0;
    let mut counter = 0;

    for op in ops {
        let visible = rig.pipeline.list(EntityKind::Note).await.unwrap();
        match op {
            Op::Create => {
                counter += 1;
                let payload = EntityPayload::Note(Note::new(format!("n{counter}"), "body"));
                rig.pipeline.create(payload).await.unwrap();
            }
            Op::Rename(pick) if !visible.is_empty() => {
                counter += 1;
                let target = &visible[pick % visible.len()];
                rig.pipeline
                    .update(
                        EntityKind::Note,
                        &target.id,
                        EntityPatch::note_title(format!("r{counter}")),
                    )
                    .await
                    .unwrap();
            }
            Op::Delete(pick) if !visible.is_empty() => {
                let target = &visible[pick % visible.len()];
                rig.pipeline.delete(EntityKind::Note, &target.id).await.unwrap();
            }
            Op::Online => {
                rig.go_online().await;
                online = true;
            }
            Op::Offline => {
                rig.go_offline().await;
                online = false;
            }
            Op::Drain if online => {
                rig.drain().await;
            }
            Op::ServerHiccup if hiccups < MAX_HICCUPS => {
                hiccups += 1;
                rig.remote
                    .fail_next(RemoteError::from_status(503, "unavailable"));
            }
            _ => {}
        }
    }

    // Settle: stay online until the queue empties.
    rig.go_online().await;
    for _ in 0..=MAX_HICCUPS + 1 {
        if rig.queue.is_empty().await {
            break;
        }
        rig.drain().await;
    }
    prop_assert!(rig.queue.is_empty().await, "queue did not drain");

    let visible = rig.pipeline.list(EntityKind::Note).await.unwrap();
    for snap in &visible {
        prop_assert_eq!(snap.sync_status, SyncStatus::Synced);
        prop_assert!(!snap.is_local, "{} was never promoted", snap.id);
    }

    let mut local: Vec<(String, String)> = visible
        .iter()
        .map(|s| (s.id.to_string(), s.payload.title().to_string()))
        .collect();
    let mut remote: Vec<(String, String)> = rig
        .remote
        .records()
        .iter()
        .map(|r| (r.id.to_string(), r.payload.title().to_string()))
        .collect();
    local.sort();
    remote.sort();
    prop_assert_eq!(local, remote);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn local_and_remote_converge(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_session(ops))?;
    }
}
