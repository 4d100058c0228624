//! Client facade: storage wiring, durable replay through a reopen and
//! cache clearing.

use std::sync::Arc;
use std::time::Duration;

use tidesync_cache::{FieldValue, Record, RecordSet};
use tidesync_engine::{
    ClearCacheOptions, MockRealtime, MockTransport, MutationRequest, QueueConfig, StorageConfig,
    SyncClient, SyncSessionConfig,
};
use tidesync_protocol::Operation;

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn open_client(storage: StorageConfig, online: bool) -> (SyncClient, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let client = SyncClient::open(
        transport.clone(),
        Arc::new(MockRealtime::new()),
        storage,
        QueueConfig {
            start_online: online,
            ..QueueConfig::default()
        },
        SyncSessionConfig::default(),
    )
    .unwrap();
    (client, transport)
}

#[tokio::test]
async fn offline_mutations_replay_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig::in_directory(dir.path());

    {
        let (client, transport) = open_client(storage.clone(), false);
        for name in ["first", "second"] {
            client
                .mutate(MutationRequest::new(Operation::mutation(
                    name,
                    format!("mutation {name} {{ result }}"),
                )))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.executed_mutations().len(), 0);
    }

    // A new client over the same directory finds and delivers them.
    let (client, transport) = open_client(storage, true);
    wait_until(|| transport.executed_mutations().len() == 2).await;
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    assert_eq!(names, vec!["first", "second"]);
    wait_until(|| client.queue().is_idle()).await;
}

#[tokio::test]
async fn clear_caches_empties_the_selected_stores() {
    let (client, _transport) = open_client(StorageConfig::in_memory(), false);

    let mut records = RecordSet::new();
    let mut post = Record::new();
    post.insert("id", FieldValue::from("Post:1"));
    records.insert("Post:1", post);
    client.cache().merge(records).unwrap();
    client
        .mutate(MutationRequest::new(Operation::mutation(
            "Pending",
            "mutation Pending { result }",
        )))
        .unwrap();
    assert_eq!(client.queue().pending_len(), 1);

    client.clear_caches(ClearCacheOptions::default()).unwrap();
    assert_eq!(client.queue().pending_len(), 0);
    let loaded = client.cache().load(&["Post:1".to_string()]).unwrap();
    assert!(loaded[0].is_none());
}

#[tokio::test]
async fn clear_caches_can_target_a_subset() {
    let (client, _transport) = open_client(StorageConfig::in_memory(), false);
    client
        .mutate(MutationRequest::new(Operation::mutation(
            "Kept",
            "mutation Kept { result }",
        )))
        .unwrap();

    // Queries only; the queued mutation survives.
    client
        .clear_caches(ClearCacheOptions {
            queries: true,
            mutations: false,
            sync_metadata: false,
        })
        .unwrap();
    assert_eq!(client.queue().pending_len(), 1);
}
