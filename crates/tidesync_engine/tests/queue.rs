//! Mutation queue behavior: ordering, durability, cancellation and
//! conflict resolution.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tidesync_engine::{
    ConflictHook, EngineError, EventBus, ClientEvent, MockTransport, MutationPriority,
    MutationQueue, MutationRequest, QueueConfig,
};
use tidesync_protocol::{ConflictState, Operation};
use tidesync_store::{KeyValueTable, MemoryTable};

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn mutation(name: &str) -> Operation {
    Operation::mutation(name, format!("mutation {name} {{ result }}"))
}

fn offline_config() -> QueueConfig {
    QueueConfig {
        start_online: false,
        ..QueueConfig::default()
    }
}

#[tokio::test]
async fn fifty_mutations_complete_in_enqueue_order() {
    let transport = Arc::new(MockTransport::new());
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        QueueConfig::default(),
    )
    .unwrap();

    for i in 0..50 {
        queue.enqueue(MutationRequest::new(mutation(&format!("m{i:02}")))).unwrap();
    }
    wait_until(|| transport.executed_mutations().len() == 50).await;

    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    let expected: Vec<String> = (0..50).map(|i| format!("m{i:02}")).collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn at_most_one_mutation_in_flight() {
    let transport = Arc::new(MockTransport::new());
    transport.gate_mutations();
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        QueueConfig::default(),
    )
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    for name in ["first", "second"] {
        let completed = completed.clone();
        queue
            .enqueue(MutationRequest::new(mutation(name)).on_result(move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }

    wait_until(|| transport.started_mutations() == 1).await;
    // The second must not start while the first is held in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.started_mutations(), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    transport.release_mutation();
    wait_until(|| transport.started_mutations() == 2).await;
    // The second started only after the first completed.
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    transport.release_mutation();
    wait_until(|| completed.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn cancelling_a_queued_mutation_removes_it_everywhere() {
    let table = Arc::new(MemoryTable::new());
    let transport = Arc::new(MockTransport::new());
    let bus = EventBus::new();
    let queue =
        MutationQueue::open(table.clone(), transport.clone(), &bus, offline_config()).unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    queue.enqueue(MutationRequest::new(mutation("keep_a"))).unwrap();
    let handle = {
        let fired = fired.clone();
        queue
            .enqueue(MutationRequest::new(mutation("doomed")).on_result(move |_| {
                fired.store(true, Ordering::SeqCst);
            }))
            .unwrap()
    };
    queue.enqueue(MutationRequest::new(mutation("keep_b"))).unwrap();
    assert_eq!(table.len().unwrap(), 3);

    handle.cancel();
    handle.cancel(); // idempotent
    assert_eq!(queue.pending_len(), 2);
    assert_eq!(table.len().unwrap(), 2);

    queue.set_online(true);
    wait_until(|| transport.executed_mutations().len() == 2).await;
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    assert_eq!(names, vec!["keep_a", "keep_b"]);
    assert!(!fired.load(Ordering::SeqCst), "cancelled handler must never fire");
}

#[tokio::test]
async fn offline_queue_holds_work_and_drains_once_on_reachability() {
    let transport = Arc::new(MockTransport::new());
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        offline_config(),
    )
    .unwrap();

    for name in ["a", "b", "c"] {
        queue.enqueue(MutationRequest::new(mutation(name))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.executed_mutations().len(), 0);

    bus.publish(ClientEvent::ReachabilityChanged { reachable: true });
    wait_until(|| transport.executed_mutations().len() == 3).await;

    // No duplicates, original order.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn persisted_mutations_survive_reopen_in_order() {
    let table = Arc::new(MemoryTable::new());
    let transport = Arc::new(MockTransport::new());
    let bus = EventBus::new();
    {
        let queue =
            MutationQueue::open(table.clone(), transport.clone(), &bus, offline_config())
                .unwrap();
        for name in ["one", "two", "three"] {
            queue.enqueue(MutationRequest::new(mutation(name))).unwrap();
        }
        assert_eq!(table.len().unwrap(), 3);
    }

    // "Restart": a fresh queue over the same table drains the backlog.
    let queue =
        MutationQueue::open(table.clone(), transport.clone(), &bus, QueueConfig::default())
            .unwrap();
    wait_until(|| transport.executed_mutations().len() == 3).await;
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    assert_eq!(names, vec!["one", "two", "three"]);
    wait_until(|| table.len().unwrap() == 0).await;
    assert!(queue.is_idle());
}

#[tokio::test]
async fn high_priority_jumps_ahead_of_queued_normals() {
    let transport = Arc::new(MockTransport::new());
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        offline_config(),
    )
    .unwrap();

    queue.enqueue(MutationRequest::new(mutation("normal_a"))).unwrap();
    queue.enqueue(MutationRequest::new(mutation("normal_b"))).unwrap();
    queue
        .enqueue(
            MutationRequest::new(mutation("urgent")).with_priority(MutationPriority::High),
        )
        .unwrap();

    queue.set_online(true);
    wait_until(|| transport.executed_mutations().len() == 3).await;
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    assert_eq!(names, vec!["urgent", "normal_a", "normal_b"]);
}

#[tokio::test(start_paused = true)]
async fn persistently_failing_mutation_goes_terminal_and_queue_advances() {
    let transport = Arc::new(MockTransport::new());
    // The backoff gives up on the twelfth consecutive failure; every
    // attempt of the first mutation gets a 503.
    for _ in 0..12 {
        transport.push_mutation_response(Err(EngineError::transport_status("unavailable", 503)));
    }
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        QueueConfig::default(),
    )
    .unwrap();

    let failed = Arc::new(AtomicBool::new(false));
    {
        let failed = failed.clone();
        queue
            .enqueue(MutationRequest::new(mutation("doomed")).on_result(move |result| {
                failed.store(result.is_err(), Ordering::SeqCst);
            }))
            .unwrap();
    }
    queue.enqueue(MutationRequest::new(mutation("next"))).unwrap();

    // More than the whole exponential ladder (about 410s of backoff).
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert!(failed.load(Ordering::SeqCst), "exhausted retries must be reported");
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    let doomed = names.iter().filter(|n| *n == "doomed").count();
    assert_eq!(doomed, 12, "one initial attempt plus eleven retries");
    assert_eq!(names.last().map(String::as_str), Some("next"));
    assert!(queue.is_idle());
}

struct Rewrite {
    replacement: Mutex<Option<Operation>>,
}

impl ConflictHook for Rewrite {
    fn resolve(&self, _server_state: &ConflictState) -> Option<Operation> {
        self.replacement.lock().take()
    }
}

#[tokio::test]
async fn conflict_hook_replacement_runs_next() {
    let transport = Arc::new(MockTransport::new());
    transport.push_mutation_response(Err(EngineError::Conflict(ConflictState::new(
        json!({"version": 7}),
    ))));
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        QueueConfig::default(),
    )
    .unwrap();

    let outcome_ok = Arc::new(AtomicBool::new(false));
    let hook = Arc::new(Rewrite {
        replacement: Mutex::new(Some(mutation("create_v7"))),
    });
    {
        let outcome_ok = outcome_ok.clone();
        queue
            .enqueue(
                MutationRequest::new(mutation("create"))
                    .with_conflict_hook(hook)
                    .on_result(move |result| {
                        outcome_ok.store(result.is_ok(), Ordering::SeqCst);
                    }),
            )
            .unwrap();
    }

    wait_until(|| transport.executed_mutations().len() == 2).await;
    let names: Vec<String> = transport
        .executed_mutations()
        .iter()
        .map(|op| op.name.clone())
        .collect();
    assert_eq!(names, vec!["create", "create_v7"]);
    wait_until(|| outcome_ok.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn conflict_abandonment_is_a_terminal_conflict_outcome() {
    let transport = Arc::new(MockTransport::new());
    transport.push_mutation_response(Err(EngineError::Conflict(ConflictState::new(
        json!({"version": 2}),
    ))));
    let bus = EventBus::new();
    let queue = MutationQueue::open(
        Arc::new(MemoryTable::new()),
        transport.clone(),
        &bus,
        QueueConfig::default(),
    )
    .unwrap();

    let saw_conflict = Arc::new(AtomicBool::new(false));
    let hook = Arc::new(Rewrite {
        replacement: Mutex::new(None), // abandon
    });
    {
        let saw_conflict = saw_conflict.clone();
        queue
            .enqueue(
                MutationRequest::new(mutation("create"))
                    .with_conflict_hook(hook)
                    .on_result(move |result| {
                        saw_conflict.store(
                            matches!(result, Err(EngineError::Conflict(_))),
                            Ordering::SeqCst,
                        );
                    }),
            )
            .unwrap();
    }

    wait_until(|| saw_conflict.load(Ordering::SeqCst)).await;
    assert_eq!(transport.executed_mutations().len(), 1);
}
