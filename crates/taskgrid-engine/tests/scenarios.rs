//! End-to-end engine scenarios over a shared in-memory store.
//!
//! Remote jobs are simulated with `RecordingClient`; their completion is
//! driven by calling `Engine::callback` the way a job would over HTTP.

use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use taskgrid_core::{
    Mode, Phase, RequestTemplate, Settings, StopFlag, Task, TaskDefinition, TaskGraph, TaskId,
    TaskState,
};
use taskgrid_engine::{
    CasRetry, DependencyPropagator, Engine, EngineError, EngineOptions, OutboundRequest,
    RecordingClient, RemoteAction, RemoteClient, RemoteError, RemoteResponse,
};
use taskgrid_state::{Keyspace, SETTINGS_KEY, StateStore};

fn engine_on(store: &StateStore, node: &str, client: &RecordingClient) -> Engine {
    Engine::new(
        store.clone(),
        Arc::new(client.clone()),
        EngineOptions {
            callback_base_url: "http://sched:8650".to_string(),
            node_id: node.to_string(),
            retry: CasRetry::default(),
        },
    )
}

fn setup() -> (Engine, RecordingClient) {
    let store = StateStore::open_in_memory().unwrap();
    let client = RecordingClient::new();
    (engine_on(&store, "node-a", &client), client)
}

fn job(id: &str) -> TaskDefinition {
    TaskDefinition::new(RequestTemplate::post(&format!("http://exec/{id}/start")))
}

fn cancellable(id: &str) -> TaskDefinition {
    let mut def = job(id);
    def.remote_cancel = Some(RequestTemplate::post(&format!("http://exec/{id}/cancel")));
    def
}

fn set_max(store: &StateStore, max: u32) {
    let settings = Settings {
        max_concurrency: max,
        ..Settings::default()
    };
    store.put(Keyspace::Settings, SETTINGS_KEY, &settings).unwrap();
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Drive a dispatched task to SUCCESSFUL the way a remote job would.
async fn complete(engine: &Engine, id: &str, result: serde_json::Value) {
    engine.callback(id, true, json!({"accepted": true})).await.unwrap();
    let task = engine.callback(id, true, result).await.unwrap();
    assert_eq!(task.state, TaskState::Successful);
}

fn state(engine: &Engine, id: &str) -> TaskState {
    engine.get_task(id).unwrap().state
}

// ── Install ────────────────────────────────────────────────────────

#[tokio::test]
async fn diamond_install_counts_in_degree_and_leaves_nothing_new() {
    let (engine, client) = setup();
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .task("c", job("c"))
        .task("d", job("d"))
        .edge("a", "b")
        .edge("a", "c")
        .edge("b", "d")
        .edge("c", "d");

    let tasks = engine.install(&graph).await.unwrap();
    assert_eq!(tasks.len(), 4);
    assert_eq!(tasks[0].id, "a");
    assert!(tasks.iter().all(|t| t.state != TaskState::New));

    let d = engine.get_task("d").unwrap();
    assert_eq!(d.unfinished_dependencies, 2);
    assert_eq!(d.state, TaskState::Waiting);
    assert_eq!(engine.get_task("b").unwrap().unfinished_dependencies, 1);
    assert_eq!(state(&engine, "a"), TaskState::Starting);
    assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a"]);
}

#[tokio::test]
async fn cyclic_graph_creates_no_tasks() {
    let (engine, client) = setup();
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "b")
        .edge("b", "c")
        .edge("c", "a");

    let err = engine.install(&graph).await.unwrap_err();
    assert!(matches!(err, EngineError::CircularDependency { .. }), "{err}");
    assert!(engine.list_tasks(None).unwrap().is_empty());
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn edge_from_failed_task_poisons_new_dependant() {
    let (engine, client) = setup();
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
    engine.callback("a", false, json!({"error": "oom"})).await.unwrap();

    let graph = TaskGraph::new()
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "b")
        .edge("b", "c");
    engine.install(&graph).await.unwrap();

    for id in ["b", "c"] {
        let task = engine.get_task(id).unwrap();
        assert_eq!(task.state, TaskState::Failed, "{id}");
        assert_eq!(task.stop_flag, StopFlag::DependencyFailed, "{id}");
    }
    assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a"]);
}

#[tokio::test]
async fn edge_from_successful_task_is_already_resolved() {
    let (engine, client) = setup();
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
    complete(&engine, "a", json!({"rows": 3})).await;

    engine
        .install(&TaskGraph::new().task("b", job("b")).edge("a", "b"))
        .await
        .unwrap();
    assert_eq!(state(&engine, "b"), TaskState::Starting);
    assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a", "b"]);
}

// ── Propagation ────────────────────────────────────────────────────

#[tokio::test]
async fn fan_out_enqueues_each_dependant_exactly_once() {
    let (engine, client) = setup();
    set_max(engine.store(), 1);
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "b")
        .edge("a", "c");
    engine.install(&graph).await.unwrap();

    complete(&engine, "a", json!({})).await;
    // One slot: b runs, c waits its turn in the queue.
    assert_eq!(state(&engine, "b"), TaskState::Starting);
    assert_eq!(state(&engine, "c"), TaskState::Enqueued);

    complete(&engine, "b", json!({})).await;
    assert_eq!(state(&engine, "c"), TaskState::Starting);
    assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn sole_dependency_failure_fails_dependant_without_dispatch() {
    let (engine, client) = setup();
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .edge("a", "b");
    engine.install(&graph).await.unwrap();

    engine.callback("a", true, json!({})).await.unwrap();
    let a = engine.callback("a", false, json!({"exit": 1})).await.unwrap();
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.stop_flag, StopFlag::SystemFailure);

    let b = engine.get_task("b").unwrap();
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(b.stop_flag, StopFlag::DependencyFailed);
    assert!(!client.sent_ids(RemoteAction::Start).contains(&"b".to_string()));
    assert_eq!(engine.admission_usage().unwrap().used, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_propagation_never_double_decrements() {
    let (engine, _client) = setup();
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "c")
        .edge("b", "c");
    engine.install(&graph).await.unwrap();
    complete(&engine, "a", json!({})).await;
    assert_eq!(engine.get_task("c").unwrap().unfinished_dependencies, 1);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let propagator = DependencyPropagator::new(engine.store().clone(), CasRetry::default());
        handles.push(tokio::spawn(async move { propagator.on_terminal("a").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let c = engine.get_task("c").unwrap();
    assert_eq!(c.unfinished_dependencies, 1);
    assert_eq!(c.state, TaskState::Waiting);
}

#[tokio::test]
async fn forwarded_results_reach_the_start_request() {
    let (engine, client) = setup();
    let mut consumer = job("b");
    consumer.configuration.forward_results = true;
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", consumer)
        .edge("a", "b");
    engine.install(&graph).await.unwrap();

    complete(&engine, "a", json!({"rows": 3})).await;

    let starts = client.sent(RemoteAction::Start);
    let b = starts.iter().find(|r| r.task_id == "b").unwrap();
    assert_eq!(b.body["dependency_results"]["a"], json!({"rows": 3}));
    assert_eq!(b.body["callback_url"], "http://sched:8650/api/v1/tasks/b/callback");
}

#[tokio::test]
async fn caller_is_notified_on_completion() {
    let (engine, client) = setup();
    let mut def = job("a");
    def.caller_notification = Some(RequestTemplate::post("http://caller/done"));
    engine.install(&TaskGraph::new().task("a", def)).await.unwrap();

    complete(&engine, "a", json!({})).await;
    let notes = client.sent(RemoteAction::Notify);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].body["state"], json!(TaskState::Successful));
    assert_eq!(notes[0].body["stop_flag"], json!(StopFlag::None));
}

// ── Admission ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pokes_from_many_engines_respect_the_bound() {
    let store = StateStore::open_in_memory().unwrap();
    let client = RecordingClient::new();
    set_max(&store, 0);
    let installer = engine_on(&store, "node-0", &client);
    let mut graph = TaskGraph::new();
    for i in 0..12 {
        graph = graph.task(&format!("t{i:02}"), job(&format!("t{i:02}")));
    }
    installer.install(&graph).await.unwrap();
    assert!(client.requests().is_empty());

    set_max(&store, 3);
    let mut handles = Vec::new();
    for node in 0..6 {
        let engine = engine_on(&store, &format!("node-{node}"), &client);
        handles.push(tokio::spawn(async move { engine.poke().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let running = installer.list_tasks(Some(Phase::Running)).unwrap();
    assert_eq!(running.len(), 3);
    assert_eq!(installer.admission_usage().unwrap().used, 3);
    assert_eq!(client.sent(RemoteAction::Start).len(), 3);
    // Oldest first.
    let mut ids: Vec<_> = running.into_iter().map(|t| t.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["t00", "t01", "t02"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bound_of_one_admits_exactly_one_of_two() {
    let store = StateStore::open_in_memory().unwrap();
    let client = RecordingClient::new();
    set_max(&store, 0);
    let first = engine_on(&store, "node-a", &client);
    let second = engine_on(&store, "node-b", &client);
    first
        .install(&TaskGraph::new().task("a", job("a")).task("b", job("b")))
        .await
        .unwrap();

    set_max(&store, 1);
    let (x, y) = tokio::join!(first.poke(), second.poke());
    x.unwrap();
    y.unwrap();

    let starting: Vec<_> = first
        .list_tasks(None)
        .unwrap()
        .into_iter()
        .filter(|t| t.state == TaskState::Starting)
        .collect();
    assert_eq!(starting.len(), 1);
    assert_eq!(starting[0].id, "a");
    assert_eq!(state(&first, "b"), TaskState::Enqueued);
}

#[tokio::test]
async fn raising_the_bound_admits_waiting_work() {
    let (engine, _client) = setup();
    engine.set_max_concurrency(0).await.unwrap();
    engine
        .install(&TaskGraph::new().task("a", job("a")).task("b", job("b")))
        .await
        .unwrap();
    assert_eq!(engine.list_tasks(Some(Phase::Waiting)).unwrap().len(), 2);

    let settings = engine.set_max_concurrency(2).await.unwrap();
    assert_eq!(settings.max_concurrency, 2);
    assert_eq!(engine.max_concurrency().unwrap(), 2);
    assert_eq!(engine.list_tasks(Some(Phase::Running)).unwrap().len(), 2);
}

#[tokio::test]
async fn idle_task_waits_until_activated() {
    let (engine, client) = setup();
    let mut def = job("a");
    def.mode = Mode::Idle;
    engine.install(&TaskGraph::new().task("a", def)).await.unwrap();
    assert_eq!(state(&engine, "a"), TaskState::Waiting);

    let task = engine.set_mode("a", Mode::Active).await.unwrap();
    assert_eq!(task.state, TaskState::Starting);
    assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a"]);
}

#[tokio::test]
async fn unreachable_start_fails_task_and_frees_slot() {
    let (engine, client) = setup();
    client.set_unreachable("a");
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .edge("a", "b");
    engine.install(&graph).await.unwrap();

    let a = engine.get_task("a").unwrap();
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.stop_flag, StopFlag::SystemFailure);
    assert_eq!(engine.get_task("b").unwrap().stop_flag, StopFlag::DependencyFailed);
    assert_eq!(engine.admission_usage().unwrap().used, 0);
}

// ── Cancellation and rollback ──────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_racing_accept_settles_once() {
    for round in 0..8 {
        let store = StateStore::open_in_memory().unwrap();
        let client = RecordingClient::new();
        let operator = engine_on(&store, "node-a", &client);
        let listener = engine_on(&store, "node-b", &client);
        operator.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
        operator.callback("a", true, json!({})).await.unwrap();

        let (cancelled, accepted) = tokio::join!(
            operator.cancel("a"),
            listener.callback("a", true, json!({"done": round}))
        );
        let task = operator.get_task("a").unwrap();
        match task.state {
            TaskState::Failed => {
                assert_eq!(task.stop_flag, StopFlag::Cancelled);
                cancelled.unwrap();
                // The late success is kept as history only.
                accepted.unwrap();
            }
            TaskState::Successful => {
                assert!(matches!(cancelled, Err(EngineError::TaskConflict(_))));
                accepted.unwrap();
            }
            other => panic!("unexpected state {other}"),
        }
        let usage = operator.admission_usage().unwrap();
        assert_eq!(usage.used, 0, "round {round}");
        assert!(usage.holders.is_empty(), "round {round}");
    }
}

/// Forwards to a recorder, but cancels `victim` through a second engine
/// while the start request for `trigger` is in flight.
#[derive(Clone)]
struct CancelDuringStart {
    recorder: RecordingClient,
    trigger: TaskId,
    victim: TaskId,
    canceller: Arc<OnceLock<Engine>>,
}

#[async_trait]
impl RemoteClient for CancelDuringStart {
    async fn send(&self, request: &OutboundRequest) -> Result<RemoteResponse, RemoteError> {
        if request.action == RemoteAction::Start && request.task_id == self.trigger {
            let canceller = self.canceller.get().unwrap();
            canceller.cancel(&self.victim).await.unwrap();
        }
        self.recorder.send(request).await
    }
}

#[tokio::test]
async fn cancel_between_admit_and_dispatch_sends_no_start() {
    for with_cancel_endpoint in [false, true] {
        let store = StateStore::open_in_memory().unwrap();
        set_max(&store, 0);
        let recorder = RecordingClient::new();
        let remote = CancelDuringStart {
            recorder: recorder.clone(),
            trigger: "a".to_string(),
            victim: "b".to_string(),
            canceller: Arc::new(OnceLock::new()),
        };
        let canceller = engine_on(&store, "node-b", &recorder);
        assert!(remote.canceller.set(canceller).is_ok());
        let scheduler = Engine::new(store.clone(), Arc::new(remote), EngineOptions::default());

        let b = if with_cancel_endpoint { cancellable("b") } else { job("b") };
        let graph = TaskGraph::new().task("a", job("a")).task("b", b);
        scheduler.install(&graph).await.unwrap();
        assert_eq!(state(&scheduler, "b"), TaskState::Enqueued);

        // One poke admits both; b is cancelled while a's start is on the wire.
        scheduler.set_max_concurrency(2).await.unwrap();

        assert_eq!(recorder.sent_ids(RemoteAction::Start), vec!["a"]);
        let b = scheduler.get_task("b").unwrap();
        assert_eq!(b.stop_flag, StopFlag::Cancelled);
        let usage = scheduler.admission_usage().unwrap();
        assert!(usage.used <= usage.max);
        if with_cancel_endpoint {
            assert_eq!(b.state, TaskState::Stopping);
            assert_eq!(recorder.sent_ids(RemoteAction::Cancel), vec!["b"]);
            assert_eq!(usage.holders, vec!["a", "b"]);
        } else {
            assert_eq!(b.state, TaskState::Failed);
            assert_eq!(usage.holders, vec!["a"]);
        }
    }
}

#[tokio::test]
async fn cancel_poisons_every_transitive_dependant() {
    let (engine, _client) = setup();
    let mut head = job("a");
    head.configuration.rollback_limit = Some(1);
    let graph = TaskGraph::new()
        .task("a", head)
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "b")
        .edge("b", "c");
    engine.install(&graph).await.unwrap();

    let a = engine.cancel("a").await.unwrap();
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.stop_flag, StopFlag::Cancelled);
    assert_eq!(a.mode, Mode::Cancel);
    for id in ["b", "c"] {
        assert_eq!(engine.get_task(id).unwrap().stop_flag, StopFlag::DependencyFailed);
    }
}

#[tokio::test]
async fn rollback_limit_one_reaches_only_direct_dependants() {
    let (engine, _client) = setup();
    let mut head = job("a");
    head.configuration.rollback_limit = Some(1);
    let graph = TaskGraph::new()
        .task("a", head)
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "b")
        .edge("b", "c");
    engine.install(&graph).await.unwrap();

    engine.callback("a", false, json!({})).await.unwrap();
    assert_eq!(engine.get_task("b").unwrap().stop_flag, StopFlag::DependencyFailed);
    let c = engine.get_task("c").unwrap();
    assert_eq!(c.state, TaskState::Waiting);
    assert_eq!(c.stop_flag, StopFlag::None);
}

#[tokio::test]
async fn running_task_with_cancel_endpoint_stops_gracefully() {
    let (engine, client) = setup();
    engine.install(&TaskGraph::new().task("a", cancellable("a"))).await.unwrap();
    engine.callback("a", true, json!({})).await.unwrap();

    let task = engine.cancel("a").await.unwrap();
    assert_eq!(task.state, TaskState::Stopping);
    assert_eq!(client.sent_ids(RemoteAction::Cancel), vec!["a"]);
    assert_eq!(engine.admission_usage().unwrap().used, 1);

    let task = engine.callback("a", true, json!({"stopped": true})).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(engine.admission_usage().unwrap().used, 0);
}

#[tokio::test]
async fn cancel_of_finished_task_conflicts() {
    let (engine, _client) = setup();
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
    complete(&engine, "a", json!({})).await;

    let err = engine.cancel("a").await.unwrap_err();
    assert_eq!(err.kind(), "task_conflict");
    let err = engine.cancel("ghost").await.unwrap_err();
    assert_eq!(err.kind(), "task_not_found");
}

#[tokio::test]
async fn correlation_cancel_touches_only_its_tasks() {
    let (engine, _client) = setup();
    let tagged = |id: &str| {
        let mut def = job(id);
        def.correlation_id = Some("batch-7".to_string());
        def
    };
    let graph = TaskGraph::new()
        .task("a", tagged("a"))
        .task("b", tagged("b"))
        .task("other", job("other"));
    engine.install(&graph).await.unwrap();

    let cancelled = engine.cancel_correlation("batch-7").await.unwrap();
    assert_eq!(cancelled, vec!["a", "b"]);
    assert_eq!(state(&engine, "other"), TaskState::Starting);

    // Second call finds nothing left to cancel.
    assert!(engine.cancel_correlation("batch-7").await.unwrap().is_empty());
    assert!(matches!(
        engine.cancel_correlation("nope").await,
        Err(EngineError::TaskNotFound(_))
    ));
}

// ── Supervision ────────────────────────────────────────────────────

#[tokio::test]
async fn silent_task_is_failed_by_sweep() {
    let (engine, _client) = setup();
    engine
        .update_settings(Settings {
            heartbeat_interval_secs: 1,
            heartbeat_tolerance: 2,
            ..Settings::default()
        })
        .await
        .unwrap();
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
    engine.callback("a", true, json!({})).await.unwrap();

    let report = engine.sweep(now()).await.unwrap();
    assert!(report.is_empty());
    engine.heartbeat("a").await.unwrap();

    let report = engine.sweep(now() + 60).await.unwrap();
    assert_eq!(report.expired, vec!["a"]);
    let task = engine.get_task("a").unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.stop_flag, StopFlag::SystemFailure);
    assert_eq!(engine.admission_usage().unwrap().used, 0);
}

#[tokio::test]
async fn unacknowledged_cancel_times_out() {
    let (engine, _client) = setup();
    engine
        .update_settings(Settings {
            cancel_timeout_secs: 5,
            ..Settings::default()
        })
        .await
        .unwrap();
    engine.install(&TaskGraph::new().task("a", cancellable("a"))).await.unwrap();
    engine.callback("a", true, json!({})).await.unwrap();
    engine.cancel("a").await.unwrap();

    assert!(engine.sweep(now()).await.unwrap().cancel_timeouts.is_empty());
    let report = engine.sweep(now() + 30).await.unwrap();
    assert_eq!(report.cancel_timeouts, vec!["a"]);
    assert_eq!(state(&engine, "a"), TaskState::Failed);
    assert_eq!(engine.admission_usage().unwrap().used, 0);
}

#[tokio::test]
async fn sweep_returns_orphaned_claims() {
    let (engine, _client) = setup();
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
    assert_eq!(engine.admission_usage().unwrap().used, 1);

    // The task record disappears while its claim stays behind.
    engine.store().delete(Keyspace::Tasks, "a").unwrap();
    let report = engine.sweep(now()).await.unwrap();
    assert_eq!(report.reaped_claims, vec!["a"]);
    assert_eq!(engine.admission_usage().unwrap().used, 0);
}

#[tokio::test]
async fn sweep_settles_tasks_stranded_in_new() {
    let (engine, client) = setup();
    let stranded = Task::from_definition("a", job("a"), 1, now());
    engine.store().put(Keyspace::Tasks, "a", &stranded).unwrap();
    assert_eq!(state(&engine, "a"), TaskState::New);

    let report = engine.sweep(now()).await.unwrap();
    assert_eq!(report.evaluated, vec!["a"]);
    assert_eq!(state(&engine, "a"), TaskState::Starting);
    assert_eq!(client.sent_ids(RemoteAction::Start), vec!["a"]);

    assert!(engine.sweep(now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_poisons_new_task_behind_failed_dependency() {
    let (engine, _client) = setup();
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
    engine.cancel("a").await.unwrap();

    let mut stranded = Task::from_definition("b", job("b"), 2, now());
    stranded.dependencies.insert("a".to_string());
    stranded.unfinished_dependencies = 1;
    engine.store().put(Keyspace::Tasks, "b", &stranded).unwrap();

    let report = engine.sweep(now()).await.unwrap();
    assert_eq!(report.evaluated, vec!["b"]);
    let b = engine.get_task("b").unwrap();
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(b.stop_flag, StopFlag::DependencyFailed);
}

// ── Admin ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reset_clears_work_but_keeps_settings() {
    let (engine, _client) = setup();
    engine.set_max_concurrency(5).await.unwrap();
    engine
        .install(&TaskGraph::new().task("a", job("a")).task("b", job("b")))
        .await
        .unwrap();

    engine.reset().unwrap();
    assert!(engine.list_tasks(None).unwrap().is_empty());
    assert_eq!(engine.admission_usage().unwrap().used, 0);
    assert_eq!(engine.max_concurrency().unwrap(), 5);

    // Ids are free again.
    engine.install(&TaskGraph::new().task("a", job("a"))).await.unwrap();
}

#[tokio::test]
async fn list_filters_by_phase() {
    let (engine, _client) = setup();
    let graph = TaskGraph::new()
        .task("a", job("a"))
        .task("b", job("b"))
        .task("c", job("c"))
        .edge("a", "c");
    engine.install(&graph).await.unwrap();
    complete(&engine, "b", json!({})).await;

    let ids = |phase| -> Vec<String> {
        engine
            .list_tasks(Some(phase))
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect()
    };
    assert_eq!(ids(Phase::Running), vec!["a"]);
    assert_eq!(ids(Phase::Finished), vec!["b"]);
    assert_eq!(ids(Phase::Waiting), vec!["c"]);
    assert_eq!(engine.list_tasks(None).unwrap().len(), 3);
}
