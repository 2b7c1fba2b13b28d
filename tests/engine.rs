//! End-to-end engine scenarios over an in-memory push channel and
//! canned REST responses: initial fetch-through, push-driven growth
//! and in-place updates, wildcard interest collapse across tabs, and
//! leader failover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use buildcache::{
    ApiError, Bus, CacheStore, Collection, Config, Connector, DataClient, RestClient,
    SchemaRegistry, SocketEvent, SocketHandle,
};

/// Canned REST envelopes keyed by rest path.
struct StubRest {
    responses: HashMap<String, Value>,
    calls: AtomicUsize,
}

impl StubRest {
    fn new(responses: Vec<(&str, Value)>) -> Arc<Self> {
        Arc::new(Self {
            responses: responses
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RestClient for StubRest {
    async fn get(&self, path: &str, _params: &Map<String, Value>) -> Result<Value, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(path)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(path.to_string()))
    }

    async fn post(&self, _path: &str, body: Value) -> Result<Value, ApiError> {
        Ok(body)
    }
}

#[derive(Default)]
struct ServerState {
    commands: parking_lot::Mutex<Vec<(String, String)>>,
    connections: parking_lot::Mutex<Vec<mpsc::UnboundedSender<SocketEvent>>>,
}

/// In-memory push channel endpoint: opens immediately, acknowledges
/// every command with code 200 and records it, and lets tests inject
/// pushes.
#[derive(Clone)]
struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    fn new() -> Self {
        Self {
            state: Arc::new(ServerState::default()),
        }
    }

    fn commands(&self) -> Vec<(String, String)> {
        self.state.commands.lock().clone()
    }

    fn push(&self, key: &str, message: Value) {
        let frame = json!({"k": key, "m": message}).to_string();
        for connection in self.state.connections.lock().iter() {
            let _ = connection.send(SocketEvent::Message(frame.clone()));
        }
    }
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(&self) -> buildcache::Result<SocketHandle> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let _ = ev_tx.send(SocketEvent::Open);
        self.state.connections.lock().push(ev_tx.clone());

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let value: Value = match serde_json::from_str(&frame) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                let cmd = value["cmd"].as_str().unwrap_or_default().to_string();
                let path = value["path"].as_str().unwrap_or_default().to_string();
                state.commands.lock().push((cmd, path));
                let reply = json!({"_id": value["_id"], "code": 200}).to_string();
                let _ = ev_tx.send(SocketEvent::Message(reply));
            }
        });

        Ok(SocketHandle {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        api_base: "http://dash.example/api/v2".into(),
        ws_url: "ws://dash.example/ws".into(),
        cache_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    }
}

async fn settle() {
    // Virtual time; timers auto-advance while the loop is idle.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

fn ids_of(collection: &Collection) -> Vec<i64> {
    collection
        .ids()
        .iter()
        .filter_map(|id| id.as_i64())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn subscribe_fetch_push_update_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let rest = StubRest::new(vec![(
        "builds",
        json!({"builds": [
            {"buildid": 1, "complete": false},
            {"buildid": 2, "complete": false},
        ]}),
    )]);
    let server = FakeServer::new();
    let client = DataClient::new(&test_config(&dir), rest, Arc::new(server.clone()))
        .await
        .unwrap();

    let accessor = client.open();
    let builds = accessor.get(&["builds"], Map::new()).await.unwrap();
    assert_eq!(ids_of(&builds), vec![1, 2]);

    wait_until(|| {
        server
            .commands()
            .contains(&("startConsuming".to_string(), "builds/*/*".to_string()))
    })
    .await;

    // A creation push grows the collection in order.
    server.push("builds/3/new", json!({"buildid": 3, "complete": false}));
    wait_until(|| builds.len() == 3).await;
    assert_eq!(ids_of(&builds), vec![1, 2, 3]);

    // An update push merges in place without touching order or
    // identity.
    let before = builds.find_by_id(&json!(1)).unwrap();
    server.push("builds/1/complete_at", json!({"buildid": 1, "complete_at": 1000}));
    wait_until(|| {
        builds
            .find_by_id(&json!(1))
            .and_then(|w| w.field("complete_at"))
            == Some(json!(1000))
    })
    .await;
    let after = builds.find_by_id(&json!(1)).unwrap();
    assert!(before.same_wrapper(&after));
    assert_eq!(ids_of(&builds), vec![1, 2, 3]);

    // Closing the accessor drops the interest and eventually stops
    // the server-side consumer.
    accessor.close();
    wait_until(|| {
        server
            .commands()
            .contains(&("stopConsuming".to_string(), "builds/*/*".to_string()))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn one_shot_reads_skip_consume_registration() {
    let dir = tempfile::tempdir().unwrap();
    let rest = StubRest::new(vec![(
        "builds",
        json!({"builds": [{"buildid": 1}, {"buildid": 2}]}),
    )]);
    let server = FakeServer::new();
    let client = DataClient::new(&test_config(&dir), rest, Arc::new(server.clone()))
        .await
        .unwrap();

    let builds = client.get(&["builds"], Map::new()).await.unwrap();
    assert_eq!(builds.len(), 2);

    settle().await;
    assert!(server.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconciliation_drops_records_that_left_the_filter() {
    let dir = tempfile::tempdir().unwrap();
    let rest = StubRest::new(vec![(
        "builds",
        json!({"builds": [
            {"buildid": 1, "complete": false},
            {"buildid": 2, "complete": false},
            {"buildid": 3, "complete": false},
        ]}),
    )]);
    let server = FakeServer::new();
    let client = DataClient::new(&test_config(&dir), rest, Arc::new(server.clone()))
        .await
        .unwrap();

    let accessor = client.open();
    let query = json!({"complete": false}).as_object().unwrap().clone();
    let pending = accessor.get(&["builds"], query).await.unwrap();
    assert_eq!(ids_of(&pending), vec![1, 2, 3]);
    let two = pending.find_by_id(&json!(2)).unwrap();
    let three = pending.find_by_id(&json!(3)).unwrap();

    wait_until(|| !server.commands().is_empty()).await;

    // A new pending build joins the collection.
    server.push("builds/4/new", json!({"buildid": 4, "complete": false}));
    wait_until(|| pending.len() == 4).await;

    // Build 1 completes and thereby leaves the filter: the update
    // event reconciles it out, everything else keeps its identity.
    server.push("builds/1/complete", json!({"buildid": 1, "complete": true}));
    wait_until(|| ids_of(&pending) == vec![2, 3, 4]).await;
    assert!(two.same_wrapper(&pending.find_by_id(&json!(2)).unwrap()));
    assert!(three.same_wrapper(&pending.find_by_id(&json!(3)).unwrap()));

    accessor.close();
}

#[tokio::test(start_paused = true)]
async fn wildcard_interest_collapses_across_tabs() {
    let dir = tempfile::tempdir().unwrap();
    let rest = StubRest::new(vec![
        (
            "builds",
            json!({"builds": [{"buildid": 1}, {"buildid": 2}]}),
        ),
        ("builds/1", json!({"builds": [{"buildid": 1}]})),
    ]);
    let registry = Arc::new(SchemaRegistry::standard());
    let store = CacheStore::open(
        registry,
        rest.clone(),
        dir.path().to_path_buf(),
        2_000,
    )
    .await
    .unwrap();
    let bus = Bus::new();
    let config = test_config(&dir);

    let server_a = FakeServer::new();
    let server_b = FakeServer::new();
    let tab_a = DataClient::attach(
        &config,
        &bus,
        store.clone(),
        rest.clone(),
        Arc::new(server_a.clone()),
    );
    let tab_b = DataClient::attach(&config, &bus, store, rest, Arc::new(server_b.clone()));

    let accessor_a = tab_a.open();
    let accessor_b = tab_b.open();
    let all_builds = accessor_a.get(&["builds"], Map::new()).await.unwrap();
    let one_build = accessor_b.get(&["builds", "1"], Map::new()).await.unwrap();
    assert_eq!(all_builds.len(), 2);
    assert_eq!(one_build.len(), 1);

    settle().await;
    // The narrower subscription is subsumed; only the wildcard path is
    // consumed, and only by the leader tab.
    let consumed: Vec<String> = server_a
        .commands()
        .into_iter()
        .filter(|(cmd, _)| cmd == "startConsuming")
        .map(|(_, path)| path)
        .collect();
    assert_eq!(consumed, vec!["builds/*/*".to_string()]);
    assert!(server_b.commands().is_empty());

    // Pushes reach both tabs' collections through the shared bus.
    server_a.push("builds/1/complete_at", json!({"buildid": 1, "complete_at": 7}));
    wait_until(|| {
        one_build
            .find_by_id(&json!(1))
            .and_then(|w| w.field("complete_at"))
            == Some(json!(7))
    })
    .await;

    // Leader failover: tab A unloads, tab B takes over the transport
    // and re-asserts the surviving interest.
    accessor_a.close();
    tab_a.shutdown().await;
    wait_until(|| {
        server_b
            .commands()
            .iter()
            .any(|(cmd, _)| cmd == "startConsuming")
    })
    .await;

    accessor_b.close();
}

#[tokio::test(start_paused = true)]
async fn wrapper_loads_child_collections() {
    let dir = tempfile::tempdir().unwrap();
    let rest = StubRest::new(vec![
        ("builds", json!({"builds": [{"buildid": 12}]})),
        (
            "builds/12/steps",
            json!({"steps": [
                {"stepid": 5, "buildid": 12, "name": "compile", "number": 1},
                {"stepid": 6, "buildid": 12, "name": "test", "number": 2},
            ]}),
        ),
    ]);
    let server = FakeServer::new();
    let client = DataClient::new(&test_config(&dir), rest, Arc::new(server.clone()))
        .await
        .unwrap();

    let accessor = client.open();
    let builds = accessor.get(&["builds"], Map::new()).await.unwrap();
    let build = builds.find_by_id(&json!(12)).unwrap();

    let steps = build.load("steps", None).await.unwrap();
    assert_eq!(steps.entity_type(), "steps");
    assert_eq!(steps.len(), 2);

    // Unsubscribing the parent collection cascades through
    // wrapper-owned children.
    builds.unsubscribe();
    settle().await;
    assert!(build.children().is_empty());
    accessor.close();
}

#[tokio::test(start_paused = true)]
async fn control_calls_use_jsonrpc_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let rest = StubRest::new(vec![]);
    let server = FakeServer::new();
    let client = DataClient::new(&test_config(&dir), rest, Arc::new(server))
        .await
        .unwrap();

    let echoed = client
        .control("forceschedulers/force", "force", json!({"builderid": 1}))
        .await
        .unwrap();
    assert_eq!(echoed["jsonrpc"], json!("2.0"));
    assert_eq!(echoed["method"], json!("force"));
    assert_eq!(echoed["id"], json!(1));

    let again = client
        .control("forceschedulers/force", "force", json!({}))
        .await
        .unwrap();
    assert_eq!(again["id"], json!(2));
}
