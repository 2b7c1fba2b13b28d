//! Interest management: maps local listeners to server-side
//! "consuming" registrations.
//!
//! Every tab registers listeners here; the interest set travels over
//! the cross-tab bus and whichever tab is leader aggregates it,
//! debounces bursts, collapses wildcard-subsumed paths and issues the
//! consume/stop-consume commands. Loads go through the cache store's
//! freshness gate, and `ready` events fan back out over the bus to
//! every tab's matching listeners.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::bus::{BusMessage, Channel, EventKind, TabHandle, TabPort};
use crate::cache::{canonical_query, CacheStore};
use crate::paths::{wildcard_key_regex, wildcard_subsume_regex};
use crate::transport::{Command, Transport};

/// Role of a tab once the first election message lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// Listeners receive event kinds and re-read the store themselves.
pub type Listener = mpsc::UnboundedSender<EventKind>;
pub type ListenerId = u64;

struct InterestEntry {
    path: String,
    query: Map<String, Value>,
    serialized: String,
    listeners: Vec<(ListenerId, Listener)>,
}

/// Leader-only bookkeeping: the tracked path set and the subset
/// actually consumed on the wire (wildcard subsumption keeps them
/// different).
#[derive(Default)]
struct LeaderState {
    tracked: HashMap<String, Vec<Map<String, Value>>>,
    consuming: HashSet<String>,
}

struct SubInner {
    store: CacheStore,
    transport: Transport,
    port: TabPort,
    role: watch::Sender<Option<Role>>,
    interests: parking_lot::Mutex<Vec<InterestEntry>>,
    next_listener: AtomicU64,
    leader: tokio::sync::Mutex<LeaderState>,
    latest_channels: parking_lot::Mutex<Vec<Channel>>,
    debounce: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    debounce_ms: u64,
    loop_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Clone is cheap; all clones share one manager.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<SubInner>,
}

impl SubscriptionManager {
    /// Wire the manager to its tab's bus membership and transport,
    /// then start processing bus messages.
    pub fn start(
        store: CacheStore,
        transport: Transport,
        tab: TabHandle,
        debounce_ms: u64,
    ) -> Self {
        let TabHandle { port, rx } = tab;
        let (role, _) = watch::channel(None);
        let manager = Self {
            inner: Arc::new(SubInner {
                store,
                transport,
                port,
                role,
                interests: parking_lot::Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                leader: tokio::sync::Mutex::new(LeaderState::default()),
                latest_channels: parking_lot::Mutex::new(Vec::new()),
                debounce: parking_lot::Mutex::new(None),
                debounce_ms,
                loop_task: parking_lot::Mutex::new(None),
            }),
        };

        let push_target = manager.clone();
        manager.inner.transport.set_push_handler(move |key, message| {
            let manager = push_target.clone();
            tokio::spawn(async move {
                manager.handle_push(key, message).await;
            });
        });

        let close_target = manager.clone();
        manager.inner.transport.set_close_handler(move || {
            let manager = close_target.clone();
            tokio::spawn(async move {
                manager.reassert_interest().await;
            });
        });

        let loop_target = manager.clone();
        let task = tokio::spawn(async move {
            loop_target.run(rx).await;
        });
        *manager.inner.loop_task.lock() = Some(task);

        manager
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// This tab's role, once elected.
    pub fn role(&self) -> Option<Role> {
        *self.inner.role.borrow()
    }

    /// Resolves when the first election message has been processed.
    pub async fn wait_initial_role(&self) -> Role {
        let mut rx = self.inner.role.subscribe();
        loop {
            if let Some(role) = *rx.borrow_and_update() {
                return role;
            }
            if rx.changed().await.is_err() {
                return Role::Follower;
            }
        }
    }

    /// Register a listener for `(path, query)`. `subscribe == false`
    /// performs a one-shot fetch-through and emits `ready` without
    /// registering ongoing interest.
    pub fn on(&self, path: &str, query: &Map<String, Value>, listener: Listener) -> ListenerId {
        let mut query = query.clone();
        let subscribe = query.remove("subscribe");
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst) + 1;

        if subscribe == Some(Value::Bool(false)) {
            let manager = self.clone();
            let path = path.to_string();
            tokio::spawn(async move {
                match manager.inner.store.load(&path, &query).await {
                    Ok(()) => {
                        let _ = listener.send(EventKind::Ready);
                    }
                    Err(e) => error!(path = %path, error = %e, "one-shot load failed"),
                }
            });
            return id;
        }

        let serialized = canonical_query(&query);
        {
            let mut interests = self.inner.interests.lock();
            match interests
                .iter_mut()
                .find(|entry| entry.path == path && entry.serialized == serialized)
            {
                Some(entry) => entry.listeners.push((id, listener)),
                None => interests.push(InterestEntry {
                    path: path.to_string(),
                    query,
                    serialized,
                    listeners: vec![(id, listener)],
                }),
            }
        }
        self.publish_interest();
        id
    }

    /// Deregister one listener; the last listener of a pair destroys
    /// the interest and eventually stops the server-side consumer.
    pub fn off(&self, path: &str, query: &Map<String, Value>, listener: ListenerId) {
        let mut query = query.clone();
        query.remove("subscribe");
        let serialized = canonical_query(&query);
        {
            let mut interests = self.inner.interests.lock();
            if let Some(index) = interests
                .iter()
                .position(|entry| entry.path == path && entry.serialized == serialized)
            {
                let entry = &mut interests[index];
                entry.listeners.retain(|(id, _)| *id != listener);
                if entry.listeners.is_empty() {
                    interests.remove(index);
                }
            }
        }
        self.publish_interest();
    }

    /// Bump freshness on everything this tab is interested in so a
    /// successor leader inherits it without refetching; called on tab
    /// unload.
    pub async fn reactivate(&self) {
        let entries: Vec<(String, String)> = self
            .inner
            .interests
            .lock()
            .iter()
            .map(|entry| (entry.path.clone(), entry.serialized.clone()))
            .collect();
        if let Err(e) = self.inner.store.activate(&entries).await {
            warn!(error = %e, "freshness reactivation failed");
        }
    }

    /// Leave the bus after reactivating interest; the next election
    /// message hands leadership (and our subscriptions) to a survivor.
    pub async fn shutdown(&self) {
        self.reactivate().await;
        self.inner.port.leave();
        self.inner.transport.close();
        if let Some(task) = self.inner.loop_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.debounce.lock().take() {
            task.abort();
        }
    }

    fn publish_interest(&self) {
        let channels: Vec<Channel> = self
            .inner
            .interests
            .lock()
            .iter()
            .map(|entry| Channel {
                path: entry.path.clone(),
                query: entry.query.clone(),
            })
            .collect();
        self.inner.port.publish_interest(channels);
    }

    async fn run(&self, mut rx: tokio::sync::broadcast::Receiver<BusMessage>) {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match rx.recv().await {
                Ok(BusMessage::Role { leader_id }) => self.handle_role(leader_id),
                Ok(BusMessage::Refresh { channels }) => self.handle_refresh(channels),
                Ok(BusMessage::Event { path, query, kind }) => {
                    self.dispatch_local(&path, &query, kind);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "bus receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn handle_role(&self, leader_id: u64) {
        let role = if leader_id == self.inner.port.id() {
            Role::Leader
        } else {
            Role::Follower
        };
        let previous = *self.inner.role.borrow();
        self.inner.role.send_replace(Some(role));
        if previous == Some(role) {
            return;
        }
        debug!(tab = self.inner.port.id(), ?role, "role transition");
        match role {
            // The leader owns the only live channel; followers shut
            // theirs down. Resync interest so a fresh leader picks up
            // whatever the bus last aggregated.
            Role::Leader => {
                self.inner.transport.open();
                let channels = self.inner.latest_channels.lock().clone();
                if !channels.is_empty() {
                    self.handle_refresh(channels);
                }
            }
            Role::Follower => self.inner.transport.close(),
        }
    }

    fn handle_refresh(&self, channels: Vec<Channel>) {
        *self.inner.latest_channels.lock() = channels.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            if manager.wait_initial_role().await != Role::Leader {
                return;
            }
            manager.debounce_recompute(channels);
        });
    }

    /// Coalesce bursts of interest changes into one recomputation; the
    /// timer resets on every new change within the window.
    fn debounce_recompute(&self, channels: Vec<Channel>) {
        let mut slot = self.inner.debounce.lock();
        if let Some(task) = slot.take() {
            task.abort();
        }
        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(manager.inner.debounce_ms)).await;
            manager.recompute(channels).await;
        }));
    }

    /// Leader-side aggregation: reactivate, collapse, diff against the
    /// consumed set, then load every pair and emit `ready`.
    async fn recompute(&self, channels: Vec<Channel>) {
        let mut paths: HashMap<String, Vec<Map<String, Value>>> = HashMap::new();
        for channel in channels {
            let queries = paths.entry(channel.path).or_default();
            if !queries.contains(&channel.query) {
                queries.push(channel.query);
            }
        }

        let mut start = Vec::new();
        let mut stop = Vec::new();
        {
            let mut leader = self.inner.leader.lock().await;

            let active: Vec<(String, String)> = leader
                .tracked
                .iter()
                .flat_map(|(path, queries)| {
                    queries
                        .iter()
                        .map(|query| (path.clone(), canonical_query(query)))
                })
                .collect();
            if let Err(e) = self.inner.store.activate(&active).await {
                warn!(error = %e, "freshness reactivation failed");
            }

            for path in collapse_wildcards(paths.keys()) {
                if !leader.tracked.contains_key(&path) && !leader.consuming.contains(&path) {
                    leader.consuming.insert(path.clone());
                    start.push(path);
                }
            }
            let stale: Vec<String> = leader
                .consuming
                .iter()
                .filter(|path| !paths.contains_key(*path))
                .cloned()
                .collect();
            for path in stale {
                leader.consuming.remove(&path);
                stop.push(path);
            }
            leader.tracked = paths.clone();
        }

        // Commands go out after the bookkeeping lock drops; failures
        // are logged and survived, reconnection re-asserts interest.
        for path in start {
            if let Err(e) = self
                .inner
                .transport
                .send(Command::StartConsuming(path.clone()))
                .await
            {
                warn!(path = %path, error = %e, "startConsuming failed");
            }
        }
        for path in stop {
            if let Err(e) = self
                .inner
                .transport
                .send(Command::StopConsuming(path.clone()))
                .await
            {
                warn!(path = %path, error = %e, "stopConsuming failed");
            }
        }

        for (path, queries) in paths {
            for query in queries {
                match self.inner.store.load(&path, &query).await {
                    Ok(()) => {
                        self.inner
                            .port
                            .emit(&path, &canonical_query(&query), EventKind::Ready);
                    }
                    Err(e) => error!(path = %path, error = %e, "load failed"),
                }
            }
        }
    }

    /// Push dispatch: classify the key, merge the record, notify every
    /// tracked path whose wildcard pattern matches.
    async fn handle_push(&self, key: String, message: Value) {
        let Some((type_name, kind)) = classify_key(&key) else {
            warn!(key = %key, "unrecognized push key");
            return;
        };
        let Value::Object(record) = message else {
            warn!(key = %key, "push payload is not a record");
            return;
        };
        if let Err(e) = self.inner.store.put(type_name, record, None).await {
            error!(key = %key, error = %e, "push merge failed");
            return;
        }

        let leader = self.inner.leader.lock().await;
        for (path, queries) in &leader.tracked {
            let matches = match wildcard_key_regex(path) {
                Ok(regex) => regex.is_match(&key),
                Err(e) => {
                    warn!(path = %path, error = %e, "bad tracked path");
                    false
                }
            };
            if matches {
                for query in queries {
                    self.inner.port.emit(path, &canonical_query(query), kind);
                }
            }
        }
    }

    /// Transport close: forget the consumed set and re-assert all
    /// currently tracked interest once reconnected.
    async fn reassert_interest(&self) {
        let channels: Vec<Channel> = {
            let mut leader = self.inner.leader.lock().await;
            let tracked = std::mem::take(&mut leader.tracked);
            leader.consuming.clear();
            tracked
                .into_iter()
                .flat_map(|(path, queries)| {
                    queries.into_iter().map(move |query| Channel {
                        path: path.clone(),
                        query,
                    })
                })
                .collect()
        };
        if channels.is_empty() {
            return;
        }
        debug!(count = channels.len(), "re-asserting interest after close");
        self.recompute(channels).await;
    }

    fn dispatch_local(&self, path: &str, query: &str, kind: EventKind) {
        let interests = self.inner.interests.lock();
        for entry in interests.iter() {
            if entry.path == path && entry.serialized == query {
                for (_, listener) in &entry.listeners {
                    let _ = listener.send(kind);
                }
            }
        }
    }
}

/// Drop every path some wildcard sibling already covers: subscribing
/// to all children of X subsumes any narrower subscription.
fn collapse_wildcards<'a>(paths: impl Iterator<Item = &'a String>) -> Vec<String> {
    let all: Vec<&String> = paths.collect();
    let mut surviving = Vec::new();
    for candidate in &all {
        let mut subsumed = false;
        for other in &all {
            if candidate == other || !other.contains('*') {
                continue;
            }
            match wildcard_subsume_regex(other) {
                Ok(regex) if regex.is_match(candidate) => {
                    subsumed = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(path = %other, error = %e, "bad wildcard path"),
            }
        }
        if !subsumed {
            surviving.push((*candidate).clone());
        }
    }
    surviving
}

/// Infer the entity type and event kind from a push key: a trailing
/// `new` segment is a creation, anything else updates the named field.
fn classify_key(key: &str) -> Option<(&str, EventKind)> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() < 3 {
        return None;
    }
    let kind = if segments[segments.len() - 1] == "new" {
        EventKind::New
    } else {
        EventKind::Update
    };
    Some((segments[segments.len() - 3], kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_subsumption_collapses_narrower_paths() {
        let paths = vec![
            "builds/*/*".to_string(),
            "builds/1/*".to_string(),
            "masters/*/*".to_string(),
        ];
        let mut surviving = collapse_wildcards(paths.iter());
        surviving.sort();
        assert_eq!(surviving, vec!["builds/*/*", "masters/*/*"]);
    }

    #[test]
    fn distinct_paths_survive_collapse() {
        let paths = vec!["builds/*/*".to_string(), "builders/*/*".to_string()];
        assert_eq!(collapse_wildcards(paths.iter()).len(), 2);
    }

    #[test]
    fn push_keys_classify_by_suffix() {
        assert_eq!(classify_key("builds/3/new"), Some(("builds", EventKind::New)));
        assert_eq!(
            classify_key("builds/1/complete_at"),
            Some(("builds", EventKind::Update))
        );
        assert_eq!(
            classify_key("masters/1/builders/2/started"),
            Some(("builders", EventKind::Update))
        );
        assert_eq!(classify_key("builds"), None);
    }
}
