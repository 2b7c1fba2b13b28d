//! Cross-tab coordination bus and leader election.
//!
//! Tabs within one browser profile register on a shared [`Bus`] (the
//! `BroadcastChannel` equivalent). The bus elects the lowest live tab
//! id as leader and re-publishes the role on every membership change;
//! each tab runs the `unelected -> follower | leader` state machine
//! over those messages. Tabs publish their full interest set and the
//! bus rebroadcasts the aggregate, so leader-side recomputation is
//! idempotent - it always works from the complete current set, never
//! from deltas, tolerating duplicate or stale snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

/// Bus fan-out buffer; slow tabs drop the oldest messages first.
const BUS_CAPACITY: usize = 256;

pub type TabId = u64;

/// One logical subscription: a path plus its data query.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub path: String,
    pub query: Map<String, Value>,
}

/// Events delivered to collection listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ready,
    Update,
    New,
}

#[derive(Debug, Clone)]
pub enum BusMessage {
    /// Elected leadership changed (or was re-announced).
    Role { leader_id: TabId },
    /// The aggregate interest of every live tab.
    Refresh { channels: Vec<Channel> },
    /// A data event for one `(path, serialized query)` pair.
    Event {
        path: String,
        query: String,
        kind: EventKind,
    },
}

struct BusInner {
    tx: broadcast::Sender<BusMessage>,
    members: parking_lot::Mutex<BTreeMap<TabId, Vec<Channel>>>,
    next_tab: AtomicU64,
}

/// The shared coordination fabric. Clone is cheap; clones share state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                tx,
                members: parking_lot::Mutex::new(BTreeMap::new()),
                next_tab: AtomicU64::new(0),
            }),
        }
    }

    /// Join the bus as a new tab. The returned handle carries the
    /// tab's receiver; roles are re-announced so the newcomer learns
    /// the current leader immediately.
    pub fn register(&self) -> TabHandle {
        let id = self.inner.next_tab.fetch_add(1, Ordering::SeqCst) + 1;
        let rx = self.inner.tx.subscribe();
        self.inner.members.lock().insert(id, Vec::new());
        debug!(tab = id, "tab registered");
        self.broadcast_role();
        TabHandle {
            port: TabPort {
                id,
                bus: self.clone(),
            },
            rx,
        }
    }

    fn leader(&self) -> Option<TabId> {
        self.inner.members.lock().keys().next().copied()
    }

    fn broadcast_role(&self) {
        if let Some(leader_id) = self.leader() {
            let _ = self.inner.tx.send(BusMessage::Role { leader_id });
        }
    }

    fn broadcast_refresh(&self) {
        let channels = self.aggregate();
        let _ = self.inner.tx.send(BusMessage::Refresh { channels });
    }

    /// Merge every tab's interest, deduplicating equal path/query
    /// pairs.
    fn aggregate(&self) -> Vec<Channel> {
        let members = self.inner.members.lock();
        let mut merged: Vec<Channel> = Vec::new();
        for channels in members.values() {
            for channel in channels {
                if !merged.contains(channel) {
                    merged.push(channel.clone());
                }
            }
        }
        merged
    }

    fn publish_interest(&self, id: TabId, channels: Vec<Channel>) {
        self.inner.members.lock().insert(id, channels);
        self.broadcast_refresh();
    }

    fn deregister(&self, id: TabId) {
        self.inner.members.lock().remove(&id);
        debug!(tab = id, "tab deregistered");
        self.broadcast_role();
        self.broadcast_refresh();
    }

    /// Fan a data event out to every tab.
    pub fn emit(&self, path: &str, query: &str, kind: EventKind) {
        let _ = self.inner.tx.send(BusMessage::Event {
            path: path.to_string(),
            query: query.to_string(),
            kind,
        });
    }
}

/// The publishing half of a tab's bus membership; cheap to clone.
#[derive(Clone)]
pub struct TabPort {
    id: TabId,
    bus: Bus,
}

impl TabPort {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Replace this tab's declared interest with the given set.
    pub fn publish_interest(&self, channels: Vec<Channel>) {
        self.bus.publish_interest(self.id, channels);
    }

    pub fn emit(&self, path: &str, query: &str, kind: EventKind) {
        self.bus.emit(path, query, kind);
    }

    /// Leave the bus; forces re-election and an interest refresh so a
    /// successor leader picks up the remaining tabs' subscriptions.
    pub fn leave(&self) {
        self.bus.deregister(self.id);
    }
}

/// A tab's bus membership: the port plus the message receiver.
pub struct TabHandle {
    pub port: TabPort,
    pub rx: broadcast::Receiver<BusMessage>,
}
