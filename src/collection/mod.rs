//! Reactive collections and entity wrappers.
//!
//! A [`Collection`] is an owned, ordered, identity-keyed container
//! bound to one `(path, query)`. It subscribes through the
//! subscription manager and, on every `ready`/`update`/`new` event,
//! re-reads the cache store and reconciles: wrappers are added for
//! ids that appeared, spliced out for ids that vanished, and merged
//! in place on updates so presentation code holding a wrapper keeps
//! seeing live data.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::bus::EventKind;
use crate::error::{Error, Result};
use crate::paths;
use crate::query::Record;
use crate::schema::SURROGATE_ID_FIELD;
use crate::subscription::{ListenerId, SubscriptionManager};

enum ReadyState {
    Pending(Vec<oneshot::Sender<()>>),
    Ready,
}

struct CollectionInner {
    manager: SubscriptionManager,
    rest_path: String,
    socket_path: String,
    endpoint: String,
    entity_type: String,
    id_field: String,
    /// Data query, `subscribe` stripped.
    query: Map<String, Value>,
    /// Inherited by child collections loaded off wrappers.
    subscribe: bool,
    items: parking_lot::Mutex<Vec<EntityWrapper>>,
    ready: parking_lot::Mutex<ReadyState>,
    listener: parking_lot::Mutex<Option<ListenerId>>,
    event_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Clone is cheap; clones share one live collection.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// Bind a collection to a path and query. The query may carry a
    /// `subscribe` flag; `false` means a one-shot read, `true` keeps
    /// the collection live through push updates.
    pub fn new(
        manager: SubscriptionManager,
        rest_path: &str,
        query: &Map<String, Value>,
    ) -> Result<Self> {
        let mut data_query = query.clone();
        let subscribe = match data_query.remove("subscribe") {
            Some(Value::Bool(flag)) => flag,
            _ => false,
        };
        let entity_type = paths::path_type(rest_path)?;
        let id_field = manager
            .store()
            .registry()
            .get(&entity_type)
            .map(|spec| spec.id_field().to_string())
            .unwrap_or_else(|| SURROGATE_ID_FIELD.to_string());
        Ok(Self {
            inner: Arc::new(CollectionInner {
                manager,
                rest_path: paths::rest_path(rest_path),
                socket_path: paths::socket_path(rest_path),
                endpoint: paths::endpoint_path(rest_path),
                entity_type,
                id_field,
                query: data_query,
                subscribe,
                items: parking_lot::Mutex::new(Vec::new()),
                ready: parking_lot::Mutex::new(ReadyState::Pending(Vec::new())),
                listener: parking_lot::Mutex::new(None),
                event_task: parking_lot::Mutex::new(None),
            }),
        })
    }

    pub fn rest_path(&self) -> &str {
        &self.inner.rest_path
    }

    pub fn entity_type(&self) -> &str {
        &self.inner.entity_type
    }

    /// Register interest and resolve once the first `ready` event for
    /// this `(path, query)` arrives.
    pub async fn subscribe(&self) -> Result<()> {
        let ready_rx = {
            let mut ready = self.inner.ready.lock();
            match &mut *ready {
                ReadyState::Ready => None,
                ReadyState::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
            }
        };

        if self.inner.listener.lock().is_none() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut query = self.inner.query.clone();
            query.insert("subscribe".to_string(), Value::Bool(self.inner.subscribe));
            let id = self
                .inner
                .manager
                .on(&self.inner.socket_path, &query, tx);
            *self.inner.listener.lock() = Some(id);

            let collection = self.clone();
            let task = tokio::spawn(async move {
                while let Some(kind) = rx.recv().await {
                    collection.handle_event(kind).await;
                }
            });
            *self.inner.event_task.lock() = Some(task);
        }

        match ready_rx {
            None => Ok(()),
            Some(rx) => rx
                .await
                .map_err(|_| Error::Transport("collection closed before ready".into())),
        }
    }

    /// Unsubscribe this collection and, recursively, every child
    /// collection reachable through its wrappers. Immediate and
    /// synchronous; the resulting stop-consume traffic is best-effort.
    pub fn unsubscribe(&self) {
        for wrapper in self.inner.items.lock().iter() {
            wrapper.unsubscribe();
        }
        if let Some(id) = self.inner.listener.lock().take() {
            self.inner
                .manager
                .off(&self.inner.socket_path, &self.inner.query, id);
        }
        if let Some(task) = self.inner.event_task.lock().take() {
            task.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Snapshot of the current wrappers, in collection order.
    pub fn to_vec(&self) -> Vec<EntityWrapper> {
        self.inner.items.lock().clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&EntityWrapper)) {
        for wrapper in self.inner.items.lock().iter() {
            f(wrapper);
        }
    }

    pub fn get(&self, index: usize) -> Option<EntityWrapper> {
        self.inner.items.lock().get(index).cloned()
    }

    pub fn find_by_id(&self, id: &Value) -> Option<EntityWrapper> {
        self.inner
            .items
            .lock()
            .iter()
            .find(|wrapper| wrapper.id().as_ref() == Some(id))
            .cloned()
    }

    pub fn ids(&self) -> Vec<Value> {
        self.inner
            .items
            .lock()
            .iter()
            .filter_map(|wrapper| wrapper.id())
            .collect()
    }

    async fn handle_event(&self, kind: EventKind) {
        // A ready for an already-populated collection is a replay.
        if kind == EventKind::Ready && !self.is_empty() {
            return;
        }
        let data = match self
            .inner
            .manager
            .store()
            .get(&self.inner.rest_path, &self.inner.query)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                error!(path = %self.inner.rest_path, error = %e, "collection read failed");
                return;
            }
        };
        debug!(path = %self.inner.rest_path, ?kind, count = data.len(), "collection event");
        match kind {
            EventKind::Ready => {
                for record in data {
                    self.add(record);
                }
                self.resolve_ready();
            }
            EventKind::New => self.reconcile(data),
            EventKind::Update => {
                self.reconcile(data.clone());
                self.merge(data);
            }
        }
    }

    /// Add wrappers for ids present only in the fresh read and splice
    /// out elements whose ids vanished; surviving wrappers keep their
    /// identity.
    fn reconcile(&self, data: Vec<Record>) {
        let fresh_ids: Vec<Option<Value>> = data
            .iter()
            .map(|record| record.get(&self.inner.id_field).cloned())
            .collect();
        let mut seen_ids: Vec<Option<Value>> = {
            let items = self.inner.items.lock();
            items.iter().map(|wrapper| wrapper.id()).collect()
        };
        for (record, id) in data.into_iter().zip(fresh_ids.iter()) {
            if !seen_ids.contains(id) {
                seen_ids.push(id.clone());
                self.add(record);
            }
        }
        self.inner
            .items
            .lock()
            .retain(|wrapper| fresh_ids.contains(&wrapper.id()));
    }

    fn merge(&self, data: Vec<Record>) {
        let items = self.inner.items.lock();
        for record in data {
            let id = record.get(&self.inner.id_field);
            if let Some(wrapper) = items.iter().find(|w| w.id().as_ref() == id) {
                wrapper.update(record.clone());
            }
        }
    }

    fn add(&self, record: Record) {
        let wrapper = EntityWrapper::new(
            self.inner.manager.clone(),
            &self.inner.endpoint,
            &self.inner.id_field,
            record,
            self.inner.subscribe,
        );
        self.inner.items.lock().push(wrapper);
    }

    fn resolve_ready(&self) {
        let mut ready = self.inner.ready.lock();
        if let ReadyState::Pending(waiters) = std::mem::replace(&mut *ready, ReadyState::Ready) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

struct WrapperInner {
    manager: SubscriptionManager,
    endpoint: String,
    id_field: String,
    record: parking_lot::Mutex<Record>,
    children: parking_lot::Mutex<Vec<Collection>>,
    subscribe_default: bool,
}

/// A materialized record plus its originating endpoint. Clone is
/// cheap and preserves identity: clones share the same live record.
#[derive(Clone)]
pub struct EntityWrapper {
    inner: Arc<WrapperInner>,
}

impl EntityWrapper {
    fn new(
        manager: SubscriptionManager,
        endpoint: &str,
        id_field: &str,
        record: Record,
        subscribe_default: bool,
    ) -> Self {
        Self {
            inner: Arc::new(WrapperInner {
                manager,
                endpoint: endpoint.to_string(),
                id_field: id_field.to_string(),
                record: parking_lot::Mutex::new(record),
                children: parking_lot::Mutex::new(Vec::new()),
                subscribe_default,
            }),
        }
    }

    /// Two handles are the same wrapper iff they share identity.
    pub fn same_wrapper(&self, other: &EntityWrapper) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn id(&self) -> Option<Value> {
        self.inner.record.lock().get(&self.inner.id_field).cloned()
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.inner.record.lock().get(name).cloned()
    }

    /// Snapshot of the current record.
    pub fn record(&self) -> Record {
        self.inner.record.lock().clone()
    }

    /// Merge incoming fields in place; object identity is preserved
    /// across updates.
    pub fn update(&self, record: Record) {
        let mut current = self.inner.record.lock();
        for (key, value) in record {
            current.insert(key, value);
        }
    }

    /// Resolve a child path relative to this entity and return a
    /// subscribed child collection. The child inherits this wrapper's
    /// subscribe default unless the query overrides it.
    pub async fn load(
        &self,
        child_type: &str,
        query: Option<Map<String, Value>>,
    ) -> Result<Collection> {
        let path = self.child_path(child_type)?;
        let mut query = query.unwrap_or_default();
        query
            .entry("subscribe".to_string())
            .or_insert(Value::Bool(self.inner.subscribe_default));

        let collection = Collection::new(self.inner.manager.clone(), &path, &query)?;
        collection.subscribe().await?;
        self.inner.children.lock().push(collection.clone());
        Ok(collection)
    }

    /// Child collections loaded off this wrapper so far.
    pub fn children(&self) -> Vec<Collection> {
        self.inner.children.lock().clone()
    }

    /// Cascade: unsubscribe every child collection this wrapper
    /// created.
    pub fn unsubscribe(&self) {
        for child in self.inner.children.lock().drain(..) {
            child.unsubscribe();
        }
    }

    /// Build the path for a child collection: straight off the root
    /// endpoint it is `<endpoint>/<id>/<child>`; deeper endpoints pick
    /// the grammar-bound field for the matched pattern.
    fn child_path(&self, child_type: &str) -> Result<String> {
        let segments: Vec<&str> = self.inner.endpoint.split('/').collect();
        let root = segments
            .first()
            .ok_or_else(|| Error::UnknownType(self.inner.endpoint.clone()))?;
        let parameter = if segments.len() <= 2 {
            self.id()
        } else {
            let registry = self.inner.manager.store().registry();
            let spec = registry.expect(root)?;
            let candidate = {
                let mut rest: Vec<&str> = segments[2..].to_vec();
                rest.push("*");
                rest.push(child_type);
                rest.join("/")
            };
            let mut bound_field = None;
            for pattern in spec.paths {
                let wildcarded: Vec<&str> = pattern
                    .split('/')
                    .map(|s| if s.contains(':') { "*" } else { s })
                    .collect();
                if wildcarded.join("/") == candidate {
                    bound_field = pattern
                        .split('/')
                        .rev()
                        .find_map(|s| s.split_once(':').map(|(_, field)| field));
                }
            }
            match bound_field {
                Some(field) => self.field(field),
                None => {
                    warn!(endpoint = %self.inner.endpoint, child = %child_type,
                        "no grammar match for child load, falling back to id");
                    self.id()
                }
            }
        };
        let parameter =
            parameter.ok_or_else(|| Error::ParentNotFound(self.inner.endpoint.clone()))?;
        Ok(format!(
            "{}/{}/{}",
            self.inner.endpoint,
            segment_of(&parameter),
            child_type
        ))
    }
}

fn segment_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
