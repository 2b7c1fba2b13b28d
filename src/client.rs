//! Presentation-facing entry point.
//!
//! A [`DataClient`] is one tab's view of the engine: it joins the
//! shared bus, owns that tab's transport and subscription manager, and
//! hands out subscribed [`Collection`]s. `get` is the one-shot style
//! accessor; `open` returns a scoped accessor whose collections stay
//! live until it is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::api::RestClient;
use crate::bus::Bus;
use crate::cache::CacheStore;
use crate::collection::Collection;
use crate::config::Config;
use crate::error::Result;
use crate::schema::SchemaRegistry;
use crate::subscription::SubscriptionManager;
use crate::transport::{Connector, Transport};

struct ClientInner {
    manager: SubscriptionManager,
    rest: Arc<dyn RestClient>,
    jsonrpc: AtomicU64,
}

/// Clone is cheap; clones share one tab.
#[derive(Clone)]
pub struct DataClient {
    inner: Arc<ClientInner>,
}

impl DataClient {
    /// Stand up a single-tab engine with the standard schema: own bus,
    /// own store under the configured cache directory.
    pub async fn new(
        config: &Config,
        rest: Arc<dyn RestClient>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::standard());
        let store = CacheStore::open(
            registry,
            rest.clone(),
            config.cache_dir()?,
            config.freshness_ttl_ms,
        )
        .await?;
        let bus = Bus::new();
        Ok(Self::attach(config, &bus, store, rest, connector))
    }

    /// Join an existing bus and store as a new tab. All tabs of one
    /// profile share the bus and the store; each owns its transport,
    /// and only the elected leader keeps it connected.
    pub fn attach(
        config: &Config,
        bus: &Bus,
        store: CacheStore,
        rest: Arc<dyn RestClient>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let transport = Transport::new(connector, Duration::from_secs(config.send_timeout_secs));
        let tab = bus.register();
        let manager = SubscriptionManager::start(store, transport, tab, config.debounce_ms);
        Self {
            inner: Arc::new(ClientInner {
                manager,
                rest,
                jsonrpc: AtomicU64::new(0),
            }),
        }
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.inner.manager
    }

    pub fn store(&self) -> &CacheStore {
        self.inner.manager.store()
    }

    /// One-shot style read: builds the rest path from the segments and
    /// returns a collection that resolved its first `ready`. Unless
    /// the query says otherwise the collection does not stay
    /// subscribed.
    pub async fn get(&self, segments: &[&str], query: Map<String, Value>) -> Result<Collection> {
        let mut query = query;
        query
            .entry("subscribe".to_string())
            .or_insert(Value::Bool(false));
        let rest_path = segments.join("/");
        let collection = Collection::new(self.inner.manager.clone(), &rest_path, &query)?;
        collection.subscribe().await?;
        Ok(collection)
    }

    /// Scoped accessor defaulting to live subscriptions; closing it
    /// unsubscribes everything it handed out.
    pub fn open(&self) -> DataAccessor {
        DataAccessor {
            client: self.clone(),
            collections: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// JSON-RPC 2.0 control call through the REST executor.
    pub async fn control(&self, path: &str, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.jsonrpc.fetch_add(1, Ordering::SeqCst) + 1;
        let body = json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        Ok(self.inner.rest.post(path, body).await?)
    }

    /// Destroy and recreate the persistent cache; the store's reload
    /// hook fires so the application restarts from a clean slate.
    pub async fn clear_cache(&self) -> Result<()> {
        info!("clearing cache");
        self.store().clear().await
    }

    /// Tab unload: reactivate interest for a successor leader, then
    /// leave the bus.
    pub async fn shutdown(&self) {
        self.inner.manager.shutdown().await;
    }
}

/// Accessor scoping collection lifetimes to one presentation scope.
pub struct DataAccessor {
    client: DataClient,
    collections: parking_lot::Mutex<Vec<Collection>>,
}

impl DataAccessor {
    /// Like [`DataClient::get`] but defaults `subscribe` to `true` and
    /// remembers the collection for `close()`.
    pub async fn get(&self, segments: &[&str], query: Map<String, Value>) -> Result<Collection> {
        let mut query = query;
        query
            .entry("subscribe".to_string())
            .or_insert(Value::Bool(true));
        let collection = self.client.get(segments, query).await?;
        self.collections.lock().push(collection.clone());
        Ok(collection)
    }

    /// Unsubscribe every collection this accessor handed out.
    pub fn close(&self) {
        for collection in self.collections.lock().drain(..) {
            collection.unsubscribe();
        }
    }
}

impl Drop for DataAccessor {
    fn drop(&mut self) {
        self.close();
    }
}
