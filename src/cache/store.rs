use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::api::RestClient;
use crate::error::{Error, Result};
use crate::paths::{self, ParentLink, ResolvedPath};
use crate::query::{Query, Record};
use crate::schema::SchemaRegistry;

/// File holding the path freshness index
const PATHS_FILE: &str = "paths.json";

/// Ceiling on indirect parent resolution nesting
const MAX_RESOLUTION_DEPTH: u8 = 8;

/// One row of the freshness index, unique by `(path, query)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPath {
    pub path: String,
    /// Canonical serialized query.
    pub query: String,
    #[serde(rename = "lastActive")]
    pub last_active: DateTime<Utc>,
}

/// Canonical serialization for query maps; keys are sorted so equal
/// queries always serialize identically.
pub fn canonical_query(query: &Map<String, Value>) -> String {
    Value::Object(query.clone()).to_string()
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Vec<Record>>,
    tracked: Vec<TrackedPath>,
    surrogate_seq: i64,
}

struct StoreInner {
    registry: Arc<SchemaRegistry>,
    rest: Arc<dyn RestClient>,
    dir: PathBuf,
    ttl: ChronoDuration,
    state: tokio::sync::Mutex<StoreState>,
    reload_hook: parking_lot::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Persistent, table-per-entity-type store with a query engine front
/// and a path freshness index.
///
/// Clone is cheap; all clones share one store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Open (or create) the store under `dir`, loading any persisted
    /// tables for the registered entity types.
    pub async fn open(
        registry: Arc<SchemaRegistry>,
        rest: Arc<dyn RestClient>,
        dir: PathBuf,
        ttl_ms: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut state = StoreState::default();
        for type_name in registry.type_names() {
            let path = dir.join(format!("{type_name}.json"));
            if path.exists() {
                let contents = std::fs::read_to_string(&path)?;
                let rows: Vec<Record> = serde_json::from_str(&contents)?;
                state.tables.insert(type_name.to_string(), rows);
            }
        }
        let paths_file = dir.join(PATHS_FILE);
        if paths_file.exists() {
            let contents = std::fs::read_to_string(&paths_file)?;
            state.tracked = serde_json::from_str(&contents)?;
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                registry,
                rest,
                dir,
                ttl: ChronoDuration::milliseconds(ttl_ms as i64),
                state: tokio::sync::Mutex::new(state),
                reload_hook: parking_lot::Mutex::new(None),
            }),
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    /// Register the hook fired after `clear()` recreates the store.
    pub fn set_reload_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.reload_hook.lock() = Some(Box::new(hook));
    }

    /// Read records for a path and query. Direct-id resolutions become
    /// key lookups, everything else is a full table scan through the
    /// query engine. Unknown entity types yield an empty result rather
    /// than an error.
    pub async fn get(&self, path: &str, query: &Map<String, Value>) -> Result<Vec<Record>> {
        match self.get_depth(path, query, 0).await {
            Ok(records) => Ok(records),
            Err(Error::UnknownType(t)) => {
                debug!(r#type = %t, "query for unknown entity type, returning empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn get_depth<'a>(
        &'a self,
        path: &'a str,
        query: &'a Map<String, Value>,
        depth: u8,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        Box::pin(async move {
            let rest_path = paths::rest_path(path);
            let resolved = paths::resolve(&self.inner.registry, &rest_path)?;

            let mut engine_query = Query::from_map(query);
            for (field, value) in &resolved.filter {
                engine_query.push_filter(field, value.clone());
            }
            if let Some(link) = &resolved.parent {
                let id = self.parent_id(link, depth).await?;
                engine_query.push_filter(&link.id_field, id);
            }

            let state = self.inner.state.lock().await;
            let spec = self.inner.registry.expect(&resolved.entity_type)?;
            let rows = state
                .tables
                .get(&resolved.entity_type)
                .cloned()
                .unwrap_or_default();
            drop(state);

            if let Some(id) = &resolved.direct_id {
                let id_field = spec.id_field();
                return Ok(rows
                    .into_iter()
                    .filter(|row| row.get(id_field) == Some(id))
                    .map(parse_record)
                    .collect());
            }
            let parsed = rows.into_iter().map(parse_record).collect();
            Ok(engine_query.apply(parsed))
        })
    }

    /// Fetch-through for a path and query: no-op while the freshness
    /// index says the pair is still trusted, otherwise a REST read
    /// whose records and freshness row are committed together.
    pub async fn load(&self, path: &str, query: &Map<String, Value>) -> Result<()> {
        self.load_depth(path, query, 0).await
    }

    fn load_depth<'a>(
        &'a self,
        path: &'a str,
        query: &'a Map<String, Value>,
        depth: u8,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rest_path = paths::rest_path(path);
            let type_name = paths::path_type(&rest_path)?;
            let spec = self.inner.registry.expect(&type_name)?;
            let serialized = canonical_query(query);

            {
                let mut state = self.inner.state.lock().await;
                let now = Utc::now();
                let ttl = self.inner.ttl;
                let fully_static = spec.is_fully_static();
                let hit = state.tracked.iter().position(|row| {
                    let same_path =
                        row.path == path && (row.query == serialized || row.query == "{}");
                    let type_wide = row.path == type_name && row.query == "{}";
                    (same_path || type_wide) && (fully_static || now - row.last_active < ttl)
                });
                if let Some(index) = hit {
                    // Reuse refreshes the freshness window.
                    state.tracked[index].last_active = now;
                    self.persist_tracked(&state)?;
                    return Ok(());
                }
            }

            let resolved = paths::resolve(&self.inner.registry, &rest_path)?;
            if self.terminal_record_cached(&resolved).await? {
                return Ok(());
            }
            let parent_scope = self.parent_scope(&rest_path, &resolved, depth).await?;

            let data = self.inner.rest.get(&rest_path, query).await?;
            let data = paths::unwrap_envelope(data, &rest_path)?;
            let records: Vec<Record> = match data {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => Some(map),
                        other => {
                            warn!(%rest_path, ?other, "dropping non-object record");
                            None
                        }
                    })
                    .collect(),
                Value::Object(map) => vec![map],
                other => {
                    warn!(%rest_path, ?other, "unexpected envelope payload");
                    Vec::new()
                }
            };

            // Records and the freshness row commit in one lock scope:
            // a failed write leaves no row behind, so the next attempt
            // retries instead of trusting a half-written cache.
            let mut state = self.inner.state.lock().await;
            for record in records {
                put_locked(
                    &mut state,
                    &self.inner.registry,
                    &resolved.entity_type,
                    record,
                    parent_scope.as_ref(),
                );
            }
            self.persist_table(&state, &resolved.entity_type)?;
            let now = Utc::now();
            let existing = state
                .tracked
                .iter()
                .position(|row| row.path == path && row.query == serialized);
            match existing {
                Some(index) => state.tracked[index].last_active = now,
                None => state.tracked.push(TrackedPath {
                    path: path.to_string(),
                    query: serialized,
                    last_active: now,
                }),
            }
            self.persist_tracked(&state)?;
            Ok(())
        })
    }

    /// Merge one record into its type's table (push deltas call this).
    pub async fn put(
        &self,
        type_name: &str,
        record: Record,
        parent_scope: Option<(String, Value)>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        put_locked(
            &mut state,
            &self.inner.registry,
            type_name,
            record,
            parent_scope.as_ref(),
        );
        self.persist_table(&state, type_name)?;
        Ok(())
    }

    /// Bump `last_active` on existing freshness rows; used on tab
    /// unload so a successor leader inherits freshness.
    pub async fn activate(&self, entries: &[(String, String)]) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let now = Utc::now();
        for (path, serialized) in entries {
            if let Some(row) = state
                .tracked
                .iter_mut()
                .find(|row| &row.path == path && &row.query == serialized)
            {
                row.last_active = now;
            }
        }
        self.persist_tracked(&state)?;
        Ok(())
    }

    /// Destroy and recreate the persistent store, then fire the reload
    /// hook; in-memory collections cannot be reconciled against an
    /// emptied store.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            std::fs::remove_dir_all(&self.inner.dir)?;
            std::fs::create_dir_all(&self.inner.dir)?;
            *state = StoreState::default();
        }
        match &*self.inner.reload_hook.lock() {
            Some(hook) => hook(),
            None => warn!("cache cleared but no reload hook is registered"),
        }
        Ok(())
    }

    /// A cached record already in its terminal state never re-fetches.
    async fn terminal_record_cached(&self, resolved: &ResolvedPath) -> Result<bool> {
        let Some(id) = &resolved.direct_id else {
            return Ok(false);
        };
        let spec = self.inner.registry.expect(&resolved.entity_type)?;
        let state = self.inner.state.lock().await;
        let cached = state
            .tables
            .get(&resolved.entity_type)
            .and_then(|rows| rows.iter().find(|row| row.get(spec.id_field()) == Some(id)));
        Ok(cached.is_some_and(|row| spec.record_is_static(&parse_record(row.clone()))))
    }

    /// The canonical id a child write is scoped under, if any.
    async fn parent_scope(
        &self,
        rest_path: &str,
        resolved: &ResolvedPath,
        depth: u8,
    ) -> Result<Option<(String, Value)>> {
        if let Some(link) = &resolved.parent {
            let id = self.parent_id(link, depth).await?;
            return Ok(Some((link.id_field.clone(), id)));
        }
        // A collection nested under a concrete parent keeps a private
        // back-reference to it so parent-scoped filters keep working
        // for records that never carry the parent field themselves.
        let segments: Vec<&str> = rest_path.split('/').collect();
        if segments.len() >= 3 && segments.len() % 2 == 1 {
            let parent_name = segments[segments.len() - 3];
            if let Some(parent_spec) = self.inner.registry.get(parent_name) {
                let value = paths::number_or_string(segments[segments.len() - 2]);
                return Ok(Some((parent_spec.id_field().to_string(), value)));
            }
        }
        Ok(None)
    }

    /// Resolve a non-canonical parent reference to its canonical id by
    /// loading the parent's own path first.
    async fn parent_id(&self, link: &ParentLink, depth: u8) -> Result<Value> {
        if depth >= MAX_RESOLUTION_DEPTH {
            return Err(Error::ResolutionDepth(link.parent_path.clone()));
        }
        let empty = Map::new();
        if let Err(e) = self.load_depth(&link.parent_path, &empty, depth + 1).await {
            warn!(path = %link.parent_path, error = %e, "parent fetch-through failed");
        }
        let records = self.get_depth(&link.parent_path, &empty, depth + 1).await?;
        records
            .first()
            .and_then(|record| record.get(&link.id_field))
            .cloned()
            .ok_or_else(|| Error::ParentNotFound(link.parent_path.clone()))
    }

    fn persist_table(&self, state: &StoreState, type_name: &str) -> Result<()> {
        let rows = state.tables.get(type_name).cloned().unwrap_or_default();
        let path = self.inner.dir.join(format!("{type_name}.json"));
        let contents = serde_json::to_string_pretty(&rows)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn persist_tracked(&self, state: &StoreState) -> Result<()> {
        let path = self.inner.dir.join(PATHS_FILE);
        let contents = serde_json::to_string_pretty(&state.tracked)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    #[cfg(test)]
    async fn age_tracked(&self, path: &str, query: &str, age: ChronoDuration) {
        let mut state = self.inner.state.lock().await;
        for row in state.tracked.iter_mut() {
            if row.path == path && row.query == query {
                row.last_active = Utc::now() - age;
            }
        }
    }
}

/// Merge a record into its table: partial deltas widen existing rows,
/// nested object/array fields are serialized for storage, id-less
/// types get a surrogate key, and parent-scoped writes append the
/// parent's canonical id to the private `_<field>` back-reference.
fn put_locked(
    state: &mut StoreState,
    registry: &SchemaRegistry,
    type_name: &str,
    record: Record,
    parent_scope: Option<&(String, Value)>,
) {
    let Some(spec) = registry.get(type_name) else {
        warn!(r#type = %type_name, "dropping record for unknown entity type");
        return;
    };
    let id_field = spec.id_field();
    let mut record = serialize_record(record);
    if spec.primary_id.is_none() && !record.contains_key(id_field) {
        state.surrogate_seq += 1;
        record.insert(id_field.to_string(), Value::from(state.surrogate_seq));
    }

    let table = state.tables.entry(type_name.to_string()).or_default();
    let id = record.get(id_field).cloned();
    let existing = id
        .as_ref()
        .and_then(|id| table.iter().position(|row| row.get(id_field) == Some(id)));
    match existing {
        Some(index) => {
            let row = &mut table[index];
            for (key, value) in record {
                row.insert(key, value);
            }
            if let Some((field, parent_id)) = parent_scope {
                append_backref(row, field, parent_id);
            }
        }
        None => {
            if let Some((field, parent_id)) = parent_scope {
                append_backref(&mut record, field, parent_id);
            }
            table.push(record);
        }
    }
}

fn append_backref(record: &mut Record, field: &str, parent_id: &Value) {
    let key = format!("_{field}");
    let mut ids = match record.get(&key) {
        Some(Value::String(s)) => serde_json::from_str::<Vec<Value>>(s).unwrap_or_default(),
        _ => Vec::new(),
    };
    if !ids.contains(parent_id) {
        ids.push(parent_id.clone());
    }
    record.insert(key, Value::String(Value::Array(ids).to_string()));
}

/// Storage form: nested object/array fields held as JSON strings.
fn serialize_record(record: Record) -> Record {
    record
        .into_iter()
        .map(|(key, value)| match value {
            Value::Object(_) | Value::Array(_) => (key, Value::String(value.to_string())),
            scalar => (key, scalar),
        })
        .collect()
}

/// Read form: serialized nested fields parsed back into values.
fn parse_record(record: Record) -> Record {
    record
        .into_iter()
        .map(|(key, value)| match &value {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ (Value::Object(_) | Value::Array(_))) => (key, parsed),
                _ => (key, value),
            },
            _ => (key, value),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::api::ApiError;

    /// Serves canned envelopes keyed by rest path and counts fetches.
    struct StubRest {
        responses: HashMap<String, Value>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubRest {
        fn new(responses: Vec<(&str, Value)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                responses: HashMap::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl RestClient for StubRest {
        async fn get(
            &self,
            path: &str,
            _params: &Map<String, Value>,
        ) -> std::result::Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::ServerError("boom".into()));
            }
            self.responses
                .get(path)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(path.to_string()))
        }

        async fn post(
            &self,
            _path: &str,
            _body: Value,
        ) -> std::result::Result<Value, ApiError> {
            Ok(Value::Null)
        }
    }

    async fn store_with(rest: Arc<StubRest>) -> (CacheStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(
            Arc::new(SchemaRegistry::standard()),
            rest,
            dir.path().to_path_buf(),
            2_000,
        )
        .await
        .unwrap();
        (store, dir)
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn put_serializes_and_get_parses_nested_fields() {
        let (store, _dir) = store_with(Arc::new(StubRest::new(vec![]))).await;
        store
            .put(
                "changes",
                record(json!({"changeid": 1, "files": ["a.rs", "b.rs"]})),
                None,
            )
            .await
            .unwrap();

        let rows = store.get("changes/1", &Map::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("files"), Some(&json!(["a.rs", "b.rs"])));
    }

    #[tokio::test]
    async fn partial_deltas_widen_existing_records() {
        let (store, _dir) = store_with(Arc::new(StubRest::new(vec![]))).await;
        store
            .put(
                "builds",
                record(json!({"buildid": 1, "complete": false, "results": null})),
                None,
            )
            .await
            .unwrap();
        store
            .put(
                "builds",
                record(json!({"buildid": 1, "complete": true, "complete_at": 1000})),
                None,
            )
            .await
            .unwrap();

        let rows = store.get("builds/1", &Map::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("complete"), Some(&json!(true)));
        assert_eq!(rows[0].get("complete_at"), Some(&json!(1000)));
        assert_eq!(rows[0].get("results"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn idless_types_get_surrogate_keys() {
        let (store, _dir) = store_with(Arc::new(StubRest::new(vec![]))).await;
        store
            .put("properties", record(json!({"name": "revision"})), None)
            .await
            .unwrap();
        store
            .put("properties", record(json!({"name": "branch"})), None)
            .await
            .unwrap();

        let rows = store.get("properties", &Map::new()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].get("id"), rows[1].get("id"));
    }

    #[tokio::test]
    async fn unknown_type_reads_empty() {
        let (store, _dir) = store_with(Arc::new(StubRest::new(vec![]))).await;
        let rows = store.get("shipments", &Map::new()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn fresh_paths_skip_the_network() {
        let rest = Arc::new(StubRest::new(vec![(
            "builds",
            json!({"builds": [{"buildid": 1}, {"buildid": 2}]}),
        )]));
        let (store, _dir) = store_with(rest.clone()).await;

        store.load("builds/*/*", &Map::new()).await.unwrap();
        store.load("builds/*/*", &Map::new()).await.unwrap();
        assert_eq!(rest.calls(), 1);

        let rows = store.get("builds", &Map::new()).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn stale_paths_refetch_unless_static() {
        let rest = Arc::new(StubRest::new(vec![
            ("builds", json!({"builds": [{"buildid": 1}]})),
            ("builders", json!({"builders": [{"builderid": 1}]})),
        ]));
        let (store, _dir) = store_with(rest.clone()).await;

        store.load("builds/*/*", &Map::new()).await.unwrap();
        store
            .age_tracked("builds/*/*", "{}", ChronoDuration::seconds(10))
            .await;
        store.load("builds/*/*", &Map::new()).await.unwrap();
        assert_eq!(rest.calls(), 2);

        // A fully static type never re-fetches regardless of age.
        store.load("builders/*/*", &Map::new()).await.unwrap();
        store
            .age_tracked("builders/*/*", "{}", ChronoDuration::days(30))
            .await;
        store.load("builders/*/*", &Map::new()).await.unwrap();
        assert_eq!(rest.calls(), 3);
    }

    #[tokio::test]
    async fn terminal_records_are_trusted_without_refetch() {
        let rest = Arc::new(StubRest::new(vec![]));
        let (store, _dir) = store_with(rest.clone()).await;
        store
            .put("builds", record(json!({"buildid": 7, "complete": true})), None)
            .await
            .unwrap();

        store.load("builds/7", &Map::new()).await.unwrap();
        assert_eq!(rest.calls(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_freshness_row() {
        let rest = Arc::new(StubRest::failing());
        let (store, _dir) = store_with(rest.clone()).await;

        assert!(store.load("builds/*/*", &Map::new()).await.is_err());
        assert_eq!(rest.calls(), 1);

        // The next attempt is not spuriously considered fresh.
        assert!(store.load("builds/*/*", &Map::new()).await.is_err());
        assert_eq!(rest.calls(), 2);
    }

    #[tokio::test]
    async fn indirect_resolution_substitutes_the_canonical_id() {
        let rest = Arc::new(StubRest::new(vec![
            (
                "builds/12/steps/compile",
                json!({"steps": [{"stepid": 5, "buildid": 12, "name": "compile"}]}),
            ),
            (
                "builds/12/steps/compile/logs",
                json!({"logs": [{"logid": 9, "slug": "stdio"}]}),
            ),
        ]));
        let (store, _dir) = store_with(rest.clone()).await;

        store
            .load("builds/12/steps/compile/logs", &Map::new())
            .await
            .unwrap();
        let rows = store
            .get("builds/12/steps/compile/logs", &Map::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("logid"), Some(&json!(9)));
    }

    #[tokio::test]
    async fn clear_recreates_the_store_and_fires_the_hook() {
        let (store, _dir) = store_with(Arc::new(StubRest::new(vec![]))).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        store.set_reload_hook(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        store
            .put("builds", record(json!({"buildid": 1})), None)
            .await
            .unwrap();
        store.clear().await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let rows = store.get("builds", &Map::new()).await.unwrap();
        assert!(rows.is_empty());
    }
}
