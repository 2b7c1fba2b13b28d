//! buildcache - client-side data synchronization for build-automation
//! dashboards.
//!
//! The engine keeps a local persistent cache consistent with a remote
//! REST+push data source, de-duplicates overlapping interest across
//! uncoordinated tabs of one profile, and exposes live, auto-updating
//! collections to presentation code:
//!
//! - [`schema`]: the entity catalog and child-path grammar
//! - [`paths`]: path resolution into (type, filter, id)
//! - [`query`]: filter/sort/paginate/project over record sets
//! - [`cache`]: the persistent table-per-type store and freshness index
//! - [`transport`]: the correlated duplex push/command channel
//! - [`bus`]: cross-tab coordination and leader election
//! - [`subscription`]: interest aggregation and consume management
//! - [`collection`]: reactive collections and entity wrappers
//!
//! Exactly one tab (the elected leader) owns the live transport; all
//! tabs share interest over the bus and read through the shared store.

pub mod api;
pub mod bus;
pub mod cache;
mod client;
pub mod collection;
pub mod config;
pub mod error;
pub mod paths;
pub mod query;
pub mod schema;
pub mod subscription;
pub mod transport;

pub use api::{ApiError, HttpClient, RestClient};
pub use bus::{Bus, EventKind};
pub use cache::CacheStore;
pub use client::{DataAccessor, DataClient};
pub use collection::{Collection, EntityWrapper};
pub use config::Config;
pub use error::{Error, Result};
pub use schema::{EntitySpec, SchemaRegistry, Staticness};
pub use subscription::{Role, SubscriptionManager};
pub use transport::{Command, Connector, SocketEvent, SocketHandle, Transport};
