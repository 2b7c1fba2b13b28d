//! Local persistent cache for dashboard entities.
//!
//! One table per entity type, mirrored between memory and a JSON file
//! per table, plus a `paths` freshness index deciding when a
//! `(path, query)` needs a REST fetch-through. Nested object/array
//! fields are stored serialized and parsed back on read.

pub mod store;

pub use store::{canonical_query, CacheStore, TrackedPath};
