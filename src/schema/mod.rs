//! Schema registry for the build-automation dashboard data model.
//!
//! Every entity type the remote data source exposes is described by an
//! [`EntitySpec`]: its primary id field, optional natural identifier,
//! declared fields, child-path grammar and staticness. The registry is
//! immutable after construction and is passed by reference to every
//! component that needs it.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Path-segment binder prefix for opaque identifier fields (`i:name`)
pub const IDENTIFIER_BINDER: &str = "i";

/// Path-segment binder prefix for numeric fields (`n:number`)
pub const NUMBER_BINDER: &str = "n";

/// Surrogate primary key field assigned to types that declare no id
pub const SURROGATE_ID_FIELD: &str = "id";

/// When a record stops changing.
#[derive(Debug, Clone, PartialEq)]
pub enum Staticness {
    /// Records of this type keep changing for their whole lifetime.
    Never,
    /// The type never changes once created; safe to cache indefinitely.
    Always,
    /// An individual record is immutable from the moment the named
    /// field holds the given value (e.g. `complete == true`).
    WhenField { field: &'static str, value: Value },
}

/// Static description of one entity type and its child-path grammar.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub type_name: &'static str,
    /// Primary id field; `None` means records get a surrogate key.
    pub primary_id: Option<&'static str>,
    /// Alternate human-meaningful unique field usable in paths.
    pub identifier: Option<&'static str>,
    pub fields: &'static [&'static str],
    /// Root types are reachable as the first path segment.
    pub root: bool,
    /// Child path templates, e.g. `steps/i:name/logs/i:slug/contents`.
    pub paths: &'static [&'static str],
    pub staticness: Staticness,
}

impl EntitySpec {
    /// The field records of this type are keyed by in the store.
    pub fn id_field(&self) -> &'static str {
        self.primary_id.unwrap_or(SURROGATE_ID_FIELD)
    }

    /// Whether the whole type is immutable once cached.
    pub fn is_fully_static(&self) -> bool {
        matches!(self.staticness, Staticness::Always)
    }

    /// Whether this particular record has reached its terminal state.
    pub fn record_is_static(&self, record: &serde_json::Map<String, Value>) -> bool {
        match &self.staticness {
            Staticness::Never => false,
            Staticness::Always => true,
            Staticness::WhenField { field, value } => record.get(*field) == Some(value),
        }
    }

    pub fn declares_field(&self, field: &str) -> bool {
        self.fields.contains(&field)
    }
}

/// Immutable lookup of entity specs, validated at construction.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    specs: HashMap<&'static str, EntitySpec>,
}

impl SchemaRegistry {
    /// Build a registry, failing fast on configuration errors: every
    /// non-binder segment of every child pattern must name a registered
    /// type, and every binder must name a field the segment to its left
    /// declares.
    pub fn new(specs: Vec<EntitySpec>) -> Result<Self> {
        let registry = Self {
            specs: specs.into_iter().map(|s| (s.type_name, s)).collect(),
        };
        registry.validate()?;
        Ok(registry)
    }

    pub fn get(&self, type_name: &str) -> Option<&EntitySpec> {
        self.specs.get(type_name)
    }

    pub fn expect(&self, type_name: &str) -> Result<&EntitySpec> {
        self.get(type_name)
            .ok_or_else(|| Error::UnknownType(type_name.to_string()))
    }

    pub fn root_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.values().filter(|s| s.root).map(|s| s.type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }

    fn validate(&self) -> Result<()> {
        for spec in self.specs.values() {
            for pattern in spec.paths {
                let mut current_type = spec.type_name;
                for segment in pattern.split('/') {
                    match segment.split_once(':') {
                        Some((_, field)) => {
                            let owner = self.specs.get(current_type).ok_or_else(|| {
                                Error::InvalidSchema(format!(
                                    "pattern {pattern} of {} passes through unregistered type {current_type}",
                                    spec.type_name
                                ))
                            })?;
                            if !owner.declares_field(field) && owner.primary_id != Some(field) {
                                return Err(Error::InvalidSchema(format!(
                                    "pattern {pattern} of {} binds field {field} not declared on {current_type}",
                                    spec.type_name
                                )));
                            }
                        }
                        None => {
                            if !self.specs.contains_key(segment) {
                                return Err(Error::InvalidSchema(format!(
                                    "pattern {pattern} of {} targets unregistered type {segment}",
                                    spec.type_name
                                )));
                            }
                            current_type = segment;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The standard build-automation dashboard schema.
    pub fn standard() -> Self {
        Self::new(standard_specs()).expect("standard schema is self-consistent")
    }
}

fn complete_means_static() -> Staticness {
    Staticness::WhenField {
        field: "complete",
        value: Value::Bool(true),
    }
}

fn standard_specs() -> Vec<EntitySpec> {
    vec![
        EntitySpec {
            type_name: "builds",
            primary_id: Some("buildid"),
            identifier: None,
            fields: &[
                "buildid",
                "builderid",
                "buildrequestid",
                "workerid",
                "complete",
                "complete_at",
                "masterid",
                "number",
                "results",
                "started_at",
                "state_string",
            ],
            root: true,
            paths: &[
                "changes",
                "properties",
                "steps",
                "steps/i:name",
                "steps/i:name/logs",
                "steps/i:name/logs/i:slug",
                "steps/i:name/logs/i:slug/contents",
                "steps/i:name/logs/i:slug/raw",
                "steps/n:number",
                "steps/n:number/logs",
                "steps/n:number/logs/i:slug",
                "steps/n:number/logs/i:slug/contents",
                "steps/n:number/logs/i:slug/raw",
            ],
            staticness: complete_means_static(),
        },
        EntitySpec {
            type_name: "builders",
            primary_id: Some("builderid"),
            identifier: Some("name"),
            fields: &["builderid", "description", "name", "tags"],
            root: true,
            paths: &[
                "forceschedulers",
                "buildrequests",
                "masters",
                "masters/n:masterid",
                "workers",
                "workers/i:name",
                "workers/n:workerid",
                "builds",
                "builds/n:number",
                "builds/n:number/steps",
                "builds/n:number/steps/i:name",
                "builds/n:number/steps/i:name/logs",
                "builds/n:number/steps/i:name/logs/i:slug",
                "builds/n:number/steps/i:name/logs/i:slug/contents",
                "builds/n:number/steps/i:name/logs/i:slug/raw",
                "builds/n:number/steps/n:number",
                "builds/n:number/steps/n:number/logs",
                "builds/n:number/steps/n:number/logs/i:slug",
                "builds/n:number/steps/n:number/logs/i:slug/contents",
                "builds/n:number/steps/n:number/logs/i:slug/raw",
            ],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "buildrequests",
            primary_id: Some("buildrequestid"),
            identifier: None,
            fields: &[
                "buildrequestid",
                "builderid",
                "buildsetid",
                "claimed",
                "claimed_at",
                "claimed_by_masterid",
                "complete",
                "complete_at",
                "priority",
                "results",
                "submitted_at",
                "waited_for",
            ],
            root: true,
            paths: &["builds"],
            staticness: complete_means_static(),
        },
        EntitySpec {
            type_name: "buildsets",
            primary_id: Some("bsid"),
            identifier: None,
            fields: &[
                "bsid",
                "complete",
                "complete_at",
                "external_idstring",
                "parent_buildid",
                "parent_relationship",
                "reason",
                "results",
                "sourcestamps",
                "submitted_at",
            ],
            root: true,
            paths: &["properties"],
            staticness: complete_means_static(),
        },
        EntitySpec {
            type_name: "workers",
            primary_id: Some("workerid"),
            identifier: Some("name"),
            fields: &["workerid", "configured_on", "connected_to", "name", "workerinfo"],
            root: true,
            paths: &[],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "changes",
            primary_id: Some("changeid"),
            identifier: None,
            fields: &[
                "changeid",
                "author",
                "branch",
                "category",
                "codebase",
                "comments",
                "files",
                "parent_changeids",
                "project",
                "properties",
                "repository",
                "revision",
                "revlink",
                "sourcestamp",
                "when_timestamp",
            ],
            root: true,
            paths: &[],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "changesources",
            primary_id: Some("changesourceid"),
            identifier: None,
            fields: &["changesourceid", "master", "name"],
            root: true,
            paths: &[],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "forceschedulers",
            primary_id: Some("name"),
            identifier: None,
            fields: &["name", "all_fields", "builder_names", "label"],
            root: true,
            paths: &[],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "masters",
            primary_id: Some("masterid"),
            identifier: None,
            fields: &["masterid", "active", "last_active", "name"],
            root: true,
            paths: &[
                "builders",
                "builders/n:builderid",
                "builders/n:builderid/workers",
                "builders/n:builderid/workers/n:workerid",
                "builders/n:builderid/workers/i:name",
                "workers",
                "workers/i:name",
                "workers/n:workerid",
                "changesources",
                "changesources/n:changesourceid",
                "schedulers",
                "schedulers/n:schedulerid",
            ],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "schedulers",
            primary_id: Some("schedulerid"),
            identifier: None,
            fields: &["schedulerid", "master", "name"],
            root: true,
            paths: &[],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "sourcestamps",
            primary_id: Some("ssid"),
            identifier: None,
            fields: &[
                "ssid",
                "branch",
                "codebase",
                "created_at",
                "patch",
                "project",
                "repository",
                "revision",
            ],
            root: true,
            paths: &["changes"],
            staticness: Staticness::Always,
        },
        EntitySpec {
            type_name: "steps",
            primary_id: Some("stepid"),
            identifier: Some("name"),
            fields: &[
                "stepid",
                "buildid",
                "complete",
                "complete_at",
                "hidden",
                "name",
                "number",
                "results",
                "started_at",
                "state_string",
                "urls",
            ],
            root: false,
            paths: &["logs", "logs/i:slug", "logs/i:slug/contents", "logs/i:slug/raw"],
            staticness: complete_means_static(),
        },
        EntitySpec {
            type_name: "logs",
            primary_id: Some("logid"),
            identifier: Some("slug"),
            fields: &["logid", "complete", "name", "num_lines", "slug", "stepid", "type"],
            root: false,
            paths: &["contents", "raw"],
            staticness: complete_means_static(),
        },
        // Pseudo-resources without ids of their own; the store assigns
        // surrogate keys.
        EntitySpec {
            type_name: "properties",
            primary_id: None,
            identifier: None,
            fields: &[],
            root: false,
            paths: &[],
            staticness: Staticness::Never,
        },
        EntitySpec {
            type_name: "contents",
            primary_id: None,
            identifier: None,
            fields: &[],
            root: false,
            paths: &[],
            staticness: Staticness::Never,
        },
        EntitySpec {
            type_name: "raw",
            primary_id: None,
            identifier: None,
            fields: &[],
            root: false,
            paths: &[],
            staticness: Staticness::Never,
        },
    ]
}
