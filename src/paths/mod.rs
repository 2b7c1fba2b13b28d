//! Path resolution against the schema's child-path grammar.
//!
//! A path string like `builds/12/steps/compile/logs` is resolved into
//! the entity type it targets plus either a direct primary-key lookup
//! or a disambiguating filter. The resolver is pure given the schema
//! registry; when a pattern binds a non-canonical parent key the result
//! carries a [`ParentLink`] and the cache store performs the indirect
//! resolution (the cache is keyed by canonical ids, never natural
//! identifiers).
//!
//! Also home to the small path-string helpers shared by every layer:
//! the REST form (wildcards stripped), the socket form (wildcard suffix
//! appended), and the endpoint form (trailing id trimmed).

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::schema::{EntitySpec, SchemaRegistry, IDENTIFIER_BINDER, NUMBER_BINDER};

/// Link to a parent whose canonical id must be looked up before the
/// child query can run.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    /// The parent's own path, e.g. `builds/12/steps/compile`.
    pub parent_path: String,
    pub parent_type: String,
    /// The parent's primary id field the child filter will use.
    pub id_field: String,
}

/// The normalized target of a path string.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub entity_type: String,
    pub filter: Map<String, Value>,
    pub direct_id: Option<Value>,
    pub parent: Option<ParentLink>,
}

impl ResolvedPath {
    fn direct(entity_type: &str, id: Value) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            filter: Map::new(),
            direct_id: Some(id),
            parent: None,
        }
    }
}

/// Coerce numeric-looking tokens to JSON numbers; all else stays string.
pub fn number_or_string(token: &str) -> Value {
    match token.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(token.to_string()),
    }
}

fn segments_of(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty() && *s != "*").collect()
}

/// The entity type a path targets, ignoring wildcard segments.
pub fn path_type(path: &str) -> Result<String> {
    let mut segs = segments_of(path);
    if segs.len() % 2 == 0 {
        segs.pop();
    }
    segs.pop()
        .map(str::to_string)
        .ok_or_else(|| Error::UnknownType(path.to_string()))
}

/// Singular form of the target type (`builds` -> `build`).
pub fn singular_type(path: &str) -> Result<String> {
    let t = path_type(path)?;
    Ok(t.strip_suffix('s').unwrap_or(&t).to_string())
}

/// The REST form of a path: wildcard segments stripped.
pub fn rest_path(path: &str) -> String {
    segments_of(path).join("/")
}

/// The endpoint form: wildcards stripped, trailing id segment trimmed.
pub fn endpoint_path(path: &str) -> String {
    let mut segs = segments_of(path);
    if segs.len() % 2 == 0 {
        segs.pop();
    }
    segs.join("/")
}

/// The subscription form: `builds` -> `builds/*/*`, `builds/1` -> `builds/1/*`.
pub fn socket_path(path: &str) -> String {
    let mut segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let odd = segs.len() % 2 == 1;
    segs.push("*");
    if odd {
        segs.push("*");
    }
    segs.join("/")
}

/// Extract the (pluralized) type-keyed member from a REST envelope.
pub fn unwrap_envelope(data: Value, path: &str) -> Result<Value> {
    let type_name = path_type(path)?;
    match data {
        Value::Object(mut map) => map
            .remove(&type_name)
            .ok_or_else(|| Error::Transport(format!("envelope missing key {type_name}"))),
        other => Ok(other),
    }
}

/// Regex matching concrete push keys against a tracked wildcard path.
pub fn wildcard_key_regex(path: &str) -> Result<Regex> {
    let pattern = format!("^{}$", path.replace('*', r"\w+"));
    Regex::new(&pattern).map_err(|e| Error::InvalidSchema(e.to_string()))
}

/// Regex deciding whether one wildcard path subsumes another declared
/// path (wildcards on the right-hand side are allowed to match).
pub fn wildcard_subsume_regex(path: &str) -> Result<Regex> {
    let pattern = format!("^{}$", path.replace('*', r"(\w+|\*)"));
    Regex::new(&pattern).map_err(|e| Error::InvalidSchema(e.to_string()))
}

fn pattern_regex(pattern: &str) -> Result<Regex> {
    let mut parts = Vec::new();
    for segment in pattern.split('/') {
        match segment.split_once(':') {
            Some((binder, _)) if binder == IDENTIFIER_BINDER => parts.push("[a-zA-Z]+".to_string()),
            Some((binder, _)) if binder == NUMBER_BINDER => parts.push(r"\d+".to_string()),
            _ => parts.push(regex::escape(segment)),
        }
    }
    let anchored = format!("^{}$", parts.join("/"));
    Regex::new(&anchored).map_err(|e| Error::InvalidSchema(e.to_string()))
}

fn binder_field(segment: &str) -> Option<&str> {
    segment.split_once(':').map(|(_, field)| field)
}

/// Resolve a concrete path string into its normalized target.
///
/// The returned filter is keyed by canonical fields except when a
/// [`ParentLink`] is present, in which case the caller must substitute
/// the parent's canonical id before querying.
pub fn resolve(registry: &SchemaRegistry, path: &str) -> Result<ResolvedPath> {
    let segments = segments_of(path);
    let root = *segments
        .first()
        .ok_or_else(|| Error::UnknownType(path.to_string()))?;
    let spec = registry.expect(root)?;

    if segments.len() <= 2 {
        return Ok(resolve_root(spec, segments.get(1).copied()));
    }

    let rest = &segments[2..];
    let joined = rest.join("/");
    let mut matched: Option<&str> = None;
    for pattern in spec.paths.iter().copied() {
        if pattern_regex(pattern)?.is_match(&joined) {
            matched = Some(pattern);
        }
    }
    // An unreachable path per the schema is a programming error.
    let matched = matched.ok_or_else(|| Error::SchemaMismatch {
        root: root.to_string(),
        path: joined.clone(),
    })?;

    let mut pattern_segs: Vec<&str> = matched.split('/').collect();
    let mut path_segs: Vec<&str> = rest.to_vec();

    // An even number of trailing segments binds one (field, value) term.
    let mut bound: Option<(String, Value)> = None;
    if path_segs.len() % 2 == 0 {
        if let (Some(value), Some(segment)) = (path_segs.pop(), pattern_segs.pop()) {
            if let Some(field) = binder_field(segment) {
                bound = Some((field.to_string(), number_or_string(value)));
            }
        }
    }

    let entity_type = path_segs.pop().ok_or_else(|| Error::SchemaMismatch {
        root: root.to_string(),
        path: joined.clone(),
    })?;
    pattern_segs.pop();
    let child = registry.expect(entity_type)?;

    // A binding on the child's own primary id is a direct lookup.
    if let Some((field, value)) = &bound {
        if Some(field.as_str()) == child.primary_id {
            return Ok(ResolvedPath::direct(entity_type, value.clone()));
        }
    }

    let parent_value = match path_segs.pop() {
        Some(v) => number_or_string(v),
        None => number_or_string(segments[1]),
    };
    let parent_binder = pattern_segs.pop().and_then(binder_field);

    let mut filter = Map::new();
    let mut parent = None;
    match parent_binder {
        None => {
            filter.insert(spec.id_field().to_string(), parent_value);
        }
        Some(field) => {
            let parent_type = pattern_segs
                .iter()
                .rev()
                .find(|s| !s.contains(':'))
                .copied()
                .unwrap_or(root);
            let parent_spec = registry.expect(parent_type)?;
            if Some(field) == parent_spec.primary_id {
                filter.insert(field.to_string(), parent_value);
            } else {
                // The grammar bound a natural identifier; the cache is
                // keyed by canonical ids, so the parent's own path must
                // be resolved first.
                let parent_path = segments[..2 + path_segs.len() + 1].join("/");
                parent = Some(ParentLink {
                    parent_path,
                    parent_type: parent_type.to_string(),
                    id_field: parent_spec.id_field().to_string(),
                });
            }
        }
    }
    if let Some((field, value)) = bound {
        filter.insert(field, value);
    }

    Ok(ResolvedPath {
        entity_type: entity_type.to_string(),
        filter,
        direct_id: None,
        parent,
    })
}

fn resolve_root(spec: &EntitySpec, id_segment: Option<&str>) -> ResolvedPath {
    let mut filter = Map::new();
    let mut direct_id = id_segment.map(number_or_string);
    if let (Some(Value::String(s)), Some(identifier)) = (&direct_id, spec.identifier) {
        filter.insert(identifier.to_string(), Value::String(s.clone()));
        direct_id = None;
    }
    ResolvedPath {
        entity_type: spec.type_name.to_string(),
        filter,
        direct_id,
        parent: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::standard()
    }

    #[test]
    fn path_helpers() {
        assert_eq!(path_type("builds/*/*").unwrap(), "builds");
        assert_eq!(path_type("builds/1/steps/2").unwrap(), "steps");
        assert_eq!(singular_type("builds").unwrap(), "build");
        assert_eq!(rest_path("builds/*/*"), "builds");
        assert_eq!(socket_path("builds"), "builds/*/*");
        assert_eq!(socket_path("builds/1"), "builds/1/*");
        assert_eq!(endpoint_path("builds/12"), "builds");
        assert_eq!(endpoint_path("builds/12/steps"), "builds/12/steps");
    }

    #[test]
    fn envelope_unwrap_uses_type_key() {
        let data = json!({"builds": [{"buildid": 1}], "meta": {}});
        let unwrapped = unwrap_envelope(data, "builds").unwrap();
        assert_eq!(unwrapped, json!([{"buildid": 1}]));
    }

    #[test]
    fn root_numeric_id_is_direct() {
        let resolved = resolve(&registry(), "builds/123").unwrap();
        assert_eq!(resolved.entity_type, "builds");
        assert_eq!(resolved.direct_id, Some(json!(123)));
        assert!(resolved.filter.is_empty());
    }

    #[test]
    fn root_natural_identifier_becomes_filter() {
        let resolved = resolve(&registry(), "builders/linux").unwrap();
        assert_eq!(resolved.direct_id, None);
        assert_eq!(resolved.filter.get("name"), Some(&json!("linux")));
    }

    #[test]
    fn child_collection_filters_by_parent_id() {
        let resolved = resolve(&registry(), "builds/12/steps").unwrap();
        assert_eq!(resolved.entity_type, "steps");
        assert_eq!(resolved.filter.get("buildid"), Some(&json!(12)));
        assert!(resolved.parent.is_none());
    }

    #[test]
    fn bound_child_field_joins_the_filter() {
        let resolved = resolve(&registry(), "builds/12/steps/5").unwrap();
        assert_eq!(resolved.entity_type, "steps");
        assert_eq!(resolved.filter.get("buildid"), Some(&json!(12)));
        assert_eq!(resolved.filter.get("number"), Some(&json!(5)));
        assert_eq!(resolved.direct_id, None);
    }

    #[test]
    fn binding_the_primary_id_is_a_direct_lookup() {
        let resolved = resolve(&registry(), "masters/1/builders/5/workers/7").unwrap();
        assert_eq!(resolved.entity_type, "workers");
        assert_eq!(resolved.direct_id, Some(json!(7)));
        assert!(resolved.filter.is_empty());
    }

    #[test]
    fn natural_parent_key_requires_indirect_resolution() {
        let resolved = resolve(&registry(), "builds/12/steps/compile/logs").unwrap();
        assert_eq!(resolved.entity_type, "logs");
        let parent = resolved.parent.expect("parent link");
        assert_eq!(parent.parent_path, "builds/12/steps/compile");
        assert_eq!(parent.parent_type, "steps");
        assert_eq!(parent.id_field, "stepid");
    }

    #[test]
    fn unreachable_path_is_a_schema_mismatch() {
        let err = resolve(&registry(), "builds/12/nonsense").unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
    }

    #[test]
    fn declared_patterns_round_trip() {
        let registry = registry();
        let spec = registry.get("builds").unwrap();
        for pattern in spec.paths {
            let mut concrete = vec!["builds".to_string(), "7".to_string()];
            let mut expected_type = "builds";
            for segment in pattern.split('/') {
                match segment.split_once(':') {
                    Some((b, _)) if b == NUMBER_BINDER => concrete.push("3".to_string()),
                    Some(_) => concrete.push("alpha".to_string()),
                    None => {
                        expected_type = segment;
                        concrete.push(segment.to_string());
                    }
                }
            }
            let resolved = resolve(&registry, &concrete.join("/")).unwrap();
            assert_eq!(resolved.entity_type, expected_type, "pattern {pattern}");
        }
    }

    #[test]
    fn wildcard_regexes() {
        let key = wildcard_key_regex("builds/*/*").unwrap();
        assert!(key.is_match("builds/3/new"));
        assert!(key.is_match("builds/1/complete_at"));
        assert!(!key.is_match("builders/3/new"));

        let subsume = wildcard_subsume_regex("builds/*/*").unwrap();
        assert!(subsume.is_match("builds/1/*"));
        assert!(!subsume.is_match("builds/1"));
    }
}
