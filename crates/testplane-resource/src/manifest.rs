//! Manifest expansion
//!
//! A manifest is whatever the user put in `resource.manifest`: an object, an
//! array of objects, a `List`-style object with `items`, or a string holding
//! JSON or multi-document YAML. Expansion turns it into an ordered sequence
//! of individual, namespace-local objects.

use serde_json::{Map, Value};

use testplane_common::crd::{ResourceAction, ResourceIdentity};
use testplane_common::yaml::parse_manifest_text;
use testplane_common::Error;

/// One object produced by expanding a manifest
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestObject {
    /// Identity with the namespace filled in
    pub identity: ResourceIdentity,
    /// Body to apply; for deletes only the identity fields remain
    pub body: Value,
}

/// Raw bytes of a manifest, used for change detection.
///
/// Strings hash as written; structured manifests hash as compact JSON.
pub fn manifest_bytes(manifest: &Value) -> Vec<u8> {
    match manifest {
        Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

/// Read the identity of an object value, if it has one
pub fn identity_of(object: &Value) -> Option<ResourceIdentity> {
    let api_version = object.get("apiVersion")?.as_str()?.to_string();
    let kind = object.get("kind")?.as_str()?.to_string();
    let metadata = object.get("metadata")?;
    let name = metadata.get("name")?.as_str()?.to_string();
    if api_version.is_empty() || kind.is_empty() || name.is_empty() {
        return None;
    }
    Some(ResourceIdentity {
        api_version,
        kind,
        namespace: metadata
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .map(String::from),
        name,
    })
}

/// Expand a manifest into individual objects, preserving document order.
///
/// `apiVersion`, `kind` and `metadata.name` are required on every object.
/// A missing namespace is filled from `namespace`; an object naming any
/// other namespace is rejected.
pub fn expand(
    manifest: &Value,
    namespace: &str,
    action: ResourceAction,
) -> Result<Vec<ManifestObject>, Error> {
    let parsed = match manifest {
        Value::String(text) => parse_manifest_text(text)?,
        other => other.clone(),
    };

    let raw = flatten(parsed)?;
    if raw.is_empty() {
        return Err(Error::manifest("manifest contains no objects"));
    }

    raw.into_iter()
        .enumerate()
        .map(|(i, obj)| normalize(obj, namespace, action).map_err(|e| indexed(i, e)))
        .collect()
}

/// Expand a manifest that must hold exactly one object.
///
/// Lists and arrays are rejected even when they hold a single item.
pub fn expand_single(
    manifest: &Value,
    namespace: &str,
    action: ResourceAction,
) -> Result<ManifestObject, Error> {
    let parsed = match manifest {
        Value::String(text) => parse_manifest_text(text)?,
        other => other.clone(),
    };
    if parsed.is_array() || parsed.get("items").is_some() {
        return Err(Error::manifest("expected a single object, found a list"));
    }
    normalize(parsed, namespace, action)
}

fn indexed(i: usize, e: Error) -> Error {
    match e {
        Error::Manifest { message } => Error::manifest(format!("object {i}: {message}")),
        other => other,
    }
}

fn flatten(parsed: Value) -> Result<Vec<Value>, Error> {
    match parsed {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.extend(flatten(item)?);
            }
            Ok(out)
        }
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => flatten(Value::Array(items)),
            Some(Value::Null) => Ok(Vec::new()),
            Some(_) => Err(Error::manifest("items must be an array")),
            None => Ok(vec![Value::Object(map)]),
        },
        other => Err(Error::manifest(format!(
            "expected an object, found {}",
            type_name(&other)
        ))),
    }
}

fn normalize(obj: Value, namespace: &str, action: ResourceAction) -> Result<ManifestObject, Error> {
    let mut map = match obj {
        Value::Object(map) => map,
        other => {
            return Err(Error::manifest(format!(
                "expected an object, found {}",
                type_name(&other)
            )))
        }
    };

    let api_version = required_str(&map, "apiVersion")?;
    let kind = required_str(&map, "kind")?;
    let metadata = map
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(metadata) = metadata else {
        return Err(Error::manifest("metadata must be an object"));
    };
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .ok_or_else(|| Error::manifest(format!("{kind} is missing metadata.name")))?;

    match metadata.get("namespace").and_then(Value::as_str) {
        Some(ns) if !ns.is_empty() && ns != namespace => {
            return Err(Error::manifest(format!(
                "{kind} {name} targets namespace '{ns}' but the test lives in '{namespace}'"
            )));
        }
        _ => {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
    }

    let identity = ResourceIdentity {
        api_version: api_version.clone(),
        kind: kind.clone(),
        namespace: Some(namespace.to_string()),
        name: name.clone(),
    };

    let body = match action {
        ResourceAction::Apply => Value::Object(map),
        ResourceAction::Delete => serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": name, "namespace": namespace },
        }),
    };

    Ok(ManifestObject { identity, body })
}

fn required_str(map: &Map<String, Value>, field: &str) -> Result<String, Error> {
    map.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| Error::manifest(format!("missing {field}")))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
