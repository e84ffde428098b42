//! Shared Kubernetes utilities using kube-rs
//!
//! Covers the pieces both reconcilers need: building `ApiResource`s for
//! arbitrary manifests, typed Server-Side Apply status patches, finalizer
//! merge patches, manifest hashing and CRD schema helpers for free-form
//! fields.

use kube::api::{Api, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::Error;

/// Extension key that tells the API server to keep arbitrary nested fields
pub const PRESERVE_UNKNOWN_FIELDS: &str = "x-kubernetes-preserve-unknown-fields";

/// Build an `ApiResource` from an apiVersion string and kind.
///
/// The plural is derived from the kind; for kinds with irregular plurals
/// prefer the discovery-backed path in the resource client.
///
/// ```ignore
/// let ar = build_api_resource("apps/v1", "Deployment");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "default", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version).
///
/// ```
/// use testplane_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Kinds whose plural does not follow the simple suffix rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("ingressclass", "ingressclasses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("priorityclass", "priorityclasses"),
    ("storageclass", "storageclasses"),
    ("runtimeclass", "runtimeclasses"),
    ("gatewayclass", "gatewayclasses"),
    ("poddisruptionbudget", "poddisruptionbudgets"),
    ("integrationtest", "integrationtests"),
    ("loadtest", "loadtests"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple
/// pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x')
    {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Hex-encoded SHA-256 of the input bytes.
///
/// Stable across toolchains, so safe to persist in annotations.
pub fn sha256_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

// =============================================================================
// Status persistence
// =============================================================================

/// Build the Server-Side Apply body for a status patch.
///
/// The body carries only the object's identity and the new status, so the
/// field owner claims the status fields and nothing else.
pub fn status_apply_body<K>(obj: &K, status: &impl Serialize) -> Result<serde_json::Value, Error>
where
    K: Resource<DynamicType = ()>,
{
    let status = serde_json::to_value(status)?;
    let mut metadata = json!({ "name": obj.name_any() });
    if let Some(ns) = obj.namespace() {
        metadata["namespace"] = json!(ns);
    }
    Ok(json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "metadata": metadata,
        "status": status,
    }))
}

/// Persist a status through a forced Server-Side Apply on the status
/// subresource, owned by `field_owner`.
pub async fn apply_status<K>(
    client: &Client,
    obj: &K,
    status: &impl Serialize,
    field_owner: &str,
) -> Result<(), Error>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::internal_with_context("apply_status", "object has no namespace"))?;
    let body = status_apply_body(obj, status)?;
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    api.patch_status(
        &obj.name_any(),
        &PatchParams::apply(field_owner).force(),
        &Patch::Apply(&body),
    )
    .await?;
    debug!(name = %obj.name_any(), namespace = %namespace, field_owner, "status applied");
    Ok(())
}

// =============================================================================
// Finalizers
// =============================================================================

/// True when the object carries the finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Merge patch that sets `metadata.finalizers` to the object's list plus `finalizer`.
///
/// Returns `None` when the finalizer is already present.
pub fn add_finalizer_patch<K: Resource>(obj: &K, finalizer: &str) -> Option<serde_json::Value> {
    if has_finalizer(obj, finalizer) {
        return None;
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    Some(json!({ "metadata": { "finalizers": finalizers } }))
}

/// Merge patch that drops `finalizer` from `metadata.finalizers`.
///
/// Returns `None` when the finalizer is absent.
pub fn remove_finalizer_patch<K: Resource>(obj: &K, finalizer: &str) -> Option<serde_json::Value> {
    if !has_finalizer(obj, finalizer) {
        return None;
    }
    let finalizers: Vec<&String> = obj.finalizers().iter().filter(|f| *f != finalizer).collect();
    Some(json!({ "metadata": { "finalizers": finalizers } }))
}

/// Merge patch setting a single annotation
pub fn annotation_patch(key: &str, value: &str) -> serde_json::Value {
    json!({ "metadata": { "annotations": { key: value } } })
}

/// Apply a merge patch to the main resource (finalizers, annotations)
pub async fn merge_patch<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    patch: &serde_json::Value,
    field_owner: &str,
) -> Result<(), Error>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.patch(name, &PatchParams::apply(field_owner), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Fetch a namespaced object straight from the API server.
///
/// NotFound maps to `Ok(None)`.
pub async fn get_opt<K>(client: &Client, name: &str, namespace: &str) -> Result<Option<K>, Error>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

// =============================================================================
// CRD schema helpers
// =============================================================================

/// Schema for a field holding any JSON value (object, array or string).
///
/// Used with `#[schemars(schema_with = "...")]` on manifest fields.
pub fn any_value_schema(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject::default();
    obj.extensions
        .insert(PRESERVE_UNKNOWN_FIELDS.to_string(), json!(true));
    Schema::Object(obj)
}

/// Schema for a free-form JSON object (function parameters).
pub fn free_object_schema(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions
        .insert(PRESERVE_UNKNOWN_FIELDS.to_string(), json!(true));
    Schema::Object(obj)
}
