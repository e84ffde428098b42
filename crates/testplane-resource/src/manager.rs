//! Resource manager
//!
//! Applies and deletes expanded manifest objects on behalf of a parent test,
//! detects convergence and gathers snapshots for expectation evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info};

use testplane_common::crd::{ResourceAction, ResourceIdentity};
use testplane_common::Error;

use crate::client::ClusterClient;
use crate::manifest::ManifestObject;

/// The parent test that owns applied objects
#[derive(Clone, Debug, PartialEq)]
pub struct Owner {
    /// Namespace every owned object must live in
    pub namespace: String,
    /// Controller owner reference stamped on owned objects
    pub reference: OwnerReference,
}

impl Owner {
    /// Build the owner for a namespaced custom resource.
    ///
    /// Fails when the object has no namespace or uid yet.
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<Self, Error> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::internal_with_context("owner", "parent has no namespace"))?;
        let reference = obj
            .controller_owner_ref(&())
            .ok_or_else(|| Error::internal_with_context("owner", "parent has no uid"))?;
        Ok(Self {
            namespace,
            reference,
        })
    }
}

/// Outcome of a convergence check
#[derive(Clone, Debug, PartialEq)]
pub enum Convergence {
    /// The object reached the desired state; carries the live object when it exists
    Ready(Option<Value>),
    /// Not there yet, with a short explanation
    NotReady(String),
}

impl Convergence {
    /// True when converged
    pub fn is_ready(&self) -> bool {
        matches!(self, Convergence::Ready(_))
    }
}

/// Applies, deletes and observes objects with a fixed field owner
#[derive(Clone)]
pub struct ResourceManager {
    client: Arc<dyn ClusterClient>,
    field_owner: &'static str,
}

impl ResourceManager {
    /// Create a manager writing as `field_owner`
    pub fn new(client: Arc<dyn ClusterClient>, field_owner: &'static str) -> Self {
        Self {
            client,
            field_owner,
        }
    }

    /// Underlying cluster client
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// Server-Side Apply an object owned by `owner`.
    ///
    /// The object must live in the owner's namespace.
    pub async fn apply_object(&self, object: &ManifestObject, owner: &Owner) -> Result<Value, Error> {
        ensure_same_namespace(&object.identity, owner)?;
        let mut body = object.body.clone();
        set_owner_reference(&mut body, &owner.reference);
        let live = self.client.apply(&body, self.field_owner).await?;
        info!(object = %object.identity, owner = %owner.reference.name, "applied test resource");
        Ok(live)
    }

    /// Delete an object; a missing object counts as deleted
    pub async fn delete_object(&self, object: &ManifestObject, owner: &Owner) -> Result<(), Error> {
        ensure_same_namespace(&object.identity, owner)?;
        if self.client.get(&object.identity).await?.is_none() {
            debug!(object = %object.identity, "already absent");
            return Ok(());
        }
        let deleted = self.client.delete(&object.identity).await?;
        info!(object = %object.identity, deleted, "deleted test resource");
        Ok(())
    }

    /// Apply or delete depending on the action
    pub async fn execute(
        &self,
        object: &ManifestObject,
        action: ResourceAction,
        owner: &Owner,
    ) -> Result<(), Error> {
        match action {
            ResourceAction::Apply => self.apply_object(object, owner).await.map(|_| ()),
            ResourceAction::Delete => self.delete_object(object, owner).await,
        }
    }

    /// Check whether an object has converged for the given action.
    ///
    /// Apply: the object exists and its controller has observed its latest
    /// generation. Delete: the object is gone.
    pub async fn wait_for_object(
        &self,
        identity: &ResourceIdentity,
        action: ResourceAction,
    ) -> Result<Convergence, Error> {
        let live = self.client.get(identity).await?;
        Ok(match (action, live) {
            (ResourceAction::Apply, None) => Convergence::NotReady(format!("{identity} not found")),
            (ResourceAction::Apply, Some(obj)) => match generation_lag(&obj) {
                Some((generation, observed)) => Convergence::NotReady(format!(
                    "{identity} at generation {generation}, observed {observed}"
                )),
                None => Convergence::Ready(Some(obj)),
            },
            (ResourceAction::Delete, None) => Convergence::Ready(None),
            (ResourceAction::Delete, Some(_)) => {
                Convergence::NotReady(format!("{identity} still present"))
            }
        })
    }

    /// Snapshot the given objects keyed by `apiVersion/kind/name`.
    ///
    /// Objects that do not exist are left out.
    pub async fn gather_state(
        &self,
        identities: &[ResourceIdentity],
    ) -> Result<BTreeMap<String, Value>, Error> {
        let mut state = BTreeMap::new();
        for identity in identities {
            if let Some(obj) = self.client.get(identity).await? {
                state.insert(identity.state_key(), obj);
            }
        }
        Ok(state)
    }
}

fn ensure_same_namespace(identity: &ResourceIdentity, owner: &Owner) -> Result<(), Error> {
    match identity.namespace.as_deref() {
        Some(ns) if ns == owner.namespace => Ok(()),
        other => Err(Error::manifest(format!(
            "{} {} is in namespace '{}' but its owner is in '{}'",
            identity.kind,
            identity.name,
            other.unwrap_or_default(),
            owner.namespace
        ))),
    }
}

/// Replace any owner reference with the same uid, keeping foreign owners
fn set_owner_reference(body: &mut Value, reference: &OwnerReference) {
    let Ok(owner) = serde_json::to_value(reference) else {
        return;
    };
    let metadata = &mut body["metadata"];
    let mut refs: Vec<Value> = metadata
        .get("ownerReferences")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    refs.retain(|r| r.get("uid").and_then(Value::as_str) != Some(reference.uid.as_str()));
    refs.push(owner);
    metadata["ownerReferences"] = Value::Array(refs);
}

/// `(generation, observedGeneration)` when the object's controller lags.
///
/// Generationless objects (generation 0 or absent) and objects without a
/// reported observedGeneration never lag.
fn generation_lag(obj: &Value) -> Option<(i64, i64)> {
    let generation = obj["metadata"]["generation"].as_i64().unwrap_or(0);
    if generation == 0 {
        return None;
    }
    let observed = obj["status"]["observedGeneration"].as_i64()?;
    (observed < generation).then_some((generation, observed))
}
