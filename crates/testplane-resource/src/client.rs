//! Untyped access to arbitrary cluster objects
//!
//! Test manifests can name any kind, so reconcilers work with objects as
//! JSON values behind the [`ClusterClient`] trait. The kube-backed
//! implementation resolves each apiVersion/kind pair through API discovery
//! once and caches the result.

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Scope};
use kube::Client;
use serde_json::Value;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use testplane_common::crd::ResourceIdentity;
use testplane_common::kube_utils::{build_api_resource, parse_api_version};
use testplane_common::Error;

/// Reads and writes arbitrary objects. Every read goes to the API server,
/// never to an informer cache.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>, Error>;

    /// List objects of a kind in a namespace, optionally by label selector
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>, Error>;

    /// Server-Side Apply an object with forced ownership; returns the live object
    async fn apply(&self, object: &Value, field_owner: &str) -> Result<Value, Error>;

    /// Delete an object; `Ok(false)` when it was already gone
    async fn delete(&self, identity: &ResourceIdentity) -> Result<bool, Error>;
}

/// kube-rs implementation of [`ClusterClient`] over `DynamicObject`
pub struct KubeClusterClient {
    client: Client,
    resources: DashMap<(String, String), (ApiResource, bool)>,
}

impl KubeClusterClient {
    /// Create a client with an empty discovery cache
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: DashMap::new(),
        }
    }

    /// Resolve the API resource and scope (namespaced or not) for a kind.
    ///
    /// Falls back to a derived plural when discovery fails; fallbacks are not
    /// cached so a later call can still pick up the real resource.
    async fn resolve(&self, api_version: &str, kind: &str) -> (ApiResource, bool) {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(entry) = self.resources.get(&key) {
            return entry.clone();
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        match kube::discovery::pinned_kind(&self.client, &gvk).await {
            Ok((ar, caps)) => {
                let namespaced = caps.scope == Scope::Namespaced;
                debug!(api_version, kind, plural = %ar.plural, namespaced, "discovered resource");
                self.resources.insert(key, (ar.clone(), namespaced));
                (ar, namespaced)
            }
            Err(e) => {
                warn!(api_version, kind, error = %e, "discovery failed, deriving plural from kind");
                (build_api_resource(api_version, kind), true)
            }
        }
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Api<DynamicObject> {
        let (ar, namespaced) = self.resolve(api_version, kind).await;
        match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>, Error> {
        let api = self
            .api(&identity.api_version, &identity.kind, identity.namespace.as_deref())
            .await;
        match api.get_opt(&identity.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>, Error> {
        let api = self.api(api_version, kind, Some(namespace)).await;
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        let list = api.list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| -> Result<Value, Error> {
                let mut value = serde_json::to_value(obj)?;
                // list items come back without type metadata
                value["apiVersion"] = Value::String(api_version.to_string());
                value["kind"] = Value::String(kind.to_string());
                Ok(value)
            })
            .collect()
    }

    async fn apply(&self, object: &Value, field_owner: &str) -> Result<Value, Error> {
        let identity = crate::manifest::identity_of(object)
            .ok_or_else(|| Error::manifest("object is missing apiVersion, kind or metadata.name"))?;
        let obj: DynamicObject = serde_json::from_value(object.clone())
            .map_err(|e| Error::serialization_for_kind(&identity.kind, e.to_string()))?;

        let api = self
            .api(&identity.api_version, &identity.kind, identity.namespace.as_deref())
            .await;
        let applied = api
            .patch(
                &identity.name,
                &PatchParams::apply(field_owner).force(),
                &Patch::Apply(&obj),
            )
            .await?;
        debug!(object = %identity, field_owner, "applied object");
        Ok(serde_json::to_value(applied)?)
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<bool, Error> {
        let api = self
            .api(&identity.api_version, &identity.kind, identity.namespace.as_deref())
            .await;
        match api.delete(&identity.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(object = %identity, "deleted object");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
