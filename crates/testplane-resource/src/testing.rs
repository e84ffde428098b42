//! In-memory cluster for controller tests
//!
//! [`FakeCluster`] behaves enough like an API server for multi-reconcile
//! scenario tests: apply creates or updates with SSA-like semantics (status
//! and uid survive, generation bumps on spec change), deletes remove, and
//! lists honor label selectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use testplane_common::crd::ResourceIdentity;
use testplane_common::Error;

use crate::client::ClusterClient;
use crate::manifest::identity_of;

type Key = (String, String, String, String);

fn key(identity: &ResourceIdentity) -> Key {
    (
        identity.api_version.clone(),
        identity.kind.clone(),
        identity.namespace.clone().unwrap_or_default(),
        identity.name.clone(),
    )
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    applies: Vec<ResourceIdentity>,
    failing_kinds: BTreeSet<String>,
    next_uid: u64,
    tick: i64,
}

/// In-memory [`ClusterClient`]
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl FakeCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `apply:<Kind>/<name>` entries into a shared journal
    pub fn with_journal(journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            state: Arc::default(),
            journal: Some(journal),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an object as-is (pre-existing cluster state)
    pub fn insert(&self, object: Value) {
        if let Some(identity) = identity_of(&object) {
            self.lock().objects.insert(key(&identity), object);
        }
    }

    /// Current copy of an object
    pub fn object(&self, identity: &ResourceIdentity) -> Option<Value> {
        self.lock().objects.get(&key(identity)).cloned()
    }

    /// Names of all objects of a kind, sorted
    pub fn names_of_kind(&self, kind: &str) -> Vec<String> {
        self.lock()
            .objects
            .iter()
            .filter(|((_, k, _, _), _)| k == kind)
            .map(|((_, _, _, n), _)| n.clone())
            .collect()
    }

    /// Replace an object's status, as its controller would
    pub fn set_status(&self, identity: &ResourceIdentity, status: Value) {
        if let Some(obj) = self.lock().objects.get_mut(&key(identity)) {
            obj["status"] = status;
        }
    }

    /// Remove an object without going through `delete`
    pub fn remove(&self, identity: &ResourceIdentity) {
        self.lock().objects.remove(&key(identity));
    }

    /// Make every apply of `kind` fail with a server error
    pub fn fail_applies_of(&self, kind: &str) {
        self.lock().failing_kinds.insert(kind.to_string());
    }

    /// Number of applies made to the object
    pub fn apply_count(&self, identity: &ResourceIdentity) -> usize {
        self.lock().applies.iter().filter(|a| *a == identity).count()
    }

    /// Number of applies made in total
    pub fn total_applies(&self) -> usize {
        self.lock().applies.len()
    }
}

fn server_error(message: &str) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).and_then(Value::as_str) == Some(v),
            None => labels.get(pair).is_some(),
        })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>, Error> {
        Ok(self.object(identity))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>, Error> {
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((av, k, ns, _), _)| av == api_version && k == kind && ns == namespace)
            .map(|(_, obj)| obj.clone())
            .filter(|obj| {
                label_selector
                    .as_deref()
                    .is_none_or(|selector| labels_match(obj, selector))
            })
            .collect())
    }

    async fn apply(&self, object: &Value, _field_owner: &str) -> Result<Value, Error> {
        let identity = identity_of(object)
            .ok_or_else(|| Error::manifest("object is missing apiVersion, kind or metadata.name"))?;
        if let Some(journal) = &self.journal {
            if let Ok(mut j) = journal.lock() {
                j.push(format!("apply:{}/{}", identity.kind, identity.name));
            }
        }

        let mut state = self.lock();
        if state.failing_kinds.contains(&identity.kind) {
            return Err(server_error("injected apply failure"));
        }
        state.applies.push(identity.clone());
        state.tick += 1;
        let tick = state.tick;

        let mut incoming = object.clone();
        let existing = state.objects.get(&key(&identity)).cloned();
        let stored = match existing {
            Some(existing) => {
                let spec_changed = existing.get("spec") != incoming.get("spec");
                let generation = existing["metadata"]["generation"].as_i64().unwrap_or(1);
                incoming["metadata"]["uid"] = existing["metadata"]["uid"].clone();
                incoming["metadata"]["creationTimestamp"] =
                    existing["metadata"]["creationTimestamp"].clone();
                incoming["metadata"]["generation"] =
                    json!(if spec_changed { generation + 1 } else { generation });
                if let Some(status) = existing.get("status") {
                    incoming["status"] = status.clone();
                }
                incoming
            }
            None => {
                state.next_uid += 1;
                incoming["metadata"]["uid"] = json!(format!("uid-{}", state.next_uid));
                incoming["metadata"]["creationTimestamp"] = json!(tick);
                incoming["metadata"]["generation"] = json!(1);
                incoming
            }
        };
        state.objects.insert(key(&identity), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<bool, Error> {
        Ok(self.lock().objects.remove(&key(identity)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, data: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": {"app": "web"}},
            "spec": {"data": data}
        })
    }

    #[tokio::test]
    async fn apply_preserves_uid_and_status_and_bumps_generation_on_spec_change() {
        let cluster = FakeCluster::new();
        let created = cluster.apply(&cm("a", "1"), "me").await.unwrap();
        let id = identity_of(&created).unwrap();
        cluster.set_status(&id, json!({"ready": true}));

        let same = cluster.apply(&cm("a", "1"), "me").await.unwrap();
        assert_eq!(same["metadata"]["generation"], 1);
        assert_eq!(same["metadata"]["uid"], created["metadata"]["uid"]);
        assert_eq!(same["status"]["ready"], true);

        let changed = cluster.apply(&cm("a", "2"), "me").await.unwrap();
        assert_eq!(changed["metadata"]["generation"], 2);
        assert_eq!(cluster.apply_count(&id), 3);
    }

    #[tokio::test]
    async fn list_filters_namespace_and_labels() {
        let cluster = FakeCluster::new();
        cluster.apply(&cm("a", "1"), "me").await.unwrap();
        let mut other = cm("b", "1");
        other["metadata"]["labels"]["app"] = json!("db");
        cluster.apply(&other, "me").await.unwrap();

        let web = cluster
            .list("v1", "ConfigMap", "ns", Some("app=web".to_string()))
            .await
            .unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(cluster.list("v1", "ConfigMap", "ns", None).await.unwrap().len(), 2);
        assert!(cluster.list("v1", "ConfigMap", "x", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_retryable_errors() {
        let cluster = FakeCluster::new();
        cluster.fail_applies_of("ConfigMap");
        let err = cluster.apply(&cm("a", "1"), "me").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cluster.total_applies(), 0);
    }
}
