//! Selector engine
//!
//! Resolves a read-only reference to an existing object by name, label set
//! or annotation set. Candidates are sorted by name so the choice is stable
//! across reconciles; when the selector carries expectations the first
//! candidate passing all of them wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use testplane_assert::Evaluator;
use testplane_common::crd::{ResourceIdentity, ResourceSelector};
use testplane_common::Error;

use crate::client::ClusterClient;

/// Resolves selectors against the cluster
#[derive(Clone)]
pub struct SelectorEngine {
    client: Arc<dyn ClusterClient>,
    evaluator: Evaluator,
}

impl SelectorEngine {
    /// Create an engine reading through `client`
    pub fn new(client: Arc<dyn ClusterClient>, evaluator: Evaluator) -> Self {
        Self { client, evaluator }
    }

    /// All objects matching the selector, sorted by `metadata.name`.
    ///
    /// The selector's namespace defaults to `namespace`.
    pub async fn resolve_candidates(
        &self,
        selector: &ResourceSelector,
        namespace: &str,
    ) -> Result<Vec<Value>, Error> {
        selector.validate()?;
        let ns = selector
            .namespace
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(namespace);

        let mut candidates = if let Some(name) = selector.name.as_deref().filter(|n| !n.is_empty()) {
            let identity = ResourceIdentity {
                api_version: selector.api_version.clone(),
                kind: selector.kind.clone(),
                namespace: Some(ns.to_string()),
                name: name.to_string(),
            };
            self.client.get(&identity).await?.into_iter().collect()
        } else if let Some(labels) = selector.label_selector.as_ref().filter(|l| !l.is_empty()) {
            self.client
                .list(
                    &selector.api_version,
                    &selector.kind,
                    ns,
                    Some(label_selector_string(labels)),
                )
                .await?
        } else {
            let annotations = selector.annotation_selector.clone().unwrap_or_default();
            self.client
                .list(&selector.api_version, &selector.kind, ns, None)
                .await?
                .into_iter()
                .filter(|obj| annotations_match(obj, &annotations))
                .collect()
        };

        candidates.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        debug!(
            kind = %selector.kind,
            namespace = ns,
            candidates = candidates.len(),
            "selector candidates resolved"
        );
        Ok(candidates)
    }

    /// The chosen object for a selector, or `None` when nothing qualifies
    pub async fn resolve(
        &self,
        selector: &ResourceSelector,
        namespace: &str,
    ) -> Result<Option<Value>, Error> {
        let candidates = self.resolve_candidates(selector, namespace).await?;
        if selector.expectations.is_empty() {
            return Ok(candidates.into_iter().next());
        }
        for candidate in candidates {
            if self.evaluator.all_pass(&selector.expectations, &candidate).await {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// `k1=v1,k2=v2` in key order
pub fn label_selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn annotations_match(obj: &Value, wanted: &BTreeMap<String, String>) -> bool {
    let annotations = &obj["metadata"]["annotations"];
    wanted
        .iter()
        .all(|(k, v)| annotations.get(k).and_then(Value::as_str) == Some(v.as_str()))
}

fn name_of(obj: &Value) -> &str {
    obj["metadata"]["name"].as_str().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use serde_json::json;
    use testplane_assert::{FunctionRegistry, FunctionResult, WebhookClient};
    use testplane_common::crd::Expectation;

    struct NoWebhooks;

    #[async_trait::async_trait]
    impl WebhookClient for NoWebhooks {
        async fn evaluate(&self, _: &str, _: &str, _: &Value) -> FunctionResult {
            FunctionResult::fail("no webhooks in this test")
        }
    }

    fn evaluator() -> Evaluator {
        let mut registry = FunctionRegistry::new();
        registry.register("IsReady", |r: &Value, _: &Value| {
            if r["status"]["ready"] == true {
                FunctionResult::pass()
            } else {
                FunctionResult::fail("not ready")
            }
        });
        Evaluator::new(Arc::new(registry), Arc::new(NoWebhooks))
    }

    fn pod(name: &str, ready: bool, annotations: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "annotations": annotations},
            "status": {"ready": ready}
        })
    }

    fn selector() -> ResourceSelector {
        ResourceSelector {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn name_selector_is_a_direct_get_in_parent_namespace() {
        let mut client = MockClusterClient::new();
        client
            .expect_get()
            .withf(|id| id.name == "web-0" && id.namespace.as_deref() == Some("team"))
            .returning(|_| Ok(Some(pod("web-0", true, json!({})))));
        let engine = SelectorEngine::new(Arc::new(client), evaluator());

        let mut sel = selector();
        sel.name = Some("web-0".to_string());
        let chosen = engine.resolve(&sel, "team").await.unwrap().unwrap();
        assert_eq!(chosen["metadata"]["name"], "web-0");
    }

    /// Story: several pods match a label; the alphabetically first ready one wins
    #[tokio::test]
    async fn story_label_selector_sorts_then_filters_by_expectations() {
        let mut client = MockClusterClient::new();
        client
            .expect_list()
            .withf(|_, _, ns, labels| ns == "team" && labels.as_deref() == Some("app=web,tier=fe"))
            .returning(|_, _, _, _| {
                Ok(vec![
                    pod("web-c", true, json!({})),
                    pod("web-a", false, json!({})),
                    pod("web-b", true, json!({})),
                ])
            });
        let engine = SelectorEngine::new(Arc::new(client), evaluator());

        let mut sel = selector();
        sel.label_selector = Some(BTreeMap::from([
            ("tier".to_string(), "fe".to_string()),
            ("app".to_string(), "web".to_string()),
        ]));

        let names: Vec<String> = engine
            .resolve_candidates(&sel, "team")
            .await
            .unwrap()
            .iter()
            .map(|p| name_of(p).to_string())
            .collect();
        assert_eq!(names, vec!["web-a", "web-b", "web-c"]);

        assert_eq!(
            engine.resolve(&sel, "team").await.unwrap().unwrap()["metadata"]["name"],
            "web-a"
        );

        sel.expectations = vec![Expectation::named("IsReady")];
        assert_eq!(
            engine.resolve(&sel, "team").await.unwrap().unwrap()["metadata"]["name"],
            "web-b"
        );
    }

    #[tokio::test]
    async fn annotation_selector_filters_client_side() {
        let mut client = MockClusterClient::new();
        client
            .expect_list()
            .withf(|_, _, _, labels| labels.is_none())
            .returning(|_, _, _, _| {
                Ok(vec![
                    pod("a", true, json!({"role": "primary"})),
                    pod("b", true, json!({"role": "replica"})),
                ])
            });
        let engine = SelectorEngine::new(Arc::new(client), evaluator());

        let mut sel = selector();
        sel.annotation_selector = Some(BTreeMap::from([(
            "role".to_string(),
            "replica".to_string(),
        )]));
        let chosen = engine.resolve(&sel, "ns").await.unwrap().unwrap();
        assert_eq!(chosen["metadata"]["name"], "b");
    }

    #[tokio::test]
    async fn ambiguous_selector_is_a_validation_error() {
        let engine = SelectorEngine::new(Arc::new(MockClusterClient::new()), evaluator());
        let mut sel = selector();
        sel.name = Some("x".to_string());
        sel.label_selector = Some(BTreeMap::from([("a".to_string(), "b".to_string())]));
        let err = engine.resolve(&sel, "ns").await.unwrap_err();
        assert!(!err.is_retryable());

        let err = engine.resolve(&selector(), "ns").await.unwrap_err();
        assert!(err.to_string().contains("one of"));
    }

    #[tokio::test]
    async fn no_passing_candidate_resolves_to_none() {
        let mut client = MockClusterClient::new();
        client
            .expect_list()
            .returning(|_, _, _, _| Ok(vec![pod("a", false, json!({}))]));
        let engine = SelectorEngine::new(Arc::new(client), evaluator());
        let mut sel = selector();
        sel.label_selector = Some(BTreeMap::from([("app".to_string(), "x".to_string())]));
        sel.expectations = vec![Expectation::named("IsReady")];
        assert!(engine.resolve(&sel, "ns").await.unwrap().is_none());
    }
}
