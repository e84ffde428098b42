//! Target resolution
//!
//! A manifest target is applied only when the SHA-256 of its manifest bytes
//! differs from the hash recorded on the LoadTest, so co-owning controllers
//! are not dragged into field-ownership churn on every pass. A selector
//! target is resolved on every pass; the first resolution is announced once.

use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use testplane_common::crd::{LoadTest, LoadTestStatus, ResourceAction, ResourceIdentity};
use testplane_common::events::{actions, reasons};
use testplane_common::kube_utils::sha256_hex;
use testplane_common::{Error, SELECTOR_RESOLVED_ANNOTATION, TARGET_SPEC_HASH_ANNOTATION};
use testplane_resource::{expand_single, identity_of, manifest_bytes, Owner};

use crate::controller::{Context, PendingEvent};

/// Apply or resolve the target and return its live object, if any.
///
/// Records the target identity in `status.resolvedTarget`.
pub(crate) async fn ensure_target(
    lt: &LoadTest,
    ctx: &Context,
    owner: &Owner,
    status: &mut LoadTestStatus,
    events: &mut Vec<PendingEvent>,
) -> Result<Option<Value>, Error> {
    let resource = &lt.spec.target.resource;

    if let Some(manifest) = &resource.manifest {
        let object = expand_single(manifest, &owner.namespace, ResourceAction::Apply)?;
        let hash = sha256_hex(&manifest_bytes(manifest));
        let recorded = lt.annotations().get(TARGET_SPEC_HASH_ANNOTATION);

        if recorded == Some(&hash) {
            debug!(target = %object.identity, "target manifest unchanged, skipping apply");
        } else {
            ctx.resources.apply_object(&object, owner).await?;
            ctx.tests
                .patch_annotation(lt, TARGET_SPEC_HASH_ANNOTATION, &hash)
                .await?;
            info!(target = %object.identity, "target applied");
            events.push(PendingEvent::normal(
                reasons::TARGET_APPLIED,
                actions::APPLY,
                format!("applied target {}", object.identity),
            ));
        }
        status.resolved_target = Some(object.identity.clone());
        return ctx.resources.client().get(&object.identity).await;
    }

    if let Some(selector) = &resource.selector {
        let found = ctx.selectors.resolve(selector, &owner.namespace).await?;
        let Some(obj) = found else {
            debug!(kind = %selector.kind, "no target matches the selector yet");
            return Ok(None);
        };
        let identity = identity_of(&obj).unwrap_or_else(|| ResourceIdentity {
            api_version: selector.api_version.clone(),
            kind: selector.kind.clone(),
            namespace: Some(owner.namespace.clone()),
            name: obj["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        });

        let announced = lt
            .annotations()
            .get(SELECTOR_RESOLVED_ANNOTATION)
            .is_some_and(|v| v == "true");
        if !announced {
            ctx.tests
                .patch_annotation(lt, SELECTOR_RESOLVED_ANNOTATION, "true")
                .await?;
            info!(target = %identity, "target resolved");
            events.push(PendingEvent::normal(
                reasons::TARGET_APPLIED,
                actions::VERIFY,
                format!("resolved target {identity}"),
            ));
        }
        status.resolved_target = Some(identity);
        return Ok(Some(obj));
    }

    Err(Error::validation_for_field(
        lt.name_any(),
        "spec.target.resource",
        "must set a manifest or a selector",
    ))
}

/// Re-read the target recorded in status, resolving it again if none is
pub(crate) async fn current_target(
    lt: &LoadTest,
    ctx: &Context,
    status: &LoadTestStatus,
) -> Result<Option<Value>, Error> {
    if let Some(identity) = &status.resolved_target {
        return ctx.resources.client().get(identity).await;
    }
    let namespace = lt.namespace().unwrap_or_default();
    let resource = &lt.spec.target.resource;
    if let Some(selector) = &resource.selector {
        return ctx.selectors.resolve(selector, &namespace).await;
    }
    match &resource.manifest {
        Some(manifest) => {
            let object = expand_single(manifest, &namespace, ResourceAction::Apply)?;
            ctx.resources.client().get(&object.identity).await
        }
        None => Ok(None),
    }
}
