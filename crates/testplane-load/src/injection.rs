//! Environment injection and workload application

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

use testplane_assert::Evaluator;
use testplane_common::crd::{EnvInjection, ResourceAction, WorkloadSpec};
use testplane_common::Error;
use testplane_resource::{expand, inject_annotations, Owner};

use crate::controller::Context;
use crate::phases::{failure_reasons, Failure};

/// Run every extractor against the target.
///
/// An unavailable target fails with `TargetGetFailed`; an unknown or failing
/// extractor fails with `EnvInjectionFailed`.
pub(crate) fn resolve_injections(
    evaluator: &Evaluator,
    injections: &[EnvInjection],
    target: Option<&Value>,
) -> Result<BTreeMap<String, String>, Failure> {
    if injections.is_empty() {
        return Ok(BTreeMap::new());
    }
    let Some(target) = target else {
        return Err(Failure::new(
            failure_reasons::TARGET_GET_FAILED,
            "target is not available for environment injection",
        ));
    };

    let mut values = BTreeMap::new();
    for injection in injections {
        let value = evaluator
            .extract(
                &injection.extractor.function,
                injection.extractor.params.as_ref(),
                target,
            )
            .map_err(|e| {
                Failure::new(
                    failure_reasons::ENV_INJECTION_FAILED,
                    format!("{}: {e}", injection.name),
                )
            })?;
        debug!(name = %injection.name, "injected value resolved");
        values.insert(injection.name.clone(), value);
    }
    Ok(values)
}

/// Apply every workload object with the injected values on its Pod template.
///
/// Returns the number of objects applied.
pub(crate) async fn apply_workload(
    ctx: &Context,
    workload: &WorkloadSpec,
    owner: &Owner,
    values: &BTreeMap<String, String>,
) -> Result<usize, Error> {
    let mut applied = 0;
    for resource in &workload.resources {
        let Some(manifest) = &resource.manifest else {
            continue;
        };
        for mut object in expand(manifest, &owner.namespace, ResourceAction::Apply)? {
            inject_annotations(&mut object.body, values);
            ctx.resources.apply_object(&object, owner).await?;
            applied += 1;
        }
    }
    info!(objects = applied, injected = values.len(), "workload applied");
    Ok(applied)
}
