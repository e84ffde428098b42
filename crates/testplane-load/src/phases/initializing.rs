//! Initializing phase handler.
//!
//! Applies (or resolves) the target, then gates on its ReadyCondition.

use kube::runtime::controller::Action;
use serde_json::json;
use tracing::{debug, info};

use testplane_assert::truncate_message;
use testplane_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, LoadTest, LoadTestStatus,
    ReadyConditionState, ReadyConditionStatus,
};
use testplane_common::events::{actions, reasons};
use testplane_common::Error;
use testplane_resource::Owner;

use crate::controller::{commit, Context, PendingEvent};
use crate::phases::running::enter_running;
use crate::phases::{fail, failure_reasons, Failure, TARGET_REQUEUE};
use crate::target;

/// Handle a LoadTest in the Initializing phase.
///
/// Each pass re-applies the target when its manifest changed, re-reads it
/// and evaluates the ReadyCondition. Once the target is ready the workload
/// is applied and the LoadTest enters Running in the same pass.
pub async fn handle_initializing(
    lt: &LoadTest,
    ctx: &Context,
    mut status: LoadTestStatus,
) -> Result<Action, Error> {
    let now = ctx.clock.now();
    let owner = Owner::of(lt)?;
    let before = status.clone();
    let mut events = Vec::new();

    let target = match target::ensure_target(lt, ctx, &owner, &mut status, &mut events).await {
        Ok(target) => target,
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => {
            let failure = Failure::new(failure_reasons::TARGET_APPLY_FAILED, e.to_string())
                .with_event(reasons::TARGET_APPLY_FAILED);
            return fail(lt, ctx, status, failure, events).await;
        }
    };
    // target changes made while initializing are absorbed by the hash-gated apply
    status.observed_generation = lt.metadata.generation;

    if let Some(ready) = lt
        .spec
        .target
        .ready_condition
        .as_ref()
        .filter(|r| !r.condition.is_empty())
    {
        let timeout = lt.spec.ready_timeout_secs();
        let rc = status
            .ready_condition_status
            .get_or_insert_with(|| ReadyConditionStatus::started(now, timeout));

        if rc.state != ReadyConditionState::Passed {
            let subject = target.clone().unwrap_or_else(|| json!({}));
            let outcome = ctx
                .evaluator
                .evaluate_condition_on(&ready.condition, &subject)
                .await;
            rc.attempts += 1;
            rc.last_check_time = Some(now);
            rc.results = outcome.summaries();

            if !outcome.passed {
                let message = truncate_message(&format!(
                    "target not ready: {}",
                    outcome.failure_message()
                ));
                if rc.expired(now) {
                    rc.state = ReadyConditionState::Failed;
                    let failure = Failure::new(
                        failure_reasons::READY_CONDITION_TIMEOUT,
                        format!("ready condition not met within {timeout}s: {message}"),
                    );
                    return fail(lt, ctx, status, failure, events).await;
                }
                if rc.attempts == 1 {
                    events.push(PendingEvent::normal(
                        reasons::READY_CONDITION_WAIT,
                        actions::VERIFY,
                        message.clone(),
                    ));
                }
                debug!(attempts = rc.attempts, "target not ready yet");
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        condition_types::TARGET_READY,
                        ConditionStatus::False,
                        "Waiting",
                        message.clone(),
                        now,
                    )
                    .with_generation(status.observed_generation),
                );
                status.message = Some(message);
                commit(lt, ctx, &status, events).await?;
                return Ok(Action::requeue(TARGET_REQUEUE));
            }

            rc.state = ReadyConditionState::Passed;
            info!(attempts = rc.attempts, "target ready");
            events.push(PendingEvent::normal(
                reasons::TARGET_READY,
                actions::VERIFY,
                "target passed its ready condition",
            ));
        }
    }

    let Some(target) = target else {
        debug!("target not available yet");
        status.message = Some("waiting for target".to_string());
        if status != before || !events.is_empty() {
            commit(lt, ctx, &status, events).await?;
        }
        return Ok(Action::requeue(TARGET_REQUEUE));
    };

    enter_running(lt, ctx, &owner, status, &target, events).await
}
