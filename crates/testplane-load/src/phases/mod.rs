//! Phase handlers for the LoadTest controller.
//!
//! Each phase of the LoadTest lifecycle is handled by a dedicated module.
//! Handlers mutate an owned copy of the status, persist it through
//! [`commit`](crate::controller::commit) and only then publish events.

mod initializing;
mod pending;
mod running;
mod terminal;

pub use initializing::handle_initializing;
pub use pending::handle_pending;
pub use running::handle_running;
pub use terminal::handle_terminal;

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use testplane_assert::truncate_message;
use testplane_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, LoadTest, LoadTestPhase,
    LoadTestStatus,
};
use testplane_common::events::{actions, reasons};
use testplane_common::Error;
use testplane_resource::Owner;

use crate::controller::{commit, Context, PendingEvent};
use crate::injection;

/// Requeue while waiting on the target
pub(crate) const TARGET_REQUEUE: Duration = Duration::from_secs(5);

/// Terminal reasons
pub(crate) mod failure_reasons {
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const TARGET_APPLY_FAILED: &str = "TargetApplyFailed";
    pub const TARGET_GET_FAILED: &str = "TargetGetFailed";
    pub const ENV_INJECTION_FAILED: &str = "EnvInjectionFailed";
    pub const WORKLOAD_APPLY_FAILED: &str = "WorkloadApplyFailed";
    pub const READY_CONDITION_TIMEOUT: &str = "ReadyConditionTimeout";
    pub const EXPECTATIONS_FAILED: &str = "ExpectationsFailed";
    pub const DURATION_ELAPSED: &str = "DurationElapsed";
}

/// A failure that ends the LoadTest
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Failure {
    pub reason: &'static str,
    pub message: String,
    /// Warning event describing the cause, published before `LoadTestFailed`
    pub cause_event: Option<&'static str>,
}

impl Failure {
    pub fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: truncate_message(&message.into()),
            cause_event: None,
        }
    }

    pub fn with_event(mut self, reason: &'static str) -> Self {
        self.cause_event = Some(reason);
        self
    }
}

/// Move the LoadTest to Failed
pub(crate) async fn fail(
    lt: &LoadTest,
    ctx: &Context,
    status: LoadTestStatus,
    failure: Failure,
    mut events: Vec<PendingEvent>,
) -> Result<Action, Error> {
    warn!(reason = failure.reason, message = %failure.message, "load test failed");
    if let Some(cause) = failure.cause_event {
        let action = if cause == reasons::EXPECTATION_FAILED {
            actions::VERIFY
        } else {
            actions::APPLY
        };
        events.push(PendingEvent::warning(cause, action, failure.message.clone()));
    }
    conclude(
        lt,
        ctx,
        status,
        LoadTestPhase::Failed,
        failure.reason.to_string(),
        failure.message,
        events,
    )
    .await
}

/// Move the LoadTest to Succeeded
pub(crate) async fn succeed(
    lt: &LoadTest,
    ctx: &Context,
    status: LoadTestStatus,
    reason: &str,
    message: String,
    events: Vec<PendingEvent>,
) -> Result<Action, Error> {
    conclude(
        lt,
        ctx,
        status,
        LoadTestPhase::Succeeded,
        reason.to_string(),
        message,
        events,
    )
    .await
}

/// Write a terminal status exactly once.
///
/// The LoadTest is re-read from the API server; when another pass already
/// stamped a completion time nothing is written or published.
pub(crate) async fn conclude(
    lt: &LoadTest,
    ctx: &Context,
    mut status: LoadTestStatus,
    phase: LoadTestPhase,
    reason: String,
    message: String,
    mut events: Vec<PendingEvent>,
) -> Result<Action, Error> {
    let namespace = lt.namespace().unwrap_or_default();
    match ctx.tests.get_latest(&lt.name_any(), &namespace).await? {
        None => {
            debug!("load test disappeared before it could finish");
            return Ok(Action::await_change());
        }
        Some(latest)
            if latest
                .status
                .as_ref()
                .is_some_and(|s| s.completion_time.is_some()) =>
        {
            debug!("load test already finished, skipping terminal write");
            return Ok(Action::await_change());
        }
        Some(_) => {}
    }

    let now = ctx.clock.now();
    let message = truncate_message(&message);
    let succeeded = phase == LoadTestPhase::Succeeded;
    status.phase = Some(phase);
    status.reason = Some(reason.clone());
    status.message = Some(message.clone());
    status.completion_time = Some(now);
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::READY,
            if succeeded {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            if succeeded { "Succeeded" } else { reason.as_str() },
            message.clone(),
            now,
        )
        .with_generation(status.observed_generation),
    );

    events.push(if succeeded {
        PendingEvent::normal(reasons::LOAD_TEST_SUCCEEDED, actions::RECONCILE, message)
    } else {
        PendingEvent::warning(reasons::LOAD_TEST_FAILED, actions::RECONCILE, message)
    });
    commit(lt, ctx, &status, events).await?;
    info!(%phase, %reason, "load test finished");
    Ok(Action::await_change())
}

/// Resolve injected values from the target and apply the workload.
///
/// Returns the number of workload objects applied, or the failure that
/// should end the LoadTest. Transient API errors propagate.
pub(crate) async fn prepare_workload(
    lt: &LoadTest,
    ctx: &Context,
    owner: &Owner,
    status: &mut LoadTestStatus,
    target: Option<&Value>,
) -> Result<Result<usize, Failure>, Error> {
    let values = match injection::resolve_injections(
        &ctx.evaluator,
        &lt.spec.workload.env_injection,
        target,
    ) {
        Ok(values) => values,
        Err(failure) => return Ok(Err(failure)),
    };
    status.injected_values = values;

    match injection::apply_workload(ctx, &lt.spec.workload, owner, &status.injected_values).await
    {
        Ok(applied) => Ok(Ok(applied)),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => Ok(Err(Failure::new(
            failure_reasons::WORKLOAD_APPLY_FAILED,
            e.to_string(),
        )
        .with_event(reasons::WORKLOAD_APPLY_FAILED))),
    }
}
