//! Step execution
//!
//! Every pass runs a step's pipeline from the top and stops at the first
//! stage that is not satisfied yet: apply on first entry, convergence,
//! ReadyCondition, then expectations. Stages that already passed are cheap
//! to re-enter because their outcome lives in the persisted StepStatus.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use testplane_assert::truncate_message;
use testplane_common::crd::{
    ExecutionMode, IntegrationTest, IntegrationTestSpec, IntegrationTestStatus,
    ReadyConditionState, ReadyConditionStatus, ResourceIdentity, ResourceRef, StepState,
    StepStatus, TestStep,
};
use testplane_common::events::{actions, reasons};
use testplane_common::Error;
use testplane_resource::{expand, identity_of, Convergence, Owner};

use crate::controller::{Context, PendingEvent, CONVERGENCE_REQUEUE, IMMEDIATE};

/// Step failure reason when a deadline elapsed
pub(crate) const TIMEOUT: &str = "Timeout";
const INVALID_MANIFEST: &str = "InvalidManifest";
const INVALID_SELECTOR: &str = "InvalidSelector";
const APPLY_FAILED: &str = "ApplyFailed";

/// Where the current round stands after a pass
#[derive(Debug, PartialEq)]
pub(crate) enum RoundProgress {
    /// Steps are still in flight; come back after the delay
    Waiting(Duration),
    /// Every step succeeded
    Complete,
    /// A step failed; the round is abandoned
    Failed(StepFailure),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StepFailure {
    pub step: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
enum StepOutcome {
    Wait(Duration),
    Succeeded,
    Failed { reason: String, message: String },
}

struct StepReport {
    step: String,
    outcome: StepOutcome,
    events: Vec<PendingEvent>,
}

/// Index of the first step that has not succeeded; `steps.len()` when the
/// round is complete
pub(crate) fn next_step_index(steps: &[TestStep], statuses: &[StepStatus]) -> usize {
    steps
        .iter()
        .position(|step| {
            !statuses
                .iter()
                .any(|s| s.name == step.name && s.state == StepState::Succeeded)
        })
        .unwrap_or(steps.len())
}

/// Move the current round forward by one pass
pub(crate) async fn advance_round(
    test: &IntegrationTest,
    ctx: &Context,
    spec: &IntegrationTestSpec,
    status: &mut IntegrationTestStatus,
    now: DateTime<Utc>,
    events: &mut Vec<PendingEvent>,
) -> Result<RoundProgress, Error> {
    let owner = Owner::of(test)?;
    let runner = StepRunner {
        ctx,
        owner: &owner,
        now,
    };
    match spec.mode {
        ExecutionMode::Sequential => advance_sequential(&runner, spec, status, events).await,
        ExecutionMode::Parallel => Ok(advance_parallel(&runner, spec, status, events).await),
    }
}

/// One step per pass, in spec order
async fn advance_sequential(
    runner: &StepRunner<'_>,
    spec: &IntegrationTestSpec,
    status: &mut IntegrationTestStatus,
    events: &mut Vec<PendingEvent>,
) -> Result<RoundProgress, Error> {
    let index = next_step_index(&spec.steps, &status.steps);
    status.current_step_index = index;
    let Some(step) = spec.steps.get(index) else {
        return Ok(RoundProgress::Complete);
    };

    if status.step(&step.name).is_none() {
        status.steps.push(StepStatus::entered(step, runner.now));
    }
    let st = status.step_mut(&step.name).ok_or_else(|| {
        Error::internal_with_context("steps", format!("no status for step {}", step.name))
    })?;

    let report = runner.advance(step, st).await;
    events.extend(report.events);

    Ok(match report.outcome {
        StepOutcome::Wait(wait) => RoundProgress::Waiting(wait),
        StepOutcome::Succeeded => {
            status.current_step_index = next_step_index(&spec.steps, &status.steps);
            if status.current_step_index >= spec.steps.len() {
                RoundProgress::Complete
            } else {
                RoundProgress::Waiting(IMMEDIATE)
            }
        }
        StepOutcome::Failed { reason, message } => RoundProgress::Failed(StepFailure {
            step: report.step,
            reason,
            message,
        }),
    })
}

/// Every unfinished step, concurrently.
///
/// All outcomes are collected before deciding; the first failure in spec
/// order abandons the round.
async fn advance_parallel(
    runner: &StepRunner<'_>,
    spec: &IntegrationTestSpec,
    status: &mut IntegrationTestStatus,
    events: &mut Vec<PendingEvent>,
) -> RoundProgress {
    let mut aligned: Vec<StepStatus> = spec
        .steps
        .iter()
        .map(|step| {
            status
                .step(&step.name)
                .cloned()
                .unwrap_or_else(|| StepStatus::entered(step, runner.now))
        })
        .collect();

    let reports = join_all(
        spec.steps
            .iter()
            .zip(aligned.iter_mut())
            .filter(|(_, st)| st.state != StepState::Succeeded)
            .map(|(step, st)| runner.advance(step, st)),
    )
    .await;

    status.steps = aligned;
    status.current_step_index = next_step_index(&spec.steps, &status.steps);

    let mut failure = None;
    let mut wait: Option<Duration> = None;
    for report in reports {
        events.extend(report.events);
        match report.outcome {
            StepOutcome::Wait(d) => wait = Some(wait.map_or(d, |w| w.min(d))),
            StepOutcome::Succeeded => {}
            StepOutcome::Failed { reason, message } => {
                if failure.is_none() {
                    failure = Some(StepFailure {
                        step: report.step,
                        reason,
                        message,
                    });
                }
            }
        }
    }

    match (failure, wait) {
        (Some(failure), _) => RoundProgress::Failed(failure),
        (None, Some(wait)) => RoundProgress::Waiting(wait),
        (None, None) => RoundProgress::Complete,
    }
}

fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::Manifest { .. } | Error::Serialization { .. } => INVALID_MANIFEST,
        Error::Validation { .. } => INVALID_SELECTOR,
        _ => APPLY_FAILED,
    }
}

struct StepRunner<'a> {
    ctx: &'a Context,
    owner: &'a Owner,
    now: DateTime<Utc>,
}

impl StepRunner<'_> {
    /// Run one pass of a step and record its outcome on `st`
    async fn advance(&self, step: &TestStep, st: &mut StepStatus) -> StepReport {
        if st.state == StepState::Failed {
            return StepReport {
                step: step.name.clone(),
                outcome: StepOutcome::Failed {
                    reason: st.reason.clone().unwrap_or_else(|| APPLY_FAILED.to_string()),
                    message: st.message.clone().unwrap_or_default(),
                },
                events: Vec::new(),
            };
        }

        let mut events = Vec::new();
        let outcome = match self.drive(step, st, &mut events).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => {
                warn!(step = %step.name, error = %e, "transient error, retrying step");
                self.wait_or_timeout(st, CONVERGENCE_REQUEUE, e.to_string())
            }
            Err(e) => StepOutcome::Failed {
                reason: failure_reason(&e).to_string(),
                message: e.to_string(),
            },
        };
        let outcome = match outcome {
            StepOutcome::Failed { reason, message } => StepOutcome::Failed {
                reason,
                message: truncate_message(&message),
            },
            other => other,
        };

        match &outcome {
            StepOutcome::Wait(_) => {}
            StepOutcome::Succeeded => {
                st.state = StepState::Succeeded;
                st.finished_at = Some(self.now);
                st.reason = None;
                st.message = None;
                info!(step = %step.name, "step succeeded");
                events.push(PendingEvent::normal(
                    reasons::STEP_SUCCEEDED,
                    actions::VERIFY,
                    format!("step {} succeeded", step.name),
                ));
            }
            StepOutcome::Failed { reason, message } => {
                st.state = StepState::Failed;
                st.finished_at = Some(self.now);
                st.reason = Some(reason.clone());
                st.message = Some(message.clone());
                warn!(step = %step.name, %reason, %message, "step failed");
                events.push(PendingEvent::warning(
                    reasons::STEP_FAILED,
                    actions::VERIFY,
                    format!("step {} failed ({reason}): {message}", step.name),
                ));
            }
        }

        StepReport {
            step: step.name.clone(),
            outcome,
            events,
        }
    }

    async fn drive(
        &self,
        step: &TestStep,
        st: &mut StepStatus,
        events: &mut Vec<PendingEvent>,
    ) -> Result<StepOutcome, Error> {
        let resource = step.resource.as_ref();
        let action = resource.map(|r| r.action).unwrap_or_default();
        let objects = match resource.and_then(|r| r.manifest.as_ref()) {
            Some(manifest) => expand(manifest, &self.owner.namespace, action)?,
            None => Vec::new(),
        };

        if st.state == StepState::Pending {
            for object in &objects {
                self.ctx.resources.execute(object, action, self.owner).await?;
            }
            st.state = StepState::Running;
            st.resources = objects.iter().map(|o| o.identity.clone()).collect();
            let (event_action, note) = if objects.is_empty() {
                (actions::VERIFY, format!("step {} started", step.name))
            } else {
                (
                    actions::APPLY,
                    format!(
                        "step {}: {:?} {} object(s)",
                        step.name,
                        action,
                        objects.len()
                    ),
                )
            };
            info!(step = %step.name, objects = objects.len(), "step started");
            events.push(PendingEvent::normal(reasons::STEP_STARTED, event_action, note));
        }

        for identity in st.resources.clone() {
            if let Convergence::NotReady(why) =
                self.ctx.resources.wait_for_object(&identity, action).await?
            {
                debug!(step = %step.name, %why, "waiting for convergence");
                self.ctx
                    .watcher
                    .watch_kind(&identity.api_version, &identity.kind);
                return Ok(self.wait_or_timeout(st, CONVERGENCE_REQUEUE, why));
            }
        }

        let mut state = self.ctx.resources.gather_state(&st.resources).await?;
        if let Some(selector) = resource.and_then(|r| r.selector.as_ref()) {
            match self
                .ctx
                .selectors
                .resolve(selector, &self.owner.namespace)
                .await?
            {
                Some(obj) => {
                    let identity = identity_of(&obj).unwrap_or_else(|| ResourceIdentity {
                        api_version: selector.api_version.clone(),
                        kind: selector.kind.clone(),
                        namespace: Some(self.owner.namespace.clone()),
                        name: obj["metadata"]["name"].as_str().unwrap_or_default().to_string(),
                    });
                    state.insert(identity.state_key(), obj);
                }
                None => {
                    self.ctx
                        .watcher
                        .watch_kind(&selector.api_version, &selector.kind);
                    return Ok(self.wait_or_timeout(
                        st,
                        CONVERGENCE_REQUEUE,
                        format!("no {} matches the selector", selector.kind),
                    ));
                }
            }
        }

        if let Some(ready) = step
            .ready_condition
            .as_ref()
            .filter(|r| !r.condition.is_empty())
        {
            let timeout = ready
                .timeout_seconds
                .filter(|t| *t > 0)
                .unwrap_or_else(|| step.timeout_secs());
            let step_expired = st.expired(self.now);
            let rc = st
                .ready_condition
                .get_or_insert_with(|| ReadyConditionStatus::started(self.now, timeout));
            if rc.state != ReadyConditionState::Passed {
                let outcome = self
                    .ctx
                    .evaluator
                    .evaluate_condition(&ready.condition, &state)
                    .await;
                rc.attempts += 1;
                rc.last_check_time = Some(self.now);
                rc.results = outcome.summaries();
                if !outcome.passed {
                    let message = format!("ready condition not met: {}", outcome.failure_message());
                    if step_expired || rc.expired(self.now) {
                        rc.state = ReadyConditionState::Failed;
                        return Ok(StepOutcome::Failed {
                            reason: TIMEOUT.to_string(),
                            message,
                        });
                    }
                    self.watch_targets(&st.resources, resource);
                    return Ok(self.wait_or_timeout(st, CONVERGENCE_REQUEUE, message));
                }
                rc.state = ReadyConditionState::Passed;
                debug!(step = %step.name, attempts = rc.attempts, "ready condition passed");
            }
        }

        if let Some(expectations) = step
            .expectations
            .as_ref()
            .filter(|e| !e.condition.is_empty())
        {
            let outcome = self
                .ctx
                .evaluator
                .evaluate_condition(&expectations.condition, &state)
                .await;
            st.last_check_time = Some(self.now);
            st.expectation_results = outcome.summaries();
            if !outcome.passed {
                self.watch_targets(&st.resources, resource);
                let interval = Duration::from_secs(step.interval_secs().unsigned_abs());
                return Ok(self.wait_or_timeout(
                    st,
                    interval,
                    format!("expectations not met: {}", outcome.failure_message()),
                ));
            }
        }

        Ok(StepOutcome::Succeeded)
    }

    /// Request informers for every kind the step is asserting on
    fn watch_targets(&self, resources: &[ResourceIdentity], resource: Option<&ResourceRef>) {
        for identity in resources {
            self.ctx
                .watcher
                .watch_kind(&identity.api_version, &identity.kind);
        }
        if let Some(selector) = resource.and_then(|r| r.selector.as_ref()) {
            self.ctx
                .watcher
                .watch_kind(&selector.api_version, &selector.kind);
        }
    }

    /// Wait at most until the step deadline, or time the step out
    fn wait_or_timeout(&self, st: &mut StepStatus, wait: Duration, message: String) -> StepOutcome {
        let remaining = st
            .deadline
            .map(|d| (d - self.now).to_std().unwrap_or(Duration::ZERO));
        if remaining == Some(Duration::ZERO) {
            return StepOutcome::Failed {
                reason: TIMEOUT.to_string(),
                message: format!("deadline exceeded: {message}"),
            };
        }
        st.message = Some(truncate_message(&message));
        StepOutcome::Wait(remaining.map_or(wait, |r| wait.min(r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> TestStep {
        TestStep {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn status(name: &str, state: StepState) -> StepStatus {
        StepStatus {
            name: name.to_string(),
            state,
            ..Default::default()
        }
    }

    #[test]
    fn next_step_is_the_first_not_succeeded() {
        let steps = vec![step("a"), step("b"), step("c")];
        assert_eq!(next_step_index(&steps, &[]), 0);
        assert_eq!(
            next_step_index(&steps, &[status("a", StepState::Succeeded)]),
            1
        );
        assert_eq!(
            next_step_index(
                &steps,
                &[
                    status("a", StepState::Succeeded),
                    status("b", StepState::Running),
                    status("c", StepState::Succeeded),
                ]
            ),
            1
        );
    }

    #[test]
    fn round_is_complete_when_every_step_succeeded() {
        let steps = vec![step("a"), step("b")];
        let statuses = vec![
            status("b", StepState::Succeeded),
            status("a", StepState::Succeeded),
        ];
        assert_eq!(next_step_index(&steps, &statuses), steps.len());
    }

    #[test]
    fn errors_map_to_step_reasons() {
        assert_eq!(failure_reason(&Error::manifest("bad")), INVALID_MANIFEST);
        assert_eq!(failure_reason(&Error::validation("bad")), INVALID_SELECTOR);
        let rejected = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert_eq!(failure_reason(&rejected), APPLY_FAILED);
    }
}
