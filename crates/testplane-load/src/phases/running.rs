//! Running phase handler.
//!
//! Checks expectations against the target once per interval and counts
//! consecutive failures. Spec edits re-apply the target and the workload.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use serde_json::{json, Value};
use tracing::{debug, info};

use testplane_assert::{truncate_message, ConditionOutcome, FunctionResult};
use testplane_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, ExpectationsStatus, HealthCheck,
    LoadTest, LoadTestPhase, LoadTestStatus, DEFAULT_CHECK_INTERVAL_SECS,
};
use testplane_common::events::{actions, reasons};
use testplane_common::Error;
use testplane_resource::Owner;

use crate::controller::{commit, Context, PendingEvent};
use crate::phases::{fail, failure_reasons, prepare_workload, succeed, Failure};
use crate::target;

/// Enter Running: inject values, apply the workload, flip the conditions
pub(crate) async fn enter_running(
    lt: &LoadTest,
    ctx: &Context,
    owner: &Owner,
    mut status: LoadTestStatus,
    target: &Value,
    mut events: Vec<PendingEvent>,
) -> Result<Action, Error> {
    let now = ctx.clock.now();
    let applied = match prepare_workload(lt, ctx, owner, &mut status, Some(target)).await? {
        Ok(applied) => applied,
        Err(failure) => return fail(lt, ctx, status, failure, events).await,
    };

    let generation = status.observed_generation;
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::TARGET_READY,
            ConditionStatus::True,
            "TargetReady",
            "target is ready",
            now,
        )
        .with_generation(generation),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "Running",
            "workload is running",
            now,
        )
        .with_generation(generation),
    );
    status.phase = Some(LoadTestPhase::Running);
    status.reason = None;
    status.message = Some(format!("{applied} workload object(s) applied"));
    status.running_since = Some(now);
    if lt.spec.expectations.is_some() {
        status.expectations_status = Some(ExpectationsStatus::default());
    }

    events.push(PendingEvent::normal(
        reasons::LOAD_TEST_RUNNING,
        actions::APPLY,
        format!(
            "{applied} workload object(s) applied with {} injected value(s)",
            status.injected_values.len()
        ),
    ));
    commit(lt, ctx, &status, events).await?;
    info!(workload = applied, "load test running");
    Ok(Action::requeue(next_wake(lt, &status, now, check_interval(lt))))
}

/// Handle a LoadTest in the Running phase.
pub async fn handle_running(
    lt: &LoadTest,
    ctx: &Context,
    mut status: LoadTestStatus,
) -> Result<Action, Error> {
    let now = ctx.clock.now();
    let before = status.clone();
    let mut events = Vec::new();

    if spec_changed(lt, &status) {
        let owner = Owner::of(lt)?;
        let target = match target::ensure_target(lt, ctx, &owner, &mut status, &mut events).await {
            Ok(target) => target,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                let failure = Failure::new(failure_reasons::TARGET_APPLY_FAILED, e.to_string())
                    .with_event(reasons::TARGET_APPLY_FAILED);
                return fail(lt, ctx, status, failure, events).await;
            }
        };
        match prepare_workload(lt, ctx, &owner, &mut status, target.as_ref()).await? {
            Ok(applied) => info!(
                generation = ?lt.metadata.generation,
                workload = applied,
                "spec change applied"
            ),
            Err(failure) => return fail(lt, ctx, status, failure, events).await,
        }
        status.observed_generation = lt.metadata.generation;
    }

    if let Some(limit) = duration_limit(lt) {
        if let Some(since) = status.running_since {
            if now - since >= limit {
                let message = format!("ran for {}s", limit.num_seconds());
                return succeed(
                    lt,
                    ctx,
                    status,
                    failure_reasons::DURATION_ELAPSED,
                    message,
                    events,
                )
                .await;
            }
        }
    }

    let Some(check) = lt
        .spec
        .expectations
        .as_ref()
        .filter(|h| !h.condition.is_empty())
    else {
        if status != before || !events.is_empty() {
            commit(lt, ctx, &status, events).await?;
        }
        return Ok(Action::requeue(next_wake(lt, &status, now, check_interval(lt))));
    };

    let interval = check_interval(lt);
    if let Some(last) = status
        .expectations_status
        .as_ref()
        .and_then(|e| e.last_check_time)
    {
        let due = last + chrono::Duration::seconds(lt.spec.check_interval_secs());
        if now < due {
            if status != before || !events.is_empty() {
                commit(lt, ctx, &status, events).await?;
            }
            let remaining = (due - now).to_std().unwrap_or(Duration::ZERO);
            debug!(?remaining, "next check not due yet");
            return Ok(Action::requeue(next_wake(lt, &status, now, remaining)));
        }
    }

    let subject = target::current_target(lt, ctx, &status)
        .await?
        .unwrap_or_else(|| json!({}));
    let outcome = evaluate(ctx, check, &subject).await;

    let threshold = lt.spec.failure_threshold();
    let es = status
        .expectations_status
        .get_or_insert_with(ExpectationsStatus::default);
    es.check_count += 1;
    es.last_check_time = Some(now);
    es.last_results = outcome.summaries();
    if outcome.passed {
        es.pass_count += 1;
        es.consecutive_failures = 0;
    } else {
        es.fail_count += 1;
        es.consecutive_failures += 1;
    }
    let checks = es.check_count;
    let consecutive = es.consecutive_failures;

    let message = if outcome.passed {
        format!("check {checks} passed")
    } else {
        truncate_message(&format!(
            "check {checks} failed ({consecutive}/{threshold}): {}",
            outcome.failure_message()
        ))
    };
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::EXPECTATIONS_MET,
            if outcome.passed {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            if outcome.passed {
                "ChecksPassing"
            } else {
                "ChecksFailing"
            },
            message.clone(),
            now,
        )
        .with_generation(status.observed_generation),
    );

    if !outcome.passed && consecutive >= threshold {
        let failure = Failure::new(failure_reasons::EXPECTATIONS_FAILED, message)
            .with_event(reasons::EXPECTATION_FAILED);
        return fail(lt, ctx, status, failure, events).await;
    }

    events.push(if outcome.passed {
        PendingEvent::normal(reasons::EXPECTATION_PASSED, actions::VERIFY, message)
    } else {
        PendingEvent::warning(reasons::EXPECTATION_FAILED, actions::VERIFY, message)
    });
    commit(lt, ctx, &status, events).await?;
    debug!(checks, consecutive, passed = outcome.passed, "expectations checked");
    Ok(Action::requeue(next_wake(lt, &status, now, interval)))
}

/// Evaluate the periodic check, bounded by its per-check timeout
async fn evaluate(ctx: &Context, check: &HealthCheck, subject: &Value) -> ConditionOutcome {
    let evaluation = ctx.evaluator.evaluate_condition_on(&check.condition, subject);
    let Some(limit) = check.timeout_seconds.filter(|t| *t > 0) else {
        return evaluation.await;
    };
    match tokio::time::timeout(Duration::from_secs(limit.unsigned_abs()), evaluation).await {
        Ok(outcome) => outcome,
        Err(_) => ConditionOutcome {
            passed: false,
            results: vec![(
                "timeout".to_string(),
                FunctionResult::fail(format!("check did not finish within {limit}s")),
            )],
        },
    }
}

fn spec_changed(lt: &LoadTest, status: &LoadTestStatus) -> bool {
    match (lt.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => generation > observed,
        _ => false,
    }
}

fn check_interval(lt: &LoadTest) -> Duration {
    let secs = if lt.spec.expectations.is_some() {
        lt.spec.check_interval_secs()
    } else {
        DEFAULT_CHECK_INTERVAL_SECS
    };
    Duration::from_secs(secs.unsigned_abs())
}

fn duration_limit(lt: &LoadTest) -> Option<chrono::Duration> {
    lt.spec
        .duration_seconds
        .filter(|d| *d > 0)
        .map(chrono::Duration::seconds)
}

/// `wait`, shortened so the duration limit is noticed on time
fn next_wake(lt: &LoadTest, status: &LoadTestStatus, now: DateTime<Utc>, wait: Duration) -> Duration {
    let (Some(limit), Some(since)) = (duration_limit(lt), status.running_since) else {
        return wait;
    };
    let remaining = (since + limit - now).to_std().unwrap_or(Duration::ZERO);
    wait.min(remaining)
}
