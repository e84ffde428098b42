//! Round bookkeeping and the stop predicate

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use tracing::info;

use testplane_assert::truncate_message;
use testplane_common::crd::{
    IntegrationTest, IntegrationTestPhase, IntegrationTestSpec, IntegrationTestStatus,
    RepeatSpec, RoundSummary, ROUND_HISTORY_LIMIT,
};
use testplane_common::events::reasons;
use testplane_common::Error;

use crate::controller::{commit, finish, Context, PendingEvent, Verdict, IMMEDIATE};
use crate::steps::{StepFailure, TIMEOUT};

/// Whether the run is over after `completed` rounds.
///
/// Without a repeat block a single round is the whole run.
pub(crate) fn should_stop(repeat: Option<&RepeatSpec>, completed: i64, elapsed_secs: i64) -> bool {
    let Some(repeat) = repeat else {
        return completed >= 1;
    };
    let by_count = repeat.count > 0 && completed >= repeat.count;
    let by_time = repeat.max_duration_seconds > 0 && elapsed_secs >= repeat.max_duration_seconds;
    by_count || by_time
}

/// Append a summary of the current round and fold it into the stats
pub(crate) fn record_round(
    status: &mut IntegrationTestStatus,
    failure: Option<&StepFailure>,
    now: DateTime<Utc>,
) {
    let started_at = status.round_start_time.or(status.start_time);
    let duration = started_at
        .map(|s| (now - s).num_seconds().max(0))
        .unwrap_or(0);

    status.round_history.push(RoundSummary {
        round: status.current_round,
        passed: failure.is_none(),
        started_at,
        finished_at: Some(now),
        duration_seconds: duration,
        failed_step: failure.map(|f| f.step.clone()),
        message: failure.map(|f| truncate_message(&format!("{}: {}", f.reason, f.message))),
    });
    if status.round_history.len() > ROUND_HISTORY_LIMIT {
        let excess = status.round_history.len() - ROUND_HISTORY_LIMIT;
        status.round_history.drain(..excess);
    }

    let stats = &mut status.stats;
    stats.total_rounds += 1;
    if failure.is_none() {
        stats.passed_rounds += 1;
    } else {
        stats.failed_rounds += 1;
    }
    stats.total_duration_seconds += duration;
    stats.min_round_seconds = Some(stats.min_round_seconds.map_or(duration, |m| m.min(duration)));
    stats.max_round_seconds = Some(stats.max_round_seconds.map_or(duration, |m| m.max(duration)));

    status.completed_rounds += 1;
}

/// Reset per-round state and schedule the next round; returns the delay
pub(crate) fn start_next_round(
    status: &mut IntegrationTestStatus,
    repeat: Option<&RepeatSpec>,
    now: DateTime<Utc>,
) -> Duration {
    status.current_round += 1;
    status.current_step_index = 0;
    status.steps.clear();
    status.message = Some(format!("round {} scheduled", status.current_round));

    let delay = repeat.map(|r| r.delay_between_rounds).unwrap_or(0);
    if delay > 0 {
        status.next_round_time = Some(now + chrono::Duration::seconds(delay));
        Duration::from_secs(delay.unsigned_abs())
    } else {
        status.next_round_time = None;
        status.round_start_time = Some(now);
        IMMEDIATE
    }
}

/// Every step of the round succeeded
pub(crate) async fn complete_round(
    test: &IntegrationTest,
    ctx: &Context,
    spec: &IntegrationTestSpec,
    mut status: IntegrationTestStatus,
    events: Vec<PendingEvent>,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    record_round(&mut status, None, now);
    info!(round = status.current_round, "round passed");
    conclude_or_continue(test, ctx, spec, status, events, now).await
}

/// A step failed and the round was abandoned.
///
/// Non-repeating and `untilFailure` runs end here; other repeating runs
/// record the failed round and carry on.
pub(crate) async fn handle_step_failure(
    test: &IntegrationTest,
    ctx: &Context,
    spec: &IntegrationTestSpec,
    mut status: IntegrationTestStatus,
    events: Vec<PendingEvent>,
    failure: StepFailure,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    record_round(&mut status, Some(&failure), now);
    info!(
        round = status.current_round,
        step = %failure.step,
        reason = %failure.reason,
        "round failed"
    );

    let terminal = spec.repeat.as_ref().is_none_or(|r| r.until_failure);
    if !terminal {
        return conclude_or_continue(test, ctx, spec, status, events, now).await;
    }

    let timed_out = failure.reason == TIMEOUT;
    let verdict = Verdict {
        phase: IntegrationTestPhase::Failed,
        reason: if timed_out { "Timeout" } else { "StepFailed" },
        message: format!("step {} failed: {}", failure.step, failure.message),
        event: if timed_out {
            reasons::INTEGRATION_TEST_TIMEOUT
        } else {
            reasons::INTEGRATION_TEST_FAILED
        },
    };
    finish(test, ctx, status, verdict, events).await
}

async fn conclude_or_continue(
    test: &IntegrationTest,
    ctx: &Context,
    spec: &IntegrationTestSpec,
    mut status: IntegrationTestStatus,
    events: Vec<PendingEvent>,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let repeat = spec.repeat.as_ref();
    let elapsed = status
        .start_time
        .map(|s| (now - s).num_seconds())
        .unwrap_or(0);

    if should_stop(repeat, status.completed_rounds, elapsed) {
        let failed = status.stats.failed_rounds;
        let verdict = if failed > 0 {
            Verdict {
                phase: IntegrationTestPhase::Failed,
                reason: "RoundsFailed",
                message: format!("{failed} of {} rounds failed", status.stats.total_rounds),
                event: reasons::INTEGRATION_TEST_FAILED,
            }
        } else {
            Verdict {
                phase: IntegrationTestPhase::Succeeded,
                reason: "Succeeded",
                message: format!("{} round(s) passed", status.completed_rounds),
                event: reasons::INTEGRATION_TEST_SUCCEEDED,
            }
        };
        return finish(test, ctx, status, verdict, events).await;
    }

    let delay = start_next_round(&mut status, repeat, now);
    commit(test, ctx, &status, events).await?;
    info!(round = status.current_round, ?delay, "next round scheduled");
    Ok(Action::requeue(delay))
}
