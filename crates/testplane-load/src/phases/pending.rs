//! Pending phase handler.

use kube::runtime::controller::Action;
use tracing::info;

use testplane_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, LoadTest, LoadTestPhase,
    LoadTestStatus,
};
use testplane_common::events::{actions, reasons};
use testplane_common::Error;

use crate::controller::{commit, Context, PendingEvent, IMMEDIATE};

/// Handle a LoadTest in the Pending phase.
///
/// Nothing gates the start: the LoadTest moves straight to Initializing.
pub async fn handle_pending(
    lt: &LoadTest,
    ctx: &Context,
    mut status: LoadTestStatus,
) -> Result<Action, Error> {
    let now = ctx.clock.now();
    status.phase = Some(LoadTestPhase::Initializing);
    status.reason = None;
    status.message = Some("resolving target".to_string());
    status.start_time = Some(now);
    status.observed_generation = lt.metadata.generation;
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "Initializing",
            "target is being prepared",
            now,
        )
        .with_generation(status.observed_generation),
    );

    commit(
        lt,
        ctx,
        &status,
        vec![PendingEvent::normal(
            reasons::LOAD_TEST_STARTED,
            actions::RECONCILE,
            "load test started",
        )],
    )
    .await?;
    info!("load test initializing");
    Ok(Action::requeue(IMMEDIATE))
}
