//! Terminal phase handler.

use kube::runtime::controller::Action;
use tracing::debug;

use testplane_common::crd::{LoadTest, LoadTestStatus};
use testplane_common::Error;

use crate::controller::Context;
use crate::phases::conclude;

/// Handle a LoadTest in Succeeded or Failed.
///
/// The completion time is stamped on first entry; afterwards the LoadTest
/// is left alone.
pub async fn handle_terminal(
    lt: &LoadTest,
    ctx: &Context,
    status: LoadTestStatus,
) -> Result<Action, Error> {
    if status.completion_time.is_some() {
        debug!(phase = %status.phase_or_default(), "load test is terminal");
        return Ok(Action::await_change());
    }
    let phase = status.phase_or_default();
    let reason = status.reason.clone().unwrap_or_else(|| phase.to_string());
    let message = status
        .message
        .clone()
        .unwrap_or_else(|| format!("load test {phase}"));
    conclude(lt, ctx, status, phase, reason, message, Vec::new()).await
}
