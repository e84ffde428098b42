//! IntegrationTest controller implementation
//!
//! Phase machine: (no phase) → Pending → Running → Succeeded | Failed | Aborted.
//!
//! Every pass samples cluster state, moves the run at most one bounded step
//! forward and returns. Status is persisted with a forced Server-Side Apply
//! before any event describing the change is published.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use testplane_assert::{truncate_message, Evaluator};
use testplane_common::crd::{
    condition_types, find_condition, set_condition, Condition, ConditionStatus, IntegrationTest,
    IntegrationTestPhase, IntegrationTestStatus,
};
use testplane_common::events::{actions, reasons};
use testplane_common::kube_utils::{
    add_finalizer_patch, apply_status, get_opt, has_finalizer, merge_patch,
    remove_finalizer_patch,
};
use testplane_common::{
    Clock, Error, EventPublisher, NoopEventPublisher, NoopTargetWatcher, SystemClock,
    TargetWatcher, INTEGRATION_TEST_FIELD_OWNER, INTEGRATION_TEST_FINALIZER,
};
use testplane_resource::{ClusterClient, ResourceManager, SelectorEngine};

use crate::rounds;
use crate::steps::{self, RoundProgress};

/// Requeue delay meaning "as soon as possible"
pub(crate) const IMMEDIATE: Duration = Duration::ZERO;

/// Requeue delay while waiting for convergence or a ReadyCondition
pub(crate) const CONVERGENCE_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue delay after adding the finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Access to IntegrationTest objects, abstracted for tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IntegrationTestClient: Send + Sync {
    /// Read a test straight from the API server, bypassing any cache
    async fn get_latest(&self, name: &str, namespace: &str)
        -> Result<Option<IntegrationTest>, Error>;

    /// Persist a status with a forced Server-Side Apply
    async fn patch_status(
        &self,
        test: &IntegrationTest,
        status: &IntegrationTestStatus,
    ) -> Result<(), Error>;

    /// Add the IntegrationTest finalizer
    async fn add_finalizer(&self, test: &IntegrationTest) -> Result<(), Error>;

    /// Remove the IntegrationTest finalizer
    async fn remove_finalizer(&self, test: &IntegrationTest) -> Result<(), Error>;
}

/// kube-rs implementation of [`IntegrationTestClient`]
pub struct IntegrationTestClientImpl {
    client: Client,
}

impl IntegrationTestClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn namespace_of(test: &IntegrationTest) -> Result<String, Error> {
    test.namespace().ok_or_else(|| {
        Error::validation_for_field(test.name_any(), "metadata.namespace", "must be namespaced")
    })
}

#[async_trait]
impl IntegrationTestClient for IntegrationTestClientImpl {
    async fn get_latest(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<IntegrationTest>, Error> {
        get_opt::<IntegrationTest>(&self.client, name, namespace).await
    }

    async fn patch_status(
        &self,
        test: &IntegrationTest,
        status: &IntegrationTestStatus,
    ) -> Result<(), Error> {
        apply_status(&self.client, test, status, INTEGRATION_TEST_FIELD_OWNER).await
    }

    async fn add_finalizer(&self, test: &IntegrationTest) -> Result<(), Error> {
        let Some(patch) = add_finalizer_patch(test, INTEGRATION_TEST_FINALIZER) else {
            return Ok(());
        };
        let namespace = namespace_of(test)?;
        merge_patch::<IntegrationTest>(
            &self.client,
            &test.name_any(),
            &namespace,
            &patch,
            INTEGRATION_TEST_FIELD_OWNER,
        )
        .await
    }

    async fn remove_finalizer(&self, test: &IntegrationTest) -> Result<(), Error> {
        let Some(patch) = remove_finalizer_patch(test, INTEGRATION_TEST_FINALIZER) else {
            return Ok(());
        };
        let namespace = namespace_of(test)?;
        merge_patch::<IntegrationTest>(
            &self.client,
            &test.name_any(),
            &namespace,
            &patch,
            INTEGRATION_TEST_FIELD_OWNER,
        )
        .await
    }
}

/// Shared context for the IntegrationTest controller
pub struct Context {
    /// Test object access
    pub tests: Arc<dyn IntegrationTestClient>,
    /// Applies, deletes and observes step resources
    pub resources: ResourceManager,
    /// Resolves selector-based step resources
    pub selectors: SelectorEngine,
    /// Evaluates ReadyConditions and expectations
    pub evaluator: Evaluator,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Requests extra reconciles when watched step resources change
    pub watcher: Arc<dyn TargetWatcher>,
    /// Time source for deadlines and timestamps
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Start building a context
    pub fn builder(
        tests: Arc<dyn IntegrationTestClient>,
        cluster: Arc<dyn ClusterClient>,
        evaluator: Evaluator,
    ) -> ContextBuilder {
        ContextBuilder {
            tests,
            cluster,
            evaluator,
            events: None,
            watcher: None,
            clock: None,
        }
    }

    /// Context backed by a real client with default collaborators
    pub fn new(client: Client, cluster: Arc<dyn ClusterClient>, evaluator: Evaluator) -> Self {
        Self::builder(
            Arc::new(IntegrationTestClientImpl::new(client)),
            cluster,
            evaluator,
        )
        .build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    tests: Arc<dyn IntegrationTestClient>,
    cluster: Arc<dyn ClusterClient>,
    evaluator: Evaluator,
    events: Option<Arc<dyn EventPublisher>>,
    watcher: Option<Arc<dyn TargetWatcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    /// Publish events through `events` instead of discarding them
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register watched resources with `watcher`
    pub fn watcher(mut self, watcher: Arc<dyn TargetWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Override the clock (tests)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            tests: self.tests,
            resources: ResourceManager::new(self.cluster.clone(), INTEGRATION_TEST_FIELD_OWNER),
            selectors: SelectorEngine::new(self.cluster, self.evaluator.clone()),
            evaluator: self.evaluator,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            watcher: self.watcher.unwrap_or_else(|| Arc::new(NoopTargetWatcher)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        }
    }
}

/// An event held back until the status that justifies it is persisted
#[derive(Clone, Debug)]
pub(crate) struct PendingEvent {
    pub warning: bool,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: String,
}

impl PendingEvent {
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason,
            action,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            reason,
            action,
            note: note.into(),
        }
    }
}

/// Persist `status`, then publish `events` in order.
///
/// When the patch fails nothing is published and the error propagates.
pub(crate) async fn commit(
    test: &IntegrationTest,
    ctx: &Context,
    status: &IntegrationTestStatus,
    events: Vec<PendingEvent>,
) -> Result<(), Error> {
    ctx.tests.patch_status(test, status).await?;
    let object_ref = test.object_ref(&());
    for event in events {
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        ctx.events
            .publish(&object_ref, type_, event.reason, event.action, Some(event.note))
            .await;
    }
    Ok(())
}

/// How a run ends
pub(crate) struct Verdict {
    pub phase: IntegrationTestPhase,
    pub reason: &'static str,
    pub message: String,
    pub event: &'static str,
}

/// Write a terminal status exactly once.
///
/// The test is re-read from the API server first; if another pass already
/// stamped a completion time nothing is written or published.
pub(crate) async fn finish(
    test: &IntegrationTest,
    ctx: &Context,
    mut status: IntegrationTestStatus,
    verdict: Verdict,
    mut events: Vec<PendingEvent>,
) -> Result<Action, Error> {
    let name = test.name_any();
    let namespace = namespace_of(test)?;

    match ctx.tests.get_latest(&name, &namespace).await? {
        None => {
            debug!("test disappeared before it could finish");
            return Ok(Action::await_change());
        }
        Some(latest)
            if latest
                .status
                .as_ref()
                .is_some_and(|s| s.completion_time.is_some()) =>
        {
            debug!("test already finished, skipping terminal write");
            return Ok(Action::await_change());
        }
        Some(_) => {}
    }

    let now = ctx.clock.now();
    let succeeded = verdict.phase == IntegrationTestPhase::Succeeded;
    let message = truncate_message(&verdict.message);
    status.phase = Some(verdict.phase);
    status.reason = Some(verdict.reason.to_string());
    status.message = Some(message.clone());
    status.completion_time = Some(now);
    status.next_round_time = None;
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::READY,
            if succeeded {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            verdict.reason,
            message.clone(),
            now,
        )
        .with_generation(status.observed_generation),
    );

    events.push(if succeeded {
        PendingEvent::normal(verdict.event, actions::RECONCILE, message)
    } else {
        PendingEvent::warning(verdict.event, actions::RECONCILE, message)
    });

    commit(test, ctx, &status, events).await?;
    ctx.watcher.deactivate(&namespace, &name);
    info!(
        phase = %verdict.phase,
        reason = verdict.reason,
        rounds = status.completed_rounds,
        "test finished"
    );
    Ok(Action::await_change())
}

/// Reconcile an IntegrationTest
#[instrument(skip(test, ctx), fields(test = %test.name_any(), namespace = ?test.namespace()))]
pub async fn reconcile(test: Arc<IntegrationTest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = test.name_any();
    let namespace = namespace_of(&test)?;

    if test.metadata.deletion_timestamp.is_some() {
        ctx.watcher.deactivate(&namespace, &name);
        if has_finalizer(test.as_ref(), INTEGRATION_TEST_FINALIZER) {
            info!("removing finalizer");
            ctx.tests.remove_finalizer(&test).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(test.as_ref(), INTEGRATION_TEST_FINALIZER) {
        info!("adding finalizer");
        ctx.tests.add_finalizer(&test).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let status = test.status.clone().unwrap_or_default();
    match status.phase {
        None => initialize(&test, &ctx, status).await,
        Some(IntegrationTestPhase::Pending) => start(&test, &ctx, status).await,
        Some(IntegrationTestPhase::Running) => run(&test, &ctx, &namespace, status).await,
        Some(phase) => {
            debug!(%phase, "test is terminal");
            ctx.watcher.deactivate(&namespace, &name);
            Ok(Action::await_change())
        }
    }
}

/// First observation: validate the spec and enter Pending
async fn initialize(
    test: &IntegrationTest,
    ctx: &Context,
    mut status: IntegrationTestStatus,
) -> Result<Action, Error> {
    if let Err(e) = test.spec.validate() {
        warn!(error = %e, "invalid spec, aborting");
        status.observed_generation = test.metadata.generation;
        let verdict = Verdict {
            phase: IntegrationTestPhase::Aborted,
            reason: "InvalidSpec",
            message: e.to_string(),
            event: reasons::INTEGRATION_TEST_FAILED,
        };
        return finish(test, ctx, status, verdict, Vec::new()).await;
    }

    status.phase = Some(IntegrationTestPhase::Pending);
    status.message = Some("waiting to start".to_string());
    status.observed_generation = test.metadata.generation;
    commit(test, ctx, &status, Vec::new()).await?;
    Ok(Action::requeue(IMMEDIATE))
}

/// Pending: seed the run and enter Running
async fn start(
    test: &IntegrationTest,
    ctx: &Context,
    mut status: IntegrationTestStatus,
) -> Result<Action, Error> {
    let now = ctx.clock.now();
    status.phase = Some(IntegrationTestPhase::Running);
    status.reason = None;
    status.message = Some("round 1 started".to_string());
    status.start_time = Some(now);
    status.round_start_time = Some(now);
    status.observed_generation = test.metadata.generation;
    status.current_round = 1;
    status.completed_rounds = 0;
    status.current_step_index = 0;
    status.steps.clear();
    status.run_spec = Some(test.spec.clone());
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "Running",
            "test is running",
            now,
        )
        .with_generation(status.observed_generation),
    );

    let note = format!(
        "running {} step(s) in {} mode",
        test.spec.steps.len(),
        test.spec.mode
    );
    commit(
        test,
        ctx,
        &status,
        vec![PendingEvent::normal(
            reasons::INTEGRATION_TEST_STARTED,
            actions::RECONCILE,
            note,
        )],
    )
    .await?;
    ctx.watcher.activate(&namespace_of(test)?, &test.name_any());
    info!("test started");
    Ok(Action::requeue(IMMEDIATE))
}

/// Running: advance the current round
async fn run(
    test: &IntegrationTest,
    ctx: &Context,
    namespace: &str,
    mut status: IntegrationTestStatus,
) -> Result<Action, Error> {
    let before = status.clone();
    let now = ctx.clock.now();
    let spec = status.run_spec.clone().unwrap_or_else(|| test.spec.clone());
    ctx.watcher.activate(namespace, &test.name_any());

    note_ignored_spec_change(test, &mut status, now);

    if let Some(next) = status.next_round_time {
        if now < next {
            if status != before {
                commit(test, ctx, &status, Vec::new()).await?;
            }
            let wait = (next - now).to_std().unwrap_or(IMMEDIATE);
            debug!(round = status.current_round, ?wait, "waiting between rounds");
            return Ok(Action::requeue(wait));
        }
        status.next_round_time = None;
        status.round_start_time = Some(now);
    }

    let mut events = Vec::new();
    let progress = steps::advance_round(test, ctx, &spec, &mut status, now, &mut events).await?;

    match progress {
        RoundProgress::Waiting(wait) => {
            if status != before || !events.is_empty() {
                commit(test, ctx, &status, events).await?;
            }
            Ok(Action::requeue(wait))
        }
        RoundProgress::Complete => {
            rounds::complete_round(test, ctx, &spec, status, events, now).await
        }
        RoundProgress::Failed(failure) => {
            rounds::handle_step_failure(test, ctx, &spec, status, events, failure, now).await
        }
    }
}

/// Stamp `SpecChangedIgnored` when the spec moved on after the run started.
///
/// The run keeps executing the snapshot taken when it started.
fn note_ignored_spec_change(
    test: &IntegrationTest,
    status: &mut IntegrationTestStatus,
    now: chrono::DateTime<chrono::Utc>,
) {
    let (Some(generation), Some(observed)) = (test.metadata.generation, status.observed_generation)
    else {
        return;
    };
    if generation == observed {
        return;
    }
    let message =
        format!("generation {generation} ignored while running; continuing with generation {observed}");
    let already = find_condition(&status.conditions, condition_types::SPEC_CHANGED_IGNORED)
        .is_some_and(|c| c.status == ConditionStatus::True && c.message == message);
    if already {
        return;
    }
    info!(generation, observed, "spec changed mid-run, ignoring");
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::SPEC_CHANGED_IGNORED,
            ConditionStatus::True,
            "SpecChangedIgnored",
            message,
            now,
        )
        .with_generation(Some(observed)),
    );
}

/// Error policy for IntegrationTest reconciliation
pub fn error_policy(test: Arc<IntegrationTest>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(?error, test = %test.name_any(), "integration test reconciliation failed, retrying");
        Action::requeue(Duration::from_secs(5))
    } else {
        error!(?error, test = %test.name_any(), "integration test reconciliation failed");
        Action::requeue(Duration::from_secs(30))
    }
}
