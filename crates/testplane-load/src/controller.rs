//! LoadTest controller implementation
//!
//! Phase machine: (no phase) → Pending → Initializing → Running →
//! Succeeded | Failed. Phase handlers live in [`crate::phases`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use testplane_assert::Evaluator;
use testplane_common::crd::{LoadTest, LoadTestPhase, LoadTestStatus};
use testplane_common::kube_utils::{
    add_finalizer_patch, annotation_patch, apply_status, get_opt, has_finalizer, merge_patch,
    remove_finalizer_patch,
};
use testplane_common::{
    Clock, Error, EventPublisher, NoopEventPublisher, SystemClock, LOAD_TEST_FIELD_OWNER,
    LOAD_TEST_FINALIZER,
};
use testplane_resource::{ClusterClient, ResourceManager, SelectorEngine};

use crate::phases::{
    fail, failure_reasons, handle_initializing, handle_pending, handle_running, handle_terminal,
    Failure,
};

/// Requeue delay meaning "as soon as possible"
pub(crate) const IMMEDIATE: Duration = Duration::ZERO;

/// Requeue delay after adding the finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Access to LoadTest objects, abstracted for tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadTestClient: Send + Sync {
    /// Read a LoadTest straight from the API server, bypassing any cache
    async fn get_latest(&self, name: &str, namespace: &str) -> Result<Option<LoadTest>, Error>;

    /// Persist a status with a forced Server-Side Apply
    async fn patch_status(&self, lt: &LoadTest, status: &LoadTestStatus) -> Result<(), Error>;

    /// Add the LoadTest finalizer
    async fn add_finalizer(&self, lt: &LoadTest) -> Result<(), Error>;

    /// Remove the LoadTest finalizer
    async fn remove_finalizer(&self, lt: &LoadTest) -> Result<(), Error>;

    /// Set a single annotation on the LoadTest
    async fn patch_annotation(&self, lt: &LoadTest, key: &str, value: &str)
        -> Result<(), Error>;
}

/// kube-rs implementation of [`LoadTestClient`]
pub struct LoadTestClientImpl {
    client: Client,
}

impl LoadTestClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn merge(&self, lt: &LoadTest, patch: &serde_json::Value) -> Result<(), Error> {
        let namespace = namespace_of(lt)?;
        merge_patch::<LoadTest>(
            &self.client,
            &lt.name_any(),
            &namespace,
            patch,
            LOAD_TEST_FIELD_OWNER,
        )
        .await
    }
}

fn namespace_of(lt: &LoadTest) -> Result<String, Error> {
    lt.namespace().ok_or_else(|| {
        Error::validation_for_field(lt.name_any(), "metadata.namespace", "must be namespaced")
    })
}

#[async_trait]
impl LoadTestClient for LoadTestClientImpl {
    async fn get_latest(&self, name: &str, namespace: &str) -> Result<Option<LoadTest>, Error> {
        get_opt::<LoadTest>(&self.client, name, namespace).await
    }

    async fn patch_status(&self, lt: &LoadTest, status: &LoadTestStatus) -> Result<(), Error> {
        apply_status(&self.client, lt, status, LOAD_TEST_FIELD_OWNER).await
    }

    async fn add_finalizer(&self, lt: &LoadTest) -> Result<(), Error> {
        match add_finalizer_patch(lt, LOAD_TEST_FINALIZER) {
            Some(patch) => self.merge(lt, &patch).await,
            None => Ok(()),
        }
    }

    async fn remove_finalizer(&self, lt: &LoadTest) -> Result<(), Error> {
        match remove_finalizer_patch(lt, LOAD_TEST_FINALIZER) {
            Some(patch) => self.merge(lt, &patch).await,
            None => Ok(()),
        }
    }

    async fn patch_annotation(&self, lt: &LoadTest, key: &str, value: &str) -> Result<(), Error> {
        self.merge(lt, &annotation_patch(key, value)).await
    }
}

/// Shared context for the LoadTest controller
pub struct Context {
    /// LoadTest object access
    pub tests: Arc<dyn LoadTestClient>,
    /// Applies the target and the workload
    pub resources: ResourceManager,
    /// Resolves selector targets
    pub selectors: SelectorEngine,
    /// Evaluates ReadyConditions, expectations and extractors
    pub evaluator: Evaluator,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Time source for deadlines and timestamps
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Start building a context
    pub fn builder(
        tests: Arc<dyn LoadTestClient>,
        cluster: Arc<dyn ClusterClient>,
        evaluator: Evaluator,
    ) -> ContextBuilder {
        ContextBuilder {
            tests,
            cluster,
            evaluator,
            events: None,
            clock: None,
        }
    }

    /// Context backed by a real client with default collaborators
    pub fn new(client: Client, cluster: Arc<dyn ClusterClient>, evaluator: Evaluator) -> Self {
        Self::builder(Arc::new(LoadTestClientImpl::new(client)), cluster, evaluator).build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    tests: Arc<dyn LoadTestClient>,
    cluster: Arc<dyn ClusterClient>,
    evaluator: Evaluator,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    /// Publish events through `events` instead of discarding them
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
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
            resources: ResourceManager::new(self.cluster.clone(), LOAD_TEST_FIELD_OWNER),
            selectors: SelectorEngine::new(self.cluster, self.evaluator.clone()),
            evaluator: self.evaluator,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
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
    lt: &LoadTest,
    ctx: &Context,
    status: &LoadTestStatus,
    events: Vec<PendingEvent>,
) -> Result<(), Error> {
    ctx.tests.patch_status(lt, status).await?;
    let object_ref = lt.object_ref(&());
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

/// Reconcile a LoadTest
#[instrument(skip(lt, ctx), fields(load_test = %lt.name_any(), namespace = ?lt.namespace()))]
pub async fn reconcile(lt: Arc<LoadTest>, ctx: Arc<Context>) -> Result<Action, Error> {
    namespace_of(&lt)?;

    if lt.metadata.deletion_timestamp.is_some() {
        if has_finalizer(lt.as_ref(), LOAD_TEST_FINALIZER) {
            info!("removing finalizer");
            ctx.tests.remove_finalizer(&lt).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(lt.as_ref(), LOAD_TEST_FINALIZER) {
        info!("adding finalizer");
        ctx.tests.add_finalizer(&lt).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let status = lt.status.clone().unwrap_or_default();
    debug!(phase = ?status.phase, "reconciling load test");
    match status.phase {
        None => initialize(&lt, &ctx, status).await,
        Some(LoadTestPhase::Pending) => handle_pending(&lt, &ctx, status).await,
        Some(LoadTestPhase::Initializing) => handle_initializing(&lt, &ctx, status).await,
        Some(LoadTestPhase::Running) => handle_running(&lt, &ctx, status).await,
        Some(LoadTestPhase::Succeeded | LoadTestPhase::Failed) => {
            handle_terminal(&lt, &ctx, status).await
        }
    }
}

/// First observation: validate the spec and enter Pending
async fn initialize(
    lt: &LoadTest,
    ctx: &Context,
    mut status: LoadTestStatus,
) -> Result<Action, Error> {
    status.observed_generation = lt.metadata.generation;
    if let Err(e) = lt.spec.validate() {
        warn!(error = %e, "invalid spec");
        let failure = Failure::new(failure_reasons::INVALID_SPEC, e.to_string());
        return fail(lt, ctx, status, failure, Vec::new()).await;
    }

    status.phase = Some(LoadTestPhase::Pending);
    status.message = Some("waiting to start".to_string());
    commit(lt, ctx, &status, Vec::new()).await?;
    Ok(Action::requeue(IMMEDIATE))
}

/// Error policy for LoadTest reconciliation
pub fn error_policy(lt: Arc<LoadTest>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(?error, load_test = %lt.name_any(), "load test reconciliation failed, retrying");
        Action::requeue(Duration::from_secs(5))
    } else {
        error!(?error, load_test = %lt.name_any(), "load test reconciliation failed");
        Action::requeue(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::{json, Value};
    use testplane_assert::{FunctionRegistry, FunctionResult, WebhookClient};
    use testplane_common::crd::{
        condition_types, find_condition, ConditionStatus, EnvInjection, Expectation, Extractor,
        HealthCheck, LoadTestSpec, ReadyCondition, ResourceIdentity, ResourceRef,
        ResourceSelector, TargetSpec, WaitCondition, WorkloadSpec,
    };
    use testplane_common::events::reasons;
    use testplane_common::{
        ManualClock, RecordingEventPublisher, SELECTOR_RESOLVED_ANNOTATION,
        TARGET_SPEC_HASH_ANNOTATION,
    };
    use testplane_resource::testing::FakeCluster;

    // =========================================================================
    // Harness
    // =========================================================================

    /// In-memory LoadTest store that journals every status write
    struct FakeLoadTests {
        current: Mutex<LoadTest>,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLoadTests {
        fn get(&self) -> LoadTest {
            self.current.lock().unwrap().clone()
        }

        fn update(&self, f: impl FnOnce(&mut LoadTest)) {
            f(&mut self.current.lock().unwrap());
        }
    }

    #[async_trait]
    impl LoadTestClient for FakeLoadTests {
        async fn get_latest(&self, _: &str, _: &str) -> Result<Option<LoadTest>, Error> {
            Ok(Some(self.get()))
        }

        async fn patch_status(&self, _: &LoadTest, status: &LoadTestStatus) -> Result<(), Error> {
            let phase = status.phase.map(|p| p.to_string()).unwrap_or_default();
            self.journal.lock().unwrap().push(format!("status:{phase}"));
            self.current.lock().unwrap().status = Some(status.clone());
            Ok(())
        }

        async fn add_finalizer(&self, _: &LoadTest) -> Result<(), Error> {
            self.update(|lt| {
                lt.metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(LOAD_TEST_FINALIZER.to_string())
            });
            Ok(())
        }

        async fn remove_finalizer(&self, _: &LoadTest) -> Result<(), Error> {
            self.update(|lt| {
                if let Some(f) = lt.metadata.finalizers.as_mut() {
                    f.retain(|x| x != LOAD_TEST_FINALIZER);
                }
            });
            Ok(())
        }

        async fn patch_annotation(&self, _: &LoadTest, key: &str, value: &str) -> Result<(), Error> {
            self.update(|lt| {
                lt.metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(key.to_string(), value.to_string());
            });
            Ok(())
        }
    }

    struct NoWebhooks;

    #[async_trait]
    impl WebhookClient for NoWebhooks {
        async fn evaluate(&self, _: &str, _: &str, _: &Value) -> FunctionResult {
            FunctionResult::fail("webhooks unavailable")
        }
    }

    fn evaluator() -> Evaluator {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register("NeverPasses", |_: &Value, _: &Value| {
            FunctionResult::fail("this never passes")
        });
        Evaluator::new(Arc::new(registry), Arc::new(NoWebhooks))
    }

    struct Harness {
        tests: Arc<FakeLoadTests>,
        cluster: FakeCluster,
        events: RecordingEventPublisher,
        clock: ManualClock,
        journal: Arc<Mutex<Vec<String>>>,
        ctx: Arc<Context>,
    }

    impl Harness {
        fn new(spec: LoadTestSpec) -> Self {
            let mut lt = LoadTest::new("soak", spec);
            lt.metadata.namespace = Some("load".to_string());
            lt.metadata.uid = Some("uid-soak".to_string());
            lt.metadata.generation = Some(1);

            let journal = Arc::new(Mutex::new(Vec::new()));
            let tests = Arc::new(FakeLoadTests {
                current: Mutex::new(lt),
                journal: journal.clone(),
            });
            let cluster = FakeCluster::with_journal(journal.clone());
            let events = RecordingEventPublisher::with_journal(journal.clone());
            let clock = ManualClock::new();
            let ctx = Context::builder(tests.clone(), Arc::new(cluster.clone()), evaluator())
                .events(Arc::new(events.clone()))
                .clock(Arc::new(clock.clone()))
                .build();
            Self {
                tests,
                cluster,
                events,
                clock,
                journal,
                ctx: Arc::new(ctx),
            }
        }

        async fn reconcile(&self) -> Action {
            reconcile(Arc::new(self.tests.get()), self.ctx.clone())
                .await
                .unwrap()
        }

        /// Reconcile until the phase is reached, advancing the clock per pass
        async fn run_until(&self, phase: LoadTestPhase, step: Duration) {
            for _ in 0..100 {
                self.reconcile().await;
                if self.status().phase == Some(phase) {
                    return;
                }
                self.clock.advance(step);
            }
            panic!("never reached {phase}: {:?}", self.status());
        }

        fn status(&self) -> LoadTestStatus {
            self.tests.get().status.unwrap_or_default()
        }

        fn annotation(&self, key: &str) -> Option<String> {
            self.tests.get().annotations().get(key).cloned()
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }

        fn position(&self, entry: &str) -> usize {
            self.journal()
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{entry} not in journal {:?}", self.journal()))
        }
    }

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "web", "image": "nginx"}]}}}
        })
    }

    fn deployment_identity() -> ResourceIdentity {
        ResourceIdentity {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: Some("load".to_string()),
            name: "web".to_string(),
        }
    }

    fn job(image: &str) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "hammer"},
            "spec": {"template": {"spec": {"containers": [{"name": "k6", "image": image}]}}}
        })
    }

    fn job_identity() -> ResourceIdentity {
        ResourceIdentity {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            namespace: Some("load".to_string()),
            name: "hammer".to_string(),
        }
    }

    fn target_spec(ready: Option<&str>) -> LoadTestSpec {
        LoadTestSpec {
            target: TargetSpec {
                resource: ResourceRef::manifest(deployment()),
                ready_condition: ready.map(|f| ReadyCondition {
                    condition: WaitCondition::all(vec![Expectation::named(f)]),
                    timeout_seconds: Some(60),
                }),
            },
            workload: WorkloadSpec {
                env_injection: vec![EnvInjection {
                    name: "TARGET_NAME".to_string(),
                    extractor: Extractor {
                        function: "ExtractName".to_string(),
                        params: None,
                    },
                }],
                resources: vec![ResourceRef::manifest(job("grafana/k6"))],
            },
            ..Default::default()
        }
    }

    fn mark_available(h: &Harness) {
        h.cluster.set_status(
            &deployment_identity(),
            json!({
                "observedGeneration": 1,
                "availableReplicas": 1,
                "conditions": [{"type": "Available", "status": "True"}]
            }),
        );
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    /// Story: a Deployment target becomes Available, then the workload starts
    #[tokio::test]
    async fn story_target_becomes_ready_then_workload_runs() {
        let h = Harness::new(target_spec(Some("DeploymentAvailable")));

        h.reconcile().await; // finalizer
        h.reconcile().await;
        assert_eq!(h.status().phase, Some(LoadTestPhase::Pending));
        assert_eq!(h.reconcile().await, Action::requeue(IMMEDIATE));
        assert_eq!(h.status().phase, Some(LoadTestPhase::Initializing));

        // target applied but not available yet
        assert_eq!(h.reconcile().await, Action::requeue(Duration::from_secs(5)));
        let status = h.status();
        assert_eq!(status.phase, Some(LoadTestPhase::Initializing));
        assert_eq!(h.cluster.apply_count(&deployment_identity()), 1);
        assert!(h.annotation(TARGET_SPEC_HASH_ANNOTATION).is_some());
        assert_eq!(h.events.count(reasons::READY_CONDITION_WAIT), 1);
        assert_eq!(
            find_condition(&status.conditions, condition_types::TARGET_READY)
                .unwrap()
                .reason,
            "Waiting"
        );

        // another pass while waiting neither re-applies nor re-announces
        h.clock.advance(Duration::from_secs(5));
        h.reconcile().await;
        assert_eq!(h.cluster.apply_count(&deployment_identity()), 1);
        assert_eq!(h.events.count(reasons::READY_CONDITION_WAIT), 1);

        mark_available(&h);
        h.clock.advance(Duration::from_secs(5));
        h.reconcile().await;

        let status = h.status();
        assert_eq!(status.phase, Some(LoadTestPhase::Running));
        assert_eq!(status.injected_values["TARGET_NAME"], "web");
        assert_eq!(
            status.resolved_target.as_ref().map(|t| t.name.as_str()),
            Some("web")
        );
        assert!(status.running_since.is_some());
        for type_ in [condition_types::TARGET_READY, condition_types::READY] {
            assert_eq!(
                find_condition(&status.conditions, type_).unwrap().status,
                ConditionStatus::True
            );
        }

        let workload = h.cluster.object(&job_identity()).unwrap();
        assert_eq!(
            workload["spec"]["template"]["metadata"]["annotations"]["testplane.io/inject-target-name"],
            "web"
        );
        assert_eq!(workload["metadata"]["ownerReferences"][0]["uid"], "uid-soak");

        assert_eq!(h.events.count(reasons::LOAD_TEST_STARTED), 1);
        assert_eq!(h.events.count(reasons::TARGET_APPLIED), 1);
        assert_eq!(h.events.count(reasons::TARGET_READY), 1);
        assert_eq!(h.events.count(reasons::LOAD_TEST_RUNNING), 1);
        assert_eq!(h.cluster.apply_count(&deployment_identity()), 1);
    }

    /// Story: a check that never passes trips the threshold of three
    #[tokio::test]
    async fn story_failing_checks_trip_the_threshold() {
        let mut spec = target_spec(None);
        spec.expectations = Some(HealthCheck {
            condition: WaitCondition::all(vec![Expectation::named("NeverPasses")]),
            interval_seconds: Some(2),
            failure_threshold: Some(3),
            timeout_seconds: None,
        });
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Running, Duration::from_secs(1)).await;

        for expected in 1..=2 {
            assert_eq!(h.reconcile().await, Action::requeue(Duration::from_secs(2)));
            let es = h.status().expectations_status.unwrap();
            assert_eq!(es.consecutive_failures, expected);
            assert_eq!(h.status().phase, Some(LoadTestPhase::Running));

            // not due yet: nothing is evaluated
            h.clock.advance(Duration::from_secs(1));
            h.reconcile().await;
            assert_eq!(h.status().expectations_status.unwrap().check_count, expected as i64);
            h.clock.advance(Duration::from_secs(1));
        }

        assert_eq!(h.reconcile().await, Action::await_change());
        let status = h.status();
        assert_eq!(status.phase, Some(LoadTestPhase::Failed));
        assert_eq!(status.reason.as_deref(), Some("ExpectationsFailed"));
        assert!(status.completion_time.is_some());
        let es = status.expectations_status.unwrap();
        assert_eq!(es.check_count, 3);
        assert_eq!(es.fail_count, 3);
        assert_eq!(es.pass_count, 0);
        assert_eq!(es.consecutive_failures, 3);
        assert_eq!(
            find_condition(&status.conditions, condition_types::EXPECTATIONS_MET)
                .unwrap()
                .reason,
            "ChecksFailing"
        );
        assert_eq!(h.events.count(reasons::EXPECTATION_FAILED), 3);
        assert_eq!(h.events.count(reasons::LOAD_TEST_FAILED), 1);
    }

    // =========================================================================
    // Target handling
    // =========================================================================

    #[tokio::test]
    async fn unchanged_target_is_applied_once() {
        let mut spec = target_spec(None);
        spec.expectations = Some(HealthCheck {
            condition: WaitCondition::all(vec![Expectation::named("ResourceExists")]),
            interval_seconds: Some(1),
            ..Default::default()
        });
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Running, Duration::from_secs(1)).await;
        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(1));
            h.reconcile().await;
        }
        let status = h.status();
        assert_eq!(status.phase, Some(LoadTestPhase::Running));
        assert_eq!(status.expectations_status.unwrap().pass_count, 5);
        assert_eq!(h.cluster.apply_count(&deployment_identity()), 1);
        assert_eq!(h.cluster.apply_count(&job_identity()), 1);
        assert_eq!(h.events.count(reasons::EXPECTATION_PASSED), 5);
    }

    #[tokio::test]
    async fn selector_target_is_announced_once() {
        let mut spec = target_spec(None);
        spec.target.resource = ResourceRef::selector(ResourceSelector {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            label_selector: Some([("app".to_string(), "web".to_string())].into()),
            ..Default::default()
        });
        let h = Harness::new(spec);
        let mut existing = deployment();
        existing["metadata"]["namespace"] = json!("load");
        h.cluster.insert(existing);

        h.run_until(LoadTestPhase::Running, Duration::from_secs(1)).await;
        h.clock.advance(Duration::from_secs(10));
        h.reconcile().await;

        let status = h.status();
        assert_eq!(status.resolved_target, Some(deployment_identity()));
        assert_eq!(h.annotation(SELECTOR_RESOLVED_ANNOTATION).as_deref(), Some("true"));
        assert_eq!(h.events.count(reasons::TARGET_APPLIED), 1);
        assert_eq!(h.cluster.apply_count(&deployment_identity()), 0);
    }

    #[tokio::test]
    async fn missing_selector_target_keeps_waiting() {
        let mut spec = target_spec(None);
        spec.target.resource = ResourceRef::selector(ResourceSelector {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: Some("absent".to_string()),
            ..Default::default()
        });
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Initializing, Duration::from_secs(1)).await;
        for _ in 0..3 {
            assert_eq!(h.reconcile().await, Action::requeue(Duration::from_secs(5)));
        }
        assert_eq!(h.status().phase, Some(LoadTestPhase::Initializing));
        assert_eq!(h.cluster.apply_count(&job_identity()), 0);
    }

    #[tokio::test]
    async fn ready_condition_gives_up_at_its_timeout() {
        let mut spec = target_spec(Some("NeverPasses"));
        if let Some(ready) = spec.target.ready_condition.as_mut() {
            ready.timeout_seconds = Some(3);
        }
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Failed, Duration::from_secs(1)).await;

        let status = h.status();
        assert_eq!(status.reason.as_deref(), Some("ReadyConditionTimeout"));
        assert_eq!(h.events.count(reasons::READY_CONDITION_WAIT), 1);
        assert_eq!(h.events.count(reasons::LOAD_TEST_FAILED), 1);
        assert_eq!(h.cluster.apply_count(&job_identity()), 0);
        let elapsed = status.completion_time.unwrap() - status.start_time.unwrap();
        assert!(elapsed.num_seconds() >= 3);
    }

    #[tokio::test]
    async fn unknown_extractor_fails_before_the_workload() {
        let mut spec = target_spec(None);
        spec.workload.env_injection[0].extractor.function = "NoSuchExtractor".to_string();
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Failed, Duration::from_secs(1)).await;
        assert_eq!(h.status().reason.as_deref(), Some("EnvInjectionFailed"));
        assert_eq!(h.cluster.apply_count(&job_identity()), 0);
    }

    // =========================================================================
    // Running
    // =========================================================================

    #[tokio::test]
    async fn duration_elapsed_succeeds() {
        let mut spec = target_spec(None);
        spec.duration_seconds = Some(3);
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Running, Duration::from_secs(1)).await;
        let since = h.status().running_since.unwrap();

        h.run_until(LoadTestPhase::Succeeded, Duration::from_secs(1)).await;
        let status = h.status();
        assert_eq!(status.reason.as_deref(), Some("DurationElapsed"));
        assert!((status.completion_time.unwrap() - since).num_seconds() >= 3);
        assert_eq!(
            find_condition(&status.conditions, condition_types::READY)
                .unwrap()
                .status,
            ConditionStatus::True
        );
        assert_eq!(h.events.count(reasons::LOAD_TEST_SUCCEEDED), 1);
    }

    #[tokio::test]
    async fn spec_change_reapplies_the_workload() {
        let h = Harness::new(target_spec(None));
        h.run_until(LoadTestPhase::Running, Duration::from_secs(1)).await;
        assert_eq!(h.cluster.apply_count(&job_identity()), 1);

        h.tests.update(|lt| {
            lt.spec.workload.resources = vec![ResourceRef::manifest(job("grafana/k6:latest"))];
            lt.metadata.generation = Some(2);
        });
        h.reconcile().await;

        let status = h.status();
        assert_eq!(status.phase, Some(LoadTestPhase::Running));
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(h.cluster.apply_count(&job_identity()), 2);
        assert_eq!(h.cluster.apply_count(&deployment_identity()), 1);
        let workload = h.cluster.object(&job_identity()).unwrap();
        assert_eq!(
            workload["spec"]["template"]["spec"]["containers"][0]["image"],
            "grafana/k6:latest"
        );
    }

    // =========================================================================
    // Event discipline and lifecycle
    // =========================================================================

    #[tokio::test]
    async fn status_is_persisted_before_each_event() {
        let h = Harness::new(target_spec(None));
        h.run_until(LoadTestPhase::Running, Duration::from_secs(1)).await;

        assert!(h.position("status:Initializing") < h.position("event:LoadTestStarted"));
        assert!(h.position("status:Running") < h.position("event:LoadTestRunning"));
        assert!(h.position("apply:Job/hammer") < h.position("status:Running"));
    }

    #[tokio::test]
    async fn terminal_load_tests_stay_quiet() {
        let mut spec = target_spec(None);
        spec.duration_seconds = Some(1);
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Succeeded, Duration::from_secs(1)).await;
        let journal_len = h.journal().len();

        for _ in 0..3 {
            assert_eq!(h.reconcile().await, Action::await_change());
        }
        assert_eq!(h.journal().len(), journal_len);
        assert_eq!(h.events.count(reasons::LOAD_TEST_SUCCEEDED), 1);
    }

    #[tokio::test]
    async fn invalid_spec_fails_immediately() {
        let mut spec = target_spec(None);
        spec.target.resource = ResourceRef::default();
        let h = Harness::new(spec);
        h.run_until(LoadTestPhase::Failed, Duration::from_secs(1)).await;

        let status = h.status();
        assert_eq!(status.reason.as_deref(), Some("InvalidSpec"));
        assert_eq!(h.events.count(reasons::LOAD_TEST_STARTED), 0);
        assert_eq!(h.cluster.total_applies(), 0);
    }

    #[tokio::test]
    async fn failed_status_patch_publishes_nothing() {
        let mut tests = MockLoadTestClient::new();
        tests.expect_patch_status().returning(|_, _| {
            Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "etcd unavailable".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            })))
        });
        let events = RecordingEventPublisher::new();
        let ctx = Context::builder(Arc::new(tests), Arc::new(FakeCluster::new()), evaluator())
            .events(Arc::new(events.clone()))
            .clock(Arc::new(ManualClock::new()))
            .build();

        let mut lt = LoadTest::new("soak", target_spec(None));
        lt.metadata.namespace = Some("load".to_string());
        lt.metadata.uid = Some("uid".to_string());
        lt.metadata.finalizers = Some(vec![LOAD_TEST_FINALIZER.to_string()]);
        lt.status = Some(LoadTestStatus {
            phase: Some(LoadTestPhase::Pending),
            ..Default::default()
        });

        let err = reconcile(Arc::new(lt), Arc::new(ctx)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn deletion_removes_the_finalizer() {
        let h = Harness::new(target_spec(None));
        h.reconcile().await;
        h.tests.update(|lt| {
            lt.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
        });
        assert_eq!(h.reconcile().await, Action::await_change());
        assert!(h
            .tests
            .get()
            .metadata
            .finalizers
            .unwrap_or_default()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_namespace_is_a_permanent_error() {
        let h = Harness::new(target_spec(None));
        let mut lt = h.tests.get();
        lt.metadata.namespace = None;
        let err = reconcile(Arc::new(lt), h.ctx.clone()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            error_policy(Arc::new(h.tests.get()), &err, h.ctx.clone()),
            Action::requeue(Duration::from_secs(30))
        );
    }
}
