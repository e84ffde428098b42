//! Kubernetes Event recording for testplane controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.
//!
//! Controllers only publish after the status mutation that justifies the
//! event has been persisted.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "StepStarted")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "integrationtest-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was published on
    pub object: String,
    /// True for Warning events
    pub warning: bool,
    /// Reason string
    pub reason: String,
    /// Optional note
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory, optionally appending a
/// `event:<Reason>` marker to a shared journal so tests can assert the
/// ordering of status patches relative to events.
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone, Default)]
pub struct RecordingEventPublisher {
    events: std::sync::Arc<std::sync::Mutex<Vec<RecordedEvent>>>,
    journal: Option<std::sync::Arc<std::sync::Mutex<Vec<String>>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder that also writes into a shared journal
    pub fn with_journal(journal: std::sync::Arc<std::sync::Mutex<Vec<String>>>) -> Self {
        Self {
            events: Default::default(),
            journal: Some(journal),
        }
    }

    /// All events recorded so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Reasons of all events recorded so far, in emission order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Number of events recorded with the given reason
    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Some(journal) = &self.journal {
            if let Ok(mut j) = journal.lock() {
                j.push(format!("event:{reason}"));
            }
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.name.clone().unwrap_or_default(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // IntegrationTest lifecycle
    /// Run started (Pending → Running)
    pub const INTEGRATION_TEST_STARTED: &str = "IntegrationTestStarted";
    /// A step applied its resource (or began evaluating)
    pub const STEP_STARTED: &str = "StepStarted";
    /// A step passed every check
    pub const STEP_SUCCEEDED: &str = "StepSucceeded";
    /// A step failed or timed out
    pub const STEP_FAILED: &str = "StepFailed";
    /// The run finished successfully
    pub const INTEGRATION_TEST_SUCCEEDED: &str = "IntegrationTestSucceeded";
    /// The run failed
    pub const INTEGRATION_TEST_FAILED: &str = "IntegrationTestFailed";
    /// The run failed because a step deadline elapsed
    pub const INTEGRATION_TEST_TIMEOUT: &str = "IntegrationTestTimeout";

    // LoadTest lifecycle
    /// LoadTest left Pending
    pub const LOAD_TEST_STARTED: &str = "LoadTestStarted";
    /// Target manifest applied or selector target resolved for the first time
    pub const TARGET_APPLIED: &str = "TargetApplied";
    /// Target ReadyCondition passed
    pub const TARGET_READY: &str = "TargetReady";
    /// Waiting on the target ReadyCondition
    pub const READY_CONDITION_WAIT: &str = "ReadyConditionWait";
    /// Workload applied, periodic checks running
    pub const LOAD_TEST_RUNNING: &str = "LoadTestRunning";
    /// LoadTest finished successfully
    pub const LOAD_TEST_SUCCEEDED: &str = "LoadTestSucceeded";
    /// LoadTest failed
    pub const LOAD_TEST_FAILED: &str = "LoadTestFailed";
    /// Target manifest could not be applied
    pub const TARGET_APPLY_FAILED: &str = "TargetApplyFailed";
    /// Workload manifests could not be applied
    pub const WORKLOAD_APPLY_FAILED: &str = "WorkloadApplyFailed";
    /// A periodic expectation check passed
    pub const EXPECTATION_PASSED: &str = "ExpectationPassed";
    /// A periodic expectation check failed
    pub const EXPECTATION_FAILED: &str = "ExpectationFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Applying a manifest
    pub const APPLY: &str = "Apply";
    /// Evaluating expectations
    pub const VERIFY: &str = "Verify";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::STEP_STARTED, "StepStarted");
        assert_eq!(reasons::INTEGRATION_TEST_TIMEOUT, "IntegrationTestTimeout");
        assert_eq!(reasons::LOAD_TEST_RUNNING, "LoadTestRunning");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::STEP_STARTED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }

    #[tokio::test]
    async fn recording_publisher_journals_in_order() {
        let journal = std::sync::Arc::new(std::sync::Mutex::new(vec!["patch".to_string()]));
        let publisher = RecordingEventPublisher::with_journal(journal.clone());
        let obj = ObjectReference {
            name: Some("smoke".to_string()),
            ..Default::default()
        };
        publisher
            .publish(&obj, EventType::Warning, reasons::STEP_FAILED, actions::VERIFY, None)
            .await;

        assert_eq!(publisher.count(reasons::STEP_FAILED), 1);
        assert!(publisher.events()[0].warning);
        assert_eq!(publisher.events()[0].object, "smoke");
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["patch".to_string(), "event:StepFailed".to_string()]
        );
    }
}
