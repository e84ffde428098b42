//! Supporting types shared by the IntegrationTest and LoadTest CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::{any_value_schema, free_object_schema};

/// Condition types written by the testplane controllers
pub mod condition_types {
    /// Overall readiness of the test
    pub const READY: &str = "Ready";
    /// LoadTest target passed its ReadyCondition
    pub const TARGET_READY: &str = "TargetReady";
    /// Latest expectation evaluation passed
    pub const EXPECTATIONS_MET: &str = "ExpectationsMet";
    /// The spec changed while a run was in progress and was ignored
    pub const SPEC_CHANGED_IGNORED: &str = "SpecChangedIgnored";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, TargetReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Generation of the test when the condition was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a condition stamped at `now`
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            observed_generation: None,
        }
    }

    /// Attach the generation the condition describes
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Insert or replace a condition by type.
///
/// `lastTransitionTime` is carried over from the existing condition unless
/// the status actually changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

// =============================================================================
// Expectations
// =============================================================================

/// A single named assertion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expectation {
    /// Registered function name (e.g. "DeploymentAvailable")
    pub function: String,

    /// When set, the function is evaluated by POSTing to this URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,

    /// Function parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_object_schema")]
    pub params: Option<serde_json::Value>,
}

impl Expectation {
    /// Expectation evaluated in-process with no parameters
    pub fn named(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Default::default()
        }
    }

    /// Attach parameters
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    /// True when the expectation is routed to a webhook
    pub fn is_webhook(&self) -> bool {
        self.webhook.as_deref().is_some_and(|w| !w.is_empty())
    }
}

/// AllOf/AnyOf composition of expectations
///
/// Passes when every `allOf` entry passes and, if `anyOf` is non-empty, at
/// least one `anyOf` entry passes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitCondition {
    /// Every entry must pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<Expectation>,

    /// At least one entry must pass (ignored when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Expectation>,
}

impl WaitCondition {
    /// Condition requiring every given expectation
    pub fn all(expectations: Vec<Expectation>) -> Self {
        Self {
            all_of: expectations,
            any_of: Vec::new(),
        }
    }

    /// True when there is nothing to evaluate
    pub fn is_empty(&self) -> bool {
        self.all_of.is_empty() && self.any_of.is_empty()
    }

    /// Every expectation in evaluation order (allOf first)
    pub fn iter(&self) -> impl Iterator<Item = &Expectation> {
        self.all_of.iter().chain(self.any_of.iter())
    }
}

/// Expectations of an IntegrationTest step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepCondition {
    /// Composition
    #[serde(flatten)]
    pub condition: WaitCondition,

    /// Poll period while the expectations fail (default 5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,
}

/// Readiness gate evaluated before expectations
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCondition {
    /// Composition
    #[serde(flatten)]
    pub condition: WaitCondition,

    /// Upper bound on the wait (LoadTest default 300; steps use the step timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

/// Periodic expectation check of a running LoadTest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Composition
    #[serde(flatten)]
    pub condition: WaitCondition,

    /// Poll period (default 10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,

    /// Consecutive failures that fail the LoadTest (default 3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,

    /// Bound on a single evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

// =============================================================================
// Resources
// =============================================================================

/// What to do with a manifest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResourceAction {
    /// Server-Side Apply the objects
    #[default]
    Apply,
    /// Delete the objects
    Delete,
}

/// Either a manifest to apply/delete or a selector to an existing object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Object, list of objects, `{items: [...]}` or a JSON/YAML string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "any_value_schema")]
    pub manifest: Option<serde_json::Value>,

    /// Reference to existing objects (read-only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ResourceSelector>,

    /// Apply or Delete; only meaningful with a manifest
    #[serde(default)]
    pub action: ResourceAction,
}

impl ResourceRef {
    /// Reference applying the given manifest
    pub fn manifest(manifest: serde_json::Value) -> Self {
        Self {
            manifest: Some(manifest),
            ..Default::default()
        }
    }

    /// Reference resolving the given selector
    pub fn selector(selector: ResourceSelector) -> Self {
        Self {
            selector: Some(selector),
            ..Default::default()
        }
    }

    /// Exactly one of manifest/selector must be set
    pub fn validate(&self) -> Result<(), crate::Error> {
        match (&self.manifest, &self.selector) {
            (Some(_), Some(_)) => Err(crate::Error::validation(
                "resource must set either manifest or selector, not both",
            )),
            (None, None) => Err(crate::Error::validation(
                "resource must set either manifest or selector",
            )),
            (None, Some(sel)) => sel.validate(),
            (Some(_), None) => Ok(()),
        }
    }
}

/// Read-only reference to existing objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// apiVersion of the selected objects
    pub api_version: String,

    /// Kind of the selected objects
    pub kind: String,

    /// Namespace (defaults to the test's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Exact object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Server-side label match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<BTreeMap<String, String>>,

    /// Client-side annotation match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<BTreeMap<String, String>>,

    /// Candidates must pass all of these to be chosen
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expectations: Vec<Expectation>,
}

impl ResourceSelector {
    /// Exactly one of name/labelSelector/annotationSelector must be set
    pub fn validate(&self) -> Result<(), crate::Error> {
        let set = [
            self.name.as_deref().is_some_and(|n| !n.is_empty()),
            self.label_selector.as_ref().is_some_and(|l| !l.is_empty()),
            self.annotation_selector
                .as_ref()
                .is_some_and(|a| !a.is_empty()),
        ]
        .iter()
        .filter(|&&x| x)
        .count();

        match set {
            1 => Ok(()),
            0 => Err(crate::Error::validation(
                "selector must set one of name, labelSelector or annotationSelector",
            )),
            _ => Err(crate::Error::validation(
                "selector name, labelSelector and annotationSelector are mutually exclusive",
            )),
        }
    }
}

/// Identity of a cluster object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    /// apiVersion
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl ResourceIdentity {
    /// `apiVersion/kind/name`, the key used in gathered state
    pub fn state_key(&self) -> String {
        format!("{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

// =============================================================================
// Result recording
// =============================================================================

/// Stored outcome of one expectation evaluation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectationResultSummary {
    /// Function name
    pub function: String,
    /// Whether it passed
    pub passed: bool,
    /// Observed value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// Explanation (truncated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Progress of a ReadyCondition wait
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReadyConditionState {
    /// Still waiting
    #[default]
    Waiting,
    /// Condition passed
    Passed,
    /// Deadline exceeded
    Failed,
}

/// Persisted state of a ReadyCondition wait
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyConditionStatus {
    /// Current state
    #[serde(default)]
    pub state: ReadyConditionState,
    /// When the wait started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the wait gives up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Last evaluation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
    /// Number of evaluations so far
    #[serde(default)]
    pub attempts: u32,
    /// Results of the last evaluation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ExpectationResultSummary>,
}

impl ReadyConditionStatus {
    /// Fresh wait started at `now` lasting `timeout_secs`
    pub fn started(now: DateTime<Utc>, timeout_secs: i64) -> Self {
        Self {
            state: ReadyConditionState::Waiting,
            started_at: Some(now),
            deadline: Some(now + chrono::Duration::seconds(timeout_secs)),
            ..Default::default()
        }
    }

    /// True once the deadline lies in the past
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}
