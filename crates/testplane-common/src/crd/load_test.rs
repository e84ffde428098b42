//! LoadTest Custom Resource Definition
//!
//! A LoadTest applies (or selects) a target, waits for it to become ready,
//! extracts values from it, applies workload objects annotated with those
//! values and then periodically checks expectations against the target.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ExpectationResultSummary, HealthCheck, ReadyCondition, ReadyConditionStatus,
    ResourceIdentity, ResourceRef,
};
use crate::kube_utils::free_object_schema;

/// Target ReadyCondition timeout when unset
pub const DEFAULT_READY_TIMEOUT_SECS: i64 = 300;

/// Health check poll period when unset
pub const DEFAULT_CHECK_INTERVAL_SECS: i64 = 10;

/// Consecutive failures tolerated when unset
pub const DEFAULT_FAILURE_THRESHOLD: i32 = 3;

/// Specification for a LoadTest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infra.testplane.io",
    version = "v1alpha1",
    kind = "LoadTest",
    plural = "loadtests",
    shortname = "lt",
    status = "LoadTestStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Checks","type":"integer","jsonPath":".status.expectationsStatus.checkCount"}"#,
    printcolumn = r#"{"name":"Pass","type":"integer","jsonPath":".status.expectationsStatus.passCount"}"#,
    printcolumn = r#"{"name":"Fail","type":"integer","jsonPath":".status.expectationsStatus.failCount"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSpec {
    /// System under test
    pub target: TargetSpec,

    /// Load generators
    #[serde(default)]
    pub workload: WorkloadSpec,

    /// Periodic checks against the target while Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectations: Option<HealthCheck>,

    /// Succeed after running this long; absent or 0 runs until deleted or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl LoadTestSpec {
    /// Validate the test specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.target
            .resource
            .validate()
            .map_err(|e| crate::Error::validation(format!("spec.target.resource: {e}")))?;
        for (i, r) in self.workload.resources.iter().enumerate() {
            if r.manifest.is_none() {
                return Err(crate::Error::validation(format!(
                    "spec.workload.resources[{i}] must be a manifest"
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for inj in &self.workload.env_injection {
            if inj.name.is_empty() || inj.extractor.function.is_empty() {
                return Err(crate::Error::validation(
                    "envInjection entries need a name and an extractor function",
                ));
            }
            if !seen.insert(inj.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate envInjection name '{}'",
                    inj.name
                )));
            }
        }
        Ok(())
    }

    /// ReadyCondition timeout in seconds
    pub fn ready_timeout_secs(&self) -> i64 {
        self.target
            .ready_condition
            .as_ref()
            .and_then(|r| r.timeout_seconds)
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_READY_TIMEOUT_SECS)
    }

    /// Health check interval in seconds
    pub fn check_interval_secs(&self) -> i64 {
        self.expectations
            .as_ref()
            .and_then(|e| e.interval_seconds)
            .filter(|i| *i > 0)
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
    }

    /// Consecutive failures that fail the test
    pub fn failure_threshold(&self) -> i32 {
        self.expectations
            .as_ref()
            .and_then(|e| e.failure_threshold)
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD)
    }
}

/// Target of a LoadTest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Manifest to apply or selector to an existing object
    pub resource: ResourceRef,

    /// Gate before the workload starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_condition: Option<ReadyCondition>,
}

/// Workload applied once the target is ready
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Values extracted from the target and injected into workload Pod templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_injection: Vec<EnvInjection>,

    /// Workload manifests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,
}

/// One injected value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvInjection {
    /// Name under which the value is stored and injected
    pub name: String,
    /// Function producing the value
    pub extractor: Extractor,
}

/// Registered extractor invocation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Extractor {
    /// Registered function name
    pub function: String,
    /// Function parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_object_schema")]
    pub params: Option<serde_json::Value>,
}

/// Lifecycle phase of a LoadTest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LoadTestPhase {
    /// Accepted, not yet started
    #[default]
    Pending,
    /// Target applied, waiting for readiness
    Initializing,
    /// Workload running, periodic checks active
    Running,
    /// Duration elapsed without tripping the failure threshold
    Succeeded,
    /// Target or workload failure, or threshold tripped
    Failed,
}

impl LoadTestPhase {
    /// No further work happens in terminal phases
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for LoadTestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Counters of the periodic health check
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectationsStatus {
    /// Evaluations performed
    #[serde(default)]
    pub check_count: i64,
    /// Passing evaluations
    #[serde(default)]
    pub pass_count: i64,
    /// Failing evaluations
    #[serde(default)]
    pub fail_count: i64,
    /// Failures since the last pass
    #[serde(default)]
    pub consecutive_failures: i32,
    /// Time of the last evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
    /// Results of the last evaluation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_results: Vec<ExpectationResultSummary>,
}

/// Status for a LoadTest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestStatus {
    /// Current phase; absent until first observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<LoadTestPhase>,

    /// Machine-readable reason for the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Extracted values by injection name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub injected_values: BTreeMap<String, String>,

    /// Target ReadyCondition progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_condition_status: Option<ReadyConditionStatus>,

    /// Periodic check counters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectations_status: Option<ExpectationsStatus>,

    /// Generation last applied to the target and workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the test state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the LoadTest left Pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the workload started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since: Option<DateTime<Utc>>,

    /// When the LoadTest reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// The object the target resolved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_target: Option<ResourceIdentity>,
}

impl LoadTestStatus {
    /// Phase with `Pending` standing in for "no phase yet"
    pub fn phase_or_default(&self) -> LoadTestPhase {
        self.phase.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ResourceSelector;
    use kube::CustomResourceExt;

    fn spec_with_manifest() -> LoadTestSpec {
        LoadTestSpec {
            target: TargetSpec {
                resource: ResourceRef::manifest(serde_json::json!({
                    "apiVersion": "apps/v1", "kind": "Deployment",
                    "metadata": {"name": "web"}
                })),
                ready_condition: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn crd_has_short_name_and_columns() {
        let crd = LoadTest::crd();
        assert_eq!(crd.spec.names.short_names, Some(vec!["lt".to_string()]));
        let columns: Vec<_> = crd.spec.versions[0]
            .additional_printer_columns
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(columns, vec!["Phase", "Checks", "Pass", "Fail", "Reason", "Age"]);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let spec = spec_with_manifest();
        assert_eq!(spec.ready_timeout_secs(), 300);
        assert_eq!(spec.check_interval_secs(), 10);
        assert_eq!(spec.failure_threshold(), 3);
    }

    #[test]
    fn explicit_health_check_values_win() {
        let mut spec = spec_with_manifest();
        spec.expectations = Some(HealthCheck {
            interval_seconds: Some(2),
            failure_threshold: Some(5),
            ..Default::default()
        });
        assert_eq!(spec.check_interval_secs(), 2);
        assert_eq!(spec.failure_threshold(), 5);
    }

    #[test]
    fn workload_entries_must_be_manifests() {
        let mut spec = spec_with_manifest();
        assert!(spec.validate().is_ok());
        spec.workload.resources.push(ResourceRef::selector(ResourceSelector {
            api_version: "v1".into(),
            kind: "Pod".into(),
            name: Some("x".into()),
            ..Default::default()
        }));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn duplicate_injection_names_rejected() {
        let mut spec = spec_with_manifest();
        let inj = EnvInjection {
            name: "TARGET_URL".into(),
            extractor: Extractor {
                function: "ExtractServiceAddress".into(),
                params: None,
            },
        };
        spec.workload.env_injection = vec![inj.clone(), inj];
        assert!(spec.validate().unwrap_err().to_string().contains("duplicate"));
    }
}
