//! Custom Resource Definitions for testplane
//!
//! Both kinds live in `infra.testplane.io/v1alpha1` and share the
//! expectation and resource shapes in `types`.

mod load_test;
mod types;

pub use integration_test::{
    ExecutionMode, IntegrationTest, IntegrationTestPhase, IntegrationTestSpec,
    IntegrationTestStatus, RepeatSpec, RoundSummary, StepState, StepStatus, TestStats, TestStep,
    DEFAULT_STEP_INTERVAL_SECS, DEFAULT_STEP_TIMEOUT_SECS, ROUND_HISTORY_LIMIT,
};
pub use load_test::{
    EnvInjection, ExpectationsStatus, Extractor, LoadTest, LoadTestPhase, LoadTestSpec,
    LoadTestStatus, TargetSpec, WorkloadSpec, DEFAULT_CHECK_INTERVAL_SECS,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_READY_TIMEOUT_SECS,
};
pub use types::{
    condition_types, find_condition, set_condition, Condition, ConditionStatus, Expectation,
    ExpectationResultSummary, HealthCheck, ReadyCondition, ReadyConditionState,
    ReadyConditionStatus, ResourceAction, ResourceIdentity, ResourceRef, ResourceSelector,
    StepCondition, WaitCondition,
};
