//! Condition evaluation
//!
//! Evaluates each expectation of a condition exactly once per check, either
//! in-process through the registry or through a webhook, then folds the
//! results with AllOf/AnyOf semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, trace};

use testplane_common::crd::{Expectation, ExpectationResultSummary, WaitCondition};

use crate::registry::{FunctionRegistry, FunctionResult};
use crate::webhook::WebhookClient;

/// Messages stored in status are cut to this many characters
pub const SUMMARY_MESSAGE_LIMIT: usize = 256;

/// Result of evaluating one condition
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConditionOutcome {
    /// AllOf/AnyOf verdict
    pub passed: bool,
    /// Per-expectation results in evaluation order (allOf first)
    pub results: Vec<(String, FunctionResult)>,
}

impl ConditionOutcome {
    /// Outcome of a condition with nothing to evaluate
    pub fn vacuous() -> Self {
        Self {
            passed: true,
            results: Vec::new(),
        }
    }

    /// Results summarized for status
    pub fn summaries(&self) -> Vec<ExpectationResultSummary> {
        self.results.iter().map(|(f, r)| summarize(f, r)).collect()
    }

    /// One-line description of the failing expectations
    pub fn failure_message(&self) -> String {
        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|(_, r)| !r.passed)
            .map(|(f, r)| match &r.message {
                Some(m) => format!("{f}: {m}"),
                None => f.clone(),
            })
            .collect();
        if failed.is_empty() {
            "no anyOf expectation passed".to_string()
        } else {
            failed.join("; ")
        }
    }
}

/// Summarize a function result for status, truncating the message
pub fn summarize(function: &str, result: &FunctionResult) -> ExpectationResultSummary {
    ExpectationResultSummary {
        function: function.to_string(),
        passed: result.passed,
        actual: result.actual.clone(),
        message: result.message.as_deref().map(truncate_message),
    }
}

/// Cut a message to [`SUMMARY_MESSAGE_LIMIT`] characters, marking the cut
/// with an ellipsis. Every message stored in status goes through here.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= SUMMARY_MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(SUMMARY_MESSAGE_LIMIT).collect();
    cut.push_str("...");
    cut
}

/// Choose the object a function sees from gathered state.
///
/// A single entry is unwrapped. With several entries the first one carrying
/// `status` or `spec` wins; otherwise the whole map is presented. Empty
/// state is presented as an empty object.
pub fn select_subject(state: &BTreeMap<String, Value>) -> Value {
    match state.len() {
        0 => json!({}),
        1 => state.values().next().cloned().unwrap_or(Value::Null),
        _ => state
            .values()
            .find(|v| v.get("status").is_some() || v.get("spec").is_some())
            .cloned()
            .unwrap_or_else(|| Value::Object(state.clone().into_iter().collect())),
    }
}

/// Decode an opaque parameter blob; absent or null means `{}`.
///
/// A string holding JSON is decoded as well.
pub fn decode_params(params: Option<&Value>) -> Result<Value, String> {
    match params {
        None | Some(Value::Null) => Ok(json!({})),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(json!({})),
        Some(Value::String(s)) => {
            serde_json::from_str(s).map_err(|e| format!("invalid params: {e}"))
        }
        Some(v) => Ok(v.clone()),
    }
}

/// Evaluates expectations through the registry or webhooks
#[derive(Clone)]
pub struct Evaluator {
    registry: Arc<FunctionRegistry>,
    webhook: Arc<dyn WebhookClient>,
}

impl Evaluator {
    /// Create an evaluator
    pub fn new(registry: Arc<FunctionRegistry>, webhook: Arc<dyn WebhookClient>) -> Self {
        Self { registry, webhook }
    }

    /// The registry backing in-process evaluation
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Evaluate one expectation against a subject
    pub async fn evaluate(&self, expectation: &Expectation, subject: &Value) -> FunctionResult {
        let params = match decode_params(expectation.params.as_ref()) {
            Ok(p) => p,
            Err(e) => return FunctionResult::fail(e),
        };
        let result = match expectation.webhook.as_deref().filter(|w| !w.is_empty()) {
            Some(url) => {
                self.webhook
                    .evaluate(url, &expectation.function, &params)
                    .await
            }
            None => self.registry.invoke(&expectation.function, subject, &params),
        };
        trace!(
            function = %expectation.function,
            passed = result.passed,
            "expectation evaluated"
        );
        result
    }

    /// Evaluate a condition against gathered state
    pub async fn evaluate_condition(
        &self,
        condition: &WaitCondition,
        state: &BTreeMap<String, Value>,
    ) -> ConditionOutcome {
        let subject = select_subject(state);
        self.evaluate_condition_on(condition, &subject).await
    }

    /// Evaluate a condition against an explicit subject
    pub async fn evaluate_condition_on(
        &self,
        condition: &WaitCondition,
        subject: &Value,
    ) -> ConditionOutcome {
        if condition.is_empty() {
            return ConditionOutcome::vacuous();
        }

        let all = join_all(condition.all_of.iter().map(|e| self.evaluate(e, subject))).await;
        let any = join_all(condition.any_of.iter().map(|e| self.evaluate(e, subject))).await;

        let all_passed = all.iter().all(|r| r.passed);
        let any_passed = any.is_empty() || any.iter().any(|r| r.passed);

        let results = condition
            .all_of
            .iter()
            .zip(all)
            .chain(condition.any_of.iter().zip(any))
            .map(|(e, r)| (e.function.clone(), r))
            .collect();

        let outcome = ConditionOutcome {
            passed: all_passed && any_passed,
            results,
        };
        debug!(passed = outcome.passed, checks = outcome.results.len(), "condition evaluated");
        outcome
    }

    /// True when every expectation passes against the subject
    pub async fn all_pass(&self, expectations: &[Expectation], subject: &Value) -> bool {
        for e in expectations {
            if !self.evaluate(e, subject).await.passed {
                return false;
            }
        }
        true
    }

    /// Run an extractor function in-process and return its value
    pub fn extract(
        &self,
        function: &str,
        params: Option<&Value>,
        subject: &Value,
    ) -> Result<String, String> {
        if !self.registry.contains(function) {
            return Err(format!("unknown function '{function}'"));
        }
        let params = decode_params(params)?;
        let result = self.registry.invoke(function, subject, &params);
        if !result.passed {
            return Err(result
                .message
                .unwrap_or_else(|| format!("{function} failed")));
        }
        result
            .value
            .or(result.actual)
            .ok_or_else(|| format!("{function} produced no value"))
    }
}
