//! Pod-template injection
//!
//! Values extracted from a LoadTest target are surfaced to workload Pods as
//! annotations (`testplane.io/inject-<kebab-name>`), which the Pods can read
//! through the Downward API.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::trace;

use testplane_common::INJECT_ANNOTATION_PREFIX;

/// Convert an injection name to kebab-case.
///
/// `_` becomes `-`, a `-` is inserted before an uppercase letter that
/// follows a lowercase letter or an ASCII digit, and the result is
/// lower-cased. Runs of uppercase letters stay together.
///
/// ```
/// use testplane_resource::kebab_case;
///
/// assert_eq!(kebab_case("TARGET_URL"), "target-url");
/// assert_eq!(kebab_case("targetAddress"), "target-address");
/// assert_eq!(kebab_case("v2Endpoint"), "v2-endpoint");
/// ```
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c == '_' {
            out.push('-');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            out.push('-');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        out.extend(c.to_lowercase());
    }
    out
}

/// Annotation key carrying the injected value named `name`
pub fn annotation_key(name: &str) -> String {
    format!("{INJECT_ANNOTATION_PREFIX}{}", kebab_case(name))
}

const TEMPLATE_PATH: &[&str] = &["spec", "template", "metadata", "annotations"];
const CRONJOB_PATH: &[&str] = &[
    "spec",
    "jobTemplate",
    "spec",
    "template",
    "metadata",
    "annotations",
];
const POD_PATH: &[&str] = &["metadata", "annotations"];

/// Where annotations go for a kind, and whether the path may be created
fn annotation_path(kind: &str) -> (&'static [&'static str], bool) {
    match kind {
        "Deployment" | "DaemonSet" | "StatefulSet" | "ReplicaSet" | "Job" => (TEMPLATE_PATH, true),
        "CronJob" => (CRONJOB_PATH, true),
        "Pod" => (POD_PATH, true),
        _ => (TEMPLATE_PATH, false),
    }
}

/// Write injected values into an object's Pod template annotations.
///
/// Returns true when annotations were written. Unknown kinds are only
/// annotated when they already carry `spec.template`; otherwise they are
/// left untouched.
pub fn inject_annotations(body: &mut Value, values: &BTreeMap<String, String>) -> bool {
    if values.is_empty() {
        return false;
    }
    let kind = body["kind"].as_str().unwrap_or_default().to_string();
    let (path, create) = annotation_path(&kind);

    if !create && !body["spec"]["template"].is_object() {
        trace!(kind = %kind, "no pod template to annotate");
        return false;
    }

    let Some(annotations) = object_at(body, path) else {
        return false;
    };
    for (name, value) in values {
        annotations.insert(annotation_key(name), Value::String(value.clone()));
    }
    true
}

/// Walk to the object at `path`, creating missing objects along the way.
///
/// Returns `None` if a non-object value is in the way.
fn object_at<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let mut current = value;
    for segment in path {
        let map = current.as_object_mut()?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }
    current.as_object_mut()
}
