//! Built-in assertion and extractor functions
//!
//! Registered by the host at startup via [`register_builtins`]. Paths use
//! dotted notation with optional list indexes, e.g.
//! `status.conditions[0].type`.

use serde_json::Value;

use crate::registry::{FunctionRegistry, FunctionResult};

/// Register the stock catalog into `registry`
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register("ResourceExists", resource_exists);
    registry.register("ResourceAbsent", resource_absent);
    registry.register("FieldEquals", field_equals);
    registry.register("FieldExists", field_exists);
    registry.register("FieldMatches", field_matches);
    registry.register("ConditionTrue", condition_true);
    registry.register("DeploymentAvailable", deployment_available);
    registry.register("StatefulSetReady", statefulset_ready);
    registry.register("DaemonSetReady", daemonset_ready);
    registry.register("PodReady", pod_ready);
    registry.register("PodRunning", pod_running);
    registry.register("JobSucceeded", job_succeeded);
    registry.register("ReplicasReady", replicas_ready);
    registry.register("LabelEquals", label_equals);
    registry.register("AnnotationEquals", annotation_equals);
    registry.register("ExtractField", extract_field);
    registry.register("ExtractServiceAddress", extract_service_address);
    registry.register("ExtractName", extract_name);
}

/// Resolve a dotted path with optional `[n]` indexes
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indexes
            .split(|c: char| c == '[' || c == ']')
            .filter(|s| !s.is_empty())
        {
            current = current.get(idx.parse::<usize>().ok()?)?;
        }
    }
    Some(current)
}

/// String form of a JSON value: strings unquoted, everything else as JSON
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, FunctionResult> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FunctionResult::fail(format!("missing string param '{key}'")))
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn int_at(resource: &Value, path: &str) -> i64 {
    lookup(resource, path).and_then(Value::as_i64).unwrap_or(0)
}

fn has_identity(resource: &Value) -> bool {
    resource
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .is_some_and(|n| !n.is_empty())
}

fn condition_status<'a>(resource: &'a Value, type_: &str) -> Option<&'a str> {
    resource
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
}

fn resource_exists(resource: &Value, _: &Value) -> FunctionResult {
    match resource.pointer("/metadata/name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => FunctionResult::pass().with_actual(name),
        _ => FunctionResult::fail("resource does not exist"),
    }
}

fn resource_absent(resource: &Value, _: &Value) -> FunctionResult {
    if has_identity(resource) {
        FunctionResult::fail("resource still exists").with_actual(display(
            resource.pointer("/metadata/name").unwrap_or(&Value::Null),
        ))
    } else {
        FunctionResult::pass()
    }
}

fn field_equals(resource: &Value, params: &Value) -> FunctionResult {
    let path = match param_str(params, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let Some(expected) = params.get("value") else {
        return FunctionResult::fail("missing param 'value'");
    };
    let Some(actual) = lookup(resource, path) else {
        return FunctionResult::fail(format!("field {path} not found"));
    };
    let equal = actual == expected || display(actual) == display(expected);
    let result = if equal {
        FunctionResult::pass()
    } else {
        FunctionResult::fail(format!(
            "{path} is {}, want {}",
            display(actual),
            display(expected)
        ))
    };
    result.with_actual(display(actual))
}

fn field_exists(resource: &Value, params: &Value) -> FunctionResult {
    let path = match param_str(params, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    match lookup(resource, path) {
        Some(v) if !v.is_null() => FunctionResult::pass().with_actual(display(v)),
        _ => FunctionResult::fail(format!("field {path} not found")),
    }
}

/// Numeric comparison: `{path, operator: gt|gte|lt|lte|eq|ne, value}`
fn field_matches(resource: &Value, params: &Value) -> FunctionResult {
    let path = match param_str(params, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    let operator = params
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or("eq");
    let Some(want) = params.get("value").and_then(as_f64) else {
        return FunctionResult::fail("param 'value' must be numeric");
    };
    let Some(actual_value) = lookup(resource, path) else {
        return FunctionResult::fail(format!("field {path} not found"));
    };
    let Some(got) = as_f64(actual_value) else {
        return FunctionResult::fail(format!("field {path} is not numeric"))
            .with_actual(display(actual_value));
    };
    let ok = match operator {
        "gt" => got > want,
        "gte" => got >= want,
        "lt" => got < want,
        "lte" => got <= want,
        "eq" => (got - want).abs() < f64::EPSILON,
        "ne" => (got - want).abs() >= f64::EPSILON,
        other => return FunctionResult::fail(format!("unknown operator '{other}'")),
    };
    let result = if ok {
        FunctionResult::pass()
    } else {
        FunctionResult::fail(format!("{path}={got} is not {operator} {want}"))
    };
    result.with_actual(display(actual_value))
}

fn condition_true(resource: &Value, params: &Value) -> FunctionResult {
    let type_ = match param_str(params, "type") {
        Ok(t) => t,
        Err(r) => return r,
    };
    match condition_status(resource, type_) {
        Some("True") => FunctionResult::pass().with_actual("True"),
        Some(other) => FunctionResult::fail(format!("condition {type_} is {other}")).with_actual(other),
        None => FunctionResult::fail(format!("condition {type_} not found")),
    }
}

fn deployment_available(resource: &Value, _: &Value) -> FunctionResult {
    if !has_identity(resource) {
        return FunctionResult::fail("deployment does not exist");
    }
    let desired = lookup(resource, "spec.replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let available = int_at(resource, "status.availableReplicas");
    let actual = format!("{available}/{desired}");
    if condition_status(resource, "Available") == Some("True") && available >= desired {
        FunctionResult::pass().with_actual(actual)
    } else {
        FunctionResult::fail(format!("{available} of {desired} replicas available"))
            .with_actual(actual)
    }
}

fn statefulset_ready(resource: &Value, _: &Value) -> FunctionResult {
    if !has_identity(resource) {
        return FunctionResult::fail("statefulset does not exist");
    }
    let desired = lookup(resource, "spec.replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = int_at(resource, "status.readyReplicas");
    let current = lookup(resource, "status.currentRevision");
    let update = lookup(resource, "status.updateRevision");
    let rolled = match (current, update) {
        (Some(c), Some(u)) => c == u,
        _ => true,
    };
    let actual = format!("{ready}/{desired}");
    if ready >= desired && rolled {
        FunctionResult::pass().with_actual(actual)
    } else if !rolled {
        FunctionResult::fail("rollout in progress").with_actual(actual)
    } else {
        FunctionResult::fail(format!("{ready} of {desired} replicas ready")).with_actual(actual)
    }
}

fn daemonset_ready(resource: &Value, _: &Value) -> FunctionResult {
    if !has_identity(resource) {
        return FunctionResult::fail("daemonset does not exist");
    }
    let desired = int_at(resource, "status.desiredNumberScheduled");
    let ready = int_at(resource, "status.numberReady");
    let updated = lookup(resource, "status.updatedNumberScheduled")
        .and_then(Value::as_i64)
        .unwrap_or(desired);
    let actual = format!("{ready}/{desired}");
    if ready >= desired && updated >= desired {
        FunctionResult::pass().with_actual(actual)
    } else {
        FunctionResult::fail(format!("{ready} of {desired} pods ready")).with_actual(actual)
    }
}

fn pod_ready(resource: &Value, _: &Value) -> FunctionResult {
    match condition_status(resource, "Ready") {
        Some("True") => FunctionResult::pass().with_actual("True"),
        Some(other) => FunctionResult::fail(format!("pod Ready is {other}")).with_actual(other),
        None => FunctionResult::fail("pod has no Ready condition"),
    }
}

fn pod_running(resource: &Value, _: &Value) -> FunctionResult {
    match lookup(resource, "status.phase").and_then(Value::as_str) {
        Some("Running") => FunctionResult::pass().with_actual("Running"),
        Some(phase) => FunctionResult::fail(format!("pod phase is {phase}")).with_actual(phase),
        None => FunctionResult::fail("pod has no phase"),
    }
}

fn job_succeeded(resource: &Value, _: &Value) -> FunctionResult {
    if condition_status(resource, "Failed") == Some("True") {
        return FunctionResult::fail("job failed");
    }
    let completions = lookup(resource, "spec.completions")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let succeeded = int_at(resource, "status.succeeded");
    let actual = format!("{succeeded}/{completions}");
    if condition_status(resource, "Complete") == Some("True") || succeeded >= completions {
        FunctionResult::pass().with_actual(actual)
    } else {
        FunctionResult::fail(format!("{succeeded} of {completions} completions"))
            .with_actual(actual)
    }
}

/// `status.readyReplicas >= min` where `min` defaults to `spec.replicas`
fn replicas_ready(resource: &Value, params: &Value) -> FunctionResult {
    let min = params
        .get("min")
        .and_then(as_f64)
        .map(|m| m as i64)
        .or_else(|| lookup(resource, "spec.replicas").and_then(Value::as_i64))
        .unwrap_or(1);
    let ready = int_at(resource, "status.readyReplicas");
    let actual = ready.to_string();
    if ready >= min {
        FunctionResult::pass().with_actual(actual)
    } else {
        FunctionResult::fail(format!("{ready} ready, want at least {min}")).with_actual(actual)
    }
}

fn metadata_map_equals(resource: &Value, params: &Value, map: &str) -> FunctionResult {
    let key = match param_str(params, "key") {
        Ok(k) => k,
        Err(r) => return r,
    };
    let want = params.get("value").map(display).unwrap_or_default();
    match resource
        .get("metadata")
        .and_then(|m| m.get(map))
        .and_then(|m| m.get(key))
        .and_then(Value::as_str)
    {
        Some(v) if v == want => FunctionResult::pass().with_actual(v),
        Some(v) => FunctionResult::fail(format!("{map} {key}={v}, want {want}")).with_actual(v),
        None => FunctionResult::fail(format!("{map} {key} not set")),
    }
}

fn label_equals(resource: &Value, params: &Value) -> FunctionResult {
    metadata_map_equals(resource, params, "labels")
}

fn annotation_equals(resource: &Value, params: &Value) -> FunctionResult {
    metadata_map_equals(resource, params, "annotations")
}

fn extract_field(resource: &Value, params: &Value) -> FunctionResult {
    let path = match param_str(params, "path") {
        Ok(p) => p,
        Err(r) => return r,
    };
    match lookup(resource, path) {
        Some(v) if !v.is_null() => FunctionResult::extracted(display(v)),
        _ => FunctionResult::fail(format!("field {path} not found")),
    }
}

/// `<clusterIP>:<port>`; headless services use `<name>.<namespace>.svc`.
///
/// `port` selects by name or number (first port otherwise); `scheme`
/// prefixes the result, e.g. `http://`.
fn extract_service_address(resource: &Value, params: &Value) -> FunctionResult {
    if resource.get("kind").and_then(Value::as_str).is_some_and(|k| k != "Service") {
        return FunctionResult::fail("target is not a Service");
    }
    let ports = lookup(resource, "spec.ports")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let wanted = params.get("port");
    let port = match wanted {
        None | Some(Value::Null) => ports.first(),
        Some(Value::String(name)) => ports
            .iter()
            .find(|p| p.get("name").and_then(Value::as_str) == Some(name.as_str())),
        Some(n) => ports.iter().find(|p| p.get("port") == Some(n)),
    };
    let Some(port) = port.and_then(|p| p.get("port")).and_then(Value::as_i64) else {
        return FunctionResult::fail("service port not found");
    };

    let host = match lookup(resource, "spec.clusterIP").and_then(Value::as_str) {
        Some(ip) if !ip.is_empty() && ip != "None" => ip.to_string(),
        _ => {
            let name = lookup(resource, "metadata.name").and_then(Value::as_str);
            let ns = lookup(resource, "metadata.namespace")
                .and_then(Value::as_str)
                .unwrap_or("default");
            match name {
                Some(name) => format!("{name}.{ns}.svc"),
                None => return FunctionResult::fail("service has no address"),
            }
        }
    };

    let scheme = params
        .get("scheme")
        .and_then(Value::as_str)
        .map(|s| format!("{s}://"))
        .unwrap_or_default();
    FunctionResult::extracted(format!("{scheme}{host}:{port}"))
}

fn extract_name(resource: &Value, _: &Value) -> FunctionResult {
    match resource.pointer("/metadata/name").and_then(Value::as_str) {
        Some(n) if !n.is_empty() => FunctionResult::extracted(n),
        _ => FunctionResult::fail("resource has no name"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::with_builtins()
    }

    fn deployment(replicas: i64, available: i64, cond: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "load", "labels": {"app": "web"}},
            "spec": {"replicas": replicas},
            "status": {
                "availableReplicas": available,
                "readyReplicas": available,
                "conditions": [{"type": "Available", "status": cond}]
            }
        })
    }

    #[test]
    fn lookup_walks_objects_and_indexes() {
        let v = json!({"status": {"conditions": [{"type": "A"}, {"type": "B"}]}});
        assert_eq!(lookup(&v, "status.conditions[1].type"), Some(&json!("B")));
        assert_eq!(lookup(&v, "status.conditions[5].type"), None);
        assert_eq!(lookup(&v, "status.missing"), None);
        assert_eq!(lookup(&v, ""), Some(&v));
    }

    #[test]
    fn existence_checks() {
        let r = registry();
        let cm = json!({"metadata": {"name": "cm"}});
        assert!(r.invoke("ResourceExists", &cm, &json!({})).passed);
        assert!(!r.invoke("ResourceExists", &json!({}), &json!({})).passed);
        assert!(r.invoke("ResourceAbsent", &json!({}), &json!({})).passed);
        assert!(!r.invoke("ResourceAbsent", &cm, &json!({})).passed);
    }

    /// Story: a one-replica Deployment becomes available once the controller catches up
    #[test]
    fn story_deployment_available_follows_status() {
        let r = registry();
        let waiting = r.invoke("DeploymentAvailable", &deployment(1, 0, "False"), &json!({}));
        assert!(!waiting.passed);
        assert_eq!(waiting.actual.as_deref(), Some("0/1"));

        let ready = r.invoke("DeploymentAvailable", &deployment(1, 1, "True"), &json!({}));
        assert!(ready.passed);
    }

    #[test]
    fn field_equals_compares_loosely() {
        let r = registry();
        let d = deployment(3, 3, "True");
        assert!(r.invoke("FieldEquals", &d, &json!({"path": "spec.replicas", "value": 3})).passed);
        assert!(r.invoke("FieldEquals", &d, &json!({"path": "spec.replicas", "value": "3"})).passed);
        let miss = r.invoke("FieldEquals", &d, &json!({"path": "spec.replicas", "value": 4}));
        assert!(!miss.passed);
        assert_eq!(miss.actual.as_deref(), Some("3"));
        assert!(!r.invoke("FieldEquals", &d, &json!({"value": 4})).passed);
    }

    #[test]
    fn field_matches_numeric_operators() {
        let r = registry();
        let d = deployment(3, 2, "True");
        let p = |op: &str, v: i64| json!({"path": "status.readyReplicas", "operator": op, "value": v});
        assert!(r.invoke("FieldMatches", &d, &p("gte", 2)).passed);
        assert!(r.invoke("FieldMatches", &d, &p("lt", 3)).passed);
        assert!(!r.invoke("FieldMatches", &d, &p("gt", 2)).passed);
        assert!(r.invoke("FieldMatches", &d, &p("ne", 5)).passed);
        assert!(!r.invoke("FieldMatches", &d, &p("between", 1)).passed);
    }

    #[test]
    fn condition_and_pod_checks() {
        let r = registry();
        let pod = json!({
            "metadata": {"name": "p"},
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert!(r.invoke("PodReady", &pod, &json!({})).passed);
        assert!(r.invoke("PodRunning", &pod, &json!({})).passed);
        assert!(r.invoke("ConditionTrue", &pod, &json!({"type": "Ready"})).passed);
        assert!(!r.invoke("ConditionTrue", &pod, &json!({"type": "Synced"})).passed);
    }

    #[test]
    fn workload_controller_checks() {
        let r = registry();
        let sts = json!({
            "metadata": {"name": "db"},
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2, "currentRevision": "a", "updateRevision": "b"}
        });
        assert!(!r.invoke("StatefulSetReady", &sts, &json!({})).passed);

        let ds = json!({
            "metadata": {"name": "agent"},
            "status": {"desiredNumberScheduled": 3, "numberReady": 3, "updatedNumberScheduled": 3}
        });
        assert!(r.invoke("DaemonSetReady", &ds, &json!({})).passed);

        let job = json!({"metadata": {"name": "j"}, "status": {"succeeded": 1}});
        assert!(r.invoke("JobSucceeded", &job, &json!({})).passed);
        let failed = json!({"metadata": {"name": "j"},
            "status": {"conditions": [{"type": "Failed", "status": "True"}]}});
        assert!(!r.invoke("JobSucceeded", &failed, &json!({})).passed);

        let d = deployment(3, 2, "True");
        assert!(!r.invoke("ReplicasReady", &d, &json!({})).passed);
        assert!(r.invoke("ReplicasReady", &d, &json!({"min": 2})).passed);
    }

    #[test]
    fn label_and_annotation_checks() {
        let r = registry();
        let d = deployment(1, 1, "True");
        assert!(r.invoke("LabelEquals", &d, &json!({"key": "app", "value": "web"})).passed);
        assert!(!r.invoke("LabelEquals", &d, &json!({"key": "app", "value": "db"})).passed);
        assert!(!r.invoke("AnnotationEquals", &d, &json!({"key": "x", "value": "y"})).passed);
    }

    #[test]
    fn extractors_produce_values() {
        let r = registry();
        let svc = json!({
            "kind": "Service",
            "metadata": {"name": "web", "namespace": "load"},
            "spec": {"clusterIP": "10.0.0.7", "ports": [
                {"name": "metrics", "port": 9090},
                {"name": "http", "port": 80}
            ]}
        });
        let first = r.invoke("ExtractServiceAddress", &svc, &json!({}));
        assert_eq!(first.value.as_deref(), Some("10.0.0.7:9090"));
        let named = r.invoke("ExtractServiceAddress", &svc, &json!({"port": "http", "scheme": "http"}));
        assert_eq!(named.value.as_deref(), Some("http://10.0.0.7:80"));

        let headless = json!({
            "kind": "Service",
            "metadata": {"name": "db", "namespace": "load"},
            "spec": {"clusterIP": "None", "ports": [{"port": 5432}]}
        });
        assert_eq!(
            r.invoke("ExtractServiceAddress", &headless, &json!({})).value.as_deref(),
            Some("db.load.svc:5432")
        );

        assert_eq!(r.invoke("ExtractName", &svc, &json!({})).value.as_deref(), Some("web"));
        assert_eq!(
            r.invoke("ExtractField", &svc, &json!({"path": "spec.ports[1].port"})).value.as_deref(),
            Some("80")
        );
        assert!(!r.invoke("ExtractField", &svc, &json!({"path": "spec.nope"})).passed);
    }

    #[test]
    fn service_extractor_rejects_other_kinds() {
        let r = registry();
        let res = r.invoke("ExtractServiceAddress", &deployment(1, 1, "True"), &json!({}));
        assert!(!res.passed);
    }
}
