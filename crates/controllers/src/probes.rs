//! Availability probe evaluation. A phase is Available iff every selected
//! object passes every probe of every matching selector.

use regex::Regex;
use serde_json::Value;

use pko_apis::v1alpha1::{CelProbe, ObjectSetProbe, Probe, ProbeSelector};
use pko_core::object;

/// Outcome of one probe against one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub passed: bool,
    pub message: String,
}

impl ProbeResult {
    fn pass() -> Self {
        Self { passed: true, message: String::new() }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self { passed: false, message: message.into() }
    }
}

/// Does this selector pick the object?
pub fn selector_matches(selector: &ProbeSelector, obj: &Value) -> bool {
    let Ok(gvk) = object::gvk_of(obj) else { return false };
    if gvk.kind != selector.kind.kind || gvk.group != selector.kind.group {
        return false;
    }
    if let Some(name_sel) = &selector.name {
        let name = object::name_of(obj).unwrap_or("");
        let anchored = format!("^(?:{})$", name_sel.pattern);
        match Regex::new(&anchored) {
            Ok(re) => re.is_match(name),
            // an unparseable pattern selects nothing
            Err(_) => return false,
        }
    } else {
        true
    }
}

/// Evaluate a single probe primitive.
pub fn evaluate(probe: &Probe, obj: &Value) -> ProbeResult {
    match probe {
        Probe::Condition(c) => {
            match object::condition_status(obj, &c.r#type) {
                Some(status) if status == c.status => ProbeResult::pass(),
                Some(status) => ProbeResult::fail(format!(
                    "condition {} is {status}, expected {}",
                    c.r#type, c.status
                )),
                None => ProbeResult::fail(format!("condition {} not reported", c.r#type)),
            }
        }
        Probe::FieldsEqual(f) => {
            let a = object::path_value(obj, &f.field_a);
            let b = object::path_value(obj, &f.field_b);
            match (a, b) {
                (Some(a), Some(b)) if a == b => ProbeResult::pass(),
                (Some(a), Some(b)) => {
                    ProbeResult::fail(format!("{} ({a}) != {} ({b})", f.field_a, f.field_b))
                }
                _ => ProbeResult::fail(format!(
                    "field {} or {} not present",
                    f.field_a, f.field_b
                )),
            }
        }
        Probe::JsonPath(p) => match object::path_value(obj, &p.path) {
            Some(v) if *v == p.value => ProbeResult::pass(),
            Some(v) => ProbeResult::fail(format!("{} is {v}, expected {}", p.path, p.value)),
            None => ProbeResult::fail(format!("{} not present", p.path)),
        },
        Probe::Cel(c) => evaluate_cel(c, obj),
    }
}

/// `self.<path> == <literal>` — the only rule shape supported.
fn evaluate_cel(probe: &CelProbe, obj: &Value) -> ProbeResult {
    let fail = |detail: String| match &probe.message {
        Some(m) => ProbeResult::fail(m.clone()),
        None => ProbeResult::fail(detail),
    };
    let Some((lhs, rhs)) = probe.rule.split_once("==") else {
        return fail(format!("rule {:?} is not an equality", probe.rule));
    };
    let lhs = lhs.trim();
    let rhs = rhs.trim();
    let Some(path) = lhs.strip_prefix("self.") else {
        return fail(format!("rule {:?} must dereference self", probe.rule));
    };
    let expected: Value = match serde_json::from_str(rhs) {
        Ok(v) => v,
        Err(_) => Value::String(rhs.trim_matches('\'').to_string()),
    };
    match object::path_value(obj, path) {
        Some(actual) if *actual == expected => ProbeResult::pass(),
        Some(actual) => fail(format!("self.{path} is {actual}, expected {expected}")),
        None => fail(format!("self.{path} not present")),
    }
}

/// Evaluate every probe set against every object of a phase. Returns
/// overall availability and the failure messages.
pub fn phase_available(probes: &[ObjectSetProbe], objects: &[&Value]) -> (bool, Vec<String>) {
    let mut failures = Vec::new();
    for probe_set in probes {
        for obj in objects {
            if !selector_matches(&probe_set.selector, obj) {
                continue;
            }
            for probe in &probe_set.probes {
                let result = evaluate(probe, obj);
                if !result.passed {
                    let key = object::key_of(obj)
                        .map(|k| k.to_string())
                        .unwrap_or_else(|_| "<unknown>".into());
                    failures.push(format!("{key}: {}", result.message));
                }
            }
        }
    }
    (failures.is_empty(), failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_apis::v1alpha1::{
        ConditionProbe, FieldsEqualProbe, JsonPathProbe, KindSelector, NameSelector,
    };
    use serde_json::json;

    fn deployment(available: &str, updated: i64, replicas: i64) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns"},
            "status": {
                "updatedReplicas": updated,
                "replicas": replicas,
                "conditions": [{"type": "Available", "status": available}]
            }
        })
    }

    fn selector(kind: &str, group: &str) -> ProbeSelector {
        ProbeSelector {
            kind: KindSelector { group: group.into(), kind: kind.into() },
            name: None,
        }
    }

    #[test]
    fn condition_probe() {
        let obj = deployment("True", 1, 1);
        let probe = Probe::Condition(ConditionProbe { r#type: "Available".into(), status: "True".into() });
        assert!(evaluate(&probe, &obj).passed);
        let obj = deployment("False", 1, 1);
        let r = evaluate(&probe, &obj);
        assert!(!r.passed);
        assert!(r.message.contains("Available"));
    }

    #[test]
    fn fields_equal_probe() {
        let probe = Probe::FieldsEqual(FieldsEqualProbe {
            field_a: "status.updatedReplicas".into(),
            field_b: "status.replicas".into(),
        });
        assert!(evaluate(&probe, &deployment("True", 2, 2)).passed);
        assert!(!evaluate(&probe, &deployment("True", 1, 2)).passed);
    }

    #[test]
    fn json_path_probe() {
        let probe = Probe::JsonPath(JsonPathProbe {
            path: "status.replicas".into(),
            value: json!(2),
        });
        assert!(evaluate(&probe, &deployment("True", 2, 2)).passed);
        assert!(!evaluate(&probe, &deployment("True", 1, 1)).passed);
    }

    #[test]
    fn cel_probe_shapes() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "status": {"phase": "Running", "ready": true}
        });
        let ok = Probe::Cel(CelProbe { rule: r#"self.status.phase == "Running""#.into(), message: None });
        assert!(evaluate(&ok, &obj).passed);
        let boolean = Probe::Cel(CelProbe { rule: "self.status.ready == true".into(), message: None });
        assert!(evaluate(&boolean, &obj).passed);
        let failing = Probe::Cel(CelProbe {
            rule: r#"self.status.phase == "Pending""#.into(),
            message: Some("pod is not pending".into()),
        });
        let r = evaluate(&failing, &obj);
        assert!(!r.passed);
        assert_eq!(r.message, "pod is not pending");
    }

    #[test]
    fn selector_by_kind_and_name_pattern() {
        let obj = deployment("True", 1, 1);
        assert!(selector_matches(&selector("Deployment", "apps"), &obj));
        assert!(!selector_matches(&selector("StatefulSet", "apps"), &obj));
        assert!(!selector_matches(&selector("Deployment", ""), &obj));

        let mut with_name = selector("Deployment", "apps");
        with_name.name = Some(NameSelector { pattern: "we.*".into() });
        assert!(selector_matches(&with_name, &obj));
        with_name.name = Some(NameSelector { pattern: "db-.*".into() });
        assert!(!selector_matches(&with_name, &obj));
    }

    #[test]
    fn phase_availability_needs_every_probe_on_every_selected_object() {
        let probes = vec![ObjectSetProbe {
            selector: selector("Deployment", "apps"),
            probes: vec![Probe::Condition(ConditionProbe {
                r#type: "Available".into(),
                status: "True".into(),
            })],
        }];
        let good = deployment("True", 1, 1);
        let bad = deployment("False", 1, 1);
        let unrelated = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}});

        let (ok, failures) = phase_available(&probes, &[&good, &unrelated]);
        assert!(ok, "failures: {failures:?}");

        let (ok, failures) = phase_available(&probes, &[&good, &bad]);
        assert!(!ok);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("Deployment.apps ns/web"));
    }
}
