//! API types for the package operator: the cluster-facing custom resources
//! (ObjectDeployment, ObjectSet, ObjectSlice and their cluster-scoped
//! variants) and the package manifest file formats.

#![forbid(unsafe_code)]

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod manifests;
pub mod v1alpha1;

pub use v1alpha1::*;

/// Status condition following the Kubernetes API conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Build a condition stamped with the current time.
pub fn new_condition(cond_type: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        r#type: cond_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        observed_generation: None,
    }
}

/// Set or update a condition, preserving lastTransitionTime when the status
/// did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
    } else {
        conditions.push(new);
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], cond_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == cond_type)
}

pub fn condition_is_true(conditions: &[Condition], cond_type: &str) -> bool {
    find_condition(conditions, cond_type)
        .map(|c| c.status == pko_core::CONDITION_TRUE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::{CONDITION_FALSE, CONDITION_TRUE};

    #[test]
    fn set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = vec![Condition {
            r#type: "Available".into(),
            status: CONDITION_TRUE.into(),
            last_transition_time: Some("2024-01-01T00:00:00Z".into()),
            reason: Some("First".into()),
            message: Some("first".into()),
            observed_generation: None,
        }];
        set_condition(&mut conditions, new_condition("Available", CONDITION_TRUE, "Second", "second"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(conditions[0].reason.as_deref(), Some("Second"));
    }

    #[test]
    fn set_condition_replaces_on_status_change() {
        let mut conditions = vec![Condition {
            r#type: "Available".into(),
            status: CONDITION_FALSE.into(),
            last_transition_time: Some("2024-01-01T00:00:00Z".into()),
            reason: None,
            message: None,
            observed_generation: None,
        }];
        set_condition(&mut conditions, new_condition("Available", CONDITION_TRUE, "Up", "up"));
        assert_ne!(conditions[0].last_transition_time.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert!(condition_is_true(&conditions, "Available"));
    }
}
