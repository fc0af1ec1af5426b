//! Drift detection: compare what Refresh reports against stored state.

use crate::core::state::ResourceState;
use crate::core::types::ResourceType;
use crate::plugins::{Outputs, RefreshResult};
use crate::tripwire::hasher;
use std::collections::BTreeSet;

/// A single drift finding.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub expected_hash: String,
    pub actual_hash: String,
    /// Output names that were added, removed or changed
    pub changed_outputs: Vec<String>,
    pub detail: String,
}

/// Fingerprint of outputs and module state together.
pub fn fingerprint(outputs: &Outputs, module_state: &[u8]) -> String {
    let values: Vec<(&String, &serde_json::Value)> =
        outputs.iter().map(|(k, v)| (k, &v.value)).collect();
    hasher::composite_hash(&[
        &hasher::hash_json(&values),
        &hasher::hash_bytes(module_state),
    ])
}

fn changed_outputs(stored: &Outputs, live: &Outputs) -> Vec<String> {
    let keys: BTreeSet<&String> = stored.keys().chain(live.keys()).collect();
    keys.into_iter()
        .filter(|k| stored.get(*k).map(|o| &o.value) != live.get(*k).map(|o| &o.value))
        .cloned()
        .collect()
}

/// Compare one resource's stored state with a fresh Refresh result.
pub fn check_resource(stored: &ResourceState, live: &RefreshResult) -> Option<DriftFinding> {
    let stored_blob = stored.module_state.as_deref().unwrap_or_default();
    let expected = fingerprint(&stored.outputs, stored_blob);
    let actual = fingerprint(&live.outputs, &live.state);
    if expected == actual {
        return None;
    }

    let changed = changed_outputs(&stored.outputs, &live.outputs);
    let detail = if changed.is_empty() {
        "module state changed".to_string()
    } else {
        format!("outputs changed: {}", changed.join(", "))
    };
    Some(DriftFinding {
        resource_id: stored.id.clone(),
        resource_type: stored.resource_type,
        expected_hash: expected,
        actual_hash: actual,
        changed_outputs: changed,
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ResourceStatus;
    use crate::plugins::OutputValue;
    use serde_json::json;

    fn outputs(pairs: &[(&str, serde_json::Value)]) -> Outputs {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    OutputValue {
                        value: v.clone(),
                        sensitive: false,
                    },
                )
            })
            .collect()
    }

    fn stored(outs: Outputs, blob: &[u8]) -> ResourceState {
        ResourceState {
            id: "app/database/main".to_string(),
            name: "main".to_string(),
            resource_type: ResourceType::Database,
            component: "app".to_string(),
            status: ResourceStatus::Ready,
            status_reason: None,
            inputs: Default::default(),
            outputs: outs,
            module_state: Some(blob.to_vec()),
            inputs_hash: None,
            depends_on: Vec::new(),
            plugin: Some("native".to_string()),
            module: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_drift_none_when_identical() {
        let outs = outputs(&[("url", json!("db://a"))]);
        let state = stored(outs.clone(), b"v1");
        let live = RefreshResult {
            outputs: outs,
            state: b"v1".to_vec(),
        };
        assert!(check_resource(&state, &live).is_none());
    }

    #[test]
    fn test_drift_changed_output() {
        let state = stored(outputs(&[("url", json!("db://a")), ("port", json!(5432))]), b"v1");
        let live = RefreshResult {
            outputs: outputs(&[("url", json!("db://b")), ("port", json!(5432))]),
            state: b"v1".to_vec(),
        };
        let finding = check_resource(&state, &live).unwrap();
        assert_eq!(finding.resource_id, "app/database/main");
        assert_eq!(finding.changed_outputs, vec!["url"]);
        assert_eq!(finding.detail, "outputs changed: url");
        assert_ne!(finding.expected_hash, finding.actual_hash);
    }

    #[test]
    fn test_drift_removed_output_and_state_only() {
        let state = stored(outputs(&[("url", json!("x")), ("gone", json!(1))]), b"v1");
        let live = RefreshResult {
            outputs: outputs(&[("url", json!("x"))]),
            state: b"v1".to_vec(),
        };
        assert_eq!(check_resource(&state, &live).unwrap().changed_outputs, vec!["gone"]);

        let state = stored(outputs(&[("url", json!("x"))]), b"v1");
        let live = RefreshResult {
            outputs: outputs(&[("url", json!("x"))]),
            state: b"v2".to_vec(),
        };
        let finding = check_resource(&state, &live).unwrap();
        assert!(finding.changed_outputs.is_empty());
        assert_eq!(finding.detail, "module state changed");
    }

    #[test]
    fn test_drift_sensitivity_flag_is_not_drift() {
        let mut outs = outputs(&[("password", json!("pw"))]);
        let state = stored(outs.clone(), b"v1");
        outs["password"].sensitive = true;
        let live = RefreshResult {
            outputs: outs,
            state: b"v1".to_vec(),
        };
        assert!(check_resource(&state, &live).is_none());
    }
}
