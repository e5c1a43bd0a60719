//! Lossless configuration maps and the job-agent config merge
//!
//! Agent configuration is schemaless: whatever keys an executor
//! understands (including `template` blocks) must survive decode,
//! merge, and re-encode byte-for-byte under JSON semantics.

use serde_json::{Map, Value};

/// Schemaless configuration map. Unknown keys always round-trip.
pub type ConfigMap = Map<String, Value>;

/// Deep-merge `overlay` into `base`.
///
/// Maps merge recursively; scalars and arrays replace wholesale. Keys
/// present only in `overlay` are inserted as-is.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Effective job-agent config for a job: the three-way merge of the
/// agent's base config, the deployment's override, and the version's
/// override, later layers winning per key at every depth.
pub fn merge_job_agent_config(
    agent: &ConfigMap,
    deployment: &ConfigMap,
    version: &ConfigMap,
) -> ConfigMap {
    let mut merged = Value::Object(agent.clone());
    deep_merge(&mut merged, &Value::Object(deployment.clone()));
    deep_merge(&mut merged, &Value::Object(version.clone()));
    match merged {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> ConfigMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_merge_later_layer_wins() {
        let agent = as_map(json!({"image": "agent:1", "timeout": 30}));
        let deployment = as_map(json!({"timeout": 60}));
        let version = as_map(json!({"image": "agent:2"}));

        let merged = merge_job_agent_config(&agent, &deployment, &version);
        assert_eq!(merged["image"], json!("agent:2"));
        assert_eq!(merged["timeout"], json!(60));
    }

    #[test]
    fn test_merge_nested_maps_merge_recursively() {
        let agent = as_map(json!({"env": {"A": "1", "B": "2"}}));
        let deployment = as_map(json!({"env": {"B": "3", "C": "4"}}));
        let version = as_map(json!({}));

        let merged = merge_job_agent_config(&agent, &deployment, &version);
        assert_eq!(merged["env"], json!({"A": "1", "B": "3", "C": "4"}));
    }

    #[test]
    fn test_merge_arrays_replace_wholesale() {
        let agent = as_map(json!({"args": ["a", "b"]}));
        let deployment = as_map(json!({"args": ["c"]}));
        let version = as_map(json!({}));

        let merged = merge_job_agent_config(&agent, &deployment, &version);
        assert_eq!(merged["args"], json!(["c"]));
    }

    #[test]
    fn test_merge_preserves_template_keys() {
        let agent = as_map(json!({}));
        let deployment = as_map(json!({
            "template": {"spec": {"containers": [{"name": "main", "image": "{{ .version }}"}]}}
        }));
        let version = as_map(json!({}));

        let merged = merge_job_agent_config(&agent, &deployment, &version);
        assert_eq!(
            merged["template"],
            json!({"spec": {"containers": [{"name": "main", "image": "{{ .version }}"}]}})
        );
    }

    #[test]
    fn test_merge_contains_every_key_from_every_layer() {
        let agent = as_map(json!({"a": 1}));
        let deployment = as_map(json!({"b": 2}));
        let version = as_map(json!({"c": 3}));

        let merged = merge_job_agent_config(&agent, &deployment, &version);
        for key in ["a", "b", "c"] {
            assert!(merged.contains_key(key), "missing key {key}");
        }
    }
}
