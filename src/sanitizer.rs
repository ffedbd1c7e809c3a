//! Query/update sanitizer: the guard that scopes every filter to one queue and
//! rejects writes to reserved fields or store-operator injection through user
//! data.
//!
//! Grounded on `labtasker/server/db_utils.py`'s `sanitize_query`/`sanitize_update`/
//! `sanitize_dict`/`arg_match`/`keys_to_query_dict`, reimplemented over
//! `serde_json::Value` instead of Python dicts, and over the typed [`UpdatePatch`]
//! algebra (SPEC_FULL §9) rather than a raw Mongo-style mapping.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::QueueId;

pub const RESERVED_FIELDS: &[&str] = &["id", "queue_id", "created_at", "last_modified"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("field `{0}` is not allowed to be updated")]
    ReservedField(String),
    #[error("store operators are not allowed in field names: {0}")]
    OperatorInjection(String),
    #[error("field names starting with `.` are not allowed: {0}")]
    DotPrefixedField(String),
    #[error("filter queue_id does not match the resolved queue")]
    QueueIdMismatch,
    #[error("key list must not be empty")]
    EmptyKeys,
}

/// A set of dotted-path leaf assignments, the algebraic replacement for a raw
/// `$set` mapping (SPEC_FULL §9). Built by [`flatten`] from a nested JSON value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePatch {
    pub sets: Vec<(String, Value)>,
}

impl UpdatePatch {
    pub fn into_pairs(self) -> Vec<(String, Value)> {
        self.sets
    }
}

/// Recursively rejects any key in `value` (at any nesting depth) that matches an
/// entry in `banned_fields`. Mirrors `sanitize_update`.
pub fn sanitize_update(value: &Value, banned_fields: &[&str]) -> Result<(), SanitizeError> {
    let Value::Object(map) = value else {
        return Ok(());
    };
    for (k, v) in map {
        if banned_fields.contains(&k.as_str()) {
            return Err(SanitizeError::ReservedField(k.clone()));
        }
        sanitize_update(v, banned_fields)?;
    }
    Ok(())
}

/// Recursively rejects keys beginning with `$` or `.`, at any nesting depth.
/// Mirrors `sanitize_dict`.
pub fn sanitize_dict(value: &Value) -> Result<(), SanitizeError> {
    let Value::Object(map) = value else {
        return Ok(());
    };
    for (k, v) in map {
        if k.starts_with('$') {
            return Err(SanitizeError::OperatorInjection(k.clone()));
        }
        if k.starts_with('.') {
            return Err(SanitizeError::DotPrefixedField(k.clone()));
        }
        sanitize_dict(v)?;
    }
    Ok(())
}

/// Enforces that a caller-supplied filter does not name a contradicting
/// `queue_id`. Scoping itself (`AND queue_id = ?`) is applied by the store layer;
/// this only checks for contradiction, mirroring `sanitize_query`.
pub fn sanitize_query(queue_id: QueueId, filter: &Value) -> Result<(), SanitizeError> {
    if let Value::Object(map) = filter {
        if let Some(given) = map.get("queue_id") {
            let matches = given.as_str().map(|s| s == queue_id.to_string()).unwrap_or(false);
            if !matches {
                return Err(SanitizeError::QueueIdMismatch);
            }
        }
    }
    Ok(())
}

/// Flattens a nested JSON object into dotted-path leaf assignments, e.g.
/// `{"a": {"b": 1}}` with `parent = "summary"` becomes `[("summary.a.b", 1)]`.
/// Non-object values (including empty objects) are leaves.
pub fn flatten(value: &Value, parent: &str) -> UpdatePatch {
    let mut sets = Vec::new();
    flatten_into(value, parent, &mut sets);
    UpdatePatch { sets }
}

fn flatten_into(value: &Value, parent: &str, sets: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if parent.is_empty() { k.clone() } else { format!("{parent}.{k}") };
                flatten_into(v, &path, sets);
            }
        }
        other => sets.push((parent.to_string(), other.clone())),
    }
}

/// Recursively asserts structural equality of key sets at each nesting level
/// ("no more, no less"). `required == Value::Null` matches any subtree of
/// `provided`. Mirrors `arg_match`.
pub fn arg_match(required: &Value, provided: &Value) -> bool {
    if required.is_null() {
        return true;
    }
    if provided.is_null() {
        return false;
    }
    let (Value::Object(req), Value::Object(prov)) = (required, provided) else {
        return false;
    };
    let req_keys: std::collections::BTreeSet<_> = req.keys().collect();
    let prov_keys: std::collections::BTreeSet<_> = prov.keys().collect();
    if req_keys != prov_keys {
        return false;
    }
    req.iter().all(|(k, v)| arg_match(v, &prov[k]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysMode {
    Deepest,
    Topmost,
}

/// Converts a list of dot-separated key paths into a nested tree (leaf = `null`),
/// per `mode`. Mirrors `keys_to_query_dict`.
pub fn keys_to_query_dict(keys: &[String], mode: KeysMode) -> Result<Value, SanitizeError> {
    if keys.is_empty() {
        return Err(SanitizeError::EmptyKeys);
    }

    #[derive(Debug)]
    enum Node {
        Leaf,
        Branch(BTreeMap<String, Node>),
    }

    fn prefix_is_leaf(root: &BTreeMap<String, Node>, parts: &[&str]) -> bool {
        let mut current = root;
        for part in parts {
            match current.get(*part) {
                Some(Node::Leaf) => return true,
                Some(Node::Branch(next)) => current = next,
                None => return false,
            }
        }
        false
    }

    fn to_value(node: Node) -> Value {
        match node {
            Node::Leaf => Value::Null,
            Node::Branch(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, to_value(v))).collect())
            }
        }
    }

    let mut unique: Vec<&String> = keys.iter().collect();
    unique.sort_by_key(|k| k.len());
    unique.dedup();

    let mut root: BTreeMap<String, Node> = BTreeMap::new();

    'keys: for key in unique {
        let parts: Vec<&str> = key.split('.').collect();

        if mode == KeysMode::Topmost {
            // Skip this key entirely if any strict prefix is already a leaf —
            // a shorter path recorded earlier shadows it.
            for i in 1..parts.len() {
                if prefix_is_leaf(&root, &parts[..i]) {
                    continue 'keys;
                }
            }
        }

        let mut current = &mut root;
        for (i, part) in parts.iter().enumerate() {
            let is_last = i == parts.len() - 1;
            if is_last {
                let extend_past_leaf = matches!(current.get(*part), Some(Node::Branch(_)));
                if !extend_past_leaf {
                    current.insert(part.to_string(), Node::Leaf);
                }
            } else {
                let entry = current.entry(part.to_string()).or_insert_with(|| Node::Branch(BTreeMap::new()));
                if matches!(entry, Node::Leaf) {
                    if mode == KeysMode::Deepest {
                        *entry = Node::Branch(BTreeMap::new());
                    } else {
                        // topmost already filtered this case above; unreachable in practice.
                        continue 'keys;
                    }
                }
                match entry {
                    Node::Branch(next) => current = next,
                    Node::Leaf => unreachable!(),
                }
            }
        }
    }

    Ok(to_value(Node::Branch(root)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_update_rejects_reserved_field_at_top_level() {
        let err = sanitize_update(&json!({"queue_id": "x"}), RESERVED_FIELDS).unwrap_err();
        assert_eq!(err, SanitizeError::ReservedField("queue_id".into()));
    }

    #[test]
    fn sanitize_update_rejects_reserved_field_nested() {
        let err = sanitize_update(&json!({"summary": {"created_at": "x"}}), RESERVED_FIELDS).unwrap_err();
        assert_eq!(err, SanitizeError::ReservedField("created_at".into()));
    }

    #[test]
    fn sanitize_update_allows_non_reserved_fields() {
        assert!(sanitize_update(&json!({"summary": {"progress": 0.5}}), RESERVED_FIELDS).is_ok());
    }

    #[test]
    fn sanitize_dict_rejects_dollar_prefixed_keys() {
        let err = sanitize_dict(&json!({"$where": "1=1"})).unwrap_err();
        assert_eq!(err, SanitizeError::OperatorInjection("$where".into()));
    }

    #[test]
    fn sanitize_dict_rejects_dot_prefixed_keys() {
        let err = sanitize_dict(&json!({".hidden": 1})).unwrap_err();
        assert_eq!(err, SanitizeError::DotPrefixedField(".hidden".into()));
    }

    #[test]
    fn flatten_produces_dotted_paths() {
        let patch = flatten(&json!({"a": {"b": 1, "c": {"d": 2}}}), "summary");
        let mut sets = patch.sets;
        sets.sort();
        assert_eq!(
            sets,
            vec![
                ("summary.a.b".to_string(), json!(1)),
                ("summary.a.c.d".to_string(), json!(2)),
            ]
        );
    }

    #[test]
    fn flatten_without_parent_key() {
        let patch = flatten(&json!({"x": 1}), "");
        assert_eq!(patch.sets, vec![("x".to_string(), json!(1))]);
    }

    #[test]
    fn arg_match_none_in_required_matches_anything() {
        assert!(arg_match(&Value::Null, &json!({"anything": 1})));
    }

    #[test]
    fn arg_match_requires_exact_key_sets_at_every_level() {
        let required = json!({"name": null});
        let provided = json!({"name": "x", "lr": 0.1});
        // required has one key, provided has two -> key sets differ -> false
        assert!(!arg_match(&required, &provided));
    }

    #[test]
    fn arg_match_scenario_from_spec() {
        // required names exactly the keys present in this subtree -> true; a
        // required key absent from the subtree -> false ("no more, no less").
        let provided = json!({"name": "x"});
        assert!(arg_match(&json!({"name": null}), &provided));
        assert!(!arg_match(&json!({"size": null}), &provided));
    }

    #[test]
    fn arg_match_fails_when_provided_missing() {
        assert!(!arg_match(&json!({"a": null}), &Value::Null));
    }

    #[test]
    fn keys_to_query_dict_rejects_empty() {
        assert!(keys_to_query_dict(&[], KeysMode::Deepest).is_err());
    }

    #[test]
    fn keys_to_query_dict_deepest_expands_every_leaf() {
        let keys = vec!["a.b".to_string(), "a.c".to_string()];
        let tree = keys_to_query_dict(&keys, KeysMode::Deepest).unwrap();
        assert_eq!(tree, json!({"a": {"b": null, "c": null}}));
    }

    #[test]
    fn keys_to_query_dict_topmost_shadows_longer_paths() {
        let keys = vec!["a".to_string(), "a.b".to_string()];
        let tree = keys_to_query_dict(&keys, KeysMode::Topmost).unwrap();
        assert_eq!(tree, json!({"a": null}));
    }

    #[test]
    fn keys_to_query_dict_topmost_keeps_unrelated_paths_separate() {
        let keys = vec!["a.b".to_string(), "c.d".to_string()];
        let tree = keys_to_query_dict(&keys, KeysMode::Topmost).unwrap();
        assert_eq!(tree, json!({"a": {"b": null}, "c": {"d": null}}));
    }
}
