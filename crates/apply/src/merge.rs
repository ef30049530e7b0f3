//! Strategic merge of a desired definition onto a live object.

use kubemod_core::FieldChange;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Discriminator keys tried, in order, when merging lists of mappings.
const LIST_KEYS: [&str; 2] = ["name", "type"];

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    /// `true` when merging changes nothing.
    pub matches: bool,
    /// Field changes in pre-order of the merged body.
    pub changes: Vec<FieldChange>,
    pub merged: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn from_changes(changes: &[FieldChange]) -> Self {
        let mut s = DiffSummary::default();
        for c in changes {
            match (&c.old, &c.new) {
                (None, Some(_)) => s.adds += 1,
                (Some(_), None) => s.removes += 1,
                _ => s.updates += 1,
            }
        }
        s
    }
}

/// Merge `desired` onto `existing`.
///
/// Mappings merge key by key and keep keys absent from `desired`. Lists of
/// mappings whose elements all carry `name` (or else all carry `type`) merge
/// element-wise on that key: matched elements merge, unmatched existing ones
/// stay, new ones are appended. Any other list, and every list when `force`
/// is set, is replaced by the desired one. Scalars are overwritten.
pub fn merge(existing: &Json, desired: &Json, force: bool) -> DiffResult {
    let merged = merge_value(existing, desired, force);
    let mut changes = Vec::new();
    collect_changes(String::new(), Some(existing), &merged, &mut changes);
    DiffResult { matches: &merged == existing, changes, merged }
}

fn merge_value(existing: &Json, desired: &Json, force: bool) -> Json {
    match (existing, desired) {
        (Json::Object(e), Json::Object(d)) => {
            let mut out = e.clone();
            for (k, dv) in d {
                let v = match e.get(k) {
                    Some(ev) => merge_value(ev, dv, force),
                    None => dv.clone(),
                };
                out.insert(k.clone(), v);
            }
            Json::Object(out)
        }
        (Json::Array(e), Json::Array(d)) if !force => match list_key(e, d) {
            Some(key) => Json::Array(merge_keyed(e, d, key, force)),
            None => desired.clone(),
        },
        _ => desired.clone(),
    }
}

fn list_key(existing: &[Json], desired: &[Json]) -> Option<&'static str> {
    if desired.is_empty() {
        return None;
    }
    LIST_KEYS.into_iter().find(|key| {
        existing.iter().chain(desired.iter()).all(|v| v.as_object().map(|o| o.contains_key(*key)).unwrap_or(false))
    })
}

fn merge_keyed(existing: &[Json], desired: &[Json], key: &str, force: bool) -> Vec<Json> {
    let mut out = Vec::with_capacity(existing.len() + desired.len());
    for ev in existing {
        match desired.iter().find(|dv| dv.get(key) == ev.get(key)) {
            Some(dv) => out.push(merge_value(ev, dv, force)),
            None => out.push(ev.clone()),
        }
    }
    for dv in desired {
        if !existing.iter().any(|ev| ev.get(key) == dv.get(key)) {
            out.push(dv.clone());
        }
    }
    out
}

fn escape_token(k: &str) -> String {
    k.replace('~', "~0").replace('/', "~1")
}

fn collect_changes(path: String, old: Option<&Json>, new: &Json, out: &mut Vec<FieldChange>) {
    match (old, new) {
        (Some(o), n) if o == n => {}
        (Some(Json::Object(o)), Json::Object(n)) => {
            for (k, nv) in n {
                collect_changes(format!("{}/{}", path, escape_token(k)), o.get(k), nv, out);
            }
            removed_keys(&path, o, n, out);
        }
        (Some(Json::Array(o)), Json::Array(n)) => {
            for (i, nv) in n.iter().enumerate() {
                collect_changes(format!("{}/{}", path, i), o.get(i), nv, out);
            }
            for (i, ov) in o.iter().enumerate().skip(n.len()) {
                out.push(FieldChange { path: format!("{}/{}", path, i), old: Some(ov.clone()), new: None });
            }
        }
        _ => out.push(FieldChange { path, old: old.cloned(), new: Some(new.clone()) }),
    }
}

// Merging never drops keys, but a replaced list element may have.
fn removed_keys(path: &str, old: &Map<String, Json>, new: &Map<String, Json>, out: &mut Vec<FieldChange>) {
    for (k, ov) in old {
        if !new.contains_key(k) {
            out.push(FieldChange { path: format!("{}/{}", path, escape_token(k)), old: Some(ov.clone()), new: None });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyed_list_merge_preserves_updates_and_appends() {
        let existing = json!({"spec": {"containers": [
            {"name": "app", "image": "app:1"},
            {"name": "sidecar", "image": "proxy:1"}
        ]}});
        let desired = json!({"spec": {"containers": [
            {"name": "app", "image": "app:2"},
            {"name": "metrics", "image": "exporter:1"}
        ]}});
        let r = merge(&existing, &desired, false);
        assert!(!r.matches);
        assert_eq!(
            r.merged["spec"]["containers"],
            json!([
                {"name": "app", "image": "app:2"},
                {"name": "sidecar", "image": "proxy:1"},
                {"name": "metrics", "image": "exporter:1"}
            ])
        );
        let paths: Vec<_> = r.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["/spec/containers/0/image", "/spec/containers/2"]);
    }

    #[test]
    fn type_key_used_when_name_missing() {
        let existing = json!({"conds": [{"type": "A", "v": 1}, {"type": "B", "v": 1}]});
        let desired = json!({"conds": [{"type": "B", "v": 2}]});
        let r = merge(&existing, &desired, false);
        assert_eq!(r.merged["conds"], json!([{"type": "A", "v": 1}, {"type": "B", "v": 2}]));
    }

    #[test]
    fn force_replaces_lists_but_merges_maps() {
        let existing = json!({"metadata": {"labels": {"a": "1"}}, "items": [{"name": "x"}, {"name": "y"}]});
        let desired = json!({"metadata": {"labels": {"b": "2"}}, "items": [{"name": "y"}]});
        let r = merge(&existing, &desired, true);
        assert_eq!(r.merged["items"], json!([{"name": "y"}]));
        assert_eq!(r.merged["metadata"]["labels"], json!({"a": "1", "b": "2"}));
        let summary = DiffSummary::from_changes(&r.changes);
        assert_eq!(summary, DiffSummary { adds: 1, updates: 1, removes: 1 });
    }

    #[test]
    fn unkeyed_lists_are_replaced() {
        let existing = json!({"args": ["a", "b"], "mixed": [{"name": "x"}, {"other": 1}]});
        let desired = json!({"args": ["c"], "mixed": [{"name": "z"}]});
        let r = merge(&existing, &desired, false);
        assert_eq!(r.merged["args"], json!(["c"]));
        assert_eq!(r.merged["mixed"], json!([{"name": "z"}]));
    }

    #[test]
    fn subset_of_live_state_matches() {
        let existing = json!({"spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "app", "image": "a", "ports": [80]}]}}}});
        let desired = json!({"spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "app", "image": "a"}]}}}});
        let r = merge(&existing, &desired, false);
        assert!(r.matches);
        assert!(r.changes.is_empty());
    }

    #[test]
    fn empty_desired_list_clears() {
        let r = merge(&json!({"l": [{"name": "a"}]}), &json!({"l": []}), false);
        assert_eq!(r.merged["l"], json!([]));
        assert_eq!(r.changes[0].path, "/l/0");
        assert_eq!(r.changes[0].new, None);
    }

    #[test]
    fn paths_escape_pointer_tokens() {
        let r = merge(&json!({"metadata": {}}), &json!({"metadata": {"annotations": {"a/b~c": "1"}}}), false);
        assert_eq!(r.changes[0].path, "/metadata/annotations");
        let r = merge(&json!({"a": {"x/y": 1}}), &json!({"a": {"x/y": 2}}), false);
        assert_eq!(r.changes[0].path, "/a/x~1y");
    }
}
