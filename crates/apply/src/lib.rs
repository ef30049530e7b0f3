//! kubemod apply: reconcile a resource definition to `present` or `absent`.
//!
//! `present` creates missing objects and otherwise merges the desired definition
//! onto the live object; nothing is sent when the merge is a no-op.

#![forbid(unsafe_code)]

use std::time::Duration;

use kubemod_core::{generate_hash, poll_until, ClientError, ConditionMatch, Error, Report, ResourceDefinition, ResourceId, Result};
use kubemod_kubehub::{ClusterClient, PatchBody};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

pub mod merge;

pub use merge::{merge, DiffResult, DiffSummary};

fn max_yaml_bytes() -> usize {
    std::env::var("KUBEMOD_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KUBEMOD_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Present,
    Absent,
}

/// Optional post-apply wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    /// Condition to wait for; without one, waits for existence (or deletion).
    pub condition: Option<ConditionMatch>,
    pub sleep: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOptions {
    pub state: State,
    /// Replace the whole object instead of patching; lists are not merged.
    pub force: bool,
    pub check_mode: bool,
    /// Append the content hash to ConfigMap/Secret names.
    pub append_hash: bool,
    pub wait: Option<WaitSpec>,
}

/// Parse one YAML/JSON document into a validated definition.
pub fn parse_definition(yaml: &str, ns_override: Option<&str>) -> Result<ResourceDefinition> {
    if yaml.len() > max_yaml_bytes() {
        return Err(Error::InvalidDefinition(format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| Error::InvalidDefinition(format!("parsing YAML: {}", e)))?;
    let json = serde_json::to_value(val)?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(Error::InvalidDefinition(format!("YAML document too complex (>{} nodes)", max_yaml_nodes())));
    }
    let def = ResourceDefinition::from_json(json)?;
    Ok(match ns_override {
        Some(ns) => def.with_namespace(ns),
        None => def,
    })
}

/// Drop server-populated fields before comparing against a desired definition.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn with_resource_version(mut body: Json, live: &Json) -> Json {
    if let (Some(rv), Some(meta)) = (live.pointer("/metadata/resourceVersion").cloned(), body.pointer_mut("/metadata").and_then(|m| m.as_object_mut())) {
        meta.insert("resourceVersion".into(), rv);
    }
    body
}

/// Reconcile `def` against the cluster.
pub async fn apply<C>(client: &C, def: ResourceDefinition, opts: &ApplyOptions) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);

    let def = if opts.append_hash {
        let hash = generate_hash(def.as_json())?;
        let name = format!("{}-{}", def.id().name, hash);
        def.with_name(&name)
    } else {
        def
    };
    let id = def.id().clone();
    info!(target_id = %id, state = ?opts.state, force = opts.force, check_mode = opts.check_mode, "apply start");

    let mut report = match opts.state {
        State::Present => ensure_present(client, &id, def.into_json(), opts).await?,
        State::Absent => ensure_absent(client, &id, opts).await?,
    };

    if report.changed && !opts.check_mode {
        counter!("apply_changed", 1u64);
        if let Some(w) = &opts.wait {
            let outcome = wait_for_state(client, &id, opts.state, w).await?;
            if opts.state == State::Present {
                report.result = outcome;
            }
        }
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(target_id = %id, changed = report.changed, "apply done");
    Ok(report)
}

async fn ensure_present<C>(client: &C, id: &ResourceId, desired: Json, opts: &ApplyOptions) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    let live = match client.get(id).await? {
        Some(live) => live,
        None => {
            if opts.check_mode {
                return Ok(Report::changed(Some(desired)).with_msg("would create"));
            }
            let created = client.create(id, &desired).await?;
            return Ok(Report::changed(Some(created)).with_msg("created"));
        }
    };

    let diff = merge(&strip_noisy(live.clone()), &desired, opts.force);
    if diff.matches {
        debug!(target_id = %id, "live object already matches");
        return Ok(Report::unchanged(Some(live)));
    }
    let summary = DiffSummary::from_changes(&diff.changes);
    debug!(target_id = %id, adds = summary.adds, updates = summary.updates, removes = summary.removes, "diff");
    if opts.check_mode {
        let mut r = Report::changed(Some(diff.merged)).with_msg("would update");
        r.diff = diff.changes;
        return Ok(r);
    }

    let result = if opts.force {
        client.replace(id, &with_resource_version(diff.merged, &live)).await
    } else {
        patch_desired(client, id, &desired).await
    }
    .map_err(|source| Error::PatchFailed { id: id.clone(), source })?;

    let mut r = Report::changed(Some(result)).with_msg(if opts.force { "replaced" } else { "patched" });
    r.diff = diff.changes;
    Ok(r)
}

// Custom resources reject strategic merge with 415; fall back to a merge patch.
async fn patch_desired<C>(client: &C, id: &ResourceId, desired: &Json) -> std::result::Result<Json, ClientError>
where
    C: ClusterClient + ?Sized,
{
    match client.patch(id, &PatchBody::Strategic(desired.clone())).await {
        Err(e) if e.status == Some(415) => {
            debug!(target_id = %id, "strategic merge unsupported; retrying as merge patch");
            client.patch(id, &PatchBody::Merge(desired.clone())).await
        }
        other => other,
    }
}

async fn ensure_absent<C>(client: &C, id: &ResourceId, opts: &ApplyOptions) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    match client.get(id).await? {
        None => Ok(Report::unchanged(None)),
        Some(_) if opts.check_mode => Ok(Report::changed(None).with_msg("would delete")),
        Some(_) => {
            client.delete(id).await?;
            Ok(Report::changed(None).with_msg("deleted"))
        }
    }
}

async fn wait_for_state<C>(client: &C, id: &ResourceId, state: State, w: &WaitSpec) -> Result<Option<Json>>
where
    C: ClusterClient + ?Sized,
{
    let outcome = poll_until(
        || client.get(id),
        |obj: &Option<Json>| match (state, obj, &w.condition) {
            (State::Absent, o, _) => o.is_none(),
            (State::Present, Some(o), Some(cond)) => cond.matches(o),
            (State::Present, Some(_), None) => true,
            (State::Present, None, _) => false,
        },
        w.sleep,
        w.timeout,
    )
    .await;
    if outcome.success {
        Ok(outcome.last.flatten())
    } else {
        Err(Error::WaitTimeout { id: id.clone(), last: outcome.last.flatten(), elapsed: outcome.elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubemod_kubehub::mock::{Call, MockCluster};
    use serde_json::json;

    fn deployment(image: &str) -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns"},
            "spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "app", "image": image}]}}}
        })
    }

    fn live(image: &str) -> Json {
        let mut v = deployment(image);
        v["metadata"]["resourceVersion"] = json!("42");
        v["metadata"]["managedFields"] = json!([{"manager": "kubectl"}]);
        v["status"] = json!({"replicas": 1});
        v
    }

    #[test]
    fn strip_noisy_prunes_common_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn parse_definition_errors_are_friendly() {
        let e1 = parse_definition("kind: Foo\nmetadata:\n  name: x\n", None).unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = parse_definition("apiVersion: v1\nmetadata:\n  name: x\n", None).unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = parse_definition("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", None).unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn parse_definition_applies_namespace_override() {
        let d = parse_definition("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n", Some("team")).unwrap();
        assert_eq!(d.id().namespace.as_deref(), Some("team"));
    }

    #[tokio::test]
    async fn creates_missing_object() {
        let m = MockCluster::new();
        let def = ResourceDefinition::from_json(deployment("app:1")).unwrap();
        let r = apply(&m, def, &ApplyOptions::default()).await.unwrap();
        assert!(r.changed);
        assert!(matches!(m.mutations().as_slice(), [Call::Create(..)]));
    }

    #[tokio::test]
    async fn matching_object_is_a_noop() {
        let m = MockCluster::new().with_object(live("app:1"));
        let def = ResourceDefinition::from_json(deployment("app:1")).unwrap();
        let r = apply(&m, def, &ApplyOptions::default()).await.unwrap();
        assert!(!r.changed);
        assert!(m.mutations().is_empty());
    }

    #[tokio::test]
    async fn changed_object_is_patched_strategically() {
        let m = MockCluster::new().with_object(live("app:1"));
        let def = ResourceDefinition::from_json(deployment("app:2")).unwrap();
        let r = apply(&m, def, &ApplyOptions::default()).await.unwrap();
        assert!(r.changed);
        assert_eq!(r.diff.len(), 1);
        assert_eq!(r.diff[0].path, "/spec/template/spec/containers/0/image");
        match m.mutations().as_slice() {
            [Call::Patch(_, p)] => assert_eq!(p.content_type(), "application/strategic-merge-patch+json"),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[tokio::test]
    async fn force_replaces_with_live_resource_version() {
        let m = MockCluster::new().with_object(live("app:1"));
        let def = ResourceDefinition::from_json(deployment("app:2")).unwrap();
        let opts = ApplyOptions { force: true, ..Default::default() };
        apply(&m, def, &opts).await.unwrap();
        match m.mutations().as_slice() {
            [Call::Replace(_, body)] => assert_eq!(body["metadata"]["resourceVersion"], "42"),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[tokio::test]
    async fn check_mode_never_mutates() {
        let m = MockCluster::new().with_object(live("app:1"));
        let def = ResourceDefinition::from_json(deployment("app:2")).unwrap();
        let opts = ApplyOptions { check_mode: true, ..Default::default() };
        let r = apply(&m, def.clone(), &opts).await.unwrap();
        assert!(r.changed);
        let opts = ApplyOptions { check_mode: true, state: State::Absent, ..Default::default() };
        let r = apply(&m, def, &opts).await.unwrap();
        assert!(r.changed);
        assert!(m.mutations().is_empty());
    }

    #[tokio::test]
    async fn absent_deletes_once() {
        let m = MockCluster::new().with_object(live("app:1"));
        let opts = ApplyOptions { state: State::Absent, ..Default::default() };
        let def = ResourceDefinition::from_json(deployment("app:1")).unwrap();
        assert!(apply(&m, def.clone(), &opts).await.unwrap().changed);
        assert!(!apply(&m, def, &opts).await.unwrap().changed);
        assert_eq!(m.mutations().len(), 1);
    }

    #[tokio::test]
    async fn append_hash_renames_configmap() {
        let m = MockCluster::new();
        let def = ResourceDefinition::from_json(json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "foo", "namespace": "ns"}, "data": {}
        }))
        .unwrap();
        let opts = ApplyOptions { append_hash: true, ..Default::default() };
        let r = apply(&m, def, &opts).await.unwrap();
        assert_eq!(r.result.unwrap()["metadata"]["name"], "foo-867km9574f");
    }

    #[tokio::test]
    async fn patch_rejection_is_patch_failed() {
        let m = MockCluster::new().with_object(live("app:1"));
        m.fail_mutations_with(kubemod_core::ClientError::new("denied").with_status(403));
        let def = ResourceDefinition::from_json(deployment("app:2")).unwrap();
        let err = apply(&m, def, &ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PatchFailed { .. }));
        assert_eq!(err.to_failure().status, Some(403));
    }

    #[tokio::test]
    async fn custom_resource_falls_back_to_merge_patch() {
        let id = ResourceId::new("example.com/v1", "Widget", Some("ns"), "w");
        let m = MockCluster::new()
            .with_object(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "ns"}, "spec": {"size": 1}}))
            .without_strategic_merge();
        let def = ResourceDefinition::from_json(json!({
            "apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "ns"}, "spec": {"size": 2}
        }))
        .unwrap();
        let r = apply(&m, def, &ApplyOptions::default()).await.unwrap();
        assert!(r.changed);
        assert_eq!(m.object(&id).unwrap()["spec"]["size"], 2);
        match m.mutations().as_slice() {
            [Call::Patch(_, PatchBody::Strategic(_)), Call::Patch(_, PatchBody::Merge(body))] => assert_eq!(body["spec"]["size"], 2),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_condition_times_out() {
        let m = MockCluster::new();
        let def = ResourceDefinition::from_json(deployment("app:1")).unwrap();
        let opts = ApplyOptions {
            wait: Some(WaitSpec { condition: Some(ConditionMatch::new("Available")), sleep: Duration::from_secs(5), timeout: Duration::from_secs(10) }),
            ..Default::default()
        };
        let err = apply(&m, def, &opts).await.unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { .. }));
    }
}
